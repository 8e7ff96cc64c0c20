#[cfg(feature = "std-hash")]
pub mod default {
    pub use std::collections::hash_map::DefaultHasher;

    #[inline]
    pub fn new() -> DefaultHasher {
        DefaultHasher::new()
    }
}

#[cfg(not(feature = "std-hash"))]
pub mod default {
    // fast branch
    pub use ahash::AHasher as DefaultHasher;

    #[inline]
    pub fn new() -> DefaultHasher {
        DefaultHasher::default()
    }
}

use std::hash::{Hash, Hasher};

/// Hashes `value` with the default hasher. Handy for argument hashing in
/// component kinds that opt into hash-keyed render caches.
pub fn hash_one<T: Hash>(value: &T) -> u64 {
    let mut hasher = default::new();
    value.hash(&mut hasher);
    hasher.finish()
}

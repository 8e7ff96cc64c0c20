//! Per-component render caches.
//!
//! Each component keeps a cache of previous render commits keyed by render
//! argument. The storage strategy follows the kind's declared capacity: a
//! single slot for capacity one, a linear-scan list with LRU eviction for
//! small capacities, and a hash-keyed map (when the kind supplies an
//! argument hash) for large or unbounded ones.

use crate::collections::map::HashMap;
use crate::context::{Context, KeySet};
use crate::{Arg, ChildSet, ComponentKind, Value};
use std::collections::VecDeque;
use std::rc::Rc;

/// Largest capacity still served by the linear-scan strategy.
const SCAN_CAPACITY_MAX: usize = 8;

/// Capacity value meaning "no eviction".
pub const UNBOUNDED: usize = usize::MAX;

/// One committed render: the argument it was produced for, the result, and
/// enough of the surrounding tree state to revalidate and restore it.
pub(crate) struct CacheEntry {
    pub arg: Arg,
    pub result: Value,
    /// Rendered children at commit time, for subtree re-attachment.
    pub children: Rc<ChildSet>,
    /// Context the component rendered under.
    pub context: Context,
    /// Context keys read by the entry's subtree.
    pub reads: KeySet,
    /// Components rendered below this one, for pass bookkeeping.
    pub descendants: usize,
}

enum Store {
    /// Strategy not chosen yet; picked on first insert.
    Unset,
    Single(Option<Rc<CacheEntry>>),
    Scan(VecDeque<Rc<CacheEntry>>),
    Hashed {
        map: HashMap<u64, Rc<CacheEntry>>,
        order: VecDeque<u64>,
    },
}

pub(crate) struct RenderCache {
    capacity: usize,
    store: Store,
}

impl RenderCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            store: Store::Unset,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match &self.store {
            Store::Unset => true,
            Store::Single(slot) => slot.is_none(),
            Store::Scan(entries) => entries.is_empty(),
            Store::Hashed { map, .. } => map.is_empty(),
        }
    }

    pub(crate) fn clear(&mut self) {
        match &mut self.store {
            Store::Unset => {}
            Store::Single(slot) => *slot = None,
            Store::Scan(entries) => entries.clear(),
            Store::Hashed { map, order } => {
                map.clear();
                order.clear();
            }
        }
    }

    /// Finds the entry for `arg`, if any. A matching entry that fails
    /// `validate` is dropped from the cache and reported as a miss. Scan
    /// hits are promoted to most-recently-used; the hashed store keeps
    /// insertion order.
    pub(crate) fn lookup(
        &mut self,
        arg: &Arg,
        kind: &dyn ComponentKind,
        validate: impl Fn(&CacheEntry) -> bool,
    ) -> Option<Rc<CacheEntry>> {
        match &mut self.store {
            Store::Unset => None,
            Store::Single(slot) => {
                let matched = slot
                    .as_ref()
                    .map(|entry| kind.arg_eq(&entry.arg, arg))
                    .unwrap_or(false);
                if !matched {
                    return None;
                }
                let valid = slot
                    .as_ref()
                    .map(|entry| validate(entry.as_ref()))
                    .unwrap_or(false);
                if valid {
                    slot.as_ref().map(Rc::clone)
                } else {
                    *slot = None;
                    None
                }
            }
            Store::Scan(entries) => {
                let position = entries
                    .iter()
                    .position(|entry| kind.arg_eq(&entry.arg, arg))?;
                if validate(entries[position].as_ref()) {
                    let entry = entries.remove(position)?;
                    entries.push_front(Rc::clone(&entry));
                    Some(entry)
                } else {
                    entries.remove(position);
                    None
                }
            }
            Store::Hashed { map, order } => {
                let hash = kind.arg_hash(arg)?;
                let entry = map.get(&hash)?;
                if !kind.arg_eq(&entry.arg, arg) {
                    return None;
                }
                if validate(entry.as_ref()) {
                    Some(Rc::clone(entry))
                } else {
                    map.remove(&hash);
                    order.retain(|known| *known != hash);
                    None
                }
            }
        }
    }

    pub(crate) fn insert(&mut self, entry: CacheEntry, kind: &dyn ComponentKind) {
        if self.capacity == 0 {
            return;
        }
        if matches!(self.store, Store::Unset) {
            self.store = self.pick_store(kind.arg_hash(&entry.arg).is_some());
        }
        let entry = Rc::new(entry);
        match &mut self.store {
            Store::Unset => {}
            Store::Single(slot) => *slot = Some(entry),
            Store::Scan(entries) => {
                // an existing key is replaced in place, keeping its
                // eviction priority
                if let Some(position) = entries
                    .iter()
                    .position(|known| kind.arg_eq(&known.arg, &entry.arg))
                {
                    entries[position] = entry;
                } else {
                    entries.push_front(entry);
                    while entries.len() > self.capacity {
                        entries.pop_back();
                    }
                }
            }
            Store::Hashed { map, order } => {
                let Some(hash) = kind.arg_hash(&entry.arg) else {
                    return;
                };
                if map.insert(hash, entry).is_none() {
                    order.push_front(hash);
                    while self.capacity != UNBOUNDED && map.len() > self.capacity {
                        if let Some(evicted) = order.pop_back() {
                            map.remove(&evicted);
                        } else {
                            break;
                        }
                    }
                }
            }
        }
    }

    fn pick_store(&self, hash_available: bool) -> Store {
        if self.capacity == 1 {
            Store::Single(None)
        } else if self.capacity <= SCAN_CAPACITY_MAX && self.capacity != UNBOUNDED {
            Store::Scan(VecDeque::new())
        } else if hash_available {
            Store::Hashed {
                map: HashMap::default(),
                order: VecDeque::new(),
            }
        } else {
            Store::Scan(VecDeque::new())
        }
    }
}

#[cfg(test)]
#[path = "tests/render_cache_tests.rs"]
mod tests;

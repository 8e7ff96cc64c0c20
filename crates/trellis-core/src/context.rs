//! Immutable downward context with interned keys and read tracking.
//!
//! A [`Context`] is a persistent map from interned [`ContextKey`]s to shared
//! values. Components receive a context from their parent; reads made through
//! a component-bound context are recorded so cached renders can be validated
//! against later context changes key by key.

use crate::collections::map::HashMap;
use crate::{Component, Value, WeakComponent};
use smallvec::SmallVec;
use std::fmt;
use std::rc::Rc;
use std::sync::{Mutex, OnceLock};

/// Interned identifier for a context entry. Keys are created from a string
/// name once and compared by identity afterward.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ContextKey(usize);

struct KeyTable {
    by_name: HashMap<String, usize>,
    names: Vec<String>,
}

static KEYS: OnceLock<Mutex<KeyTable>> = OnceLock::new();

fn with_key_table<R>(f: impl FnOnce(&mut KeyTable) -> R) -> R {
    let table = KEYS.get_or_init(|| {
        Mutex::new(KeyTable {
            by_name: HashMap::default(),
            names: Vec::new(),
        })
    });
    let mut guard = match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

/// Interns `name`, returning the same key for the same name every time.
pub fn context_key(name: &str) -> ContextKey {
    with_key_table(|table| {
        if let Some(index) = table.by_name.get(name) {
            return ContextKey(*index);
        }
        let index = table.names.len();
        table.names.push(name.to_string());
        table.by_name.insert(name.to_string(), index);
        ContextKey(index)
    })
}

/// Reverse lookup of a key's interned name.
pub fn key_name(key: ContextKey) -> Option<String> {
    with_key_table(|table| table.names.get(key.0).cloned())
}

impl ContextKey {
    pub fn name(&self) -> String {
        key_name(*self).unwrap_or_else(|| format!("key#{}", self.0))
    }

    fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

const BITS_PER_WORD: usize = 64;

/// Compact set of [`ContextKey`]s, packed into bit words. Key indices are
/// dense, so most sets fit the inline words.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    words: SmallVec<[u64; 2]>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ContextKey) {
        let word = key.index() / BITS_PER_WORD;
        let bit = key.index() % BITS_PER_WORD;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << bit;
    }

    pub fn contains(&self, key: ContextKey) -> bool {
        let word = key.index() / BITS_PER_WORD;
        let bit = key.index() % BITS_PER_WORD;
        self.words
            .get(word)
            .map(|bits| bits & (1u64 << bit) != 0)
            .unwrap_or(false)
    }

    pub fn union_with(&mut self, other: &KeySet) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (word, bits) in other.words.iter().enumerate() {
            self.words[word] |= bits;
        }
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|bits| *bits == 0)
    }

    pub fn take(&mut self) -> KeySet {
        std::mem::take(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = ContextKey> + '_ {
        self.words.iter().enumerate().flat_map(|(word, bits)| {
            let bits = *bits;
            (0..BITS_PER_WORD).filter_map(move |bit| {
                if bits & (1u64 << bit) != 0 {
                    Some(ContextKey(word * BITS_PER_WORD + bit))
                } else {
                    None
                }
            })
        })
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|key| key.name())).finish()
    }
}

type ContextValues = HashMap<ContextKey, Value>;

struct ContextData {
    values: ContextValues,
}

thread_local! {
    static EMPTY_DATA: Rc<ContextData> = Rc::new(ContextData {
        values: ContextValues::default(),
    });
}

/// Immutable map of context values flowing from parents to children.
///
/// Cloning shares the underlying storage; two contexts are "the same" when
/// they share storage, and values themselves are compared by pointer
/// identity. A context may carry a reader component, in which case every
/// value lookup is recorded as a dependency of that component.
#[derive(Clone)]
pub struct Context {
    data: Rc<ContextData>,
    reader: Option<WeakComponent>,
}

impl Context {
    /// The shared empty context. Repeated calls return handles to the same
    /// storage, so identity comparisons across passes hold.
    pub fn empty() -> Context {
        Context {
            data: EMPTY_DATA.with(Rc::clone),
            reader: None,
        }
    }

    /// Looks up `key`, recording the read against the bound reader.
    pub fn get(&self, key: ContextKey) -> Option<Value> {
        self.note_read(key);
        self.data.values.get(&key).cloned()
    }

    /// Typed lookup; records the read like [`Context::get`].
    pub fn read<T: 'static>(&self, key: ContextKey) -> Option<Rc<T>> {
        self.get(key).and_then(|value| value.downcast::<T>().ok())
    }

    /// Whether `key` has a value. Counts as a read.
    pub fn contains(&self, key: ContextKey) -> bool {
        self.note_read(key);
        self.data.values.contains_key(&key)
    }

    /// True when both handles share the same underlying storage.
    pub fn same(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Applies `patch` on top of this context. Entries whose value is
    /// pointer-identical to the existing one are skipped; if nothing actually
    /// changes the base storage is reused so identity comparisons still hold.
    pub fn apply(&self, patch: &ContextPatch) -> Context {
        let mut changes: SmallVec<[(ContextKey, Value); 4]> = SmallVec::new();
        for (key, value) in patch.entries() {
            match self.data.values.get(key) {
                Some(current) if Rc::ptr_eq(current, value) => {}
                _ => changes.push((*key, Rc::clone(value))),
            }
        }
        if changes.is_empty() {
            return self.without_reader();
        }
        let mut values = self.data.values.clone();
        for (key, value) in changes {
            values.insert(key, value);
        }
        Context {
            data: Rc::new(ContextData { values }),
            reader: None,
        }
    }

    /// Lookup without read recording. Used for cache validity checks.
    pub(crate) fn value_at(&self, key: ContextKey) -> Option<&Value> {
        self.data.values.get(&key)
    }

    pub(crate) fn with_reader(&self, component: &Component) -> Context {
        Context {
            data: Rc::clone(&self.data),
            reader: Some(component.downgrade()),
        }
    }

    pub(crate) fn without_reader(&self) -> Context {
        Context {
            data: Rc::clone(&self.data),
            reader: None,
        }
    }

    fn note_read(&self, key: ContextKey) {
        if let Some(reader) = &self.reader {
            if let Some(component) = reader.upgrade() {
                component.note_context_read(key);
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.data.values.keys().map(|key| key.name()).collect();
        keys.sort();
        f.debug_struct("Context").field("keys", &keys).finish()
    }
}

/// An ordered list of key/value assignments layered onto a base context.
#[derive(Clone, Default)]
pub struct ContextPatch {
    entries: SmallVec<[(ContextKey, Value); 4]>,
}

impl ContextPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an assignment; builder style.
    pub fn set(mut self, key: ContextKey, value: Value) -> Self {
        self.entries.push((key, value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> &[(ContextKey, Value)] {
        &self.entries
    }

    /// Shallow equality: same keys in order, values pointer-identical.
    pub(crate) fn shallow_eq(&self, other: &ContextPatch) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && Rc::ptr_eq(va, vb))
    }
}

/// One-entry cache for a context modification: remembers the last base
/// storage and patch, and reuses the produced context when both match.
#[derive(Default)]
pub(crate) struct PatchSlot {
    cached: Option<PatchSlotEntry>,
}

struct PatchSlotEntry {
    base: Rc<ContextData>,
    patch: ContextPatch,
    result: Context,
}

impl PatchSlot {
    pub(crate) fn apply(&mut self, base: &Context, patch: &ContextPatch) -> Context {
        if let Some(entry) = &self.cached {
            if Rc::ptr_eq(&entry.base, &base.data) && entry.patch.shallow_eq(patch) {
                return entry.result.clone();
            }
        }
        let result = base.apply(patch);
        self.cached = Some(PatchSlotEntry {
            base: Rc::clone(&base.data),
            patch: patch.clone(),
            result: result.clone(),
        });
        result
    }

    pub(crate) fn clear(&mut self) {
        self.cached = None;
    }
}

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod tests;

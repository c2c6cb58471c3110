//! Concurrency-safe keyed store.
//!
//! A `HashMap` behind a single reader-writer lock. Lookups take the shared
//! lock and may run in parallel; inserts and removals take the exclusive
//! lock. The lock is never held across an `.await` or any I/O, so callers
//! can use it from TLS handshake callbacks and request handlers alike.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use parking_lot::RwLock;

/// Keyed store with one reader-writer lock discipline
pub struct KeyedStore<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Clone out the value stored under `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.read().get(key).cloned()
    }

    /// Insert or replace the value under `key`, returning the previous one
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.entries.write().insert(key, value)
    }

    /// Remove the value under `key`
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl<K, V> Default for KeyedStore<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for KeyedStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedStore")
            .field("len", &self.entries.read().len())
            .finish()
    }
}

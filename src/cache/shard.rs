//! Sharded Map Implementation
//!
//! Concurrent string-keyed hashmap split into `N` independently locked shards.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Closures run under the shard lock, never across an `.await`

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Single shard
pub struct Shard<V> {
    map: RwLock<HashMap<String, V>>,
}

impl<V> Default for Shard<V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> Shard<V> {
    fn len(&self) -> usize {
        self.map.read().len()
    }
}

/// Sharded map with a compile-time shard count
pub struct ShardedMap<V, const N: usize = 64> {
    shards: Box<[Shard<V>]>,
}

impl<V, const N: usize> Default for ShardedMap<V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, const N: usize> ShardedMap<V, N> {
    /// Create a new sharded map
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "shard count must be a power of two");
        let shards: Vec<Shard<V>> = (0..N).map(|_| Shard::default()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    #[inline]
    fn shard_for(&self, key: &str) -> &Shard<V> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    /// Total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the value under the shard's read lock
    pub fn with<R>(&self, key: &str, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard_for(key).map.read().get(key).map(f)
    }

    pub fn get(&self, key: &str) -> Option<V>
    where
        V: Clone,
    {
        self.with(key, V::clone)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shard_for(key).map.read().contains_key(key)
    }

    /// Insert a value, returning the previous one
    pub fn insert(&self, key: String, value: V) -> Option<V> {
        self.shard_for(&key).map.write().insert(key, value)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard_for(key).map.write().remove(key)
    }

    /// Remove the value only if `predicate` holds, atomically per shard
    pub fn remove_if(&self, key: &str, predicate: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut guard = self.shard_for(key).map.write();
        match guard.get(key) {
            Some(value) if predicate(value) => guard.remove(key),
            _ => None,
        }
    }

    /// Drop every value for which `keep` returns false; returns the dropped values
    pub fn retain(&self, mut keep: impl FnMut(&str, &V) -> bool) -> Vec<V> {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.map.write();
            let doomed: Vec<String> = guard
                .iter()
                .filter(|(k, v)| !keep(k, v))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(value) = guard.remove(&key) {
                    removed.push(value);
                }
            }
        }
        removed
    }

    /// Point-in-time copy of all entries
    pub fn snapshot(&self) -> Vec<(String, V)>
    where
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let guard = shard.map.read();
            out.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.map.write().clear();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

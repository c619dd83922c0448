//! Memory tier: a true LRU bounded by entry count and by bytes
//!
//! Not internally synchronized; the engine keeps it under the same lock as its
//! in-flight registry.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;

/// LRU cache that evicts least-recently-used entries when either the entry
/// cap or the byte budget is exceeded.
pub struct MemoryCache<K: Hash + Eq, V> {
    entries: lru::LruCache<K, (V, usize)>,
    max_entries: usize,
    max_bytes: usize,
    total_bytes: usize,
}

impl<K: Hash + Eq, V: Clone> MemoryCache<K, V> {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            entries: lru::LruCache::unbounded(),
            max_entries,
            max_bytes,
            total_bytes: 0,
        }
    }

    /// Get a value, marking it most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|(value, _)| value.clone())
    }

    /// Check presence without touching recency
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains(key)
    }

    /// Insert a value, evicting old items if necessary. Returns how many
    /// entries were evicted.
    pub fn insert(&mut self, key: K, value: V, byte_size: usize) -> usize {
        if let Some((_, old_size)) = self.entries.put(key, (value, byte_size)) {
            self.total_bytes = self.total_bytes.saturating_sub(old_size);
        }
        self.total_bytes = self.total_bytes.saturating_add(byte_size);

        let mut evicted = 0;
        while self.entries.len() > self.max_entries || self.total_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, (_, size))) => {
                    self.total_bytes = self.total_bytes.saturating_sub(size);
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }
}

impl<K: Hash + Eq, V> fmt::Debug for MemoryCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("len", &self.entries.len())
            .field("total_bytes", &self.total_bytes)
            .field("max_entries", &self.max_entries)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

//! Bounded recency-ordered caches.
//!
//! Used for hosts that recently failed relay setup, the backup contact pool
//! fed by denial replies, and uids of outbound connections that already
//! failed. Inserting past capacity evicts the least recently used entry.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Fixed-capacity LRU map
#[derive(Debug)]
pub struct BoundedCache<K: Hash + Eq, V> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Insert or refresh an entry
    ///
    /// Returns the displaced entry: the evicted least recently used entry, or
    /// the previous value when `key` was already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        self.inner.push(key, value)
    }

    /// Look up an entry and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    /// Check membership without touching recency
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    /// Remove every entry, least recently used first
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.inner.len());
        while let Some(entry) = self.inner.pop_lru() {
            out.push(entry);
        }
        out
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Maximum number of entries
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = BoundedCache::new(2);
        cache.insert("a", ());
        cache.insert("b", ());
        cache.get(&"a");
        let evicted = cache.insert("c", ());

        assert_eq!(evicted, Some(("b", ())));
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn test_contains_does_not_touch() {
        let mut cache = BoundedCache::new(2);
        cache.insert(1, ());
        cache.insert(2, ());
        assert!(cache.contains(&1));
        cache.insert(3, ());

        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_drain_in_insertion_order() {
        let mut cache = BoundedCache::new(8);
        for i in 0..5 {
            cache.insert(i, i * 10);
        }
        let drained: Vec<_> = cache.drain().into_iter().map(|(k, _)| k).collect();

        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reinsert_refreshes() {
        let mut cache = BoundedCache::new(2);
        cache.insert("x", 1);
        cache.insert("y", 2);
        cache.insert("x", 3);
        cache.insert("z", 4);

        assert!(!cache.contains(&"y"));
        assert_eq!(cache.remove(&"x"), Some(3));
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut cache = BoundedCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(1, ());
        cache.insert(2, ());
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(
            capacity in 1usize..32,
            keys in prop::collection::vec(0u16..64, 0..256),
        ) {
            let mut cache = BoundedCache::new(capacity);
            for key in keys {
                cache.insert(key, ());
                prop_assert!(cache.len() <= capacity);
                prop_assert!(cache.contains(&key));
            }
        }
    }
}

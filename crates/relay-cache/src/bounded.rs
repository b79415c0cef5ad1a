use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// Fixed-capacity map evicting the least-recently-used entry on overflow.
///
/// Not synchronized: each streaming connection owns its instances.
#[derive(Debug)]
pub struct BoundedLru<K: Hash + Eq, V> {
    inner: LruCache<K, V>,
}

impl<K: Hash + Eq, V> BoundedLru<K, V> {
    /// A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Lookup that promotes the entry to most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    /// Insert or replace, evicting the least-recently-used entry when full.
    pub fn put(&mut self, key: K, value: V) {
        self.inner.put(key, value);
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedLru;

    #[test]
    fn evicts_least_recently_used() {
        let mut lru = BoundedLru::new(2);
        lru.put("a", 1);
        lru.put("b", 2);
        assert_eq!(lru.get(&"a"), Some(&1));
        lru.put("c", 3);

        assert!(lru.contains(&"a"));
        assert!(!lru.contains(&"b"));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn zero_capacity_still_holds_one_entry() {
        let mut lru = BoundedLru::new(0);
        lru.put(1_u64, "x");
        lru.put(2_u64, "y");
        assert_eq!(lru.len(), 1);
        assert!(!lru.contains(&1));
        assert_eq!(lru.get(&2), Some(&"y"));
        assert_eq!(lru.remove(&2), Some("y"));
        assert!(lru.is_empty());
    }
}

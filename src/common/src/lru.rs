use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use tracing::trace;

/// Called for every entry leaving the cache, either by eviction or by
/// [`LruCache::clear`].
pub trait RemovalListener<V> {
    fn on_remove(&self, value: &V);
}

/// Remover that does not care about the fate of removed entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRemover;

impl<V> RemovalListener<V> for NoopRemover {
    fn on_remove(&self, _value: &V) {}
}

/// Bounded map with recency ordering.
///
/// `get` promotes the entry to the front. `put` for a key that is already
/// present returns the cached value and does NOT replace it; the caller
/// decides what to do with the rejected value. When the cache grows past
/// `max_size` the least recently used entry is handed to the removal
/// listener and dropped.
pub struct LruCache<K, V, R = NoopRemover> {
    max_size: usize,
    // front = most recently used
    order: VecDeque<K>,
    map: HashMap<K, V>,
    remover: R,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V, NoopRemover> {
    pub fn new(max_size: usize) -> Self {
        Self::with_remover(max_size, NoopRemover)
    }
}

impl<K: Eq + Hash + Clone, V: Clone, R: RemovalListener<V>> LruCache<K, V, R> {
    pub fn with_remover(max_size: usize, remover: R) -> Self {
        assert!(max_size > 0, "cache size must be positive");
        LruCache {
            max_size,
            order: VecDeque::with_capacity(max_size),
            map: HashMap::with_capacity(max_size),
            remover,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn promote(&mut self, key: &K) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if pos != 0 {
                let k = self.order.remove(pos).unwrap();
                self.order.push_front(k);
            }
        }
    }

    /// Insert `value` under `key`. Returns the already cached value when the
    /// key is present, leaving the cache unchanged; returns `None` when the
    /// value was actually inserted.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if let Some(cached) = self.map.get(&key) {
            return Some(cached.clone());
        }
        self.order.push_front(key.clone());
        self.map.insert(key, value);
        if self.map.len() > self.max_size {
            self.remove_eldest();
        }
        None
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        if self.map.contains_key(key) {
            self.promote(key);
        }
        self.map.get(key).cloned()
    }

    /// Drop one entry through the removal listener.
    pub fn remove(&mut self, key: &K) -> bool {
        if let Some(value) = self.map.remove(key) {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
            self.remover.on_remove(&value);
            return true;
        }
        false
    }

    fn remove_eldest(&mut self) {
        if let Some(victim) = self.order.pop_back() {
            if let Some(value) = self.map.remove(&victim) {
                trace!("lru cache evicting eldest entry");
                self.remover.on_remove(&value);
            }
        }
    }

    pub fn clear(&mut self) {
        for value in self.map.values() {
            self.remover.on_remove(value);
        }
        self.map.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingRemover(Arc<AtomicUsize>);

    impl RemovalListener<u32> for CountingRemover {
        fn on_remove(&self, _value: &u32) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    pub fn test_put_existing_key_wins() {
        let mut cache = LruCache::new(2);
        assert_eq!(cache.put("a", 1), None);
        // second put of the same key returns the cached value untouched
        assert_eq!(cache.put("a", 99), Some(1));
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    pub fn test_eviction_order_and_promote() {
        let removed = Arc::new(AtomicUsize::new(0));
        let mut cache = LruCache::with_remover(2, CountingRemover(removed.clone()));
        cache.put("a", 1u32);
        cache.put("b", 2u32);
        // touch "a" so "b" becomes the eldest
        cache.get(&"a");
        cache.put("c", 3u32);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    pub fn test_clear_runs_remover() {
        let removed = Arc::new(AtomicUsize::new(0));
        let mut cache = LruCache::with_remover(4, CountingRemover(removed.clone()));
        cache.put("a", 1u32);
        cache.put("b", 2u32);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(removed.load(Ordering::SeqCst), 2);
    }
}

//! Bounded LRU cache shared by the statistics, scan cursor and SPOP stores
//!
//! Recency is tracked with a monotonically increasing tick: `entries` maps a
//! key to its value and last tick, `order` maps ticks back to keys so the
//! least recently used entry is always the first one in `order`.
//!
//! All methods take `&self`; the state sits behind one mutex so the cache
//! can be shared by every command thread without external locking.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

struct LruState<K, V> {
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    tick: u64,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> LruState<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Evict least recently used entries until `len <= capacity`
    fn shrink(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
        }
    }
}

/// Thread-safe bounded LRU map
pub struct LruCache<K, V> {
    state: Mutex<LruState<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
                capacity,
            }),
        }
    }

    /// Look up a value and mark it most recently used
    pub fn lookup(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        let tick = state.next_tick();
        let (value, last) = state.entries.get_mut(key)?;
        let previous = std::mem::replace(last, tick);
        let value = value.clone();
        if let Some(k) = state.order.remove(&previous) {
            state.order.insert(tick, k);
        }
        Some(value)
    }

    /// Insert or replace a value, evicting the least recently used entry if
    /// the cache is full. A zero-capacity cache stores nothing.
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();
        if state.capacity == 0 {
            return;
        }
        let tick = state.next_tick();
        if let Some((_, previous)) = state.entries.insert(key.clone(), (value, tick)) {
            state.order.remove(&previous);
        }
        state.order.insert(tick, key);
        state.shrink();
    }

    /// Apply `f` to the value of `key`, starting from `V::default()` when the
    /// key is absent, and mark it most recently used. If `f` returns true the
    /// entry is removed and its final value returned. The whole update runs
    /// under the cache lock. A zero-capacity cache stores nothing.
    pub fn update(&self, key: K, f: impl FnOnce(&mut V) -> bool) -> Option<V>
    where
        V: Default,
    {
        let mut state = self.state.lock();
        if state.capacity == 0 {
            return None;
        }
        let tick = state.next_tick();
        let (mut value, previous) = state.entries.remove(&key).unwrap_or_default();
        if previous != 0 {
            state.order.remove(&previous);
        }
        if f(&mut value) {
            return Some(value);
        }
        state.entries.insert(key.clone(), (value, tick));
        state.order.insert(tick, key);
        state.shrink();
        None
    }

    /// Remove a value
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        let (value, tick) = state.entries.remove(key)?;
        state.order.remove(&tick);
        Some(value)
    }

    /// Change the capacity, evicting entries that no longer fit
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.capacity = capacity;
        state.shrink();
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lru_basic() {
        let cache = LruCache::new(10);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.lookup(&"a"), Some(1));
        assert_eq!(cache.lookup(&"c"), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.lookup(&"a"), None);
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let cache = LruCache::new(2);
        cache.insert(1, "one");
        cache.insert(2, "two");
        // touch 1 so 2 becomes the eviction candidate
        assert_eq!(cache.lookup(&1), Some("one"));
        cache.insert(3, "three");

        assert_eq!(cache.lookup(&1), Some("one"));
        assert_eq!(cache.lookup(&2), None);
        assert_eq!(cache.lookup(&3), Some("three"));
    }

    #[test]
    fn test_lru_replace_keeps_len() {
        let cache = LruCache::new(2);
        cache.insert(1, 10);
        cache.insert(1, 11);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&1), Some(11));
    }

    #[test]
    fn test_lru_set_capacity() {
        let cache = LruCache::new(4);
        for i in 0..4 {
            cache.insert(i, i);
        }
        cache.set_capacity(1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&3), Some(3));

        cache.set_capacity(0);
        cache.insert(9, 9);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_update() {
        let cache: LruCache<&str, u64> = LruCache::new(2);
        assert_eq!(cache.update("a", |v| {
            *v += 1;
            false
        }), None);
        assert_eq!(cache.lookup(&"a"), Some(1));
        // returning true takes the entry out
        assert_eq!(cache.update("a", |v| {
            *v += 1;
            *v >= 2
        }), Some(2));
        assert_eq!(cache.lookup(&"a"), None);

        cache.insert("b", 10);
        cache.insert("c", 20);
        cache.update("b", |v| {
            *v += 1;
            false
        });
        cache.insert("d", 30);
        assert_eq!(cache.lookup(&"b"), Some(11));
        assert_eq!(cache.lookup(&"c"), None);

        let empty: LruCache<&str, u64> = LruCache::new(0);
        assert_eq!(empty.update("a", |_| false), None);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_lru_concurrent_access() {
        let cache = Arc::new(LruCache::new(64));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500u64 {
                        cache.insert(t * 1000 + i, i);
                        cache.lookup(&(t * 1000 + i / 2));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 64);
    }
}

//! 有界 LRU 内存缓存
//!
//! 超出容量时自动淘汰最久未访问的项，不需要显式清理。
//! 每次失效都会推进代数（generation）；回源读取前记录代数，
//! 写回时若代数已变化则放弃写回，避免慢读覆盖新数据。

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

struct Entry<V> {
    value: V,
    tick: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    /// 访问时间 -> 键，最小者最久未访问
    order: BTreeMap<u64, K>,
    tick: u64,
    generation: u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn touch(&mut self, key: &K) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.map.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.clone());
        }
    }

    fn put(&mut self, key: K, value: V, capacity: usize) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(old) = self.map.insert(key.clone(), Entry { value, tick }) {
            self.order.remove(&old.tick);
        }
        self.order.insert(tick, key);

        while self.map.len() > capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.map.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &K) {
        if let Some(old) = self.map.remove(key) {
            self.order.remove(&old.tick);
        }
    }
}

/// 有界 LRU 缓存（线程安全）
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// 容量为 0 时缓存不保存任何数据
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
                generation: 0,
            }),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let value = inner.map.get(key).map(|e| e.value.clone())?;
        inner.touch(key);
        Some(value)
    }

    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        self.inner.lock().put(key, value, self.capacity);
    }

    /// 当前代数，回源读取前调用
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// 仅当期间没有发生失效时写入，返回是否写入
    pub fn insert_if_current(&self, generation: u64, entries: Vec<(K, V)>) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        for (key, value) in entries {
            inner.put(key, value, self.capacity);
        }
        true
    }

    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.remove(key);
    }

    pub fn invalidate_where(&self, pred: impl Fn(&K) -> bool) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        let doomed: Vec<K> = inner.map.keys().filter(|k| pred(k)).cloned().collect();
        for key in doomed {
            inner.remove(&key);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.map.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // 访问 a，使 b 成为最久未访问
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let cache = LruCache::new(2);
        cache.insert(1, "x");
        cache.insert(1, "y");
        cache.insert(2, "z");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some("y"));
    }

    #[test]
    fn stale_fill_is_rejected_after_invalidation() {
        let cache = LruCache::new(8);
        let gen = cache.generation();
        cache.invalidate(&1);
        assert!(!cache.insert_if_current(gen, vec![(1, "old")]));
        assert_eq!(cache.get(&1), None);

        let gen = cache.generation();
        assert!(cache.insert_if_current(gen, vec![(1, "new"), (2, "new")]));
        assert_eq!(cache.get(&2), Some("new"));
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let cache = LruCache::new(0);
        cache.insert(1, 1);
        assert!(cache.is_empty());
        assert!(!cache.insert_if_current(cache.generation(), vec![(1, 1)]));
    }

    #[test]
    fn invalidate_where_drops_matching_keys() {
        let cache = LruCache::new(8);
        cache.insert((1, 10), "a");
        cache.insert((1, 11), "b");
        cache.insert((2, 10), "c");
        cache.invalidate_where(|k| k.0 == 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&(2, 10)), Some("c"));
    }
}

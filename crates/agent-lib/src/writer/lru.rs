//! Small LRU map used for dimension-property dedup

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// LRU map keyed by last access. `get` and `put` are O(log n).
pub(crate) struct LruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    /// Access stamp -> key, oldest first
    order: BTreeMap<u64, K>,
    clock: u64,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn touch(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.touch();
        let (_, last) = self.entries.get_mut(key)?;
        self.order.remove(last);
        *last = stamp;
        self.order.insert(stamp, key.clone());
        self.entries.get(key).map(|(v, _)| v)
    }

    pub(crate) fn put(&mut self, key: K, value: V) {
        let stamp = self.touch();
        if let Some((_, last)) = self.entries.remove(&key) {
            self.order.remove(&last);
        }
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else { break };
            self.entries.remove(&oldest);
        }
        self.order.insert(stamp, key.clone());
        self.entries.insert(key, (value, stamp));
    }
}

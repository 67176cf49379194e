//! A sharded, bounded LRU cache over point-lookup results.
//!
//! `S` shards (a power of two); the shard for a key is `hash(key) & (S-1)`.
//! Each shard is a doubly-linked list plus a hash map behind its own
//! reader-writer lock — writers are serialized per shard, readers are
//! concurrent, and no cross-shard lock is ever held. The cache is a
//! best-effort shadow of storage: callers update it only after a
//! successful mutation.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::bytesutil::fnv1a;

struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A single shard: an index-based doubly-linked list (so the list never
/// needs `Rc`/interior mutability) plus a map from key to slot index.
struct Shard {
    nodes: Vec<Option<Node>>,
    free_slots: Vec<usize>,
    index: HashMap<Vec<u8>, usize>,
    head: Option<usize>, // most recently used
    tail: Option<usize>, // least recently used
    capacity: usize,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Shard {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
            capacity,
        }
    }

    fn detach(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.nodes[slot].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.nodes[slot].as_mut().unwrap();
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h].as_mut().unwrap().prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn touch(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.detach(slot);
        self.push_front(slot);
    }

    fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let slot = *self.index.get(key)?;
        self.touch(slot);
        Some(self.nodes[slot].as_ref().unwrap().value.clone())
    }

    fn evict_tail(&mut self) {
        if let Some(tail) = self.tail {
            let key = self.nodes[tail].as_ref().unwrap().key.clone();
            self.detach(tail);
            self.index.remove(&key);
            self.nodes[tail] = None;
            self.free_slots.push(tail);
        }
    }

    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        if let Some(&slot) = self.index.get(&key) {
            self.nodes[slot].as_mut().unwrap().value = value;
            self.touch(slot);
            return;
        }
        if self.index.len() >= self.capacity {
            self.evict_tail();
        }
        let slot = match self.free_slots.pop() {
            Some(s) => s,
            None => {
                self.nodes.push(None);
                self.nodes.len() - 1
            }
        };
        self.nodes[slot] = Some(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.index.insert(key, slot);
        self.push_front(slot);
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some(slot) = self.index.remove(key) {
            self.detach(slot);
            self.nodes[slot] = None;
            self.free_slots.push(slot);
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free_slots.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

pub struct ShardedCache {
    shards: Vec<RwLock<Shard>>,
    shard_mask: usize,
}

impl ShardedCache {
    /// `shard_count` must be a power of two; `per_shard_capacity` bounds
    /// each shard independently.
    pub fn new(shard_count: usize, per_shard_capacity: usize) -> Self {
        let shard_count = shard_count.next_power_of_two().max(1);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(Shard::new(per_shard_capacity)))
            .collect();
        ShardedCache {
            shards,
            shard_mask: shard_count - 1,
        }
    }

    fn shard_for(&self, key: &[u8]) -> &RwLock<Shard> {
        let idx = (fnv1a(key) as usize) & self.shard_mask;
        &self.shards[idx]
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut shard = self.shard_for(key).write().expect("cache shard lock poisoned");
        shard.get(key)
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut shard = self.shard_for(&key).write().expect("cache shard lock poisoned");
        shard.insert(key, value);
    }

    pub fn remove(&self, key: &[u8]) {
        let mut shard = self.shard_for(key).write().expect("cache shard lock poisoned");
        shard.remove(key);
    }

    /// Clears every shard; called after WAL recovery since recovered
    /// state has no corresponding cache entries yet.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().expect("cache shard lock poisoned").clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("cache shard lock poisoned").len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_hits() {
        let cache = ShardedCache::new(4, 8);
        cache.put(b"k".to_vec(), b"v".to_vec());
        assert_eq!(cache.get(b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn remove_evicts_key() {
        let cache = ShardedCache::new(4, 8);
        cache.put(b"k".to_vec(), b"v".to_vec());
        cache.remove(b"k");
        assert_eq!(cache.get(b"k"), None);
    }

    #[test]
    fn eviction_drops_least_recently_used() {
        let cache = ShardedCache::new(1, 2);
        cache.put(b"a".to_vec(), b"1".to_vec());
        cache.put(b"b".to_vec(), b"2".to_vec());
        cache.get(b"a"); // promote a, b now LRU
        cache.put(b"c".to_vec(), b"3".to_vec()); // evicts b
        assert_eq!(cache.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(cache.get(b"b"), None);
        assert_eq!(cache.get(b"c"), Some(b"3".to_vec()));
    }

    #[test]
    fn clear_empties_every_shard() {
        let cache = ShardedCache::new(4, 8);
        for i in 0..20 {
            cache.put(format!("k{i}").into_bytes(), b"v".to_vec());
        }
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn shard_count_is_rounded_to_power_of_two() {
        let cache = ShardedCache::new(10, 4);
        assert_eq!(cache.shards.len(), 16);
    }

    #[test]
    fn update_existing_key_does_not_grow_len() {
        let cache = ShardedCache::new(2, 8);
        cache.put(b"k".to_vec(), b"v1".to_vec());
        cache.put(b"k".to_vec(), b"v2".to_vec());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(b"k"), Some(b"v2".to_vec()));
    }
}

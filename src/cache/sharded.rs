//! A lock-striped concurrent map: fixed number of shards, each guarded by its
//! own mutex, so unrelated keys never contend on load, and writers to the
//! same key are serialized through the shard they hash into.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

const SHARD_COUNT: usize = 16;

pub struct ShardedMap<K, V> {
    shards: Vec<Mutex<HashMap<K, V>>>,
}

fn shard_index<K: Hash>(key: &K) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

impl<K: Hash + Eq + Clone, V: Clone> ShardedMap<K, V> {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(Mutex::new(HashMap::new()));
        }
        ShardedMap { shards }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let shard = &self.shards[shard_index(key)];
        shard.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        let shard = &self.shards[shard_index(&key)];
        shard.lock().unwrap().insert(key, value);
    }

    /// Inserts `value` unless an existing entry wins the tiebreak computed by
    /// `keep_existing`. Used to merge records "take the greatest
    /// last-write-time on collision" without a read-then-write race.
    pub fn upsert_with(&self, key: K, value: V, keep_existing: impl Fn(&V, &V) -> bool) {
        let shard = &self.shards[shard_index(&key)];
        let mut guard = shard.lock().unwrap();
        match guard.get(&key) {
            Some(existing) if keep_existing(existing, &value) => {}
            _ => {
                guard.insert(key, value);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().unwrap();
            out.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

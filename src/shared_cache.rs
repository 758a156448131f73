//! Process-wide sharded LRU cache.
//!
//! Operators like `@pm` and `@within` compile expensive multi-pattern
//! scanners out of their token lists. Two rules sharing one large pattern
//! list should share one scanner, so scanners are cached process-wide, keyed
//! by an order-independent hash of the token set.
//!
//! Layout: a fixed, prime number of shards, each a reader-writer lock over a
//! hash bucket, plus one mutex-guarded LRU list for eviction. The write path
//! drops the read lock before taking the write lock and re-checks presence
//! (double-checked insert), so concurrent factories race at most once per
//! key.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, RwLock};

/// Shard count. Prime, so that sequential hash values spread.
const SHARD_COUNT: usize = 127;

pub struct ShardedLruCache<K, V> {
    shards: Vec<RwLock<HashMap<K, V>>>,
    /// Recency list, most recent first. Guarded separately from the shards.
    lru: Mutex<Vec<K>>,
    max_size: usize,
}

impl<K, V> ShardedLruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(max_size: usize) -> Self {
        ShardedLruCache {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            lru: Mutex::new(Vec::new()),
            max_size: max_size.max(1),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Get the value for `key`, building it with `factory` on a miss.
    /// The touched entry moves to the head of the LRU list.
    pub fn access(&self, key: &K, factory: impl FnOnce() -> V) -> V {
        let shard = self.shard(key);

        if let Some(value) = shard.read().get(key) {
            let value = value.clone();
            self.touch(key);
            return value;
        }

        // Read lock dropped; re-check under the write lock before inserting.
        let mut guard = shard.write();
        if let Some(value) = guard.get(key) {
            let value = value.clone();
            drop(guard);
            self.touch(key);
            return value;
        }

        let value = factory();
        guard.insert(key.clone(), value.clone());
        drop(guard);

        {
            let mut lru = self.lru.lock();
            lru.insert(0, key.clone());
        }
        self.evict_overflow();

        value
    }

    /// Look up `key` without inserting or touching the LRU list.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(&self, key: &K) {
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|k| k == key) {
            let k = lru.remove(pos);
            lru.insert(0, k);
        }
    }

    fn evict_overflow(&self) {
        loop {
            let victim = {
                let mut lru = self.lru.lock();
                if lru.len() <= self.max_size {
                    return;
                }
                lru.pop()
            };
            let Some(victim) = victim else { return };
            self.shard(&victim).write().remove(&victim);
        }
    }
}

/// Order-independent hash of a token set: per-token hashes are sorted before
/// being folded, so `"a b"` and `"b a"` share a cache slot.
pub fn order_independent_hash<T: Hash>(tokens: impl IntoIterator<Item = T>) -> u64 {
    let mut token_hashes: Vec<u64> = tokens
        .into_iter()
        .map(|token| {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            hasher.finish()
        })
        .collect();
    token_hashes.sort_unstable();

    let mut hash: u64 = 0;
    for token_hash in token_hashes {
        hash = hash.wrapping_mul(31).wrapping_add(token_hash);
    }
    hash
}

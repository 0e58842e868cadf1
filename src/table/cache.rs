//! Process-wide cell cache: `{table_id, row_index, column}` -> decoded value.
//!
//! Sharded so that concurrent tables don't serialize on one lock. Each shard
//! tracks its own byte usage and evicts LRU-first once the shard's share of
//! `data_cache_size` is exceeded; entries over `max_cache_entry_size` bypass
//! the cache entirely rather than being stored and immediately evicted.

use crate::types::{TableId, Value};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub table_id: TableId,
    pub row_index: u64,
    pub column: u16,
}

fn estimated_size(value: &Value) -> usize {
    let payload = match value {
        Value::Integer(_) => 8,
        Value::Float(_) => 8,
        Value::Bool(_) => 1,
        Value::Text(s) => s.len(),
        Value::Blob(_) => 8,
        Value::Null => 0,
    };
    payload + std::mem::size_of::<CellKey>()
}

struct Shard {
    entries: LruCache<CellKey, std::sync::Arc<Value>>,
    bytes_used: usize,
    byte_budget: usize,
}

impl Shard {
    fn new(byte_budget: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(usize::MAX).unwrap()),
            bytes_used: 0,
            byte_budget,
        }
    }

    fn evict_to_budget(&mut self) {
        while self.bytes_used > self.byte_budget {
            match self.entries.pop_lru() {
                Some((key, value)) => {
                    self.bytes_used = self.bytes_used.saturating_sub(estimated_size(&value) + std::mem::size_of_val(&key));
                }
                None => break,
            }
        }
    }
}

/// Shared cell cache, bounded by total byte budget across all shards.
pub struct CellCache {
    shards: Vec<Mutex<Shard>>,
    max_entry_size: usize,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl CellCache {
    pub fn new(data_cache_size: usize, max_cache_entry_size: usize) -> Self {
        let per_shard = (data_cache_size / SHARD_COUNT).max(1);
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(Shard::new(per_shard))).collect();
        Self {
            shards,
            max_entry_size: max_cache_entry_size,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &CellKey) -> &Mutex<Shard> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn get(&self, key: CellKey) -> Option<std::sync::Arc<Value>> {
        let mut shard = self.shard_for(&key).lock();
        let found = shard.entries.get(&key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        found
    }

    pub fn put(&self, key: CellKey, value: Value) {
        let size = estimated_size(&value);
        if size > self.max_entry_size {
            return;
        }
        let mut shard = self.shard_for(&key).lock();
        if let Some(old) = shard.entries.put(key, std::sync::Arc::new(value)) {
            shard.bytes_used = shard.bytes_used.saturating_sub(estimated_size(&old));
        }
        shard.bytes_used += size;
        shard.evict_to_budget();
    }

    pub fn invalidate(&self, key: CellKey) {
        let mut shard = self.shard_for(&key).lock();
        if let Some(old) = shard.entries.pop(&key) {
            shard.bytes_used = shard.bytes_used.saturating_sub(estimated_size(&old));
        }
    }

    pub fn invalidate_table(&self, table_id: TableId) {
        for shard_lock in &self.shards {
            let mut shard = shard_lock.lock();
            let stale: Vec<CellKey> = shard
                .entries
                .iter()
                .filter(|(k, _)| k.table_id == table_id)
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                if let Some(old) = shard.entries.pop(&key) {
                    shard.bytes_used = shard.bytes_used.saturating_sub(estimated_size(&old));
                }
            }
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(std::sync::atomic::Ordering::Relaxed);
        let misses = self.misses.load(std::sync::atomic::Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 { 0.0 } else { hits as f64 / total as f64 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let cache = CellCache::new(1 << 20, 1 << 16);
        let key = CellKey { table_id: 1, row_index: 0, column: 0 };
        assert!(cache.get(key).is_none());

        cache.put(key, Value::Integer(42));
        assert_eq!(*cache.get(key).unwrap(), Value::Integer(42));
    }

    #[test]
    fn test_entries_over_budget_bypass() {
        let cache = CellCache::new(1 << 20, 4);
        let key = CellKey { table_id: 1, row_index: 0, column: 0 };
        cache.put(key, Value::Text("way too long for the cap".into()));
        assert!(cache.get(key).is_none());
    }

    #[test]
    fn test_invalidate_table() {
        let cache = CellCache::new(1 << 20, 1 << 16);
        let k1 = CellKey { table_id: 1, row_index: 0, column: 0 };
        let k2 = CellKey { table_id: 2, row_index: 0, column: 0 };
        cache.put(k1, Value::Integer(1));
        cache.put(k2, Value::Integer(2));

        cache.invalidate_table(1);
        assert!(cache.get(k1).is_none());
        assert!(cache.get(k2).is_some());
    }

    #[test]
    fn test_eviction_under_byte_budget() {
        let cache = CellCache::new(SHARD_COUNT * 64, 1 << 16);
        for i in 0..1000u64 {
            let key = CellKey { table_id: 1, row_index: i, column: 0 };
            cache.put(key, Value::Text("x".repeat(32)));
        }
        // Didn't grow unbounded; some entries were evicted.
        let still_present = (0..1000u64)
            .filter(|&i| cache.get(CellKey { table_id: 1, row_index: i, column: 0 }).is_some())
            .count();
        assert!(still_present < 1000);
    }
}

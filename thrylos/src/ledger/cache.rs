//! Hot-UTXO cache.
//!
//! A bounded LRU fronted by a counting Bloom filter. The filter answers
//! "definitely not cached" without touching the LRU lock ordering for
//! misses on cold keys; 4-bit counters allow removal when entries are
//! spent or evicted. Strictly a performance layer: it is dropped wholesale
//! on any store write that cannot be confirmed and is never the source of
//! truth.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use crate::types::Utxo;

/// Saturation limit for a 4-bit counter.
const MAX_COUNTER: u8 = 15;

/// Cache sizing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum cached UTXOs
    pub capacity: usize,
    /// Counting Bloom filter size in counters
    pub bloom_counters: usize,
    /// Number of hash positions per element
    pub bloom_hashes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 8_192,
            bloom_counters: 1 << 16,
            bloom_hashes: 4,
        }
    }
}

impl CacheConfig {
    /// Small configuration for tests.
    pub fn minimal() -> Self {
        Self {
            capacity: 16,
            bloom_counters: 1 << 10,
            bloom_hashes: 3,
        }
    }
}

/// Counting Bloom filter with 4-bit counters packed two per byte.
pub struct CountingBloom {
    counters: Vec<u8>,
    k: usize,
    m: usize,
}

impl CountingBloom {
    /// Create a filter with `m` counters and `k` hash positions.
    pub fn new(m: usize, k: usize) -> Self {
        Self {
            counters: vec![0u8; m.div_ceil(2)],
            k,
            m,
        }
    }

    /// Positions derived from two BLAKE2b lanes (double hashing).
    fn positions(&self, element: &[u8]) -> Vec<usize> {
        let digest = thrylos_crypto::hash(element);
        let h1 = u64::from_le_bytes(digest[0..8].try_into().expect("digest is 32 bytes"));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("digest is 32 bytes"));
        (0..self.k)
            .map(|i| ((h1.wrapping_add((i as u64).wrapping_mul(h2))) % self.m as u64) as usize)
            .collect()
    }

    /// Increment the element's counters.
    pub fn add(&mut self, element: &[u8]) {
        for pos in self.positions(element) {
            self.increment(pos);
        }
    }

    /// Decrement the element's counters. Only call for elements that were
    /// previously added; removing unknown elements causes false negatives.
    pub fn remove(&mut self, element: &[u8]) {
        for pos in self.positions(element) {
            self.decrement(pos);
        }
    }

    /// Membership test; false means definitely absent.
    pub fn contains(&self, element: &[u8]) -> bool {
        self.positions(element)
            .iter()
            .all(|&pos| self.counter(pos) > 0)
    }

    /// Reset every counter.
    pub fn clear(&mut self) {
        self.counters.fill(0);
    }

    fn counter(&self, pos: usize) -> u8 {
        let byte = self.counters[pos / 2];
        if pos % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        }
    }

    fn increment(&mut self, pos: usize) {
        let current = self.counter(pos);
        if current < MAX_COUNTER {
            self.set_counter(pos, current + 1);
        }
    }

    fn decrement(&mut self, pos: usize) {
        let current = self.counter(pos);
        if current > 0 && current < MAX_COUNTER {
            // Saturated counters stay pinned; decrementing one could
            // underestimate membership for colliding keys.
            self.set_counter(pos, current - 1);
        }
    }

    fn set_counter(&mut self, pos: usize, value: u8) {
        let byte_idx = pos / 2;
        if pos % 2 == 0 {
            self.counters[byte_idx] = (self.counters[byte_idx] & 0x0F) | (value << 4);
        } else {
            self.counters[byte_idx] = (self.counters[byte_idx] & 0xF0) | value;
        }
    }
}

/// Cache counters, for stats queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that fell through to the store
    pub misses: u64,
    /// Misses answered by the Bloom filter without touching the LRU
    pub bloom_short_circuits: u64,
}

struct CacheInner {
    lru: LruCache<String, Utxo>,
    bloom: CountingBloom,
    stats: CacheStats,
}

/// The bounded hot-UTXO cache. Keys are `"{txid}-{index}"`.
pub struct UtxoCache {
    inner: Mutex<CacheInner>,
}

impl UtxoCache {
    /// Create a cache with the given sizing.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(capacity),
                bloom: CountingBloom::new(config.bloom_counters, config.bloom_hashes),
                stats: CacheStats::default(),
            }),
        }
    }

    /// Look up a cached unspent output.
    pub fn get(&self, key: &str) -> Option<Utxo> {
        let mut inner = self.inner.lock();
        if !inner.bloom.contains(key.as_bytes()) {
            inner.stats.bloom_short_circuits += 1;
            inner.stats.misses += 1;
            return None;
        }
        match inner.lru.get(key).cloned() {
            Some(utxo) => {
                inner.stats.hits += 1;
                Some(utxo)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Insert an unspent output.
    pub fn put(&self, key: String, utxo: Utxo) {
        let mut inner = self.inner.lock();
        if inner.lru.contains(&key) {
            inner.lru.put(key, utxo);
            return;
        }
        if let Some((evicted, _)) = inner.lru.push(key.clone(), utxo) {
            if evicted != key {
                inner.bloom.remove(evicted.as_bytes());
            }
        }
        inner.bloom.add(key.as_bytes());
    }

    /// Drop one entry (spent or superseded).
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.lru.pop(key).is_some() {
            inner.bloom.remove(key.as_bytes());
        }
    }

    /// Drop everything. Called whenever a store write cannot be confirmed.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.bloom.clear();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().lru.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn utxo(id: &str) -> Utxo {
        Utxo::new(id, 0, Address::parse(&"ef".repeat(20)).unwrap(), 100)
    }

    #[test]
    fn test_counting_bloom_add_remove() {
        let mut bloom = CountingBloom::new(1024, 3);

        bloom.add(b"tx1-0");
        assert!(bloom.contains(b"tx1-0"));

        bloom.remove(b"tx1-0");
        assert!(!bloom.contains(b"tx1-0"));
    }

    #[test]
    fn test_counting_bloom_no_false_negatives() {
        let mut bloom = CountingBloom::new(4096, 4);
        let keys: Vec<String> = (0..200).map(|i| format!("tx{i}-0")).collect();
        for key in &keys {
            bloom.add(key.as_bytes());
        }
        for key in &keys {
            assert!(bloom.contains(key.as_bytes()));
        }
    }

    #[test]
    fn test_cache_round_trip() {
        let cache = UtxoCache::new(CacheConfig::minimal());
        cache.put("tx1-0".into(), utxo("tx1"));

        assert_eq!(cache.get("tx1-0").unwrap().transaction_id, "tx1");
        assert!(cache.get("tx2-0").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!(stats.bloom_short_circuits >= 1);
    }

    #[test]
    fn test_cache_remove() {
        let cache = UtxoCache::new(CacheConfig::minimal());
        cache.put("tx1-0".into(), utxo("tx1"));
        cache.remove("tx1-0");
        assert!(cache.get("tx1-0").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_eviction_keeps_bloom_consistent() {
        let config = CacheConfig {
            capacity: 4,
            ..CacheConfig::minimal()
        };
        let cache = UtxoCache::new(config);

        for i in 0..20 {
            cache.put(format!("tx{i}-0"), utxo(&format!("tx{i}")));
        }
        assert_eq!(cache.len(), 4);

        // The most recent entries survive and stay reachable.
        assert!(cache.get("tx19-0").is_some());
        assert!(cache.get("tx0-0").is_none());
    }

    #[test]
    fn test_cache_clear() {
        let cache = UtxoCache::new(CacheConfig::minimal());
        cache.put("tx1-0".into(), utxo("tx1"));
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get("tx1-0").is_none());
    }
}

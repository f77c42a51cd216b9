//! Keyed LRU store for generated thumbnails and probed metadata
//!
//! Key format: any hashable key, e.g. (file, offset) -> Thumbnail
//! Fixed entry capacity; inserting past the cap evicts the least recently
//! used entry. Reads bump recency, `peek` doesn't.
//!
//! The inner mutex is a leaf lock: nothing is called while it is held, so it
//! can be taken under the coordinator's lock without ordering hazards.

use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use lru::LruCache;

/// Cache statistics for monitoring hit rate
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.hits() as f64 / total as f64 }
    }
}

/// Thread-safe fixed-capacity LRU map.
#[derive(Debug)]
pub struct LruStore<K: Hash + Eq, V> {
    cache: Mutex<LruCache<K, V>>,
    stats: CacheStats,
    capacity: usize,
}

impl<K, V> LruStore<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    /// Create store holding at most `capacity` entries (min 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        debug!("LruStore created: capacity={}", cap);

        Self {
            cache: Mutex::new(LruCache::new(cap)),
            stats: CacheStats::new(),
            capacity: cap.get(),
        }
    }

    /// Get value, bumping it to most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let result = cache.get(key).cloned();
        if result.is_some() {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
        result
    }

    /// Get value without touching recency or stats.
    pub fn peek(&self, key: &K) -> Option<V> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.contains(key)
    }

    /// Insert or overwrite, bumping the key to most recently used.
    ///
    /// Returns the evicted key when the insert pushed the store over capacity.
    pub fn put(&self, key: K, value: V) -> Option<K> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let existed = cache.contains(&key);

        // push() hands back the replaced entry for existing keys, the
        // evicted LRU entry otherwise
        match cache.push(key, value) {
            Some((evicted, _)) if !existed => {
                self.stats.record_eviction();
                trace!("LRU evicted {:?} (len {}/{})", evicted, cache.len(), self.capacity);
                Some(evicted)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<K> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn clear(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
        debug!("Cleared LruStore");
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

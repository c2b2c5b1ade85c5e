//! Model byte caching for flowerloop.
//!
//! Published model versions are immutable, so the bytes downloaded for a
//! version can be memoized without invalidation. The cache is bounded by entry
//! count and evicts the least recently used version.

use crate::types::ModelVersion;
use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Default number of memoized versions.
pub const DEFAULT_CAPACITY: usize = 5;

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache hits.
    pub hits: u64,
    /// Total number of cache misses.
    pub misses: u64,
    /// Total number of evicted versions.
    pub evictions: u64,
    /// Current number of cached versions.
    pub entries: usize,
    /// Current cache size in bytes.
    pub size_bytes: u64,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// LRU memo of model artifact bytes keyed by version.
pub struct ModelCache {
    /// The LRU cache.
    cache: RwLock<LruCache<ModelVersion, Bytes>>,
    /// Current cache size in bytes.
    current_size: AtomicU64,
    /// Cache hits counter.
    hits: AtomicU64,
    /// Cache misses counter.
    misses: AtomicU64,
    /// Evictions counter.
    evictions: AtomicU64,
}

impl ModelCache {
    /// Create a cache holding at most `capacity` versions.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: RwLock::new(LruCache::new(capacity)),
            current_size: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Get the bytes of a version, refreshing its recency.
    pub async fn get(&self, version: ModelVersion) -> Option<Bytes> {
        let mut cache = self.cache.write().await;

        match cache.get(&version) {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("flowerloop_model_cache_hits_total").increment(1);
                Some(data.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("flowerloop_model_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Memoize the bytes of a version.
    pub async fn put(&self, version: ModelVersion, data: Bytes) {
        let size = data.len() as u64;
        let mut cache = self.cache.write().await;

        if let Some((evicted_version, evicted)) = cache.push(version, data) {
            self.current_size
                .fetch_sub(evicted.len() as u64, Ordering::Relaxed);
            if evicted_version != version {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.current_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Drop a version, e.g. after its bytes failed to decode.
    pub async fn remove(&self, version: ModelVersion) -> bool {
        let mut cache = self.cache.write().await;

        if let Some(data) = cache.pop(&version) {
            self.current_size
                .fetch_sub(data.len() as u64, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Whether a version is cached, without touching recency or stats.
    pub async fn contains(&self, version: ModelVersion) -> bool {
        self.cache.read().await.contains(&version)
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;

        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: cache.len(),
            size_bytes: self.current_size.load(Ordering::Relaxed),
        }
    }

    /// Get number of entries.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Check if cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: u64) -> ModelVersion {
        ModelVersion::new(n)
    }

    #[tokio::test]
    async fn test_cache_put_get() {
        let cache = ModelCache::default();
        cache.put(v(1), Bytes::from_static(b"model")).await;

        assert_eq!(cache.get(v(1)).await.unwrap(), Bytes::from_static(b"model"));
        assert!(cache.get(v(2)).await.is_none());
    }

    #[tokio::test]
    async fn test_cache_evicts_least_recent() {
        let cache = ModelCache::new(2);
        cache.put(v(1), Bytes::from_static(b"a")).await;
        cache.put(v(2), Bytes::from_static(b"bb")).await;

        // Touch 1 so 2 becomes least recent.
        assert!(cache.get(v(1)).await.is_some());
        cache.put(v(3), Bytes::from_static(b"ccc")).await;

        assert!(cache.contains(v(1)).await);
        assert!(!cache.contains(v(2)).await);
        assert!(cache.contains(v(3)).await);

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.size_bytes, 4);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_cache_replace_same_version() {
        let cache = ModelCache::new(2);
        cache.put(v(1), Bytes::from_static(b"old")).await;
        cache.put(v(1), Bytes::from_static(b"newer")).await;

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size_bytes, 5);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test]
    async fn test_cache_remove() {
        let cache = ModelCache::default();
        cache.put(v(9), Bytes::from_static(b"xyz")).await;
        assert!(cache.remove(v(9)).await);
        assert!(!cache.remove(v(9)).await);
        assert!(cache.is_empty().await);
        assert_eq!(cache.stats().await.size_bytes, 0);
    }

    #[tokio::test]
    async fn test_hit_ratio() {
        let cache = ModelCache::default();
        cache.get(v(1)).await;
        cache.put(v(1), Bytes::from_static(b"m")).await;
        cache.get(v(1)).await;
        cache.get(v(1)).await;
        cache.get(v(1)).await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio() - 0.75).abs() < 0.001);
    }
}

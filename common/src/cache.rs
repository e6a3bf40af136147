//! Bounded in-memory cache backed by moka.
//!
//! The engine keeps materialized partitions of cached stages here. Access is
//! synchronous because lookups happen inside worker threads that never enter
//! an async runtime.

use moka::notification::RemovalCause;
use moka::sync::Cache as MokaCache;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Synchronous cache interface.
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync + Clone + Hash + Eq + 'static,
    V: Send + Sync + Clone + 'static,
{
    fn get(&self, key: &K) -> Option<V>;

    fn put(&self, key: K, value: V);

    fn remove(&self, key: &K) -> Option<V>;

    fn contains_key(&self, key: &K) -> bool;

    fn clear(&self);

    fn stats(&self) -> CacheStats;
}

/// Cache statistics information.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub insert_count: u64,
    pub eviction_count: u64,
    pub entry_count: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Builder for creating cache instances.
#[derive(Debug, Clone)]
pub struct CacheBuilder {
    max_capacity: u64,
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self {
            max_capacity: 10_000,
        }
    }

    /// Maximum number of entries before moka starts evicting.
    pub fn max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = capacity;
        self
    }

    pub fn build<K, V>(self) -> Arc<dyn Cache<K, V>>
    where
        K: Send + Sync + Clone + Hash + Eq + 'static,
        V: Send + Sync + Clone + 'static,
    {
        let stats = Arc::new(InternalCacheStats::default());
        let listener_stats = Arc::clone(&stats);

        let inner = MokaCache::builder()
            .max_capacity(self.max_capacity)
            .eviction_listener(move |_key, _value, cause| {
                if matches!(cause, RemovalCause::Size) {
                    listener_stats.evictions.fetch_add(1, Ordering::AcqRel);
                }
            })
            .build();

        Arc::new(MokaCacheImpl { inner, stats })
    }
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct InternalCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

struct MokaCacheImpl<K, V>
where
    K: Send + Sync + Clone + Hash + Eq + 'static,
    V: Send + Sync + Clone + 'static,
{
    inner: MokaCache<K, V>,
    stats: Arc<InternalCacheStats>,
}

impl<K, V> Debug for MokaCacheImpl<K, V>
where
    K: Send + Sync + Clone + Hash + Eq + 'static,
    V: Send + Sync + Clone + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaCacheImpl")
            .field("entries", &self.inner.entry_count())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<K, V> Cache<K, V> for MokaCacheImpl<K, V>
where
    K: Send + Sync + Clone + Hash + Eq + 'static,
    V: Send + Sync + Clone + 'static,
{
    fn get(&self, key: &K) -> Option<V> {
        let result = self.inner.get(key);
        if result.is_some() {
            self.stats.hits.fetch_add(1, Ordering::AcqRel);
        } else {
            self.stats.misses.fetch_add(1, Ordering::AcqRel);
        }
        result
    }

    fn put(&self, key: K, value: V) {
        self.inner.insert(key, value);
        self.stats.inserts.fetch_add(1, Ordering::AcqRel);
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks();
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.stats.hits.load(Ordering::Acquire),
            miss_count: self.stats.misses.load(Ordering::Acquire),
            insert_count: self.stats.inserts.load(Ordering::Acquire),
            eviction_count: self.stats.evictions.load(Ordering::Acquire),
            entry_count: self.inner.entry_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_basic_operations() {
        let cache = CacheBuilder::new().max_capacity(100).build::<u64, Arc<Vec<i32>>>();

        cache.put(1, Arc::new(vec![1, 2, 3]));
        assert_eq!(cache.get(&1).as_deref(), Some(&vec![1, 2, 3]));
        assert!(cache.contains_key(&1));
        assert!(!cache.contains_key(&2));

        assert!(cache.remove(&1).is_some());
        assert!(cache.get(&1).is_none());

        cache.put(2, Arc::new(vec![]));
        cache.clear();
        assert!(cache.get(&2).is_none());
    }

    #[test]
    fn test_cache_shares_values() {
        let cache = CacheBuilder::new().build::<u64, Arc<String>>();
        let value = Arc::new("partition".to_string());
        cache.put(7, Arc::clone(&value));

        let fetched = cache.get(&7).unwrap();
        assert!(Arc::ptr_eq(&fetched, &value));
    }

    #[test]
    fn test_cache_statistics() {
        let cache = CacheBuilder::new().build::<String, i32>();
        for i in 0..4 {
            cache.put(format!("stage_{}", i), i);
        }
        for i in 0..6 {
            cache.get(&format!("stage_{}", i));
        }

        let stats = cache.stats();
        assert_eq!(stats.insert_count, 4);
        assert_eq!(stats.hit_count, 4);
        assert_eq!(stats.miss_count, 2);
        assert!((stats.hit_ratio() - 4.0 / 6.0).abs() < 1e-9);
    }
}

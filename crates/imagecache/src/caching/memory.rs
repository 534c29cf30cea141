use std::fmt;
use std::io;
use std::sync::Arc;

use moka::policy::EvictionPolicy;

use super::{Cache, CacheKey, PruneStats, StorageError};
use crate::config::MemoryCacheConfig;

/// Computes the in-memory cost of a value, in bytes.
pub type Weigher<V> = Arc<dyn Fn(&V) -> u64 + Send + Sync>;

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct MemoryItem<V> {
    /// The actual data.
    value: V,
    /// The cost this item was inserted with.
    cost: u64,
}

type InMemoryCache<V> = moka::sync::Cache<CacheKey, MemoryItem<V>>;

/// A bounded, in-process cache tier.
///
/// The cache is bounded both by the number of entries and by the total cost of all entries.
/// Both limits are enforced by giving every entry a minimum weight of `cost_limit / count_limit`
/// while the capacity is the cost limit. Entries are evicted least recently used first.
///
/// Like all moka caches, eviction happens asynchronously with respect to inserts. Evicted entries
/// are never returned from [`get`](Self::get), but [`entry_count`](Self::entry_count) may lag
/// behind until [`sync`](Self::sync) is called.
pub struct MemoryCache<V> {
    cache: Option<InMemoryCache<V>>,
    weigher: Weigher<V>,
}

impl<V> fmt::Debug for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("enabled", &self.cache.is_some())
            .field("entry_count", &self.entry_count())
            .field("weighted_size", &self.weighted_size())
            .finish()
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache with the given limits.
    ///
    /// `weigher` computes the cost of values added through [`Cache::insert`]. A limit of `0`
    /// disables the cache: it stores nothing and every lookup is a miss.
    pub fn new(config: &MemoryCacheConfig, weigher: Weigher<V>) -> Self {
        let MemoryCacheConfig {
            count_limit,
            cost_limit,
        } = *config;

        if count_limit == 0 || cost_limit == 0 {
            return Self {
                cache: None,
                weigher,
            };
        }

        let min_weight = (cost_limit / count_limit).max(1);
        // A capacity of `count_limit * min_weight` guarantees that `count_limit + 1` entries
        // never fit, even when `cost_limit` is not a multiple of `count_limit`.
        let capacity = cost_limit.min(count_limit.saturating_mul(min_weight));

        let cache = InMemoryCache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(move |_k, v: &MemoryItem<V>| {
                v.cost
                    .max(min_weight)
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .build();

        Self {
            cache: Some(cache),
            weigher,
        }
    }

    /// Inserts `value` with an explicit cost, replacing any previous value for `key`.
    pub fn insert_with_cost(&self, key: &CacheKey, value: V, cost: u64) {
        if let Some(cache) = &self.cache {
            cache.insert(key.clone(), MemoryItem { value, cost });
        }
    }

    /// Returns the value for `key` if it is cached.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let item = self.cache.as_ref()?.get(key)?;
        metric!(counter("caches.memory.hit") += 1);
        Some(item.value)
    }

    pub fn remove(&self, key: &CacheKey) {
        if let Some(cache) = &self.cache {
            cache.invalidate(key);
        }
    }

    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate_all();
            cache.run_pending_tasks();
        }
    }

    /// Runs pending evictions, so that the counters reflect the configured limits.
    pub fn sync(&self) {
        if let Some(cache) = &self.cache {
            cache.run_pending_tasks();
        }
    }

    /// The approximate number of cached values.
    pub fn entry_count(&self) -> u64 {
        self.cache.as_ref().map_or(0, |c| c.entry_count())
    }

    /// The approximate total weight of all cached values.
    pub fn weighted_size(&self) -> u64 {
        self.cache.as_ref().map_or(0, |c| c.weighted_size())
    }
}

impl<V> Cache<V> for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &CacheKey) -> Option<V> {
        MemoryCache::get(self, key)
    }

    fn insert(&self, key: &CacheKey, value: &V) -> Result<(), StorageError> {
        let cost = (self.weigher)(value);
        self.insert_with_cost(key, value.clone(), cost);
        Ok(())
    }

    fn remove(&self, key: &CacheKey) {
        MemoryCache::remove(self, key)
    }

    fn clear(&self) {
        MemoryCache::clear(self)
    }

    fn prune(&self) -> io::Result<PruneStats> {
        self.sync();
        Ok(PruneStats::default())
    }
}

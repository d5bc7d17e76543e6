use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;
use tracing::trace;

#[derive(Debug)]
struct CacheEntry<V> {
    value: Arc<V>,
    ttl: Option<Duration>,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        CacheEntry {
            value: self.value.clone(),
            ttl: self.ttl,
        }
    }
}

/// Expires each entry after the TTL it was inserted with.
struct EntryTtl;

impl<V> Expiry<String, CacheEntry<V>> for EntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-memory cache of query results keyed by fingerprint.
///
/// Reads don't block each other. Concurrent writes to the same key are last
/// writer wins.
#[derive(Debug)]
pub struct ResultCache<V: Send + Sync + 'static> {
    cache: Cache<String, CacheEntry<V>>,
}

impl<V: Send + Sync + 'static> Clone for ResultCache<V> {
    fn clone(&self) -> Self {
        ResultCache {
            cache: self.cache.clone(),
        }
    }
}

impl<V: Send + Sync + 'static> ResultCache<V> {
    pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

    pub fn new() -> Self {
        Self::with_max_entries(Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryTtl)
            .build();
        ResultCache { cache }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        let hit = self.cache.get(key).await.map(|entry| entry.value);
        trace!(%key, hit = hit.is_some(), "result cache lookup");
        hit
    }

    /// Insert a value. A `None` TTL keeps it until evicted for space.
    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value: Arc::new(value),
            ttl,
        };
        self.cache.insert(key.into(), entry).await;
    }

    pub async fn delete(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Approximate number of live entries.
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

impl<V: Send + Sync + 'static> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

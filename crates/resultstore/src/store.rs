use std::fmt::Debug;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

/// Blob store handing result payloads from workers back to callers.
#[async_trait]
pub trait ResultStore: Debug + Send + Sync {
    /// Store a payload, returning whether the write succeeded.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> bool;

    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Remove a payload, returning whether it existed.
    async fn delete(&self, key: &str) -> bool;
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    expires_at: Option<Instant>,
}

impl StoredBlob {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process local result store.
///
/// Entries expire lazily on access and when the store fills up. Writes are
/// refused when a payload exceeds the size limit or no room can be made.
#[derive(Debug)]
pub struct InMemoryResultStore {
    blobs: DashMap<String, StoredBlob>,
    max_entries: usize,
    max_blob_size: Option<usize>,
}

impl InMemoryResultStore {
    pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

    pub fn new() -> Self {
        InMemoryResultStore {
            blobs: DashMap::new(),
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            max_blob_size: None,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_max_blob_size(mut self, max_blob_size: usize) -> Self {
        self.max_blob_size = Some(max_blob_size);
        self
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.blobs.retain(|_, blob| !blob.is_expired(now));
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> bool {
        if let Some(max) = self.max_blob_size {
            if value.len() > max {
                warn!(%key, size = value.len(), max, "refusing to store oversized result payload");
                return false;
            }
        }

        if !self.blobs.contains_key(key) && self.blobs.len() >= self.max_entries {
            self.evict_expired();
            if self.blobs.len() >= self.max_entries {
                warn!(%key, entries = self.blobs.len(), "result store is full");
                return false;
            }
        }

        let blob = StoredBlob {
            data: value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.blobs.insert(key.to_string(), blob);
        debug!(%key, "stored result payload");
        true
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        match self.blobs.get(key) {
            Some(blob) if !blob.is_expired(now) => return Some(blob.data.clone()),
            Some(_) => (),
            None => return None,
        }
        self.blobs.remove_if(key, |_, blob| blob.is_expired(now));
        None
    }

    async fn delete(&self, key: &str) -> bool {
        self.blobs.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        logutil::init_test();
        let store = InMemoryResultStore::new();
        assert!(store.get("k").await.is_none());

        assert!(store.set("k", Bytes::from_static(b"payload"), None).await);
        assert_eq!(Some(Bytes::from_static(b"payload")), store.get("k").await);

        assert!(store.delete("k").await);
        assert!(!store.delete("k").await);
        assert!(store.get("k").await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_gone() {
        logutil::init_test();
        let store = InMemoryResultStore::new();
        assert!(store.set("k", Bytes::from_static(b"x"), Some(Duration::from_millis(20))).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("k").await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn refuses_writes_over_limits() {
        logutil::init_test();
        let store = InMemoryResultStore::new().with_max_blob_size(4);
        assert!(!store.set("big", Bytes::from_static(b"too large"), None).await);
        assert!(store.get("big").await.is_none());

        let store = InMemoryResultStore::new().with_max_entries(1);
        assert!(store.set("a", Bytes::from_static(b"1"), None).await);
        assert!(!store.set("b", Bytes::from_static(b"2"), None).await);
        // Overwriting an existing key is always allowed.
        assert!(store.set("a", Bytes::from_static(b"3"), None).await);
        assert_eq!(Some(Bytes::from_static(b"3")), store.get("a").await);
    }

    #[tokio::test]
    async fn full_store_makes_room_from_expired() {
        logutil::init_test();
        let store = InMemoryResultStore::new().with_max_entries(1);
        assert!(store.set("a", Bytes::from_static(b"1"), Some(Duration::from_millis(10))).await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set("b", Bytes::from_static(b"2"), None).await);
        assert_eq!(1, store.len());
    }
}

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

/// Cache interface for stored search results. The host evicts entries by
/// exact key; values are opaque payloads owned by the search subsystem.
#[async_trait]
pub trait CacheInterface: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn put(&self, key: &str, value: Vec<u8>);
    /// Remove an entry, returning whether it was present.
    async fn evict(&self, key: &str) -> bool;
    async fn clear(&self);
}

/// In-process LRU cache implementation of [`CacheInterface`].
pub struct MemoryCache {
    inner: Mutex<LruCache<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        MemoryCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[async_trait]
impl CacheInterface for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.get(key).cloned()
    }

    async fn put(&self, key: &str, value: Vec<u8>) {
        self.inner.lock().await.put(key.to_string(), value);
    }

    async fn evict(&self, key: &str) -> bool {
        self.inner.lock().await.pop(key).is_some()
    }

    async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CacheError, DeliveryError};
use crate::storage::Store;
use crate::types::{Subscription, SubscriptionId};

/// Key/value cache holding subscriptions with a per-entry expiry.
///
/// Backends synchronize internally; callers never lock around them.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Subscription>, CacheError>;
    async fn set(&self, key: &str, value: &Subscription, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Subscription,
    expires_at: Instant,
}

/// Process-local cache backend.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Subscription>, CacheError> {
        let now = Instant::now();
        {
            let guard = self.entries.read().await;
            match guard.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it unless a concurrent writer already refreshed it.
        let mut guard = self.entries.write().await;
        if guard.get(key).is_some_and(|e| e.expires_at <= now) {
            guard.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &Subscription, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Read-through cache of subscription records.
///
/// Entries live for at most `ttl`. Writers must call [`refresh`] or
/// [`invalidate`] after mutating a subscription; a concurrent reader may
/// still repopulate a stale copy, which then ages out within one TTL.
///
/// [`refresh`]: SubscriptionCache::refresh
/// [`invalidate`]: SubscriptionCache::invalidate
pub struct SubscriptionCache {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl SubscriptionCache {
    pub fn new(backend: Arc<dyn CacheBackend>, store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { backend, store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Resolve a subscription, consulting the cache before the store.
    ///
    /// Cache backend failures fall through to the store. A store miss is
    /// reported as [`DeliveryError::SubscriptionNotFound`].
    pub async fn resolve(&self, id: SubscriptionId) -> Result<Subscription, DeliveryError> {
        let key = id.cache_key();

        match self.backend.get(&key).await {
            Ok(Some(sub)) => return Ok(sub),
            Ok(None) => debug!(subscription_id = %id, "subscription cache miss"),
            Err(e) => warn!(subscription_id = %id, error = %e, "subscription cache read failed"),
        }

        let sub = self
            .store
            .get_subscription(id)
            .await?
            .ok_or(DeliveryError::SubscriptionNotFound)?;

        if let Err(e) = self.backend.set(&key, &sub, self.ttl).await {
            warn!(subscription_id = %id, error = %e, "subscription cache write failed");
        }
        Ok(sub)
    }

    /// Replace the cached copy after an update.
    pub async fn refresh(&self, sub: &Subscription) -> Result<(), CacheError> {
        self.backend.set(&sub.id.cache_key(), sub, self.ttl).await
    }

    /// Drop the cached copy after a delete.
    pub async fn invalidate(&self, id: SubscriptionId) -> Result<(), CacheError> {
        self.backend.delete(&id.cache_key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    async fn setup(
        ttl: Duration,
    ) -> (Arc<InMemoryStore>, Arc<InMemoryCache>, SubscriptionCache, Subscription) {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(InMemoryCache::new());
        let sub = Subscription::new("http://old.example.com/hook");
        store.insert_subscription(&sub).await.unwrap();
        let cache = SubscriptionCache::new(backend.clone(), store.clone(), ttl);
        (store, backend, cache, sub)
    }

    #[tokio::test]
    async fn miss_populates_cache() {
        let (_store, backend, cache, sub) = setup(Duration::from_secs(3600)).await;

        assert!(backend.is_empty().await);
        assert_eq!(cache.resolve(sub.id).await.unwrap(), sub);
        assert_eq!(backend.get(&sub.id.cache_key()).await.unwrap(), Some(sub));
    }

    #[tokio::test]
    async fn stale_copy_served_until_refreshed() {
        let (store, _backend, cache, sub) = setup(Duration::from_secs(3600)).await;
        cache.resolve(sub.id).await.unwrap();

        let mut updated = sub.clone();
        updated.target_url = "http://new.example.com/hook".to_string();
        store.update_subscription(&updated).await.unwrap();
        assert_eq!(cache.resolve(sub.id).await.unwrap().target_url, sub.target_url);

        cache.refresh(&updated).await.unwrap();
        assert_eq!(cache.resolve(sub.id).await.unwrap().target_url, updated.target_url);
    }

    #[tokio::test]
    async fn expired_entry_rereads_store() {
        let (store, _backend, cache, sub) = setup(Duration::from_millis(20)).await;
        cache.resolve(sub.id).await.unwrap();

        let mut updated = sub.clone();
        updated.target_url = "http://new.example.com/hook".to_string();
        store.update_subscription(&updated).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.resolve(sub.id).await.unwrap().target_url, updated.target_url);
    }

    #[tokio::test]
    async fn invalidate_after_delete_reports_not_found() {
        let (store, _backend, cache, sub) = setup(Duration::from_secs(3600)).await;
        cache.resolve(sub.id).await.unwrap();

        store.delete_subscription(sub.id).await.unwrap();
        cache.invalidate(sub.id).await.unwrap();

        assert_eq!(cache.resolve(sub.id).await, Err(DeliveryError::SubscriptionNotFound));
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_cache() {
        let (_store, backend, cache, sub) = setup(Duration::from_secs(3600)).await;
        let cache = Arc::new(cache);
        let id = sub.id;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.resolve(id).await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(backend.len().await, 1);
    }
}

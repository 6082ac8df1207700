#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;
#[cfg(feature = "redis")]
use redis::aio::ConnectionManager;
#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use crate::cache::CacheBackend;
#[cfg(feature = "redis")]
use crate::error::CacheError;
#[cfg(feature = "redis")]
use crate::types::Subscription;

/// Shared Redis cache backend.
///
/// Entries are stored as JSON strings with a native Redis expiry so
/// every process sees the same invalidations. One managed connection is
/// opened up front and reconnects on its own after a failure.
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisCache {
    pub async fn new(client: redis::Client) -> Result<Self, CacheError> {
        let conn = ConnectionManager::new(client).await.map_err(backend_err)?;
        Ok(Self { conn })
    }

    pub async fn open(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(backend_err)?;
        Self::new(client).await
    }
}

#[cfg(feature = "redis")]
fn backend_err(err: redis::RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}

#[cfg(feature = "redis")]
#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Subscription>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.map_err(backend_err)?;
        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Subscription, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(value)?;
        let seconds = ttl.as_secs().max(1) as usize;
        conn.set_ex::<_, _, ()>(key, payload, seconds)
            .await
            .map_err(backend_err)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(backend_err)
    }
}

#[cfg(all(test, feature = "redis"))]
mod tests {
    use super::*;

    // Needs a reachable server: REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn entries_round_trip_over_one_connection() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let cache = RedisCache::open(&url).await.unwrap();
        let sub = Subscription::new("http://example.com/hook");
        let key = format!("subscription:{}", sub.id);

        cache.set(&key, &sub, Duration::from_secs(60)).await.unwrap();
        let cached = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(cached.target_url, sub.target_url);

        cache.delete(&key).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use webhook_delivery::{
    AppState, CacheBackend, Config, DeliveryEngine, InMemoryCache, InMemoryStore, Store,
    build_router, init_tracing,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::from_env()?;
    let store = open_store(&config).await?;
    let cache = open_cache(&config).await?;

    let engine = DeliveryEngine::start(config.delivery.clone(), store, cache).await?;
    let app = build_router(AppState::new(&engine));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}

fn in_memory_store() -> Arc<dyn Store> {
    warn!("DB_URL not set, using in-memory store; accepted tasks are lost on restart");
    Arc::new(InMemoryStore::new())
}

#[cfg(feature = "postgres")]
async fn open_store(config: &Config) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(webhook_delivery::PostgresStore::connect(url).await?)),
        None => Ok(in_memory_store()),
    }
}

#[cfg(not(feature = "postgres"))]
async fn open_store(_config: &Config) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    Ok(in_memory_store())
}

#[cfg(feature = "redis")]
async fn open_cache(
    config: &Config,
) -> Result<Arc<dyn CacheBackend>, Box<dyn std::error::Error>> {
    match &config.redis_url {
        Some(url) => Ok(Arc::new(webhook_delivery::RedisCache::open(url).await?)),
        None => Ok(Arc::new(InMemoryCache::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn open_cache(
    _config: &Config,
) -> Result<Arc<dyn CacheBackend>, Box<dyn std::error::Error>> {
    Ok(Arc::new(InMemoryCache::new()))
}

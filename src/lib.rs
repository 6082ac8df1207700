//! Reliable webhook ingestion and delivery.
//!
//! Events are accepted over HTTP, verified against the subscription's
//! shared secret, persisted and handed to a durable queue. A bounded
//! worker pool posts each payload to the subscriber and records every
//! attempt in an append-only delivery log.
//!
//! ## Guarantees
//! - A `202 Accepted` means the task row and its queue job are durable
//! - At-least-once delivery, at most one concurrent attempt per task
//! - Exactly one log row per executed attempt, numbered 1..N
//! - Bounded retries with capped exponential backoff
//! - Subscription changes reach workers within one cache TTL
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across tasks
//! - Pushing final outcomes back to the ingesting caller
//! - Log rows older than the retention window

mod cache;
mod config;
mod engine;
mod error;
mod ingest;
mod janitor;
mod queue;
mod retry;
mod server;
mod signing;
mod status;
mod storage;
mod subscriptions;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod cache_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use cache::{CacheBackend, InMemoryCache, SubscriptionCache};
pub use config::{Config, DeliveryConfig, DEFAULT_PORT};
pub use engine::DeliveryEngine;
pub use error::{
    CacheError,
    ConfigError,
    DeliveryError,
    EngineError,
    IngestError,
    QueueError,
    ServiceError,
    StoreError,
};
pub use ingest::Ingestor;
pub use janitor::RetentionJanitor;
pub use queue::{
    DeliveryQueue,
    EnqueueOptions,
    Job,
    JobHandler,
    JobState,
    QueueConfig,
    QueueSpec,
    DEFAULT_QUEUE,
};
pub use retry::RetryPolicy;
pub use server::{build_router, AppState};
pub use signing::{
    compute_signature,
    verify_payload,
    verify_signature,
    VerificationError,
    SIGNATURE_HEADER,
};
pub use status::{StatusService, RECENT_LOG_LIMIT};
pub use storage::{InMemoryStore, Store};
pub use subscriptions::SubscriptionService;
pub use telemetry::init_tracing;
pub use types::{
    AttemptStatus,
    DeliveryLog,
    NewSubscription,
    Subscription,
    SubscriptionId,
    SubscriptionUpdate,
    TaskId,
    WebhookTask,
    NO_RESPONSE_STATUS,
};
pub use worker::DeliveryWorker;

#[cfg(feature = "redis")]
pub use cache_redis::RedisCache;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;

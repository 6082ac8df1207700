use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{CacheBackend, SubscriptionCache};
use crate::config::DeliveryConfig;
use crate::error::EngineError;
use crate::ingest::Ingestor;
use crate::janitor::RetentionJanitor;
use crate::queue::DeliveryQueue;
use crate::status::StatusService;
use crate::storage::Store;
use crate::subscriptions::SubscriptionService;
use crate::worker::DeliveryWorker;

/// The assembled pipeline.
///
/// Owns the queue, its worker pool and the retention janitor. Every
/// collaborator is passed in explicitly, so tests swap the store or the
/// cache backend for in-memory versions.
pub struct DeliveryEngine {
    queue: Arc<DeliveryQueue>,
    ingestor: Arc<Ingestor>,
    subscriptions: Arc<SubscriptionService>,
    status: Arc<StatusService>,
    shutdown: CancellationToken,
    janitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryEngine {
    /// Wire the components together and start background work.
    ///
    /// Unfinished jobs left in `store` by a previous run are resumed
    /// before this returns.
    pub async fn start(
        config: DeliveryConfig,
        store: Arc<dyn Store>,
        cache_backend: Arc<dyn CacheBackend>,
    ) -> Result<Self, EngineError> {
        let cache = Arc::new(SubscriptionCache::new(
            cache_backend,
            store.clone(),
            config.cache_ttl,
        ));

        let worker = DeliveryWorker::new(
            cache.clone(),
            store.clone(),
            config.attempt_timeout,
            config.error_body_limit,
        )?;

        let queue = Arc::new(
            DeliveryQueue::start(config.queue_config(), store.clone(), Arc::new(worker)).await?,
        );

        let shutdown = CancellationToken::new();
        let janitor =
            RetentionJanitor::new(store.clone(), config.janitor_period, config.log_retention);
        let janitor_handle = tokio::spawn(janitor.run(shutdown.clone()));

        info!(
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            "delivery engine started"
        );

        Ok(Self {
            ingestor: Arc::new(Ingestor::new(
                store.clone(),
                queue.clone(),
                config.enqueue_options(),
            )),
            subscriptions: Arc::new(SubscriptionService::new(store.clone(), cache)),
            status: Arc::new(StatusService::new(store)),
            queue,
            shutdown,
            janitor_handle: Mutex::new(Some(janitor_handle)),
        })
    }

    pub fn ingestor(&self) -> Arc<Ingestor> {
        self.ingestor.clone()
    }

    pub fn subscriptions(&self) -> Arc<SubscriptionService> {
        self.subscriptions.clone()
    }

    pub fn status(&self) -> Arc<StatusService> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.queue.is_running()
    }

    /// Stop accepting work, let in-flight attempts conclude and stop the
    /// janitor. Queued and scheduled jobs stay in the store.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.shutdown.cancel();

        let janitor = self.janitor_handle.lock().await.take();
        if let Some(handle) = janitor {
            let _ = handle.await;
        }
        info!("delivery engine stopped");
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

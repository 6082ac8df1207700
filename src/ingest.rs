use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::queue::{DeliveryQueue, EnqueueOptions};
use crate::signing::verify_payload;
use crate::storage::Store;
use crate::telemetry::metric_inc;
use crate::types::{SubscriptionId, TaskId, WebhookTask};

/// Accepts inbound events and turns them into queued delivery jobs.
///
/// The subscription is read from the store rather than the cache so the
/// secret used for verification is always the current one.
pub struct Ingestor {
    store: Arc<dyn Store>,
    queue: Arc<DeliveryQueue>,
    options: EnqueueOptions,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>, queue: Arc<DeliveryQueue>, options: EnqueueOptions) -> Self {
        Self { store, queue, options }
    }

    /// Validate, verify, persist and enqueue one event.
    ///
    /// On `Ok` the task row exists and its job is durable in the queue.
    /// The signature is checked over the canonical re-encoding of the
    /// body, which is also the exact payload that will be delivered.
    pub async fn ingest(
        &self,
        subscription_id: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<TaskId, IngestError> {
        let subscription_id: SubscriptionId = subscription_id
            .parse()
            .map_err(|_| IngestError::BadRequest("Invalid subscription ID".to_string()))?;

        let payload = canonicalize(body)?;

        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or(IngestError::NotFound)?;

        if let Err(e) = verify_payload(&sub.secret, &payload, signature) {
            warn!(
                subscription_id = %subscription_id,
                reason = e.message(),
                "rejected unsigned or mis-signed event"
            );
            metric_inc("webhook.ingest.unauthorized");
            return Err(IngestError::Unauthorized(e.message()));
        }

        let task = WebhookTask::new(subscription_id, payload);
        let task_id = task.id;
        self.store.insert_task(&task).await?;

        let job_id: Uuid = match self.queue.enqueue(task, self.options.clone()).await {
            Ok(id) => id,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "task persisted but could not be enqueued");
                return Err(e.into());
            }
        };

        info!(
            task_id = %task_id,
            job_id = %job_id,
            subscription_id = %subscription_id,
            "webhook queued"
        );
        metric_inc("webhook.ingest.accepted");
        Ok(task_id)
    }
}

/// Parse a JSON object and re-encode it with sorted keys and no
/// insignificant whitespace.
fn canonicalize(body: &[u8]) -> Result<Vec<u8>, IngestError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|_| IngestError::BadRequest("Invalid JSON".to_string()))?;
    if !value.is_object() {
        return Err(IngestError::BadRequest("Invalid JSON".to_string()));
    }
    serde_json::to_vec(&value)
        .map_err(|e| IngestError::Internal(format!("payload marshal failed: {e}")))
}

use std::sync::Arc;

use crate::error::ServiceError;
use crate::storage::Store;
use crate::types::{DeliveryLog, SubscriptionId, TaskId};

/// Rows returned by [`StatusService::recent_logs_for_subscription`].
pub const RECENT_LOG_LIMIT: usize = 20;

/// Read-only view over the delivery log.
pub struct StatusService {
    store: Arc<dyn Store>,
}

impl StatusService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Every recorded attempt for a task, oldest first. An unknown task
    /// yields an empty list.
    pub async fn logs_for_task(&self, task_id: TaskId) -> Result<Vec<DeliveryLog>, ServiceError> {
        Ok(self.store.logs_for_task(task_id).await?)
    }

    /// The latest attempts across all tasks of a subscription, newest first.
    pub async fn recent_logs_for_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Vec<DeliveryLog>, ServiceError> {
        Ok(self
            .store
            .recent_logs_for_subscription(subscription_id, RECENT_LOG_LIMIT)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::types::WebhookTask;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn task_logs_are_oldest_first() {
        let store = Arc::new(InMemoryStore::new());
        let task = WebhookTask::new(SubscriptionId::new(), b"{}".to_vec());
        let now = Utc::now();

        for attempt in [3u32, 1, 2] {
            let mut log =
                DeliveryLog::failure(&task, "http://example.com", attempt, 503, "HTTP 503: ");
            log.created_at = now + Duration::seconds(attempt as i64);
            store.insert_log(&log).await.unwrap();
        }

        let service = StatusService::new(store);
        let attempts: Vec<u32> = service
            .logs_for_task(task.id)
            .await
            .unwrap()
            .iter()
            .map(|l| l.attempt_number)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert!(service.logs_for_task(TaskId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscription_logs_are_capped_and_newest_first() {
        let store = Arc::new(InMemoryStore::new());
        let sub_id = SubscriptionId::new();
        let now = Utc::now();

        for i in 0..25 {
            let task = WebhookTask::new(sub_id, b"{}".to_vec());
            let mut log = DeliveryLog::success(&task, "http://example.com", 1, 200);
            log.created_at = now + Duration::seconds(i);
            store.insert_log(&log).await.unwrap();
        }

        let logs = StatusService::new(store)
            .recent_logs_for_subscription(sub_id)
            .await
            .unwrap();
        assert_eq!(logs.len(), RECENT_LOG_LIMIT);
        assert_eq!(logs[0].created_at, now + Duration::seconds(24));
        assert!(logs.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::StoreError;
use crate::storage::Store;
use crate::telemetry::metric_add;

/// Periodically deletes delivery log rows and finished queue jobs past
/// their retention window.
///
/// Subscriptions, tasks and unfinished jobs are never removed here.
pub struct RetentionJanitor {
    store: Arc<dyn Store>,
    period: Duration,
    retention: Duration,
}

impl RetentionJanitor {
    pub fn new(store: Arc<dyn Store>, period: Duration, retention: Duration) -> Self {
        Self {
            store,
            period,
            retention,
        }
    }

    /// Run a single pass, purging rows older than `now - retention`.
    ///
    /// Returns the number of log rows removed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| StoreError::Backend(format!("retention out of range: {e}")))?;
        let cutoff = now - retention;

        let removed = self.store.purge_logs_before(cutoff).await?;
        info!(removed, cutoff = %cutoff, "cleaned up old delivery logs");
        metric_add("webhook.janitor.purged", removed);

        let jobs_removed = self.store.purge_finished_jobs_before(cutoff).await?;
        info!(removed = jobs_removed, cutoff = %cutoff, "cleaned up finished jobs");
        metric_add("webhook.janitor.jobs_purged", jobs_removed);
        Ok(removed)
    }

    /// Tick every `period` until cancelled. The first pass happens one
    /// full period after start. A failed pass is logged and skipped.
    pub async fn run(self, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + self.period;
        let mut ticker = interval_at(start, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "failed to clean up delivery logs");
                    }
                }
            }
        }
        info!("retention janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Job, JobState};
    use crate::storage::InMemoryStore;
    use crate::types::{DeliveryLog, Subscription, SubscriptionId, TaskId, WebhookTask};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn log_at(task: &WebhookTask, created_at: DateTime<Utc>) -> DeliveryLog {
        let mut log = DeliveryLog::success(task, "http://example.com/hook", 1, 200);
        log.created_at = created_at;
        log
    }

    #[tokio::test]
    async fn removes_only_rows_older_than_retention() {
        let store = Arc::new(InMemoryStore::new());
        let task = WebhookTask::new(SubscriptionId::new(), b"{}".to_vec());
        let now = Utc::now();

        for hours in [1, 23, 25, 48] {
            store
                .insert_log(&log_at(&task, now - chrono::Duration::hours(hours)))
                .await
                .unwrap();
        }

        let janitor = RetentionJanitor::new(store.clone(), Duration::from_secs(6 * 3600), DAY);
        assert_eq!(janitor.run_once(now).await.unwrap(), 2);

        let remaining = store.all_logs().await;
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|l| now - l.created_at < chrono::Duration::hours(24)));
    }

    #[tokio::test]
    async fn leaves_tasks_and_subscriptions_alone() {
        let store = Arc::new(InMemoryStore::new());
        let task = WebhookTask::new(SubscriptionId::new(), b"{}".to_vec());
        store.insert_task(&task).await.unwrap();
        store
            .insert_log(&log_at(&task, Utc::now() - chrono::Duration::days(3)))
            .await
            .unwrap();

        let janitor = RetentionJanitor::new(store.clone(), Duration::from_secs(6 * 3600), DAY);
        janitor.run_once(Utc::now()).await.unwrap();

        assert!(store.all_logs().await.is_empty());
        assert!(store.get_task(task.id).await.unwrap().is_some());
    }

    fn job_at(state: JobState, last_attempt: DateTime<Utc>) -> Job {
        Job {
            id: uuid::Uuid::new_v4(),
            task: WebhookTask::new(SubscriptionId::new(), b"{}".to_vec()),
            queue: crate::queue::DEFAULT_QUEUE.to_string(),
            attempt: 1,
            max_attempts: 5,
            timeout: Duration::from_secs(10),
            state,
            last_error: None,
            enqueued_at: last_attempt,
            next_attempt_at: last_attempt,
        }
    }

    #[tokio::test]
    async fn prunes_finished_jobs_but_keeps_unfinished_ones() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let old = now - chrono::Duration::days(2);

        let succeeded = job_at(JobState::Succeeded, old);
        let dead = job_at(JobState::DeadLettered, old);
        let recent = job_at(JobState::Succeeded, now - chrono::Duration::hours(1));
        let pending = job_at(JobState::Pending, old);
        let retrying = job_at(JobState::FailedRetryable, old);
        for job in [&succeeded, &dead, &recent, &pending, &retrying] {
            store.save_job(job).await.unwrap();
        }

        let janitor = RetentionJanitor::new(store.clone(), Duration::from_secs(6 * 3600), DAY);
        janitor.run_once(now).await.unwrap();

        assert!(store.job(succeeded.id).await.is_none());
        assert!(store.job(dead.id).await.is_none());
        assert!(store.job(recent.id).await.is_some());
        assert!(store.job(pending.id).await.is_some());
        assert!(store.job(retrying.id).await.is_some());
        assert_eq!(store.load_unfinished_jobs().await.unwrap().len(), 2);
    }

    /// Store whose purge fails on the first call only.
    struct FlakyPurge {
        inner: InMemoryStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Store for FlakyPurge {
        async fn insert_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
            self.inner.insert_subscription(sub).await
        }
        async fn get_subscription(
            &self,
            id: SubscriptionId,
        ) -> Result<Option<Subscription>, StoreError> {
            self.inner.get_subscription(id).await
        }
        async fn update_subscription(&self, sub: &Subscription) -> Result<bool, StoreError> {
            self.inner.update_subscription(sub).await
        }
        async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StoreError> {
            self.inner.delete_subscription(id).await
        }
        async fn insert_task(&self, task: &WebhookTask) -> Result<(), StoreError> {
            self.inner.insert_task(task).await
        }
        async fn get_task(&self, id: TaskId) -> Result<Option<WebhookTask>, StoreError> {
            self.inner.get_task(id).await
        }
        async fn insert_log(&self, log: &DeliveryLog) -> Result<(), StoreError> {
            self.inner.insert_log(log).await
        }
        async fn logs_for_task(&self, task_id: TaskId) -> Result<Vec<DeliveryLog>, StoreError> {
            self.inner.logs_for_task(task_id).await
        }
        async fn recent_logs_for_subscription(
            &self,
            subscription_id: SubscriptionId,
            limit: usize,
        ) -> Result<Vec<DeliveryLog>, StoreError> {
            self.inner.recent_logs_for_subscription(subscription_id, limit).await
        }
        async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.purge_logs_before(cutoff).await
        }
        async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.save_job(job).await
        }
        async fn load_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError> {
            self.inner.load_unfinished_jobs().await
        }
        async fn purge_finished_jobs_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.inner.purge_finished_jobs_before(cutoff).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pass_waits_for_next_tick() {
        let store = Arc::new(FlakyPurge {
            inner: InMemoryStore::new(),
            calls: AtomicUsize::new(0),
        });
        let task = WebhookTask::new(SubscriptionId::new(), b"{}".to_vec());
        store
            .insert_log(&log_at(&task, Utc::now() - chrono::Duration::days(2)))
            .await
            .unwrap();

        let period = Duration::from_secs(6 * 3600);
        let janitor = RetentionJanitor::new(store.clone(), period, DAY);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(janitor.run(shutdown.clone()));

        tokio::time::sleep(period + Duration::from_secs(1)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.all_logs().await.len(), 1);

        tokio::time::sleep(period).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
        assert!(store.inner.all_logs().await.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}

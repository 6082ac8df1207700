use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::queue::{Job, JobState};
use crate::types::{DeliveryLog, Subscription, SubscriptionId, TaskId, WebhookTask};

/// Durable state behind the pipeline.
///
/// Implementations provide their own isolation. The only atomicity the
/// pipeline relies on is a single `insert_log` per attempt.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_subscription(&self, sub: &Subscription) -> Result<(), StoreError>;
    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError>;
    /// Returns `false` when no row matched.
    async fn update_subscription(&self, sub: &Subscription) -> Result<bool, StoreError>;
    /// Returns `false` when no row matched.
    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StoreError>;

    async fn insert_task(&self, task: &WebhookTask) -> Result<(), StoreError>;
    async fn get_task(&self, id: TaskId) -> Result<Option<WebhookTask>, StoreError>;

    async fn insert_log(&self, log: &DeliveryLog) -> Result<(), StoreError>;
    /// All attempts for a task, oldest first.
    async fn logs_for_task(&self, task_id: TaskId) -> Result<Vec<DeliveryLog>, StoreError>;
    /// Most recent attempts for a subscription, newest first.
    async fn recent_logs_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<DeliveryLog>, StoreError>;
    /// Delete attempts created strictly before `cutoff`, returning the count.
    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Upsert the queue's view of a job.
    async fn save_job(&self, job: &Job) -> Result<(), StoreError>;
    /// Jobs not yet succeeded or dead-lettered.
    async fn load_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError>;
    /// Delete succeeded and dead-lettered jobs whose last attempt was
    /// scheduled before `cutoff`. Unfinished jobs are never touched.
    async fn purge_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory storage for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStore {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    tasks: Mutex<HashMap<TaskId, WebhookTask>>,
    logs: Mutex<Vec<DeliveryLog>>,
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn all_logs(&self) -> Vec<DeliveryLog> {
        self.logs.lock().await.clone()
    }

    pub async fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().await.get(&id).cloned()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        let mut subs = self.subscriptions.lock().await;
        if subs.contains_key(&sub.id) {
            return Err(StoreError::Backend(format!("duplicate subscription id {}", sub.id)));
        }
        subs.insert(sub.id, sub.clone());
        Ok(())
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.lock().await.get(&id).cloned())
    }

    async fn update_subscription(&self, sub: &Subscription) -> Result<bool, StoreError> {
        let mut subs = self.subscriptions.lock().await;
        match subs.get_mut(&sub.id) {
            Some(existing) => {
                *existing = sub.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StoreError> {
        Ok(self.subscriptions.lock().await.remove(&id).is_some())
    }

    async fn insert_task(&self, task: &WebhookTask) -> Result<(), StoreError> {
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<WebhookTask>, StoreError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn insert_log(&self, log: &DeliveryLog) -> Result<(), StoreError> {
        self.logs.lock().await.push(log.clone());
        Ok(())
    }

    async fn logs_for_task(&self, task_id: TaskId) -> Result<Vec<DeliveryLog>, StoreError> {
        let logs = self.logs.lock().await;
        let mut matching: Vec<DeliveryLog> = logs
            .iter()
            .filter(|l| l.webhook_task_id == task_id)
            .cloned()
            .collect();
        matching.sort_by_key(|l| (l.created_at, l.attempt_number));
        Ok(matching)
    }

    async fn recent_logs_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<DeliveryLog>, StoreError> {
        let logs = self.logs.lock().await;
        let mut matching: Vec<DeliveryLog> = logs
            .iter()
            .filter(|l| l.subscription_id == subscription_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut logs = self.logs.lock().await;
        let before = logs.len();
        logs.retain(|l| l.created_at >= cutoff);
        Ok((before - logs.len()) as u64)
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut pending: Vec<Job> = jobs
            .values()
            .filter(|j| !matches!(j.state, JobState::Succeeded | JobState::DeadLettered))
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.enqueued_at);
        Ok(pending)
    }

    async fn purge_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.state.is_finished() && j.next_attempt_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttemptStatus, NO_RESPONSE_STATUS};
    use chrono::Duration;

    fn log_at(task: &WebhookTask, attempt: u32, created_at: DateTime<Utc>) -> DeliveryLog {
        let mut log =
            DeliveryLog::failure(task, "http://example.com", attempt, NO_RESPONSE_STATUS, "x");
        log.created_at = created_at;
        log
    }

    #[tokio::test]
    async fn purge_keeps_rows_at_or_after_cutoff() {
        let store = InMemoryStore::new();
        let task = WebhookTask::new(SubscriptionId::new(), b"{}".to_vec());
        let now = Utc::now();
        let cutoff = now - Duration::hours(24);

        store.insert_log(&log_at(&task, 1, cutoff - Duration::seconds(1))).await.unwrap();
        store.insert_log(&log_at(&task, 2, cutoff)).await.unwrap();
        store.insert_log(&log_at(&task, 3, now)).await.unwrap();

        assert_eq!(store.purge_logs_before(cutoff).await.unwrap(), 1);
        let remaining: Vec<u32> = store
            .logs_for_task(task.id)
            .await
            .unwrap()
            .iter()
            .map(|l| l.attempt_number)
            .collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    #[tokio::test]
    async fn recent_logs_are_newest_first_and_limited() {
        let store = InMemoryStore::new();
        let sub = SubscriptionId::new();
        let task = WebhookTask::new(sub, b"{}".to_vec());
        let base = Utc::now() - Duration::hours(1);

        for i in 0..25 {
            let created_at = base + Duration::seconds(i as i64);
            store.insert_log(&log_at(&task, i + 1, created_at)).await.unwrap();
        }

        let recent = store.recent_logs_for_subscription(sub, 20).await.unwrap();
        assert_eq!(recent.len(), 20);
        assert_eq!(recent[0].attempt_number, 25);
        assert_eq!(recent[19].attempt_number, 6);
        assert!(recent.iter().all(|l| l.status == AttemptStatus::Failed));
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_rows() {
        let store = InMemoryStore::new();
        let sub = Subscription::new("http://example.com");

        assert!(!store.update_subscription(&sub).await.unwrap());
        store.insert_subscription(&sub).await.unwrap();
        assert!(store.update_subscription(&sub).await.unwrap());
        assert!(store.delete_subscription(sub.id).await.unwrap());
        assert!(!store.delete_subscription(sub.id).await.unwrap());
    }
}

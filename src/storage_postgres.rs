#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use chrono::{DateTime, Utc};
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, NoTls, Row};
#[cfg(feature = "postgres")]
use tracing::error;
#[cfg(feature = "postgres")]
use uuid::Uuid;

#[cfg(feature = "postgres")]
use crate::error::StoreError;
#[cfg(feature = "postgres")]
use crate::queue::{Job, JobState};
#[cfg(feature = "postgres")]
use crate::storage::Store;
#[cfg(feature = "postgres")]
use crate::types::{DeliveryLog, Subscription, SubscriptionId, TaskId, WebhookTask};

#[cfg(feature = "postgres")]
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS subscriptions (
        id UUID PRIMARY KEY,
        target_url TEXT NOT NULL,
        secret TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS webhook_tasks (
        id UUID PRIMARY KEY,
        subscription_id UUID NOT NULL,
        payload BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS delivery_logs (
        id UUID PRIMARY KEY,
        webhook_task_id UUID NOT NULL,
        subscription_id UUID NOT NULL,
        target_url TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        status TEXT NOT NULL,
        http_status INTEGER NOT NULL,
        error_message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS delivery_logs_task_idx
        ON delivery_logs (webhook_task_id, created_at)",
    "CREATE INDEX IF NOT EXISTS delivery_logs_subscription_idx
        ON delivery_logs (subscription_id, created_at)",
    "CREATE INDEX IF NOT EXISTS delivery_logs_created_idx ON delivery_logs (created_at)",
    "CREATE TABLE IF NOT EXISTS delivery_jobs (
        id UUID PRIMARY KEY,
        state TEXT NOT NULL,
        enqueued_at TIMESTAMPTZ NOT NULL,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS delivery_jobs_state_idx ON delivery_jobs (state, next_attempt_at)",
];

/// Postgres-backed [`Store`].
///
/// Queue jobs are kept as JSONB documents next to a plain `state`
/// column used to find unfinished work after a restart.
#[cfg(feature = "postgres")]
pub struct PostgresStore {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresStore {
    /// Wrap an existing client and create any missing tables.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            client.execute(*statement, &[]).await.map_err(pg_err)?;
        }
        Ok(Self { client })
    }

    /// Connect without TLS and drive the connection on a background task.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await.map_err(pg_err)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection closed");
            }
        });
        Self::new(client).await
    }
}

#[cfg(feature = "postgres")]
fn pg_err(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(feature = "postgres")]
fn subscription_from_row(row: &Row) -> Result<Subscription, StoreError> {
    Ok(Subscription {
        id: SubscriptionId(row.try_get("id").map_err(pg_err)?),
        target_url: row.try_get("target_url").map_err(pg_err)?,
        secret: row.try_get("secret").map_err(pg_err)?,
    })
}

#[cfg(feature = "postgres")]
fn log_from_row(row: &Row) -> Result<DeliveryLog, StoreError> {
    let status: String = row.try_get("status").map_err(pg_err)?;
    let attempt_number: i32 = row.try_get("attempt_number").map_err(pg_err)?;
    let http_status: i32 = row.try_get("http_status").map_err(pg_err)?;

    Ok(DeliveryLog {
        id: row.try_get("id").map_err(pg_err)?,
        webhook_task_id: TaskId(row.try_get("webhook_task_id").map_err(pg_err)?),
        subscription_id: SubscriptionId(row.try_get("subscription_id").map_err(pg_err)?),
        target_url: row.try_get("target_url").map_err(pg_err)?,
        attempt_number: u32::try_from(attempt_number)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        http_status: u16::try_from(http_status)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        error_message: row.try_get("error_message").map_err(pg_err)?,
        created_at: row.try_get("created_at").map_err(pg_err)?,
    })
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Store for PostgresStore {
    async fn insert_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO subscriptions (id, target_url, secret) VALUES ($1, $2, $3)",
                &[&sub.id.0, &sub.target_url, &sub.secret],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn get_subscription(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT id, target_url, secret FROM subscriptions WHERE id = $1", &[&id.0])
            .await
            .map_err(pg_err)?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn update_subscription(&self, sub: &Subscription) -> Result<bool, StoreError> {
        let updated = self
            .client
            .execute(
                "UPDATE subscriptions SET target_url = $2, secret = $3 WHERE id = $1",
                &[&sub.id.0, &sub.target_url, &sub.secret],
            )
            .await
            .map_err(pg_err)?;
        Ok(updated > 0)
    }

    async fn delete_subscription(&self, id: SubscriptionId) -> Result<bool, StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM subscriptions WHERE id = $1", &[&id.0])
            .await
            .map_err(pg_err)?;
        Ok(deleted > 0)
    }

    async fn insert_task(&self, task: &WebhookTask) -> Result<(), StoreError> {
        self.client
            .execute(
                "INSERT INTO webhook_tasks (id, subscription_id, payload, created_at)
                 VALUES ($1, $2, $3, $4)",
                &[&task.id.0, &task.subscription_id.0, &task.payload, &task.created_at],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<WebhookTask>, StoreError> {
        let Some(row) = self
            .client
            .query_opt(
                "SELECT id, subscription_id, payload, created_at FROM webhook_tasks WHERE id = $1",
                &[&id.0],
            )
            .await
            .map_err(pg_err)?
        else {
            return Ok(None);
        };

        Ok(Some(WebhookTask {
            id: TaskId(row.try_get("id").map_err(pg_err)?),
            subscription_id: SubscriptionId(row.try_get("subscription_id").map_err(pg_err)?),
            payload: row.try_get("payload").map_err(pg_err)?,
            created_at: row.try_get("created_at").map_err(pg_err)?,
        }))
    }

    async fn insert_log(&self, log: &DeliveryLog) -> Result<(), StoreError> {
        let attempt_number = i32::try_from(log.attempt_number)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let http_status = i32::from(log.http_status);
        self.client
            .execute(
                "INSERT INTO delivery_logs (id, webhook_task_id, subscription_id, target_url, \
                 attempt_number, status, http_status, error_message, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &log.id,
                    &log.webhook_task_id.0,
                    &log.subscription_id.0,
                    &log.target_url,
                    &attempt_number,
                    &log.status.as_str(),
                    &http_status,
                    &log.error_message,
                    &log.created_at,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn logs_for_task(&self, task_id: TaskId) -> Result<Vec<DeliveryLog>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, webhook_task_id, subscription_id, target_url, attempt_number, \
                 status, http_status, error_message, created_at \
                 FROM delivery_logs WHERE webhook_task_id = $1 \
                 ORDER BY created_at ASC, attempt_number ASC",
                &[&task_id.0],
            )
            .await
            .map_err(pg_err)?;
        rows.iter().map(log_from_row).collect()
    }

    async fn recent_logs_for_subscription(
        &self,
        subscription_id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<DeliveryLog>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                "SELECT id, webhook_task_id, subscription_id, target_url, attempt_number, \
                 status, http_status, error_message, created_at \
                 FROM delivery_logs WHERE subscription_id = $1 \
                 ORDER BY created_at DESC LIMIT $2",
                &[&subscription_id.0, &limit],
            )
            .await
            .map_err(pg_err)?;
        rows.iter().map(log_from_row).collect()
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.client
            .execute("DELETE FROM delivery_logs WHERE created_at < $1", &[&cutoff])
            .await
            .map_err(pg_err)
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_value(job).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.client
            .execute(
                "INSERT INTO delivery_jobs (id, state, enqueued_at, next_attempt_at, payload)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state,
                     next_attempt_at = EXCLUDED.next_attempt_at, payload = EXCLUDED.payload",
                &[
                    &job.id,
                    &job.state.as_str(),
                    &job.enqueued_at,
                    &job.next_attempt_at,
                    &payload,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn load_unfinished_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT id, payload FROM delivery_jobs
                 WHERE state NOT IN ($1, $2)
                 ORDER BY enqueued_at ASC",
                &[&JobState::Succeeded.as_str(), &JobState::DeadLettered.as_str()],
            )
            .await
            .map_err(pg_err)?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("id").map_err(pg_err)?;
                let payload: serde_json::Value = row.try_get("payload").map_err(pg_err)?;
                serde_json::from_value::<Job>(payload)
                    .map_err(|e| StoreError::Corrupt(format!("job {id}: {e}")))
            })
            .collect()
    }

    async fn purge_finished_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.client
            .execute(
                "DELETE FROM delivery_jobs WHERE state IN ($1, $2) AND next_attempt_at < $3",
                &[
                    &JobState::Succeeded.as_str(),
                    &JobState::DeadLettered.as_str(),
                    &cutoff,
                ],
            )
            .await
            .map_err(pg_err)
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};

use crate::cache::SubscriptionCache;
use crate::error::DeliveryError;
use crate::queue::{Job, JobHandler};
use crate::storage::Store;
use crate::types::{DeliveryLog, NO_RESPONSE_STATUS, WebhookTask};

/// Outcome of the network part of an attempt, before it is recorded.
struct Attempt {
    target_url: String,
    http_status: u16,
    result: Result<(), DeliveryError>,
    detail: String,
}

impl Attempt {
    fn failed(
        target_url: impl Into<String>,
        http_status: u16,
        err: DeliveryError,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            target_url: target_url.into(),
            http_status,
            result: Err(err),
            detail: detail.into(),
        }
    }
}

/// Performs one delivery attempt per invocation and records it.
///
/// Every call appends exactly one [`DeliveryLog`] row, including the
/// early-exit paths, before the outcome is returned to the queue.
pub struct DeliveryWorker {
    cache: Arc<SubscriptionCache>,
    store: Arc<dyn Store>,
    client: reqwest::Client,
    error_body_limit: usize,
}

impl DeliveryWorker {
    pub fn new(
        cache: Arc<SubscriptionCache>,
        store: Arc<dyn Store>,
        request_timeout: Duration,
        error_body_limit: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("webhook-delivery/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            cache,
            store,
            client,
            error_body_limit,
        })
    }

    /// Deliver `job.task` once, logging it as attempt `job.attempt`.
    pub async fn deliver(&self, job: &Job, deadline: Instant) -> Result<(), DeliveryError> {
        let task = &job.task;
        let attempt = self.attempt(task, deadline, job.timeout).await;
        let log = match &attempt.result {
            Ok(()) => {
                DeliveryLog::success(task, &attempt.target_url, job.attempt, attempt.http_status)
            }
            Err(_) => DeliveryLog::failure(
                task,
                &attempt.target_url,
                job.attempt,
                attempt.http_status,
                attempt.detail.clone(),
            ),
        };

        match &attempt.result {
            Ok(()) => info!(
                task_id = %task.id,
                attempt = job.attempt,
                http_status = attempt.http_status,
                target_url = %attempt.target_url,
                "webhook delivered"
            ),
            Err(err) => warn!(
                task_id = %task.id,
                attempt = job.attempt,
                http_status = attempt.http_status,
                target_url = %attempt.target_url,
                error = %err,
                "webhook delivery failed"
            ),
        }

        if let Err(e) = self.store.insert_log(&log).await {
            error!(
                task_id = %task.id,
                attempt = job.attempt,
                error = %e,
                "failed to record delivery attempt"
            );
        }

        attempt.result
    }

    async fn attempt(&self, task: &WebhookTask, deadline: Instant, budget: Duration) -> Attempt {
        let sub = match timeout_at(deadline, self.cache.resolve(task.subscription_id)).await {
            Ok(Ok(sub)) => sub,
            Ok(Err(err)) => {
                let detail = err.to_string();
                return Attempt::failed("", NO_RESPONSE_STATUS, err, detail);
            }
            Err(_) => {
                let err = DeliveryError::Timeout(budget);
                let detail = "timed out resolving subscription";
                return Attempt::failed("", NO_RESPONSE_STATUS, err, detail);
            }
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let request = self
            .client
            .post(&sub.target_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .timeout(remaining)
            .body(task.payload.clone());

        let response = match timeout_at(deadline, request.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                let detail = err.to_string();
                let kind = if err.is_timeout() {
                    DeliveryError::Timeout(budget)
                } else {
                    DeliveryError::Transport(detail.clone())
                };
                return Attempt::failed(sub.target_url, NO_RESPONSE_STATUS, kind, detail);
            }
            Err(_) => {
                let err = DeliveryError::Timeout(budget);
                let detail = err.to_string();
                return Attempt::failed(sub.target_url, NO_RESPONSE_STATUS, err, detail);
            }
        };

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Attempt {
                target_url: sub.target_url,
                http_status: status,
                result: Ok(()),
                detail: String::new(),
            };
        }

        let body = read_capped(response, self.error_body_limit, deadline).await;
        Attempt::failed(
            sub.target_url,
            status,
            DeliveryError::HttpStatus(status),
            format!("HTTP {status}: {body}"),
        )
    }
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn handle(&self, job: &Job, deadline: Instant) -> Result<(), DeliveryError> {
        self.deliver(job, deadline).await
    }
}

/// Read at most `limit` bytes of an error body, stopping at the deadline.
async fn read_capped(mut response: reqwest::Response, limit: usize, deadline: Instant) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < limit {
        match timeout_at(deadline, response.chunk()).await {
            Ok(Ok(Some(chunk))) => buf.extend_from_slice(&chunk),
            _ => break,
        }
    }
    truncate_utf8(&buf, limit)
}

fn truncate_utf8(bytes: &[u8], limit: usize) -> String {
    let mut text = String::from_utf8_lossy(&bytes[..bytes.len().min(limit)]).into_owned();
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_utf8(b"hello world", 5), "hello");
        assert_eq!(truncate_utf8("héllo".as_bytes(), 2), "h");
        assert_eq!(truncate_utf8(b"short", 1024), "short");
        assert_eq!(truncate_utf8(b"", 10), "");
    }
}

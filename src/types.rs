use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a subscription.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of subscription IDs with task or log identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Key under which the subscription is cached.
    pub fn cache_key(&self) -> String {
        format!("subscription:{}", self.0)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SubscriptionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for an ingested webhook task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Destination for webhook delivery.
///
/// The identifier never changes once created. The target URL and secret
/// may be replaced by the owner, which must refresh any cached copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,

    /// Callback URL that receives delivered payloads.
    pub target_url: String,

    /// Shared secret for inbound signature verification.
    /// Empty means payloads are accepted unauthenticated.
    #[serde(default)]
    pub secret: String,
}

impl Subscription {
    /// Create a subscription with a fresh identifier and no secret.
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            id: SubscriptionId::new(),
            target_url: target_url.into(),
            secret: String::new(),
        }
    }

    /// Set a secret for HMAC verification.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn requires_signature(&self) -> bool {
        !self.secret.is_empty()
    }
}

/// Request body for registering a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub target_url: String,
    #[serde(default)]
    pub secret: String,
}

/// Replacement values for a subscription's mutable attributes.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionUpdate {
    pub target_url: String,
    #[serde(default)]
    pub secret: String,
}

/// A durable record of one ingested event.
///
/// The payload is exactly the canonical bytes that passed signature
/// verification and is never re-validated or mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTask {
    pub id: TaskId,
    pub subscription_id: SubscriptionId,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl WebhookTask {
    pub fn new(subscription_id: SubscriptionId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: TaskId::new(),
            subscription_id,
            payload: payload.into(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "Success",
            AttemptStatus::Failed => "Failed",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(AttemptStatus::Success),
            "Failed" => Ok(AttemptStatus::Failed),
            other => Err(format!("unknown attempt status: {other}")),
        }
    }
}

/// HTTP status recorded when no response was obtained.
pub const NO_RESPONSE_STATUS: u16 = 0;

/// Immutable record of a single delivery attempt.
///
/// Target URL and subscription id are copied at attempt time so the row
/// stays meaningful after the subscription changes or disappears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub webhook_task_id: TaskId,
    pub subscription_id: SubscriptionId,
    pub target_url: String,

    /// 1-based, taken from the queue's attempt counter.
    pub attempt_number: u32,
    pub status: AttemptStatus,

    /// Observed response status, or [`NO_RESPONSE_STATUS`].
    pub http_status: u16,

    /// Empty on success.
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

impl DeliveryLog {
    pub fn success(
        task: &WebhookTask,
        target_url: &str,
        attempt_number: u32,
        http_status: u16,
    ) -> Self {
        Self::record(
            task,
            target_url,
            attempt_number,
            AttemptStatus::Success,
            http_status,
            String::new(),
        )
    }

    pub fn failure(
        task: &WebhookTask,
        target_url: &str,
        attempt_number: u32,
        http_status: u16,
        error_message: impl Into<String>,
    ) -> Self {
        Self::record(
            task,
            target_url,
            attempt_number,
            AttemptStatus::Failed,
            http_status,
            error_message.into(),
        )
    }

    fn record(
        task: &WebhookTask,
        target_url: &str,
        attempt_number: u32,
        status: AttemptStatus,
        http_status: u16,
        error_message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_task_id: task.id,
            subscription_id: task.subscription_id,
            target_url: target_url.to_string(),
            attempt_number,
            status,
            http_status,
            error_message,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_uses_subscription_prefix() {
        let id: SubscriptionId = "7f1c2d9e-7c4c-4a8e-9a51-0d3b6f1e2a10".parse().unwrap();
        assert_eq!(id.cache_key(), "subscription:7f1c2d9e-7c4c-4a8e-9a51-0d3b6f1e2a10");
    }

    #[test]
    fn empty_secret_means_unauthenticated() {
        assert!(!Subscription::new("http://example.com/hook").requires_signature());
        assert!(Subscription::new("http://example.com/hook")
            .with_secret("abc")
            .requires_signature());
    }

    #[test]
    fn failure_log_denormalizes_task_fields() {
        let task = WebhookTask::new(SubscriptionId::new(), br#"{"x":1}"#.to_vec());
        let log = DeliveryLog::failure(&task, "http://example.com", 3, NO_RESPONSE_STATUS, "boom");

        assert_eq!(log.webhook_task_id, task.id);
        assert_eq!(log.subscription_id, task.subscription_id);
        assert_eq!(log.attempt_number, 3);
        assert_eq!(log.status, AttemptStatus::Failed);
        assert_eq!(log.http_status, 0);
        assert_eq!(log.error_message, "boom");
    }
}

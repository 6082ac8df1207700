use thiserror::Error;

/// Errors raised by a durable [`Store`](crate::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or rejected the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A persisted row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors raised by a subscription cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned synchronously to the ingestion caller.
///
/// Nothing here is retried: the caller learns the event was rejected
/// and no task was queued.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Malformed subscription id or payload.
    #[error("{0}")]
    BadRequest(String),

    /// Signature header missing or mismatched.
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("subscription not found")]
    NotFound,

    /// Persistence or enqueue failure after validation passed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        IngestError::Internal(err.to_string())
    }
}

/// Reasons a single delivery attempt failed.
///
/// Every variant is recorded as a delivery log row before it reaches
/// the queue engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Subscription was deleted while the task was in flight.
    #[error("subscription not found")]
    SubscriptionNotFound,

    /// Request could not be built or sent (connect, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the attempt deadline.
    #[error("attempt timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Subscriber answered outside the 2xx range.
    #[error("non-2xx status code: {0}")]
    HttpStatus(u16),

    /// Store or cache unavailable while resolving or recording.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl From<StoreError> for DeliveryError {
    fn from(err: StoreError) -> Self {
        DeliveryError::Persistence(err.to_string())
    }
}

/// Errors raised by the subscription CRUD and status services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while assembling configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    /// A backend URL was configured but its cargo feature is not compiled in.
    #[error("{var} is set but the `{feature}` feature is disabled")]
    FeatureDisabled { var: &'static str, feature: &'static str },
}

/// Errors raised while queueing a job.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue has been shut down.
    #[error("delivery queue is shut down")]
    Shutdown,

    /// Queue name has no configured dispatch slot.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while starting the delivery engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to recover queued jobs: {0}")]
    Recovery(#[from] StoreError),
}

impl From<QueueError> for IngestError {
    fn from(err: QueueError) -> Self {
        IngestError::Internal(format!("failed to enqueue task: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delivery_errors_render_log_messages() {
        assert_eq!(DeliveryError::SubscriptionNotFound.to_string(), "subscription not found");
        assert_eq!(DeliveryError::HttpStatus(503).to_string(), "non-2xx status code: 503");
        assert_eq!(
            DeliveryError::Timeout(Duration::from_secs(10)).to_string(),
            "attempt timed out after 10s"
        );
    }

    #[test]
    fn enqueue_failure_surfaces_as_internal() {
        let err: IngestError = QueueError::Shutdown.into();
        assert!(matches!(err, IngestError::Internal(_)));
    }
}

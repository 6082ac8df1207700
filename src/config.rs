use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::{DEFAULT_QUEUE, EnqueueOptions, QueueConfig, QueueSpec};
use crate::retry::RetryPolicy;

pub const DEFAULT_PORT: u16 = 8080;

/// Tuning for the delivery pipeline.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Jobs executing at once across the worker pool.
    pub concurrency: usize,
    pub queue: String,
    pub queue_dispatch_per_round: usize,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
    pub cache_ttl: Duration,
    pub janitor_period: Duration,
    pub log_retention: Duration,

    /// Bytes of a non-2xx response body kept in the log row.
    pub error_body_limit: usize,
    pub timeout_grace: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            queue: DEFAULT_QUEUE.to_string(),
            queue_dispatch_per_round: 10,
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            cache_ttl: Duration::from_secs(60 * 60),
            janitor_period: Duration::from_secs(6 * 60 * 60),
            log_retention: Duration::from_secs(24 * 60 * 60),
            error_body_limit: 1_024,
            timeout_grace: Duration::from_secs(2),
        }
    }
}

impl DeliveryConfig {
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.concurrency,
            queues: vec![QueueSpec {
                name: self.queue.clone(),
                per_round: self.queue_dispatch_per_round,
            }],
            retry: self.retry.clone(),
            timeout_grace: self.timeout_grace,
            ..QueueConfig::default()
        }
    }

    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            queue: self.queue.clone(),
            max_attempts: self.max_attempts,
            timeout: self.attempt_timeout,
        }
    }
}

/// Process configuration.
///
/// Absent backend URLs select the in-memory store or cache.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub port: u16,
    pub delivery: DeliveryConfig,
}

impl Config {
    /// Read `DB_URL`, `REDIS_URL` and `PORT` from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = non_empty("DB_URL");
        if database_url.is_some() && !cfg!(feature = "postgres") {
            return Err(ConfigError::FeatureDisabled {
                var: "DB_URL",
                feature: "postgres",
            });
        }

        let redis_url = non_empty("REDIS_URL");
        if redis_url.is_some() && !cfg!(feature = "redis") {
            return Err(ConfigError::FeatureDisabled {
                var: "REDIS_URL",
                feature: "redis",
            });
        }

        let port = match non_empty("PORT") {
            Some(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
                var: "PORT",
                reason: format!("{raw:?}: {e}"),
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            database_url,
            redis_url,
            port,
            delivery: DeliveryConfig::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert!(config.database_url.is_none());
        assert!(config.redis_url.is_none());

        let delivery = config.delivery;
        assert_eq!(delivery.concurrency, 5);
        assert_eq!(delivery.max_attempts, 5);
        assert_eq!(delivery.attempt_timeout, Duration::from_secs(10));
        assert_eq!(delivery.cache_ttl, Duration::from_secs(3600));
        assert_eq!(delivery.janitor_period, Duration::from_secs(6 * 3600));
        assert_eq!(delivery.log_retention, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn port_is_parsed() {
        let config = Config::from_lookup(lookup(&[("PORT", "9090")])).unwrap();
        assert_eq!(config.port, 9090);

        let err = Config::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PORT", .. }));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let config = Config::from_lookup(lookup(&[("PORT", ""), ("DB_URL", "  ")])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.database_url.is_none());
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn database_url_requires_postgres_feature() {
        let err = Config::from_lookup(lookup(&[("DB_URL", "postgres://localhost/webhooks")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::FeatureDisabled { feature: "postgres", .. }));
    }

    #[test]
    fn queue_settings_follow_delivery_config() {
        let delivery = DeliveryConfig::default();
        let queue = delivery.queue_config();
        assert_eq!(queue.concurrency, 5);
        assert_eq!(queue.queues, vec![QueueSpec { name: "default".into(), per_round: 10 }]);

        let options = delivery.enqueue_options();
        assert_eq!(options, EnqueueOptions::default());
    }
}

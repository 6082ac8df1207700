use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::cache::SubscriptionCache;
use crate::error::ServiceError;
use crate::storage::Store;
use crate::types::{NewSubscription, Subscription, SubscriptionId, SubscriptionUpdate};

/// Owner-facing CRUD over subscriptions.
///
/// Every successful update rewrites the cached copy and every delete
/// drops it, so in-flight deliveries stop using the old URL or secret.
/// A cache failure after the store write is logged and the entry is left
/// to expire on its own.
pub struct SubscriptionService {
    store: Arc<dyn Store>,
    cache: Arc<SubscriptionCache>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn Store>, cache: Arc<SubscriptionCache>) -> Self {
        Self { store, cache }
    }

    pub async fn create(&self, req: NewSubscription) -> Result<Subscription, ServiceError> {
        validate_target_url(&req.target_url)?;

        let sub = Subscription::new(req.target_url).with_secret(req.secret);
        self.store.insert_subscription(&sub).await?;
        info!(subscription_id = %sub.id, target_url = %sub.target_url, "subscription created");
        Ok(sub)
    }

    pub async fn get(&self, id: SubscriptionId) -> Result<Subscription, ServiceError> {
        self.store.get_subscription(id).await?.ok_or(ServiceError::NotFound)
    }

    /// Replace the target URL and secret.
    pub async fn update(
        &self,
        id: SubscriptionId,
        req: SubscriptionUpdate,
    ) -> Result<Subscription, ServiceError> {
        validate_target_url(&req.target_url)?;

        let mut sub = self.get(id).await?;
        sub.target_url = req.target_url;
        sub.secret = req.secret;

        if !self.store.update_subscription(&sub).await? {
            return Err(ServiceError::NotFound);
        }

        if let Err(e) = self.cache.refresh(&sub).await {
            warn!(subscription_id = %id, error = %e, "failed to refresh cached subscription");
        }
        info!(subscription_id = %id, target_url = %sub.target_url, "subscription updated");
        Ok(sub)
    }

    pub async fn delete(&self, id: SubscriptionId) -> Result<(), ServiceError> {
        if !self.store.delete_subscription(id).await? {
            return Err(ServiceError::NotFound);
        }

        if let Err(e) = self.cache.invalidate(id).await {
            warn!(subscription_id = %id, error = %e, "failed to invalidate cached subscription");
        }
        info!(subscription_id = %id, "subscription deleted");
        Ok(())
    }
}

fn validate_target_url(raw: &str) -> Result<(), ServiceError> {
    if raw.trim().is_empty() {
        return Err(ServiceError::Validation("target_url is required".to_string()));
    }

    let url = Url::parse(raw)
        .map_err(|e| ServiceError::Validation(format!("invalid target_url: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ServiceError::Validation(format!(
            "target_url must use http or https, got {other}"
        ))),
    }
}

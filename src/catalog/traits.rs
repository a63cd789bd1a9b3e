use anyhow::Result;
use async_trait::async_trait;

use super::model::{ContentRecord, Subscription};

/// Read access to the content catalog.
#[async_trait]
pub trait ContentCatalog: Send + Sync {
    async fn get_content_by_id(&self, id: &str) -> Result<Option<ContentRecord>>;
}

/// Read access to principals' subscription state.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn get_principal_subscription(&self, principal_id: &str) -> Result<Option<Subscription>>;
}

// In-memory stores seeded from a JSON document.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use super::model::{ContentRecord, Principal, Subscription};
use super::traits::{ContentCatalog, SubscriptionDirectory};

/// Seed document layout: `{ "contents": [...], "principals": [...] }`.
#[derive(Debug, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub contents: Vec<ContentRecord>,
    #[serde(default)]
    pub principals: Vec<Principal>,
}

impl CatalogSeed {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog seed {}", path.display()))?;
        let seed: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing catalog seed {}", path.display()))?;
        info!(
            "catalog seed {} loaded: {} contents, {} principals",
            path.display(),
            seed.contents.len(),
            seed.principals.len()
        );
        Ok(seed)
    }

    /// Split the seed into the two stores the server needs.
    pub fn into_stores(self) -> (Arc<MemoryCatalog>, Arc<MemorySubscriptions>) {
        let catalog = MemoryCatalog::new();
        for record in self.contents {
            catalog.insert(record);
        }
        let subscriptions = MemorySubscriptions::new();
        for principal in self.principals {
            subscriptions.upsert(&principal.id, principal.subscription);
        }
        (Arc::new(catalog), Arc::new(subscriptions))
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    records: RwLock<HashMap<String, ContentRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ContentRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ContentCatalog for MemoryCatalog {
    async fn get_content_by_id(&self, id: &str) -> Result<Option<ContentRecord>> {
        Ok(self.records.read().get(id).cloned())
    }
}

#[derive(Default)]
pub struct MemorySubscriptions {
    subscriptions: RwLock<HashMap<String, Subscription>>,
}

impl MemorySubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; changes are visible to the very next request.
    pub fn upsert(&self, principal_id: &str, subscription: Subscription) {
        self.subscriptions
            .write()
            .insert(principal_id.to_string(), subscription);
    }
}

#[async_trait]
impl SubscriptionDirectory for MemorySubscriptions {
    async fn get_principal_subscription(&self, principal_id: &str) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().get(principal_id).cloned())
    }
}

//! In-process document store.
//!
//! Backs tests and single-node deployments without a database. Writes are
//! serialized by one lock, so compare-and-swap is exact.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;

use super::{Document, DocumentStore, Filter, StorageError};

type Collections = HashMap<String, HashMap<String, Document>>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<Collections>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Document, StorageError> {
        self.collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or_else(|| StorageError::not_found(collection, id))
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StorageError::duplicate(collection, id));
        }
        docs.insert(
            id.to_string(),
            Document {
                id: id.to_string(),
                version: 1,
                body,
                expires_at,
            },
        );
        Ok(1)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StorageError::not_found(collection, id))?;
        if doc.version != expected_version {
            return Err(StorageError::conflict(collection, id));
        }
        doc.version += 1;
        doc.body = body;
        doc.expires_at = expires_at;
        Ok(doc.version)
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError> {
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_string()).or_default();
        let version = docs.get(id).map_or(1, |doc| doc.version + 1);
        docs.insert(
            id.to_string(),
            Document {
                id: id.to_string(),
                version,
                body,
                expires_at,
            },
        );
        Ok(version)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        Ok(self
            .collections
            .write()
            .await
            .get_mut(collection)
            .and_then(|docs| docs.remove(id))
            .is_some())
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StorageError> {
        let guard = self.collections.read().await;
        let mut found: Vec<Document> = guard
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(&doc.body))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // HashMap order is random; keep listings stable.
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn delete_expired(
        &self,
        collection: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let mut guard = self.collections.write().await;
        let Some(docs) = guard.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, doc| !doc.is_expired(now));
        Ok(u64::try_from(before - docs.len()).unwrap_or(u64::MAX))
    }
}

//! Document storage boundary.
//!
//! Every durable record (login sessions, sessions, tenants, roles, codes, ...)
//! is a JSON document addressed by `(collection, id)` and carrying a version
//! token. Writes that depend on a previous read go through
//! [`DocumentStore::update`], a compare-and-swap on that version; callers use
//! [`modify`] to refetch and retry on conflict instead of replaying a stale
//! version.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// How many times a read-modify-write is retried after a version conflict.
const MAX_CAS_ATTEMPTS: usize = 8;

pub mod collections {
    pub const LOGIN_SESSIONS: &str = "login_sessions";
    pub const SESSIONS: &str = "sessions";
    pub const RESOURCES: &str = "resources";
    pub const ROLES: &str = "roles";
    pub const ROLE_ASSIGNMENTS: &str = "role_assignments";
    pub const TENANTS: &str = "tenants";
    pub const TENANT_ASSIGNMENTS: &str = "tenant_assignments";
    pub const LAST_ACTIVITY: &str = "last_activity";
    pub const CLIENTS: &str = "clients";
    pub const AUTHORIZATION_CODES: &str = "authorization_codes";
    pub const TOTP: &str = "totp";
    pub const PREPARED_TOTP: &str = "prepared_totp";
    pub const EXTERNAL_LOGINS: &str = "external_logins";
    pub const EXTERNAL_LOGIN_STATES: &str = "external_login_states";
    pub const AUDIT: &str = "audit";
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("{collection}/{id} already exists")]
    Duplicate { collection: String, id: String },

    #[error("{collection}/{id} was modified concurrently")]
    VersionConflict { collection: String, id: String },

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn duplicate(collection: &str, id: &str) -> Self {
        Self::Duplicate {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(collection: &str, id: &str) -> Self {
        Self::VersionConflict {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// A stored document as the backend sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub id: String,
    pub version: u64,
    pub body: Value,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Document {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// One predicate over a document body. Fields are JSON pointers (`/a/b`).
#[derive(Clone, Debug)]
pub enum Condition {
    Eq(String, Value),
    /// The array at the pointer contains the value.
    Contains(String, Value),
    /// The object at the pointer has the key.
    HasKey(String, String),
}

impl Condition {
    fn matches(&self, body: &Value) -> bool {
        match self {
            Self::Eq(pointer, value) => body.pointer(pointer) == Some(value),
            Self::Contains(pointer, value) => body
                .pointer(pointer)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
            Self::HasKey(pointer, key) => body
                .pointer(pointer)
                .and_then(Value::as_object)
                .is_some_and(|map| map.contains_key(key)),
        }
    }
}

/// Conjunction of conditions; an empty filter matches everything.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, pointer: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(pointer.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn contains(mut self, pointer: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Contains(pointer.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn has_key(mut self, pointer: &str, key: &str) -> Self {
        self.conditions
            .push(Condition::HasKey(pointer.to_string(), key.to_string()));
        self
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    #[must_use]
    pub fn matches(&self, body: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(body))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Document, StorageError>;

    /// Create a document; fails with `Duplicate` when the id is taken.
    async fn insert(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError>;

    /// Compare-and-swap: replaces the body only if the stored version is
    /// `expected_version`, returning the new version.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError>;

    /// Create-or-replace regardless of version.
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        body: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<u64, StorageError>;

    /// Returns whether a document was removed. Missing ids are not an error.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError>;

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StorageError>;

    async fn delete_expired(&self, collection: &str, now: DateTime<Utc>)
        -> Result<u64, StorageError>;
}

/// A decoded document with its concurrency token.
#[derive(Clone, Debug)]
pub struct Versioned<T> {
    pub id: String,
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub value: T,
}

impl<T: DeserializeOwned> Versioned<T> {
    /// # Errors
    /// Returns an error if the body does not match `T`.
    pub fn decode(doc: Document) -> Result<Self, StorageError> {
        Ok(Self {
            value: serde_json::from_value(doc.body)?,
            id: doc.id,
            version: doc.version,
            expires_at: doc.expires_at,
        })
    }
}

/// Encode a value for storage.
///
/// # Errors
/// Returns an error if `value` cannot be represented as JSON.
pub fn encode<T: Serialize>(value: &T) -> Result<Value, StorageError> {
    Ok(serde_json::to_value(value)?)
}

/// Fetch and decode one document.
///
/// # Errors
/// Returns `NotFound` when absent or a serialization error on a malformed body.
pub async fn fetch<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Versioned<T>, StorageError> {
    Versioned::decode(store.get(collection, id).await?)
}

/// Find and decode every matching document.
///
/// # Errors
/// Returns an error if the backend fails or a document does not decode.
pub async fn find_all<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    filter: &Filter,
) -> Result<Vec<Versioned<T>>, StorageError> {
    store
        .find(collection, filter)
        .await?
        .into_iter()
        .map(Versioned::decode)
        .collect()
}

/// Read-modify-write with refetch on version conflict.
///
/// `mutate` sees a fresh copy on every attempt and may abort by returning an
/// error. The expiry of the stored document is preserved.
///
/// # Errors
/// Returns whatever `mutate` returns, `NotFound` if the document disappears,
/// or `VersionConflict` once the retries are spent.
pub async fn modify<T, F>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
    mut mutate: F,
) -> crate::Result<Versioned<T>>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnMut(&mut T) -> crate::Result<()> + Send,
{
    for attempt in 1..=MAX_CAS_ATTEMPTS {
        let mut current: Versioned<T> = fetch(store, collection, id).await?;
        mutate(&mut current.value)?;
        match store
            .update(
                collection,
                id,
                current.version,
                encode(&current.value)?,
                current.expires_at,
            )
            .await
        {
            Ok(version) => {
                current.version = version;
                return Ok(current);
            }
            Err(StorageError::VersionConflict { .. }) => {
                debug!(collection, id, attempt, "version conflict, refetching");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(StorageError::conflict(collection, id).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_conditions() {
        let body = json!({
            "type": "cookie",
            "tenants": ["acme", "globex"],
            "authz": {"acme": ["app:read"]},
        });
        assert!(Filter::all().matches(&body));
        assert!(Filter::all().eq("/type", "cookie").matches(&body));
        assert!(!Filter::all().eq("/type", "root").matches(&body));
        assert!(Filter::all().contains("/tenants", "globex").matches(&body));
        assert!(!Filter::all().contains("/tenants", "initech").matches(&body));
        assert!(Filter::all().has_key("/authz", "acme").matches(&body));
        assert!(!Filter::all()
            .eq("/type", "cookie")
            .has_key("/authz", "globex")
            .matches(&body));
    }

    /// Lands a competing write right before the first compare-and-swap.
    struct RacingStore {
        inner: MemoryStore,
        raced: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for RacingStore {
        async fn get(&self, collection: &str, id: &str) -> Result<Document, StorageError> {
            self.inner.get(collection, id).await
        }

        async fn insert(
            &self,
            collection: &str,
            id: &str,
            body: Value,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<u64, StorageError> {
            self.inner.insert(collection, id, body, expires_at).await
        }

        async fn update(
            &self,
            collection: &str,
            id: &str,
            expected_version: u64,
            body: Value,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<u64, StorageError> {
            if !self.raced.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.inner
                    .update(collection, id, expected_version, json!({"n": 10}), None)
                    .await?;
            }
            self.inner
                .update(collection, id, expected_version, body, expires_at)
                .await
        }

        async fn upsert(
            &self,
            collection: &str,
            id: &str,
            body: Value,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<u64, StorageError> {
            self.inner.upsert(collection, id, body, expires_at).await
        }

        async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
            self.inner.delete(collection, id).await
        }

        async fn find(
            &self,
            collection: &str,
            filter: &Filter,
        ) -> Result<Vec<Document>, StorageError> {
            self.inner.find(collection, filter).await
        }

        async fn delete_expired(
            &self,
            collection: &str,
            now: DateTime<Utc>,
        ) -> Result<u64, StorageError> {
            self.inner.delete_expired(collection, now).await
        }
    }

    #[tokio::test]
    async fn modify_refetches_after_version_conflict() -> anyhow::Result<()> {
        let store = RacingStore {
            inner: MemoryStore::new(),
            raced: std::sync::atomic::AtomicBool::new(false),
        };
        store.insert("c", "doc", json!({"n": 0}), None).await?;

        let mut calls = 0;
        let updated: Versioned<Value> = modify(&store, "c", "doc", |value: &mut Value| {
            calls += 1;
            let n = value["n"].as_i64().unwrap_or_default();
            value["n"] = json!(n + 1);
            Ok(())
        })
        .await?;

        // The stale increment (0 -> 1) was discarded; the retry built on 10.
        assert_eq!(calls, 2);
        assert_eq!(updated.value["n"], json!(11));
        assert_eq!(updated.version, 3);
        Ok(())
    }
}

//! Audit trail.
//!
//! Records are appended to the `audit` collection under a ULID id, so a
//! listing in id order is chronological, and mirrored to the log. Writing an
//! audit record never fails the operation being audited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::{
    storage::{collections, encode, find_all, DocumentStore, Filter},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCode {
    LoginSuccess,
    LoginFailed,
    Logout,
    M2mSessionCreated,
    AuthorizeSuccess,
    AuthorizeError,
    ImpersonationSuccessful,
    ImpersonationFailed,
    ExternalLoginSuccess,
    ExternalLoginFailed,
    TenantDeleted,
}

impl AuditCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailed => "LOGIN_FAILED",
            Self::Logout => "LOGOUT",
            Self::M2mSessionCreated => "M2M_SESSION_CREATED",
            Self::AuthorizeSuccess => "AUTHORIZE_SUCCESS",
            Self::AuthorizeError => "AUTHORIZE_ERROR",
            Self::ImpersonationSuccessful => "IMPERSONATION_SUCCESSFUL",
            Self::ImpersonationFailed => "IMPERSONATION_FAILED",
            Self::ExternalLoginSuccess => "EXTERNAL_LOGIN_SUCCESS",
            Self::ExternalLoginFailed => "EXTERNAL_LOGIN_FAILED",
            Self::TenantDeleted => "TENANT_DELETED",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditRecord {
    pub code: AuditCode,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub details: Map<String, Value>,
}

#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn DocumentStore>,
    ids: Arc<Mutex<ulid::Generator>>,
}

impl AuditService {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            ids: Arc::new(Mutex::new(ulid::Generator::new())),
        }
    }

    /// Monotonic within this process, so records from one node sort stably.
    fn next_id(&self) -> String {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generate()
            .unwrap_or_else(|_| ulid::Ulid::new())
            .to_string()
    }

    /// Append a record; storage failures are logged and swallowed.
    pub async fn append(&self, code: AuditCode, details: Value) {
        if let Err(err) = self.try_append(code, details).await {
            warn!(code = code.as_str(), "failed to write audit record: {err}");
        }
    }

    /// # Errors
    /// Returns an error if the record cannot be stored.
    pub async fn try_append(&self, code: AuditCode, details: Value) -> Result<String> {
        let details = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        let record = AuditRecord {
            code,
            at: Utc::now(),
            details,
        };
        let id = self.next_id();
        self.store
            .insert(collections::AUDIT, &id, encode(&record)?, None)
            .await?;
        let details = Value::Object(record.details);
        info!(audit = code.as_str(), details = %details, "audit record");
        Ok(id)
    }

    /// Records with `code`, oldest first.
    ///
    /// # Errors
    /// Returns an error if storage fails.
    pub async fn list(&self, code: Option<AuditCode>) -> Result<Vec<AuditRecord>> {
        let filter = match code {
            Some(code) => Filter::all().eq("/code", code.as_str()),
            None => Filter::all(),
        };
        Ok(
            find_all::<AuditRecord>(self.store.as_ref(), collections::AUDIT, &filter)
                .await?
                .into_iter()
                .map(|doc| doc.value)
                .collect(),
        )
    }
}

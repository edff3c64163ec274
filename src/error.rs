//! Error taxonomy shared by every component boundary.
//!
//! Authentication-path callers collapse most of these into one uniform
//! failure shape; the variants exist so the cause can reach logs and audit.

use crate::storage::StorageError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} expired")]
    Expired(String),

    #[error("login attempts exhausted")]
    AttemptsExhausted,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("access to {resource} denied for {subject}")]
    AccessDenied { subject: String, resource: String },

    #[error("tenant {0} not found")]
    TenantNotFound(String),

    #[error("credentials {subject} have no access to tenant {tenant}")]
    TenantAccessDenied { subject: String, tenant: String },

    #[error("credentials {0} are not assigned to any tenant")]
    NoTenants(String),

    #[error("{0} is read-only")]
    NotEditable(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("decryption failed")]
    Decryption,

    #[error("external provider error: {0}")]
    ExternalProvider(String),

    #[error("invalid session composition: {0}")]
    InvalidSessionComposition(&'static str),

    #[error(transparent)]
    Storage(StorageError),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn access_denied(subject: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::AccessDenied {
            subject: subject.into(),
            resource: resource.into(),
        }
    }

    /// `NotFound` and `Expired` are indistinguishable to clients.
    #[must_use]
    pub const fn is_gone(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Expired(_) | Self::Storage(StorageError::NotFound { .. })
        )
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate { collection, id } => {
                Self::Conflict(format!("{collection}/{id}"))
            }
            other => Self::Storage(other),
        }
    }
}

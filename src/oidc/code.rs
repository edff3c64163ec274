//! Single-use authorization codes.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::CodeChallengeMethod;
use crate::{
    storage::{collections, encode, fetch, DocumentStore, StorageError},
    Error, Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub session_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default)]
    pub code_challenge_method: CodeChallengeMethod,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuthorizationCodeStore {
    store: Arc<dyn DocumentStore>,
    ttl: Duration,
}

impl AuthorizationCodeStore {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Mint a code bound to `session_id`.
    ///
    /// # Errors
    /// Returns an error if the code cannot be stored.
    pub async fn generate(
        &self,
        session_id: &str,
        client_id: &str,
        redirect_uri: Option<&str>,
        code_challenge: Option<&str>,
        code_challenge_method: CodeChallengeMethod,
    ) -> Result<String> {
        let mut bytes = [0u8; 36];
        OsRng.fill_bytes(&mut bytes);
        let code = Base64UrlUnpadded::encode_string(&bytes);
        let record = AuthorizationCode {
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.map(ToString::to_string),
            code_challenge: code_challenge.map(ToString::to_string),
            code_challenge_method,
            expires_at: Utc::now() + self.ttl,
        };
        self.store
            .insert(
                collections::AUTHORIZATION_CODES,
                &code,
                encode(&record)?,
                Some(record.expires_at),
            )
            .await?;
        Ok(code)
    }

    /// Take the code out of the store. Of two concurrent callers only the
    /// one whose delete removed the record gets it.
    ///
    /// # Errors
    /// `NotFound` for an unknown or already used code, `Expired` for a stale one.
    pub async fn pop(&self, code: &str) -> Result<AuthorizationCode> {
        let doc = fetch::<AuthorizationCode>(
            self.store.as_ref(),
            collections::AUTHORIZATION_CODES,
            code,
        )
        .await
        .map_err(|err| match err {
            StorageError::NotFound { .. } => Error::not_found("authorization code"),
            other => other.into(),
        })?;
        if !self
            .store
            .delete(collections::AUTHORIZATION_CODES, code)
            .await?
        {
            debug!("authorization code consumed concurrently");
            return Err(Error::not_found("authorization code"));
        }
        if doc.value.expires_at <= Utc::now() {
            return Err(Error::Expired("authorization code".to_string()));
        }
        Ok(doc.value)
    }

    /// # Errors
    /// Returns an error if the backend fails.
    pub async fn delete_expired(&self) -> Result<u64> {
        Ok(self
            .store
            .delete_expired(collections::AUTHORIZATION_CODES, Utc::now())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn codes_are_single_use() -> anyhow::Result<()> {
        let codes = AuthorizationCodeStore::new(Arc::new(MemoryStore::new()), Duration::seconds(60));
        let code = codes
            .generate("sid", "app", None, None, CodeChallengeMethod::None)
            .await?;
        assert_eq!(codes.pop(&code).await?.session_id, "sid");
        assert!(matches!(codes.pop(&code).await, Err(Error::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn stale_code_is_consumed_and_rejected() -> anyhow::Result<()> {
        let codes = AuthorizationCodeStore::new(Arc::new(MemoryStore::new()), Duration::seconds(-1));
        let code = codes
            .generate("sid", "app", None, None, CodeChallengeMethod::None)
            .await?;
        assert!(matches!(codes.pop(&code).await, Err(Error::Expired(_))));
        assert!(matches!(codes.pop(&code).await, Err(Error::NotFound(_))));
        Ok(())
    }
}

//! Login sessions: short-lived, single-use handshake state.
//!
//! A login session is charged one attempt before every validation and is
//! deleted as soon as it expires, runs out of attempts or is promoted into a
//! session. Reads re-check both conditions; the sweep only reclaims space.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::LoginDescriptor;
use crate::{
    crypto::{ClientPublicKey, ServerKeyPair},
    storage::{collections, encode, fetch, modify, DocumentStore, StorageError},
    Error, Result,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoginSession {
    pub id: String,
    /// Empty for decoy sessions.
    pub credentials_id: String,
    pub ident: String,
    server_key: String,
    client_public_key: String,
    pub login_descriptors: Vec<LoginDescriptor>,
    pub remaining_attempts: i32,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Root session lifetime the client asked for, in seconds.
    #[serde(default)]
    pub requested_session_expiration: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: u64,
}

impl LoginSession {
    #[must_use]
    pub fn is_fake(&self) -> bool {
        self.credentials_id.is_empty()
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// # Errors
    /// Returns `Validation` if the stored key material is corrupt.
    pub fn server_key(&self) -> Result<ServerKeyPair> {
        ServerKeyPair::from_secret(&self.server_key)
    }

    /// # Errors
    /// Returns `Validation` if the stored key material is corrupt.
    pub fn public_key(&self) -> Result<String> {
        Ok(self.server_key()?.public_key())
    }

    fn client_key(&self) -> Result<ClientPublicKey> {
        ClientPublicKey::parse(&self.client_public_key)
    }

    /// # Errors
    /// Returns `Decryption` for anything not sealed by this session's client.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.server_key()
            .and_then(|key| key.decrypt(&self.client_key()?, ciphertext))
            .map_err(|_| Error::Decryption)
    }

    /// # Errors
    /// Returns an error if the key material is corrupt.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.server_key()?.encrypt(&self.client_key()?, plaintext)
    }

    #[must_use]
    pub fn descriptor(&self, id: &str) -> Option<&LoginDescriptor> {
        self.login_descriptors.iter().find(|d| d.id == id)
    }
}

fn generate_login_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

/// Parameters for a new login session.
pub struct NewLoginSession<'a> {
    pub ident: &'a str,
    pub credentials_id: &'a str,
    pub client_public_key: &'a ClientPublicKey,
    pub descriptors: Vec<LoginDescriptor>,
    pub expiration: Option<Duration>,
    pub requested_session_expiration: Option<i64>,
}

#[derive(Clone)]
pub struct LoginSessionStore {
    store: Arc<dyn DocumentStore>,
    max_attempts: i32,
    default_ttl: Duration,
}

impl LoginSessionStore {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: i32, default_ttl: Duration) -> Self {
        Self {
            store,
            max_attempts,
            default_ttl,
        }
    }

    /// # Errors
    /// Returns an error if the session cannot be persisted.
    pub async fn create(&self, new: NewLoginSession<'_>) -> Result<LoginSession> {
        let now = Utc::now();
        let mut login_session = LoginSession {
            id: generate_login_session_id(),
            credentials_id: new.credentials_id.to_string(),
            ident: new.ident.to_string(),
            server_key: ServerKeyPair::generate().export_secret(),
            client_public_key: new.client_public_key.encode(),
            login_descriptors: new.descriptors,
            remaining_attempts: self.max_attempts,
            data: Map::new(),
            requested_session_expiration: new.requested_session_expiration,
            created_at: now,
            expires_at: now + new.expiration.unwrap_or(self.default_ttl),
            version: 0,
        };
        login_session.version = self
            .store
            .insert(
                collections::LOGIN_SESSIONS,
                &login_session.id,
                encode(&login_session)?,
                Some(login_session.expires_at),
            )
            .await?;
        Ok(login_session)
    }

    async fn discard(&self, id: &str, reason: &str) {
        debug!(lsid = %id, reason, "discarding login session");
        if let Err(err) = self.store.delete(collections::LOGIN_SESSIONS, id).await {
            warn!(lsid = %id, "failed to delete login session: {err}");
        }
    }

    /// Fetch a usable login session.
    ///
    /// # Errors
    /// `NotFound` when absent; `Expired` or `AttemptsExhausted` after which
    /// the record is deleted.
    pub async fn get(&self, id: &str) -> Result<LoginSession> {
        let doc = fetch::<LoginSession>(self.store.as_ref(), collections::LOGIN_SESSIONS, id)
            .await
            .map_err(|err| match err {
                StorageError::NotFound { .. } => Error::not_found("login session"),
                other => other.into(),
            })?;
        let mut login_session = doc.value;
        login_session.version = doc.version;

        if login_session.is_expired(Utc::now()) {
            self.discard(id, "expired").await;
            return Err(Error::Expired("login session".to_string()));
        }
        if login_session.remaining_attempts <= 0 {
            self.discard(id, "attempts exhausted").await;
            return Err(Error::AttemptsExhausted);
        }
        Ok(login_session)
    }

    /// Read-modify-write with compare-and-swap. The mutation is re-applied
    /// to a fresh copy after every conflict.
    ///
    /// # Errors
    /// As [`Self::get`], plus whatever `mutate` returns.
    pub async fn update<F>(&self, id: &str, mut mutate: F) -> Result<LoginSession>
    where
        F: FnMut(&mut LoginSession) -> Result<()> + Send,
    {
        let now = Utc::now();
        let outcome = modify::<LoginSession, _>(
            self.store.as_ref(),
            collections::LOGIN_SESSIONS,
            id,
            |login_session| {
                if login_session.is_expired(now) {
                    return Err(Error::Expired("login session".to_string()));
                }
                if login_session.remaining_attempts <= 0 {
                    return Err(Error::AttemptsExhausted);
                }
                mutate(login_session)
            },
        )
        .await;

        match outcome {
            Ok(doc) => {
                let mut login_session = doc.value;
                login_session.version = doc.version;
                Ok(login_session)
            }
            Err(Error::Storage(StorageError::NotFound { .. })) => {
                Err(Error::not_found("login session"))
            }
            Err(err @ (Error::Expired(_) | Error::AttemptsExhausted)) => {
                self.discard(id, "unusable on update").await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Atomically take one attempt. Two concurrent callers never observe the
    /// same remaining count.
    ///
    /// # Errors
    /// As [`Self::update`].
    pub async fn charge_attempt(&self, id: &str) -> Result<LoginSession> {
        self.update(id, |login_session| {
            login_session.remaining_attempts -= 1;
            Ok(())
        })
        .await
    }

    /// Merge one key of factor scratch state.
    ///
    /// # Errors
    /// As [`Self::update`].
    pub async fn set_data(&self, id: &str, key: &str, value: Value) -> Result<LoginSession> {
        self.update(id, |login_session| {
            login_session.data.insert(key.to_string(), value.clone());
            Ok(())
        })
        .await
    }

    /// Idempotent.
    ///
    /// # Errors
    /// Returns an error only if the backend fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(collections::LOGIN_SESSIONS, id).await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the backend fails.
    pub async fn delete_expired(&self) -> Result<u64> {
        Ok(self
            .store
            .delete_expired(collections::LOGIN_SESSIONS, Utc::now())
            .await?)
    }
}

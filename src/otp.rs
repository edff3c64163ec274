//! TOTP enrollment and verification.
//!
//! Flow Overview:
//! 1) `prepare` generates a secret bound to the caller's session and returns
//!    the provisioning URL. The prepared secret expires after the
//!    registration timeout and is swept by housekeeping.
//! 2) `activate_prepared` requires one valid code before the secret becomes
//!    the credential's active TOTP.
//! 3) `verify` checks codes during login.
//!
//! Secrets are sealed with the server secret key; the AAD binds them to the
//! credentials id so a sealed blob cannot be moved to another credential.

use base64ct::{Base64, Encoding};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, warn};

use crate::{
    credentials::Credentials,
    crypto::SecretKey,
    storage::{collections, encode, fetch, DocumentStore},
    Error, Result,
};

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP: u64 = 30;

#[derive(Debug, Serialize, Deserialize)]
struct PreparedSecret {
    credentials_id: String,
    sealed_secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ActiveSecret {
    sealed_secret: String,
}

/// What a client needs to enroll an authenticator app.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct TotpSetup {
    pub url: String,
    pub username: String,
    pub issuer: String,
    pub secret: String,
    pub timeout_seconds: i64,
}

#[derive(Clone)]
pub struct OtpService {
    store: Arc<dyn DocumentStore>,
    key: SecretKey,
    issuer: String,
    registration_timeout: Duration,
}

fn aad(credentials_id: &str) -> Vec<u8> {
    format!("totp-secret:v1|{credentials_id}").into_bytes()
}

fn sanitize_label(value: &str) -> String {
    value.replace(':', "_")
}

impl OtpService {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        key: SecretKey,
        issuer: &str,
        registration_timeout: Duration,
    ) -> Self {
        Self {
            store,
            key,
            issuer: sanitize_label(issuer),
            registration_timeout,
        }
    }

    fn build(&self, secret: Vec<u8>, account: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            STEP,
            secret,
            Some(self.issuer.clone()),
            sanitize_label(account),
        )
        .map_err(|e| Error::validation(format!("invalid TOTP parameters: {e}")))
    }

    fn seal(&self, credentials_id: &str, secret: &[u8]) -> Result<String> {
        Ok(Base64::encode_string(
            &self.key.seal(secret, &aad(credentials_id))?,
        ))
    }

    fn unseal(&self, credentials_id: &str, sealed: &str) -> Result<Vec<u8>> {
        let sealed = Base64::decode_vec(sealed).map_err(|_| Error::Decryption)?;
        self.key.open(&sealed, &aad(credentials_id))
    }

    /// Start enrollment for `credentials` within `session_id`.
    ///
    /// Calling it again before the timeout returns the same secret.
    ///
    /// # Errors
    /// Returns `Conflict` if TOTP is already active for the credential.
    pub async fn prepare(&self, session_id: &str, credentials: &Credentials) -> Result<TotpSetup> {
        if self.has_activated(&credentials.id).await? {
            return Err(Error::Conflict(format!("totp for {}", credentials.id)));
        }
        let account = credentials
            .username
            .clone()
            .or_else(|| credentials.email.clone())
            .unwrap_or_else(|| credentials.id.clone());

        let now = Utc::now();
        let existing = fetch::<PreparedSecret>(
            self.store.as_ref(),
            collections::PREPARED_TOTP,
            session_id,
        )
        .await
        .ok()
        .filter(|doc| doc.expires_at.is_some_and(|exp| exp > now))
        .filter(|doc| doc.value.credentials_id == credentials.id);

        let (secret, expires_at) = if let Some(doc) = existing {
            (
                self.unseal(&credentials.id, &doc.value.sealed_secret)?,
                doc.expires_at.unwrap_or(now),
            )
        } else {
            let secret = Secret::generate_secret()
                .to_bytes()
                .map_err(|e| Error::validation(format!("secret generation failed: {e:?}")))?;
            let expires_at = now + self.registration_timeout;
            let prepared = PreparedSecret {
                credentials_id: credentials.id.clone(),
                sealed_secret: self.seal(&credentials.id, &secret)?,
            };
            self.store
                .upsert(
                    collections::PREPARED_TOTP,
                    session_id,
                    encode(&prepared)?,
                    Some(expires_at),
                )
                .await?;
            (secret, expires_at)
        };

        let totp = self.build(secret, &account)?;
        Ok(TotpSetup {
            url: totp.get_url(),
            username: account,
            issuer: self.issuer.clone(),
            secret: totp.get_secret_base32(),
            timeout_seconds: (expires_at - now).num_seconds().max(0),
        })
    }

    /// Confirm enrollment with a first valid code.
    ///
    /// # Errors
    /// `NotFound` when nothing is prepared (or it expired), `Validation` for a
    /// wrong code, `Conflict` if TOTP got activated meanwhile.
    pub async fn activate_prepared(
        &self,
        session_id: &str,
        credentials_id: &str,
        code: &str,
    ) -> Result<()> {
        let prepared = fetch::<PreparedSecret>(
            self.store.as_ref(),
            collections::PREPARED_TOTP,
            session_id,
        )
        .await
        .map_err(|_| Error::not_found("prepared TOTP secret"))?;
        if prepared.expires_at.is_some_and(|exp| exp <= Utc::now())
            || prepared.value.credentials_id != credentials_id
        {
            self.store
                .delete(collections::PREPARED_TOTP, session_id)
                .await?;
            return Err(Error::not_found("prepared TOTP secret"));
        }

        let secret = self.unseal(credentials_id, &prepared.value.sealed_secret)?;
        if !self.check(secret.clone(), credentials_id, code)? {
            return Err(Error::validation("invalid TOTP code"));
        }

        let active = ActiveSecret {
            sealed_secret: self.seal(credentials_id, &secret)?,
        };
        self.store
            .insert(collections::TOTP, credentials_id, encode(&active)?, None)
            .await?;
        self.store
            .delete(collections::PREPARED_TOTP, session_id)
            .await?;
        info!(cid = %credentials_id, "totp activated");
        Ok(())
    }

    /// # Errors
    /// Returns `NotFound` if TOTP was not active.
    pub async fn deactivate(&self, credentials_id: &str) -> Result<()> {
        if self.store.delete(collections::TOTP, credentials_id).await? {
            info!(cid = %credentials_id, "totp deactivated");
            Ok(())
        } else {
            Err(Error::not_found(format!("totp for {credentials_id}")))
        }
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn has_activated(&self, credentials_id: &str) -> Result<bool> {
        match self.store.get(collections::TOTP, credentials_id).await {
            Ok(_) => Ok(true),
            Err(crate::storage::StorageError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Check a login code. A credential without TOTP never verifies.
    ///
    /// # Errors
    /// Returns an error if storage fails or the stored secret cannot be opened.
    pub async fn verify(&self, credentials_id: &str, code: &str) -> Result<bool> {
        let active =
            match fetch::<ActiveSecret>(self.store.as_ref(), collections::TOTP, credentials_id)
                .await
            {
                Ok(active) => active,
                Err(crate::storage::StorageError::NotFound { .. }) => return Ok(false),
                Err(err) => return Err(err.into()),
            };
        let secret = self.unseal(credentials_id, &active.value.sealed_secret)?;
        self.check(secret, credentials_id, code)
    }

    fn check(&self, secret: Vec<u8>, credentials_id: &str, code: &str) -> Result<bool> {
        let totp = self.build(secret, credentials_id)?;
        match totp.check_current(code.trim()) {
            Ok(valid) => Ok(valid),
            Err(e) => {
                warn!("system clock error during TOTP check: {e}");
                Ok(false)
            }
        }
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn delete_expired_prepared(&self) -> Result<u64> {
        Ok(self
            .store
            .delete_expired(collections::PREPARED_TOTP, Utc::now())
            .await?)
    }
}

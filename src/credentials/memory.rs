//! In-memory credential provider with Argon2 password hashes.

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2,
};
use async_trait::async_trait;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use super::{CredentialProvider, Credentials, M2M_PROVIDER_TYPE, STANDARD_PROVIDER_TYPE};
use crate::{login::FactorType, Error, Result};

pub(crate) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::validation(format!("password hashing failed: {e}")))
}

struct Record {
    credentials: Credentials,
    password_hash: Option<String>,
}

pub struct MemoryCredentialProvider {
    prefix: String,
    provider_type: &'static str,
    records: RwLock<HashMap<String, Record>>,
}

impl MemoryCredentialProvider {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            prefix: format!("memory:{name}:"),
            provider_type: STANDARD_PROVIDER_TYPE,
            records: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn m2m(name: &str) -> Self {
        Self {
            prefix: format!("m2m:{name}:"),
            provider_type: M2M_PROVIDER_TYPE,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Register a credential and return its id.
    ///
    /// # Errors
    /// Returns `Conflict` if the username is taken, `Validation` if hashing fails.
    pub async fn create(
        &self,
        username: &str,
        email: Option<&str>,
        phone: Option<&str>,
        password: Option<&SecretString>,
    ) -> Result<String> {
        if self.find_by_ident(username).await.is_some() {
            return Err(Error::Conflict(format!("username {username}")));
        }
        let password_hash = match password {
            Some(secret) => {
                let secret = secret.expose_secret().to_string();
                Some(
                    tokio::task::spawn_blocking(move || hash_password(&secret))
                        .await
                        .map_err(|e| Error::validation(e.to_string()))??,
                )
            }
            None => None,
        };

        let id = format!("{}{}", self.prefix, Ulid::new().to_string().to_lowercase());
        let credentials = Credentials {
            id: id.clone(),
            username: Some(username.to_string()),
            email: email.map(ToString::to_string),
            phone: phone.map(ToString::to_string),
            suspended: false,
            has_password: password_hash.is_some(),
            enforce_factors: Vec::new(),
        };
        self.records.write().await.insert(
            id.clone(),
            Record {
                credentials,
                password_hash,
            },
        );
        Ok(id)
    }

    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn set_suspended(&self, credentials_id: &str, suspended: bool) -> Result<()> {
        self.update(credentials_id, |c| c.suspended = suspended).await
    }

    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn set_enforce_factors(
        &self,
        credentials_id: &str,
        factors: Vec<FactorType>,
    ) -> Result<()> {
        self.update(credentials_id, move |c| c.enforce_factors = factors)
            .await
    }

    async fn update(
        &self,
        credentials_id: &str,
        change: impl FnOnce(&mut Credentials),
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(credentials_id)
            .ok_or_else(|| Error::not_found(format!("credentials {credentials_id}")))?;
        change(&mut record.credentials);
        Ok(())
    }

    async fn find_by_ident(&self, ident: &str) -> Option<String> {
        let ident = ident.to_lowercase();
        self.records
            .read()
            .await
            .values()
            .find(|r| {
                let c = &r.credentials;
                [&c.username, &c.email, &c.phone]
                    .into_iter()
                    .flatten()
                    .any(|value| value.to_lowercase() == ident)
            })
            .map(|r| r.credentials.id.clone())
    }
}

#[async_trait]
impl CredentialProvider for MemoryCredentialProvider {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn provider_type(&self) -> &str {
        self.provider_type
    }

    async fn locate(&self, ident: &str) -> Result<Option<String>> {
        Ok(self.find_by_ident(ident).await)
    }

    async fn get(&self, credentials_id: &str) -> Result<Credentials> {
        self.records
            .read()
            .await
            .get(credentials_id)
            .map(|r| r.credentials.clone())
            .ok_or_else(|| Error::not_found(format!("credentials {credentials_id}")))
    }

    async fn authenticate(&self, credentials_id: &str, payload: &Value) -> Result<bool> {
        let hash = self
            .records
            .read()
            .await
            .get(credentials_id)
            .filter(|r| !r.credentials.suspended)
            .and_then(|r| r.password_hash.clone());
        let Some(hash) = hash else {
            super::decoy_password_check(payload).await;
            return Ok(false);
        };
        let password = payload
            .get("password")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        super::verify_hash(hash, password).await
    }
}

//! Registered OAuth2 clients and their authorize-time policy.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::CodeChallengeMethod;
use crate::{
    credentials::{hash_password, verify_hash},
    storage::{collections, encode, fetch, find_all, DocumentStore, Filter, StorageError},
    Error, Result,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectUriValidation {
    /// Scheme, host, port and path must equal a registered URI.
    #[default]
    FullMatch,
    /// The URI must start with a registered URI.
    PrefixMatch,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret_hash: Option<String>,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub redirect_uri_validation: RedirectUriValidation,
    #[serde(default = "default_response_types")]
    pub response_types: Vec<String>,
    /// `None` allows every scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_scopes: Option<Vec<String>>,
    #[serde(default)]
    pub code_challenge_method: CodeChallengeMethod,
    #[serde(default)]
    pub authorize_anonymous_users: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorize_uri: Option<String>,
    /// Client session lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_expiration: Option<i64>,
    pub created_at: DateTime<Utc>,
}

fn default_response_types() -> Vec<String> {
    vec!["code".to_string()]
}

impl Client {
    #[must_use]
    pub fn is_confidential(&self) -> bool {
        self.client_secret_hash.is_some()
    }

    #[must_use]
    pub fn session_expiration(&self) -> Option<Duration> {
        self.session_expiration.map(Duration::seconds)
    }

    /// Does `redirect_uri` match one of the registered URIs?
    #[must_use]
    pub fn accepts_redirect_uri(&self, redirect_uri: &str) -> bool {
        let Ok(url) = Url::parse(redirect_uri) else {
            return false;
        };
        if url.fragment().is_some() {
            return false;
        }
        match self.redirect_uri_validation {
            RedirectUriValidation::FullMatch => {
                let mut bare = url;
                bare.set_query(None);
                self.redirect_uris
                    .iter()
                    .filter_map(|registered| Url::parse(registered).ok())
                    .any(|mut registered| {
                        registered.set_query(None);
                        registered == bare
                    })
            }
            RedirectUriValidation::PrefixMatch => self
                .redirect_uris
                .iter()
                .any(|registered| redirect_uri.starts_with(registered.as_str())),
        }
    }

    /// `tenant` in the allowed list also allows `tenant:<anything>`.
    #[must_use]
    pub fn allows_scope(&self, scope: &str) -> bool {
        self.allowed_scopes.as_ref().is_none_or(|allowed| {
            allowed.iter().any(|entry| {
                scope == entry
                    || scope
                        .strip_prefix(entry.as_str())
                        .is_some_and(|rest| rest.starts_with(':'))
            })
        })
    }
}

/// Why a client may not start this authorize request.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid client secret")]
    InvalidClientSecret,
    #[error("redirect_uri {0:?} is not registered")]
    InvalidRedirectUri(String),
    #[error("scope {0:?} is not allowed")]
    ScopeNotAllowed(String),
    #[error("response_type {0:?} is not allowed")]
    ResponseTypeNotAllowed(String),
}

/// Parameters of a new client registration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClientRegistration {
    /// Generated when absent.
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub redirect_uri_validation: RedirectUriValidation,
    pub response_types: Option<Vec<String>>,
    pub allowed_scopes: Option<Vec<String>>,
    #[serde(default)]
    pub code_challenge_method: CodeChallengeMethod,
    #[serde(default)]
    pub authorize_anonymous_users: bool,
    pub login_uri: Option<String>,
    pub authorize_uri: Option<String>,
    pub session_expiration: Option<i64>,
    /// Issue a client secret.
    #[serde(default)]
    pub confidential: bool,
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

#[derive(Clone)]
pub struct ClientService {
    store: Arc<dyn DocumentStore>,
}

impl ClientService {
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Register a client. The plain secret is returned once and only its
    /// hash is stored.
    ///
    /// # Errors
    /// `Validation` for malformed URIs, `Conflict` for a taken client id.
    pub async fn register(
        &self,
        registration: ClientRegistration,
    ) -> Result<(Client, Option<SecretString>)> {
        if registration.redirect_uris.is_empty() {
            return Err(Error::validation("at least one redirect_uri is required"));
        }
        for uri in registration
            .redirect_uris
            .iter()
            .chain(registration.login_uri.iter())
            .chain(registration.authorize_uri.iter())
        {
            let url = Url::parse(uri)
                .map_err(|e| Error::validation(format!("invalid uri {uri:?}: {e}")))?;
            if url.fragment().is_some() && registration.redirect_uris.contains(uri) {
                return Err(Error::validation(format!(
                    "redirect_uri {uri:?} must not contain a fragment"
                )));
            }
        }

        let secret = registration
            .confidential
            .then(|| SecretString::from(random_token(32)));
        let client_secret_hash = match &secret {
            Some(secret) => {
                let plain = secret.expose_secret().to_string();
                Some(
                    tokio::task::spawn_blocking(move || hash_password(&plain))
                        .await
                        .map_err(|e| Error::validation(e.to_string()))??,
                )
            }
            None => None,
        };

        let client = Client {
            client_id: registration
                .client_id
                .unwrap_or_else(|| random_token(16)),
            client_name: registration.client_name,
            client_secret_hash,
            redirect_uris: registration.redirect_uris,
            redirect_uri_validation: registration.redirect_uri_validation,
            response_types: registration
                .response_types
                .unwrap_or_else(default_response_types),
            allowed_scopes: registration.allowed_scopes,
            code_challenge_method: registration.code_challenge_method,
            authorize_anonymous_users: registration.authorize_anonymous_users,
            login_uri: registration.login_uri,
            authorize_uri: registration.authorize_uri,
            session_expiration: registration.session_expiration,
            created_at: Utc::now(),
        };
        self.store
            .insert(collections::CLIENTS, &client.client_id, encode(&client)?, None)
            .await?;
        info!(client_id = %client.client_id, confidential = client.is_confidential(), "client registered");
        Ok((client, secret))
    }

    /// # Errors
    /// `NotFound` for an unknown client id.
    pub async fn get(&self, client_id: &str) -> Result<Client> {
        match fetch::<Client>(self.store.as_ref(), collections::CLIENTS, client_id).await {
            Ok(doc) => Ok(doc.value),
            Err(StorageError::NotFound { .. }) => {
                Err(Error::not_found(format!("client {client_id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// # Errors
    /// Returns an error if storage fails.
    pub async fn list(&self) -> Result<Vec<Client>> {
        Ok(
            find_all::<Client>(self.store.as_ref(), collections::CLIENTS, &Filter::all())
                .await?
                .into_iter()
                .map(|doc| doc.value)
                .collect(),
        )
    }

    /// # Errors
    /// `NotFound` for an unknown client id.
    pub async fn delete(&self, client_id: &str) -> Result<()> {
        if !self.store.delete(collections::CLIENTS, client_id).await? {
            return Err(Error::not_found(format!("client {client_id}")));
        }
        warn!(client_id, "client deleted");
        Ok(())
    }

    /// Check an authorize request against the client's registration.
    ///
    /// A secret is only checked when the request carries one.
    ///
    /// # Errors
    /// The first policy the request violates. The redirect URI is checked
    /// first so later errors may be sent to it.
    pub async fn authorize_client(
        &self,
        client: &Client,
        scope: &[String],
        redirect_uri: &str,
        response_type: &str,
        client_secret: Option<&str>,
    ) -> std::result::Result<(), ClientError> {
        if !client.accepts_redirect_uri(redirect_uri) {
            return Err(ClientError::InvalidRedirectUri(redirect_uri.to_string()));
        }
        if let Some(secret) = client_secret {
            let Some(hash) = client.client_secret_hash.clone() else {
                return Err(ClientError::InvalidClientSecret);
            };
            if !verify_hash(hash, secret.to_string()).await.unwrap_or(false) {
                return Err(ClientError::InvalidClientSecret);
            }
        }
        if !client.response_types.iter().any(|t| t == response_type) {
            return Err(ClientError::ResponseTypeNotAllowed(response_type.to_string()));
        }
        if let Some(denied) = scope.iter().find(|s| !client.allows_scope(s)) {
            return Err(ClientError::ScopeNotAllowed(denied.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn registration(uris: &[&str]) -> ClientRegistration {
        ClientRegistration {
            client_id: Some("app".to_string()),
            redirect_uris: uris.iter().map(ToString::to_string).collect(),
            ..ClientRegistration::default()
        }
    }

    fn scope(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn full_match_ignores_query_only() -> anyhow::Result<()> {
        let clients = ClientService::new(Arc::new(MemoryStore::new()));
        let (client, secret) = clients
            .register(registration(&["https://app.example.com/cb"]))
            .await?;
        assert!(secret.is_none());
        assert!(client.accepts_redirect_uri("https://app.example.com/cb"));
        assert!(client.accepts_redirect_uri("https://app.example.com/cb?next=/home"));
        assert!(!client.accepts_redirect_uri("https://app.example.com/cb/other"));
        assert!(!client.accepts_redirect_uri("https://evil.example.com/cb"));
        assert!(!client.accepts_redirect_uri("https://app.example.com/cb#frag"));
        assert!(matches!(
            clients.register(registration(&["https://x.example.com"])).await,
            Err(Error::Conflict(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn policy_checks() -> anyhow::Result<()> {
        let clients = ClientService::new(Arc::new(MemoryStore::new()));
        let (client, secret) = clients
            .register(ClientRegistration {
                allowed_scopes: Some(scope(&["openid", "tenant", "cookie"])),
                confidential: true,
                redirect_uri_validation: RedirectUriValidation::PrefixMatch,
                ..registration(&["https://app.example.com/"])
            })
            .await?;
        let secret = secret.ok_or_else(|| anyhow::anyhow!("confidential client without secret"))?;
        let uri = "https://app.example.com/deep/cb";

        clients
            .authorize_client(&client, &scope(&["openid", "tenant:acme"]), uri, "code", None)
            .await?;
        clients
            .authorize_client(
                &client,
                &scope(&["openid"]),
                uri,
                "code",
                Some(secret.expose_secret()),
            )
            .await?;
        assert!(matches!(
            clients
                .authorize_client(&client, &scope(&["openid"]), uri, "code", Some("nope"))
                .await,
            Err(ClientError::InvalidClientSecret)
        ));
        assert!(matches!(
            clients
                .authorize_client(&client, &scope(&["openid", "profile"]), uri, "code", None)
                .await,
            Err(ClientError::ScopeNotAllowed(s)) if s == "profile"
        ));
        assert!(matches!(
            clients
                .authorize_client(&client, &scope(&["openid"]), uri, "token", None)
                .await,
            Err(ClientError::ResponseTypeNotAllowed(_))
        ));
        assert!(matches!(
            clients
                .authorize_client(&client, &scope(&["openid"]), "https://other/", "code", None)
                .await,
            Err(ClientError::InvalidRedirectUri(_))
        ));
        // An unverified redirect URI wins over a bad secret.
        assert!(matches!(
            clients
                .authorize_client(&client, &scope(&["openid"]), "https://other/", "code", Some("nope"))
                .await,
            Err(ClientError::InvalidRedirectUri(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_client_is_not_found() {
        let clients = ClientService::new(Arc::new(MemoryStore::new()));
        assert!(clients.get("ghost").await.is_err_and(|e| e.is_gone()));
    }
}

//! Identity providers for external login.
//!
//! Flow Overview:
//! 1) The browser is sent to the provider's authorization endpoint with a
//!    `state` and a `nonce` we generated.
//! 2) The provider redirects back with a `code`, which is exchanged at the
//!    token endpoint for an ID token.
//! 3) The ID token is verified against the provider's JWKS (RS256, issuer,
//!    audience and nonce) and reduced to a handful of identity claims.

use async_trait::async_trait;
use jsonwebtoken::{
    decode, decode_header,
    jwk::{Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};
use url::Url;

use crate::{Error, Result, APP_USER_AGENT};

/// Claims kept from a verified ID token.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Short provider id, used in login descriptors as `ext:<name>`.
    fn name(&self) -> &str;

    fn label(&self) -> &str;

    /// Where to send the browser to start the flow.
    ///
    /// # Errors
    /// `Validation` when the configured endpoint cannot carry a query.
    fn authorize_uri(&self, redirect_uri: &str, state: &str, nonce: &str) -> Result<String>;

    /// Exchange `code` and return the verified identity.
    async fn user_info(&self, code: &str, redirect_uri: &str, nonce: &str)
        -> Result<ExternalIdentity>;
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub name: String,
    pub label: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub jwks_uri: Url,
    pub scope: String,
}

impl ProviderConfig {
    /// Derive the endpoints from `issuer` the way most OIDC providers lay
    /// them out.
    ///
    /// # Errors
    /// `Validation` if `issuer` is not an absolute URL.
    pub fn from_issuer(name: &str, issuer: &str, client_id: &str) -> Result<Self> {
        let base = Url::parse(&format!("{}/", issuer.trim_end_matches('/')))?;
        Ok(Self {
            name: name.to_string(),
            label: name.to_string(),
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            client_secret: None,
            authorization_endpoint: base.join("authorize")?,
            token_endpoint: base.join("token")?,
            jwks_uri: base.join(".well-known/jwks.json")?,
            scope: "openid email".to_string(),
        })
    }

    #[must_use]
    pub fn with_client_secret(mut self, secret: SecretString) -> Self {
        self.client_secret = Some(secret);
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: &str) -> Self {
        self.scope = scope.to_string();
        self
    }
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: Value,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Any OAuth2 provider that returns an OpenID Connect ID token.
pub struct GenericOAuth2Provider {
    config: ProviderConfig,
    http: reqwest::Client,
    jwks: RwLock<Option<JwkSet>>,
}

fn provider_error(err: impl std::fmt::Display) -> Error {
    Error::ExternalProvider(err.to_string())
}

impl GenericOAuth2Provider {
    /// # Errors
    /// `ExternalProvider` if the HTTP client cannot be built.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .build()
            .map_err(provider_error)?;
        Ok(Self {
            config,
            http,
            jwks: RwLock::new(None),
        })
    }

    /// Start with a known key set instead of fetching one.
    #[must_use]
    pub fn with_jwks(mut self, jwks: JwkSet) -> Self {
        self.jwks = RwLock::new(Some(jwks));
        self
    }

    #[instrument(skip(self), fields(provider = %self.config.name))]
    async fn fetch_jwks(&self) -> Result<JwkSet> {
        let response = self
            .http
            .get(self.config.jwks_uri.as_str())
            .send()
            .await
            .map_err(provider_error)?;
        if !response.status().is_success() {
            let status = response.status();
            error!(%status, "failed to fetch JWKS");
            return Err(Error::ExternalProvider(format!("JWKS request failed: {status}")));
        }
        let jwks: JwkSet = response.json().await.map_err(provider_error)?;
        info!(keys = jwks.keys.len(), "identity provider JWKS loaded");
        Ok(jwks)
    }

    /// Key for `kid`, refetching the set once when the cached one lacks it.
    async fn signing_key(&self, kid: Option<&str>) -> Result<Jwk> {
        if let Some(jwks) = self.jwks.read().await.as_ref() {
            if let Some(jwk) = select_key(jwks, kid) {
                return Ok(jwk);
            }
        }
        let fresh = self.fetch_jwks().await?;
        let jwk = select_key(&fresh, kid);
        *self.jwks.write().await = Some(fresh);
        jwk.ok_or_else(|| Error::ExternalProvider(format!("no signing key {kid:?}")))
    }

    async fn token_request(&self, code: &str, redirect_uri: &str) -> Result<String> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("redirect_uri", redirect_uri),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.expose_secret()));
        }
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form)
            .finish();

        let response = self
            .http
            .post(self.config.token_endpoint.as_str())
            .header("content-type", "application/x-www-form-urlencoded")
            .header("accept", "application/json")
            .body(body)
            .send()
            .await
            .map_err(provider_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(provider = %self.config.name, %status, %text, "token request failed");
            return Err(Error::ExternalProvider(format!("token request failed: {status}")));
        }
        let tokens: Value = response.json().await.map_err(provider_error)?;
        tokens
            .get("id_token")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| Error::ExternalProvider("no id_token in token response".to_string()))
    }

    fn verify(&self, id_token: &str, jwk: &Jwk, nonce: &str) -> Result<ExternalIdentity> {
        let key = DecodingKey::from_jwk(jwk).map_err(provider_error)?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.client_id.as_str()]);
        let claims = decode::<IdTokenClaims>(id_token, &key, &validation)
            .map_err(provider_error)?
            .claims;
        if claims.nonce.as_deref() != Some(nonce) {
            return Err(Error::ExternalProvider("nonce mismatch".to_string()));
        }
        let sub = match claims.sub {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => return Err(Error::ExternalProvider("malformed sub".to_string())),
        };
        Ok(ExternalIdentity {
            sub,
            email: claims.email,
            phone_number: claims.phone_number,
            preferred_username: claims.preferred_username,
            name: claims.name,
        })
    }
}

fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => jwks.find(kid).cloned(),
        None if jwks.keys.len() == 1 => jwks.keys.first().cloned(),
        None => None,
    }
}

#[async_trait]
impl IdentityProvider for GenericOAuth2Provider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn label(&self) -> &str {
        &self.config.label
    }

    fn authorize_uri(&self, redirect_uri: &str, state: &str, nonce: &str) -> Result<String> {
        let mut uri = self.config.authorization_endpoint.clone();
        uri.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("scope", &self.config.scope)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("prompt", "select_account")
            .append_pair("state", state)
            .append_pair("nonce", nonce);
        Ok(uri.into())
    }

    async fn user_info(
        &self,
        code: &str,
        redirect_uri: &str,
        nonce: &str,
    ) -> Result<ExternalIdentity> {
        let id_token = self.token_request(code, redirect_uri).await?;
        let header = decode_header(&id_token).map_err(provider_error)?;
        let jwk = self.signing_key(header.kid.as_deref()).await?;
        let identity = self.verify(&id_token, &jwk, nonce)?;
        debug!(provider = %self.config.name, sub = %identity.sub, "id token verified");
        Ok(identity)
    }
}

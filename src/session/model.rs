use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{
    authz::Authz,
    credentials::Credentials,
    login::{FactorType, LoginDescriptor},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Anchors a login; parent of every derived session.
    Root,
    /// Client session carried by a per-client cookie.
    Cookie,
    /// Client session handed out through the authorization code flow.
    Openidconnect,
    /// Machine session created from basic auth.
    M2m,
}

impl SessionType {
    #[must_use]
    pub const fn is_derived(self) -> bool {
        matches!(self, Self::Cookie | Self::Openidconnect)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Cookie => "cookie",
            Self::Openidconnect => "openidconnect",
            Self::M2m => "m2m",
        }
    }
}

/// Identity snapshot taken when the session is built.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl From<&Credentials> for SessionCredentials {
    fn from(credentials: &Credentials) -> Self {
        Self {
            id: credentials.id.clone(),
            username: credentials.username.clone(),
            email: credentials.email.clone(),
            phone: credentials.phone.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    #[serde(default)]
    pub authz: Authz,
}

impl Authorization {
    /// Tenants in scope, without the global key.
    pub fn tenants(&self) -> impl Iterator<Item = &str> {
        self.authz
            .keys()
            .map(String::as_str)
            .filter(|t| *t != crate::authz::GLOBAL_SCOPE)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Authentication {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_descriptor: Option<LoginDescriptor>,
    /// Factors completed to create the session.
    #[serde(default)]
    pub login_factors: Vec<FactorType>,
    /// Factors the credentials have set up.
    #[serde(default)]
    pub available_factors: Vec<FactorType>,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonator_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonator_credentials_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_login: Option<ExternalLoginRef>,
}

impl Authentication {
    #[must_use]
    pub fn is_impersonated(&self) -> bool {
        self.impersonator_session_id.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLoginRef {
    pub provider: String,
    pub subject: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieData {
    /// Opaque cookie value, base64url.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl CookieData {
    #[must_use]
    pub fn generate(domain: Option<&str>) -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self {
            id: Base64UrlUnpadded::encode_string(&bytes),
            domain: domain.map(ToString::to_string),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Data {
    pub client_id: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub credentials: SessionCredentials,
    #[serde(default)]
    pub authorization: Authorization,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<CookieData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2Data>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: u64,
}

impl Session {
    #[must_use]
    pub fn credentials_id(&self) -> &str {
        &self.credentials.id
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.oauth2.as_ref().map(|o| o.client_id.as_str())
    }
}

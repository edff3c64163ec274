//! Login descriptors: named, ordered factor sequences.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FactorType {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "totp")]
    Totp,
    #[serde(rename = "smscode")]
    SmsCode,
    #[serde(rename = "webauthn")]
    WebAuthn,
    /// A header injected by a trusted proxy (client certificate, SSO gateway).
    #[serde(rename = "xheader")]
    XHeader,
    /// Successful exchange with a federated identity provider.
    #[serde(rename = "ext")]
    External,
    #[serde(rename = "!m2m-basic-auth")]
    M2mBasicAuth,
    #[serde(rename = "!impersonation")]
    Impersonation,
}

impl FactorType {
    /// Something the user has rather than knows.
    #[must_use]
    pub const fn is_possession(self) -> bool {
        matches!(self, Self::Totp | Self::SmsCode | Self::WebAuthn)
    }

    /// Internal factors are stamped on sessions, never offered to clients.
    #[must_use]
    pub const fn is_internal(self) -> bool {
        matches!(self, Self::M2mBasicAuth | Self::Impersonation)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Totp => "totp",
            Self::SmsCode => "smscode",
            Self::WebAuthn => "webauthn",
            Self::XHeader => "xheader",
            Self::External => "ext",
            Self::M2mBasicAuth => "!m2m-basic-auth",
            Self::Impersonation => "!impersonation",
        }
    }

    /// Parse the wire name used in configuration and query strings.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(Value::String(value.trim().to_string())).ok()
    }
}

/// One factor of a descriptor. Parameters carry factor-specific settings
/// (e.g. `header` for `xheader`, `provider` for `ext`) and never secrets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactorSpec {
    #[serde(rename = "type")]
    pub factor_type: FactorType,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl FactorSpec {
    #[must_use]
    pub fn new(factor_type: FactorType) -> Self {
        Self {
            factor_type,
            params: Map::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoginDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub factors: Vec<FactorSpec>,
}

impl LoginDescriptor {
    #[must_use]
    pub fn new(id: &str, label: Option<&str>, factors: Vec<FactorSpec>) -> Self {
        Self {
            id: id.to_string(),
            label: label.map(ToString::to_string),
            factors,
        }
    }

    #[must_use]
    pub fn factor_types(&self) -> Vec<FactorType> {
        self.factors.iter().map(|f| f.factor_type).collect()
    }

    #[must_use]
    pub fn has_possession_factor(&self) -> bool {
        self.factors.iter().any(|f| f.factor_type.is_possession())
    }

    /// Descriptor stamped on sessions created from m2m basic auth.
    #[must_use]
    pub fn m2m() -> Self {
        Self::new("!m2m", None, vec![FactorSpec::new(FactorType::M2mBasicAuth)])
    }

    /// Descriptor stamped on impersonated root sessions.
    #[must_use]
    pub fn impersonation() -> Self {
        Self::new(
            "!impersonate",
            None,
            vec![FactorSpec::new(FactorType::Impersonation)],
        )
    }

    #[must_use]
    pub fn external(provider: &str) -> Self {
        Self::new(
            &format!("!ext:{provider}"),
            None,
            vec![FactorSpec::new(FactorType::External).with_param("provider", provider)],
        )
    }
}

/// Templates enabled when configuration does not provide its own.
#[must_use]
pub fn default_descriptor_templates() -> Vec<LoginDescriptor> {
    vec![
        LoginDescriptor::new(
            "default",
            Some("Use recommended login."),
            vec![FactorSpec::new(FactorType::Password)],
        ),
        LoginDescriptor::new(
            "totp",
            Some("Use password and authenticator app."),
            vec![
                FactorSpec::new(FactorType::Password),
                FactorSpec::new(FactorType::Totp),
            ],
        ),
        LoginDescriptor::new(
            "webauthn",
            Some("Use a security key."),
            vec![FactorSpec::new(FactorType::WebAuthn)],
        ),
        LoginDescriptor::new(
            "smslogin",
            Some("Use password and SMS code."),
            vec![
                FactorSpec::new(FactorType::Password),
                FactorSpec::new(FactorType::SmsCode),
            ],
        ),
    ]
}

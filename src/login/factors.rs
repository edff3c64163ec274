//! Per-factor eligibility and verification.
//!
//! Provider failures are logged and count as a failed factor; they never
//! abort the attempt.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

use super::{FactorSpec, FactorType, LoginSession, RequestContext};
use crate::{
    credentials::{decoy_password_check, Credentials, CredentialsService},
    otp::OtpService,
    webauthn::WebAuthnVerifier,
};

pub(crate) const SMS_CODE_KEY: &str = "smscode";
pub(crate) const WEBAUTHN_KEY: &str = "webauthn";

#[derive(Clone)]
pub struct FactorVerifier {
    credentials: CredentialsService,
    otp: OtpService,
    webauthn: Arc<dyn WebAuthnVerifier>,
}

fn or_failed<T: Default>(result: crate::Result<T>, factor: FactorType, cid: &str) -> T {
    result.unwrap_or_else(|err| {
        warn!(cid = %cid, factor = factor.as_str(), "factor provider failed: {err}");
        T::default()
    })
}

impl FactorVerifier {
    #[must_use]
    pub fn new(
        credentials: CredentialsService,
        otp: OtpService,
        webauthn: Arc<dyn WebAuthnVerifier>,
    ) -> Self {
        Self {
            credentials,
            otp,
            webauthn,
        }
    }

    #[must_use]
    pub fn credentials(&self) -> &CredentialsService {
        &self.credentials
    }

    #[must_use]
    pub fn webauthn(&self) -> &Arc<dyn WebAuthnVerifier> {
        &self.webauthn
    }

    /// Can `credentials` complete this factor in `ctx`?
    pub async fn is_eligible(
        &self,
        factor: &FactorSpec,
        credentials: &Credentials,
        ctx: &RequestContext,
    ) -> bool {
        let cid = credentials.id.as_str();
        match factor.factor_type {
            FactorType::Password => credentials.has_password,
            FactorType::Totp => or_failed(self.otp.has_activated(cid).await, FactorType::Totp, cid),
            FactorType::SmsCode => credentials.phone.as_deref().is_some_and(|p| !p.is_empty()),
            FactorType::WebAuthn => or_failed(
                self.webauthn.has_authenticators(cid).await,
                FactorType::WebAuthn,
                cid,
            ),
            FactorType::XHeader => factor
                .param("header")
                .is_some_and(|header| ctx.header(header).is_some()),
            FactorType::External | FactorType::M2mBasicAuth | FactorType::Impersonation => false,
        }
    }

    /// Verify one factor of an attempt. Decoy sessions do the same
    /// expensive work for passwords and always fail.
    pub async fn authenticate(
        &self,
        factor: &FactorSpec,
        login_session: &LoginSession,
        payload: &Value,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> bool {
        let cid = login_session.credentials_id.as_str();
        if login_session.is_fake() {
            if factor.factor_type == FactorType::Password {
                decoy_password_check(payload).await;
            }
            return false;
        }

        match factor.factor_type {
            FactorType::Password => or_failed(
                self.credentials.authenticate(cid, payload).await,
                FactorType::Password,
                cid,
            ),
            FactorType::Totp => {
                let code = payload.get("totp").and_then(Value::as_str).unwrap_or_default();
                !code.is_empty()
                    && or_failed(self.otp.verify(cid, code).await, FactorType::Totp, cid)
            }
            FactorType::SmsCode => verify_sms_code(login_session, payload, now),
            FactorType::WebAuthn => {
                let (Some(options), Some(assertion)) = (
                    login_session.data.get(WEBAUTHN_KEY),
                    payload.get("webauthn"),
                ) else {
                    return false;
                };
                or_failed(
                    self.webauthn
                        .verify_assertion(cid, options, assertion)
                        .await,
                    FactorType::WebAuthn,
                    cid,
                )
            }
            FactorType::XHeader => factor.param("header").is_some_and(|header| {
                let value = ctx.header(header);
                match factor.param("value") {
                    Some(expected) => value == Some(expected),
                    None => value.is_some_and(|v| !v.is_empty()),
                }
            }),
            FactorType::External | FactorType::M2mBasicAuth | FactorType::Impersonation => false,
        }
    }
}

fn verify_sms_code(login_session: &LoginSession, payload: &Value, now: DateTime<Utc>) -> bool {
    let Some(stored) = login_session.data.get(SMS_CODE_KEY) else {
        return false;
    };
    let expected = stored.get("code").and_then(Value::as_str).unwrap_or_default();
    let expires_at = stored
        .get("expires_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
    let submitted = payload
        .get("smscode")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim();

    !expected.is_empty()
        && expires_at.is_some_and(|exp| exp > now)
        && bool::from(expected.as_bytes().ct_eq(submitted.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn session_with_code(code: &str, expires_at: DateTime<Utc>) -> anyhow::Result<LoginSession> {
        let mut value = json!({
            "id": "lsid",
            "credentials_id": "memory:default:alice",
            "ident": "alice",
            "server_key": crate::crypto::ServerKeyPair::generate().export_secret(),
            "client_public_key": crate::crypto::envelope::ClientKeyPair::generate().public_key().encode(),
            "login_descriptors": [],
            "remaining_attempts": 3,
            "created_at": Utc::now(),
            "expires_at": Utc::now() + Duration::minutes(5),
        });
        value["data"] = json!({
            SMS_CODE_KEY: {"code": code, "expires_at": expires_at.to_rfc3339()},
        });
        Ok(serde_json::from_value(value)?)
    }

    #[test]
    fn sms_code_must_match_and_be_fresh() -> anyhow::Result<()> {
        let now = Utc::now();
        let fresh = session_with_code("123456", now + Duration::minutes(1))?;
        assert!(verify_sms_code(&fresh, &json!({"smscode": "123456"}), now));
        assert!(verify_sms_code(&fresh, &json!({"smscode": " 123456 "}), now));
        assert!(!verify_sms_code(&fresh, &json!({"smscode": "654321"}), now));
        assert!(!verify_sms_code(&fresh, &json!({}), now));

        let stale = session_with_code("123456", now - Duration::seconds(1))?;
        assert!(!verify_sms_code(&stale, &json!({"smscode": "123456"}), now));
        Ok(())
    }
}

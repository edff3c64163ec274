//! WebAuthn assertion verification seam.
//!
//! The login flow only needs three things from a WebAuthn backend: whether a
//! credential has authenticators registered, a challenge to hand to the
//! browser, and a verdict on the signed assertion. The challenge is kept in
//! the login session between the two calls.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Error, Result};

#[async_trait]
pub trait WebAuthnVerifier: Send + Sync {
    async fn has_authenticators(&self, credentials_id: &str) -> Result<bool>;

    /// Public-key request options (challenge, allowed credentials) for the browser.
    async fn authentication_options(&self, credentials_id: &str) -> Result<Value>;

    async fn verify_assertion(
        &self,
        credentials_id: &str,
        options: &Value,
        assertion: &Value,
    ) -> Result<bool>;
}

/// Used when no WebAuthn backend is configured: nobody has authenticators.
#[derive(Clone, Debug)]
pub struct DisabledWebAuthn;

#[async_trait]
impl WebAuthnVerifier for DisabledWebAuthn {
    async fn has_authenticators(&self, _credentials_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn authentication_options(&self, _credentials_id: &str) -> Result<Value> {
        Err(Error::ExternalProvider("webauthn is not configured".to_string()))
    }

    async fn verify_assertion(
        &self,
        _credentials_id: &str,
        _options: &Value,
        _assertion: &Value,
    ) -> Result<bool> {
        Ok(false)
    }
}

//! Login handshake.
//!
//! Flow Overview:
//! 1) Prologue: the client sends an identifier and its public key. The
//!    identifier is located, eligible descriptors are prepared and a login
//!    session with a fresh server key pair is stored. Identifiers that cannot
//!    log in get a decoy session with the fallback descriptors.
//! 2) Optional preparation steps (`sms_login`, `webauthn_login`) stash a
//!    one-time code or challenge in the login session.
//! 3) Attempt: one attempt is charged, the sealed payload is opened and
//!    validated against the session's descriptors. Success promotes the login
//!    session into a root session; every failure looks the same.

use std::collections::HashMap;

mod descriptor;
mod engine;
mod factors;
mod service;
mod session;

pub use descriptor::{default_descriptor_templates, FactorSpec, FactorType, LoginDescriptor};
pub use engine::DescriptorEngine;
pub use factors::FactorVerifier;
pub use service::{
    AuthenticationService, LoginOutcome, Prologue, PrologueRequest, RootSessionRequest,
};
pub use session::{LoginSession, LoginSessionStore, NewLoginSession};

/// What the login flow may know about the HTTP request besides its body.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    headers: HashMap<String, String>,
    /// Client address chain, nearest proxy last.
    pub from: Vec<String>,
}

impl RequestContext {
    #[must_use]
    pub fn new(headers: HashMap<String, String>, from: Vec<String>) -> Self {
        Self {
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            from,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

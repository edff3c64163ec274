//! # Portunus (Identity and Access Management)
//!
//! `portunus` authenticates users, issues and manages sessions, brokers
//! OAuth2/OIDC authorization flows and enforces tenant/role based access
//! control.
//!
//! ## Login Handshake
//!
//! A login starts with a *prologue* that creates a short-lived login session
//! holding an ephemeral X25519 key pair. Every later step of the handshake is
//! sealed with a key derived from that pair and the client's public key, so
//! the exchange survives intermediaries without relying on TLS session state.
//! Unknown identifiers get a decoy login session that looks and behaves like a
//! real one; the response shape never reveals whether an identity exists.
//!
//! ## Sessions
//!
//! A successful login yields a *root* session. Clients derive scoped child
//! sessions (cookie or OpenID Connect) from it through the authorize
//! endpoint. Children never outlive their root and deleting a session
//! deletes its whole subtree. Deletion is the only revocation mechanism.
//!
//! ## Authorization
//!
//! Credentials are assigned to tenants and roles; roles carry resources.
//! A fixed set of resources (superuser, impersonate, cross-tenant access and
//! the administrative ones) can only be granted globally and never appears
//! in a tenant-scoped grant set.

pub mod api;
pub mod audit;
pub mod authz;
pub mod cli;
pub mod config;
pub mod cookie;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod external_login;
pub mod housekeeping;
pub mod impersonation;
pub mod introspection;
pub mod login;
pub mod notification;
pub mod oidc;
pub mod otp;
pub mod services;
pub mod session;
pub mod storage;
pub mod webauthn;

pub use error::{Error, Result};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}

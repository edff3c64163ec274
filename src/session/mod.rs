//! Sessions and their lifecycle.
//!
//! Flow Overview:
//! 1) A successful login, basic-auth M2M call or external login creates a
//!    top-level session (root or m2m).
//! 2) Client sessions (cookie, openidconnect) derive from a root session,
//!    are capped by its expiry and inherit its track id.
//! 3) Deleting a session removes all sessions derived from it.
//!
//! Sessions are assembled from [`SessionContribution`]s so every flow only
//! supplies the parts it owns.

mod builder;
mod model;
mod service;

pub use builder::SessionContribution;
pub use model::{
    Authentication, Authorization, CookieData, ExternalLoginRef, OAuth2Data, Session,
    SessionCredentials, SessionType,
};
pub use service::{SessionMatcher, SessionService};

//! Request introspection for a reverse proxy (`auth_request` style).
//!
//! The proxy forwards the original request's `Authorization` or `Cookie`
//! header; a live session turns into identity headers the proxy copies onto
//! the upstream request. Anything else is a 401 with a Basic challenge.

use base64ct::{Base64, Base64Url, Encoding};
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    authz::GLOBAL_SCOPE,
    cookie::CookieService,
    credentials::{CredentialsService, M2M_PROVIDER_TYPE},
    login::{AuthenticationService, RequestContext},
    session::{Session, SessionMatcher, SessionService, SessionType},
    Error, Result,
};

pub const BASIC_REALM: &str = "portunus";

pub const HEADER_CREDENTIALS_ID: &str = "x-credentials-id";
pub const HEADER_SESSION_ID: &str = "x-session-id";
pub const HEADER_TENANTS: &str = "x-tenants";
pub const HEADER_RESOURCES: &str = "x-resources";
pub const HEADER_USERNAME: &str = "x-username";
pub const HEADER_TRACK_ID: &str = "x-track-id";

/// `WWW-Authenticate` value sent with every introspection failure.
#[must_use]
pub fn basic_challenge() -> String {
    format!("Basic realm=\"{BASIC_REALM}\"")
}

/// Headers describing who is behind `session`.
///
/// Resources are the global ones; tenant grants travel as the tenant list.
#[must_use]
pub fn identity_headers(session: &Session) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        (HEADER_CREDENTIALS_ID, session.credentials_id().to_string()),
        (HEADER_SESSION_ID, session.id.clone()),
        (
            HEADER_TENANTS,
            session.authorization.tenants().collect::<Vec<_>>().join(" "),
        ),
    ];
    if let Some(global) = session.authorization.authz.get(GLOBAL_SCOPE) {
        headers.push((
            HEADER_RESOURCES,
            global.iter().map(String::as_str).collect::<Vec<_>>().join(" "),
        ));
    }
    if let Some(username) = &session.credentials.username {
        headers.push((HEADER_USERNAME, username.clone()));
    }
    if let Some(track_id) = &session.track_id {
        headers.push((HEADER_TRACK_ID, track_id.clone()));
    }
    headers
}

/// `(username, password)` from a `Basic` authorization value.
fn parse_basic(authorization: &str) -> Option<(String, String)> {
    let token = authorization.trim().strip_prefix("Basic ")?.trim();
    let decoded = Base64::decode_vec(token)
        .or_else(|_| Base64Url::decode_vec(token))
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[derive(Clone)]
pub struct IntrospectionService {
    credentials: CredentialsService,
    sessions: SessionService,
    authn: AuthenticationService,
    cookies: CookieService,
}

impl IntrospectionService {
    #[must_use]
    pub fn new(
        credentials: CredentialsService,
        sessions: SessionService,
        authn: AuthenticationService,
        cookies: CookieService,
    ) -> Self {
        Self {
            credentials,
            sessions,
            authn,
            cookies,
        }
    }

    /// Authenticate a machine call by Basic auth.
    ///
    /// A live m2m session for the credentials is reused, otherwise one is
    /// created.
    ///
    /// # Errors
    /// `AccessDenied` for a missing or malformed header, unknown or
    /// non-machine credentials and a wrong password; storage failures as is.
    pub async fn m2m_basic(&self, authorization: &str, ctx: &RequestContext) -> Result<Session> {
        let denied = || Error::access_denied("anonymous", "m2m");
        let Some((username, password)) = parse_basic(authorization) else {
            warn!("basic auth token not provided");
            return Err(denied());
        };
        let Some(cid) = self.credentials.locate(&username).await? else {
            warn!(username = %username, "credentials not found");
            return Err(denied());
        };
        if self.credentials.provider_type(&cid)? != M2M_PROVIDER_TYPE {
            warn!(cid = %cid, "basic auth is only available to machine credentials");
            return Err(denied());
        }
        if !self
            .credentials
            .authenticate(&cid, &json!({ "password": password }))
            .await?
        {
            warn!(cid = %cid, "basic authentication failed");
            return Err(denied());
        }

        match self
            .sessions
            .get_by(SessionMatcher::CredentialsId {
                credentials_id: &cid,
                session_type: Some(SessionType::M2m),
            })
            .await
        {
            Ok(session) => {
                debug!(sid = %session.id, "reusing m2m session");
                Ok(session)
            }
            Err(err) if err.is_gone() => self.authn.create_m2m_session(&cid, ctx).await,
            Err(err) => Err(err),
        }
    }

    /// Resolve the session behind a browser cookie.
    ///
    /// # Errors
    /// `AccessDenied` when the cookie is missing or points nowhere.
    pub async fn cookie(
        &self,
        cookie_header: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<Session> {
        self.cookies
            .session_from_cookie_header(cookie_header, client_id)
            .await?
            .ok_or_else(|| Error::access_denied("anonymous", "cookie"))
    }
}

//! Browser cookie sessions.
//!
//! The root session travels in the configured cookie; every cookie client
//! gets its own cookie whose name is derived from the client id, so one
//! browser can hold sessions for several clients at once.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::{
    config::AuthConfig,
    oidc::{ClientService, ClientSessionFactory, OidcService},
    session::{CookieData, OAuth2Data, Session, SessionMatcher, SessionService, SessionType},
    Error, Result,
};

#[derive(Clone)]
pub struct CookieService {
    name: String,
    domain: Option<String>,
    secure: bool,
    sessions: SessionService,
    factory: ClientSessionFactory,
    clients: ClientService,
    oidc: OidcService,
}

/// Leading dots are dropped; only ASCII domains are accepted.
fn normalize_domain(domain: Option<&str>) -> Result<Option<String>> {
    let Some(domain) = domain else {
        return Ok(None);
    };
    if !domain.is_ascii() {
        return Err(Error::validation("cookie domain must be ASCII"));
    }
    let domain = domain.trim_start_matches('.');
    Ok((!domain.is_empty()).then(|| domain.to_string()))
}

impl CookieService {
    /// # Errors
    /// Returns `Validation` for a non-ASCII cookie domain.
    pub fn new(
        config: &AuthConfig,
        factory: ClientSessionFactory,
        clients: ClientService,
        oidc: OidcService,
    ) -> Result<Self> {
        Ok(Self {
            name: config.cookie_name().to_string(),
            domain: normalize_domain(config.cookie_domain())?,
            secure: config.cookie_secure(),
            sessions: factory.sessions().clone(),
            factory,
            clients,
            oidc,
        })
    }

    /// Root cookie name, or `<name>_<hash>` for a client cookie.
    #[must_use]
    pub fn cookie_name(&self, client_id: Option<&str>) -> String {
        match client_id {
            Some(client_id) => {
                let digest = Sha256::digest(client_id.as_bytes());
                format!(
                    "{}_{}",
                    self.name,
                    Base64UrlUnpadded::encode_string(&digest[..10])
                )
            }
            None => self.name.clone(),
        }
    }

    #[must_use]
    pub fn root_domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// New cookie data for a root session.
    #[must_use]
    pub fn root_cookie(&self) -> CookieData {
        CookieData::generate(self.domain.as_deref())
    }

    /// Find the session a cookie value points at.
    ///
    /// A root session issued for another cookie domain is revoked instead.
    ///
    /// # Errors
    /// Returns an error only if storage fails.
    pub async fn session_by_cookie_value(&self, value: &str) -> Result<Option<Session>> {
        if Base64UrlUnpadded::decode_vec(value).is_err() {
            warn!("cookie value is not base64url");
            return Ok(None);
        }
        let session = match self.sessions.get_by(SessionMatcher::CookieId(value)).await {
            Ok(session) => session,
            Err(err) if err.is_gone() => {
                debug!("no session for cookie");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if session.session_type == SessionType::Root {
            let issued_for = session.cookie.as_ref().and_then(|c| c.domain.as_deref());
            if issued_for != self.domain.as_deref() {
                warn!(
                    sid = %session.id,
                    issued_for = issued_for.unwrap_or("-"),
                    "cookie domain changed, revoking session"
                );
                self.sessions.delete(&session.id).await?;
                return Ok(None);
            }
        }
        Ok(Some(session))
    }

    /// Resolve the session from a raw `Cookie` header.
    ///
    /// # Errors
    /// Returns an error only if storage fails.
    pub async fn session_from_cookie_header(
        &self,
        header: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<Option<Session>> {
        let name = self.cookie_name(client_id);
        let Some(value) = header.and_then(|h| cookie_value(h, &name)) else {
            return Ok(None);
        };
        self.session_by_cookie_value(value).await
    }

    /// Derive a cookie session for `client_id` from `root`.
    ///
    /// # Errors
    /// `NotFound` for an unknown client, otherwise as
    /// [`ClientSessionFactory::create`].
    pub async fn create_cookie_client_session(
        &self,
        root: &Session,
        client_id: &str,
        scope: &[String],
        tenants: &BTreeSet<String>,
        expiration: Option<Duration>,
    ) -> Result<Session> {
        let client = self.clients.get(client_id).await?;
        let session = self
            .factory
            .create(
                root,
                SessionType::Cookie,
                OAuth2Data {
                    client_id: client_id.to_string(),
                    scope: scope.to_vec(),
                    ..OAuth2Data::default()
                },
                tenants,
                expiration.or_else(|| client.session_expiration()),
                Some(CookieData::generate(None)),
            )
            .await?;
        info!(sid = %session.id, client_id, "cookie session created");
        Ok(session)
    }

    /// Exchange an authorization code for a client cookie.
    ///
    /// # Errors
    /// `NotFound`/`Expired` for a bad code, `Validation` when the code was
    /// not issued for a cookie session.
    pub async fn cookie_entry(&self, code: &str) -> Result<(Session, String)> {
        let session = self.oidc.exchange_authorization_code(code, None, None).await?;
        if session.session_type != SessionType::Cookie {
            warn!(sid = %session.id, "cookie entry with a non-cookie session");
            return Err(Error::validation("code was not issued for a cookie session"));
        }
        let header = self.set_cookie_header(&session)?;
        Ok((session, header))
    }

    /// `Set-Cookie` value carrying the session's cookie.
    ///
    /// # Errors
    /// Returns `Validation` for a session without cookie data.
    pub fn set_cookie_header(&self, session: &Session) -> Result<String> {
        let cookie = session
            .cookie
            .as_ref()
            .ok_or_else(|| Error::validation("session has no cookie"))?;
        let name = self.cookie_name(session.client_id());
        let mut header = format!("{name}={}; HttpOnly; Path=/", cookie.id);
        if let Some(domain) = self.domain.as_deref() {
            if session.session_type == SessionType::Root {
                header.push_str(&format!("; Domain={domain}"));
            }
        }
        if let Some(expires_at) = session.expires_at {
            let max_age = (expires_at - Utc::now()).num_seconds().max(0);
            header.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.secure {
            header.push_str("; Secure");
        }
        Ok(header)
    }

    /// `Set-Cookie` value that clears the cookie.
    #[must_use]
    pub fn delete_cookie_header(&self, client_id: Option<&str>) -> String {
        let name = self.cookie_name(client_id);
        let mut header = format!("{name}=; HttpOnly; Path=/; Max-Age=0");
        if client_id.is_none() {
            if let Some(domain) = self.domain.as_deref() {
                header.push_str(&format!("; Domain={domain}"));
            }
        }
        if self.secure {
            header.push_str("; Secure");
        }
        header
    }
}

fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value.trim_matches('"'))
    })
}

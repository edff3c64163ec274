//! The authorize endpoint state machine.
//!
//! Every exit is a redirect: back to the client with `code` or `error`, to
//! the login page with a loopback to this endpoint, or to the factor setup
//! page. Every error exit is audited. Until the client and its
//! `redirect_uri` are verified, errors land on this endpoint instead of the
//! caller-supplied URI.

use chrono::Duration;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use url::{form_urlencoded, Url};

use super::{
    validate_challenge, ClientError, ClientService, CodeChallengeMethod, OidcService,
    OidcSessionRequest,
};
use crate::{
    audit::{AuditCode, AuditService},
    authz::{has_resource_access, resource_id, TenantService},
    config::AuthConfig,
    cookie::CookieService,
    credentials::CredentialsService,
    login::FactorType,
    session::{Session, SessionService, SessionType},
    Error, Result,
};

pub const AUTHORIZE_PATH: &str = "/openidconnect/authorize";
const LOGIN_PATH: &str = "/#/login";
const HOME_PATH: &str = "/#/";

/// OAuth2 authorization error codes (RFC 6749 4.1.2.1, OIDC 3.1.2.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OAuthError {
    InvalidRequest,
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    InvalidScope,
    LoginRequired,
    ServerError,
}

impl OAuthError {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidScope => "invalid_scope",
            Self::LoginRequired => "login_required",
            Self::ServerError => "server_error",
        }
    }
}

/// Authorize parameters, from the query string (GET) or form body (POST).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthorizeRequest {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub prompt: Option<String>,
    pub nonce: Option<String>,
    pub client_secret: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    /// Anything else, forwarded to the login page (`expiration`, `ldid`, ...).
    #[serde(flatten)]
    pub login_parameters: BTreeMap<String, String>,
}

impl AuthorizeRequest {
    fn scope(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(ToString::to_string)
            .collect()
    }

    fn requested_expiration(&self) -> Option<Duration> {
        self.login_parameters
            .get("expiration")
            .and_then(|e| e.parse::<f64>().ok())
            .and_then(|seconds| {
                #[allow(clippy::cast_possible_truncation)]
                let seconds = seconds as i64;
                (seconds > 0).then(|| Duration::seconds(seconds))
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthorizeReply {
    /// Back to the client (success or error) or to the factor setup page.
    Redirect(String),
    /// To the login page; the root cookie is cleared.
    Login(String),
}

impl AuthorizeReply {
    #[must_use]
    pub fn location(&self) -> &str {
        match self {
            Self::Redirect(location) | Self::Login(location) => location,
        }
    }
}

#[derive(Clone)]
pub struct AuthorizeFlow {
    config: AuthConfig,
    clients: ClientService,
    sessions: SessionService,
    tenants: TenantService,
    credentials: CredentialsService,
    oidc: OidcService,
    cookies: CookieService,
    audit: AuditService,
}

/// Validated authorize parameters.
struct Params<'a> {
    client_id: &'a str,
    redirect_uri: &'a str,
    response_type: &'a str,
    scope: Vec<String>,
    state: Option<&'a str>,
}

impl AuthorizeFlow {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: AuthConfig,
        clients: ClientService,
        sessions: SessionService,
        tenants: TenantService,
        credentials: CredentialsService,
        oidc: OidcService,
        cookies: CookieService,
        audit: AuditService,
    ) -> Self {
        Self {
            config,
            clients,
            sessions,
            tenants,
            credentials,
            oidc,
            cookies,
            audit,
        }
    }

    /// Run one authorize request. `root_session` is whatever the request's
    /// root cookie resolved to.
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        root_session: Option<Session>,
    ) -> AuthorizeReply {
        let (Some(client_id), Some(redirect_uri), Some(response_type), Some(_)) = (
            request.client_id.as_deref(),
            request.redirect_uri.as_deref(),
            request.response_type.as_deref(),
            request.scope.as_deref(),
        ) else {
            warn!("authorize request is missing required parameters");
            let missing: Vec<&str> = [
                ("scope", request.scope.is_none()),
                ("client_id", request.client_id.is_none()),
                ("response_type", request.response_type.is_none()),
                ("redirect_uri", request.redirect_uri.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();
            self.audit_error(
                request.client_id.as_deref().unwrap_or_default(),
                "invalid_request",
                None,
                json!({"missing": missing}),
            )
            .await;
            return self.error_reply(
                OAuthError::InvalidRequest,
                request.redirect_uri.as_deref(),
                Some("Missing required parameters: scope, client_id, response_type, redirect_uri"),
                request.state.as_deref(),
            );
        };
        let params = Params {
            client_id,
            redirect_uri,
            response_type,
            scope: request.scope(),
            state: request.state.as_deref(),
        };

        match self.authorize_code_flow(request, &params, root_session).await {
            Ok(reply) => reply,
            Err(err) => {
                error!(client_id, "authorize failed: {err}");
                self.audit_error(client_id, "server_error", None, json!({
                    "redirect_uri": redirect_uri,
                    "reason": err.to_string(),
                }))
                .await;
                self.error_reply(
                    OAuthError::ServerError,
                    Some(redirect_uri),
                    None,
                    params.state,
                )
            }
        }
    }

    async fn authorize_code_flow(
        &self,
        request: &AuthorizeRequest,
        params: &Params<'_>,
        root_session: Option<Session>,
    ) -> Result<AuthorizeReply> {
        let Params {
            client_id,
            redirect_uri,
            response_type,
            state,
            ..
        } = *params;
        let scope = &params.scope;

        let client = match self.clients.get(client_id).await {
            Ok(client) => client,
            Err(err) if err.is_gone() => {
                error!(client_id, "client not found");
                self.audit_error(client_id, "invalid_client", None, json!({
                    "redirect_uri": redirect_uri,
                }))
                .await;
                return Ok(self.error_reply(
                    OAuthError::InvalidRequest,
                    None,
                    Some("Invalid client_id"),
                    state,
                ));
            }
            Err(err) => return Err(err),
        };

        match self
            .clients
            .authorize_client(
                &client,
                scope,
                redirect_uri,
                response_type,
                request.client_secret.as_deref(),
            )
            .await
        {
            Ok(()) => {}
            Err(ClientError::InvalidClientSecret) => {
                error!(client_id, "invalid client secret");
                self.audit_error(client_id, "unauthorized_client", None, json!({
                    "redirect_uri": redirect_uri,
                }))
                .await;
                return Ok(self.error_reply(
                    OAuthError::UnauthorizedClient,
                    Some(redirect_uri),
                    Some("Unauthorized client"),
                    state,
                ));
            }
            Err(ClientError::InvalidRedirectUri(uri)) => {
                error!(client_id, redirect_uri = %uri, "redirect_uri not registered");
                self.audit_error(client_id, "invalid_redirect_uri", None, json!({
                    "redirect_uri": uri,
                }))
                .await;
                return Ok(self.error_reply(
                    OAuthError::InvalidRequest,
                    None,
                    Some("Invalid redirect_uri"),
                    state,
                ));
            }
            Err(ClientError::ResponseTypeNotAllowed(_)) => {
                return Ok(self.unsupported_response_type(params).await);
            }
            Err(err) => {
                error!(client_id, "client error: {err}");
                self.audit_error(client_id, "client_error", None, json!({
                    "redirect_uri": redirect_uri,
                    "reason": err.to_string(),
                }))
                .await;
                return Ok(self.error_reply(
                    OAuthError::InvalidRequest,
                    Some(redirect_uri),
                    Some("Client error"),
                    state,
                ));
            }
        }

        if response_type != "code" {
            return Ok(self.unsupported_response_type(params).await);
        }

        if let Err(err) = validate_challenge(
            client.code_challenge_method,
            request.code_challenge.as_deref(),
            request.code_challenge_method.as_deref(),
        ) {
            error!(client_id, "invalid code challenge: {err}");
            self.audit_error(client_id, "client_error", None, json!({
                "redirect_uri": redirect_uri,
                "reason": err.to_string(),
            }))
            .await;
            return Ok(self.error_reply(
                OAuthError::InvalidRequest,
                Some(redirect_uri),
                Some("Client error"),
                state,
            ));
        }
        let challenge_method = match request.code_challenge {
            Some(_) => client.code_challenge_method,
            None => CodeChallengeMethod::None,
        };

        if !scope.iter().any(|s| s == "openid") {
            warn!(client_id, scope = %scope.join(" "), "scope does not contain openid");
            self.audit_error(client_id, "invalid_scope", None, json!({"scope": scope}))
                .await;
            return Ok(self.error_reply(
                OAuthError::InvalidScope,
                Some(redirect_uri),
                Some("Scope must contain 'openid'"),
                state,
            ));
        }

        let mut root_session = root_session.filter(|session| {
            if session.session_type != SessionType::Root {
                warn!(sid = %session.id, "authorizing session must be a root session");
                return false;
            }
            if session.authentication.is_anonymous && !client.authorize_anonymous_users {
                warn!(sid = %session.id, client_id, "client does not authorize anonymous sessions");
                return false;
            }
            true
        });

        let prompt = request.prompt.as_deref();
        if !matches!(prompt, None | Some("none" | "login" | "select_account")) {
            warn!(client_id, prompt = ?prompt, "invalid prompt");
            self.audit_error(client_id, "invalid_request", None, json!({"prompt": prompt}))
                .await;
            return Ok(self.error_reply(
                OAuthError::InvalidRequest,
                Some(redirect_uri),
                Some(&format!(
                    "Invalid parameter value for prompt: {}",
                    prompt.unwrap_or_default()
                )),
                state,
            ));
        }

        if prompt == Some("login") {
            if let Some(session) = root_session.take() {
                info!(sid = %session.id, "login prompt requested, ending root session");
                self.sessions.delete(&session.id).await?;
            }
        }

        let root_session = match root_session {
            None if prompt == Some("none") => {
                info!(client_id, "not authenticated and no prompt allowed");
                self.audit_error(client_id, "login_required", None, json!({"prompt": prompt}))
                    .await;
                return Ok(self.error_reply(
                    OAuthError::LoginRequired,
                    Some(redirect_uri),
                    None,
                    state,
                ));
            }
            None => return self.login_redirect(request, params, &client, challenge_method),
            Some(_) if prompt == Some("select_account") => {
                info!(client_id, "account selection requested");
                return self.login_redirect(request, params, &client, challenge_method);
            }
            Some(session) => session,
        };

        let cid = root_session.credentials_id().to_string();
        let authz = &root_session.authorization.authz;
        let has_access_to_all_tenants = has_resource_access(authz, None, &[resource_id::SUPERUSER])
            || has_resource_access(authz, None, &[resource_id::ACCESS_ALL_TENANTS]);
        let tenants = match self
            .tenants
            .get_tenants_by_scope(scope, &cid, has_access_to_all_tenants)
            .await
        {
            Ok(tenants) => tenants,
            Err(err) => {
                let (reason, tenant) = match &err {
                    Error::TenantNotFound(tenant) => ("access_denied:tenant_not_found", Some(tenant)),
                    Error::TenantAccessDenied { tenant, .. } => {
                        ("access_denied:unauthorized_tenant", Some(tenant))
                    }
                    Error::NoTenants(_) => ("access_denied:user_has_no_tenant", None),
                    _ => return Err(err),
                };
                error!(cid = %cid, client_id, "tenant authorization failed: {err}");
                self.audit_error(client_id, reason, Some(&cid), json!({
                    "tenant": tenant,
                    "scope": scope,
                }))
                .await;
                return Ok(self.error_reply(
                    OAuthError::AccessDenied,
                    Some(redirect_uri),
                    None,
                    state,
                ));
            }
        };

        let missing = self.factors_to_setup(&root_session).await?;
        if !missing.is_empty() {
            warn!(cid = %cid, missing = ?missing, "factor setup required");
            return Ok(self.factor_setup_redirect(params, &missing));
        }

        let expiration = request
            .requested_expiration()
            .or_else(|| client.session_expiration());
        let (session, code) = if scope.iter().any(|s| s == "cookie") {
            let session = self
                .cookies
                .create_cookie_client_session(&root_session, client_id, scope, &tenants, expiration)
                .await?;
            let code = self
                .oidc
                .codes()
                .generate(
                    &session.id,
                    client_id,
                    Some(redirect_uri),
                    None,
                    CodeChallengeMethod::None,
                )
                .await?;
            (session, code)
        } else {
            self.oidc
                .create_oidc_session(
                    &root_session,
                    &tenants,
                    OidcSessionRequest {
                        client_id,
                        scope: scope.clone(),
                        nonce: request.nonce.as_deref(),
                        redirect_uri: Some(redirect_uri),
                        code_challenge: request.code_challenge.as_deref(),
                        code_challenge_method: challenge_method,
                        expiration,
                    },
                )
                .await?
        };

        self.tenants.set_last_authorized_tenants(&cid, &tenants).await?;
        self.audit
            .append(
                AuditCode::AuthorizeSuccess,
                json!({
                    "cid": cid,
                    "sid": session.id,
                    "tenants": session.authorization.tenants().collect::<Vec<_>>(),
                    "client_id": client_id,
                    "scope": scope,
                }),
            )
            .await;

        Ok(AuthorizeReply::Redirect(success_redirect(
            redirect_uri,
            &code,
            state,
        )?))
    }

    /// App-wide enforced factors the session did not log in with, plus the
    /// factors the credentials are flagged to (re)set.
    async fn factors_to_setup(&self, session: &Session) -> Result<Vec<FactorType>> {
        let used = session
            .authentication
            .login_descriptor
            .as_ref()
            .map(crate::login::LoginDescriptor::factor_types)
            .unwrap_or_default();
        let mut missing: Vec<FactorType> = self
            .config
            .enforce_factors()
            .iter()
            .copied()
            .filter(|f| !used.contains(f))
            .collect();
        if session.authentication.impersonator_session_id.is_none() {
            let credentials = self.credentials.get(session.credentials_id()).await?;
            for factor in credentials.enforce_factors {
                if !missing.contains(&factor) {
                    missing.push(factor);
                }
            }
        }
        Ok(missing)
    }

    fn login_redirect(
        &self,
        request: &AuthorizeRequest,
        params: &Params<'_>,
        client: &super::Client,
        challenge_method: CodeChallengeMethod,
    ) -> Result<AuthorizeReply> {
        let mut loopback = vec![
            ("response_type".to_string(), params.response_type.to_string()),
            ("scope".to_string(), params.scope.join(" ")),
            ("client_id".to_string(), params.client_id.to_string()),
            ("redirect_uri".to_string(), params.redirect_uri.to_string()),
        ];
        if let Some(state) = params.state {
            loopback.push(("state".to_string(), state.to_string()));
        }
        if let Some(challenge) = &request.code_challenge {
            loopback.push(("code_challenge".to_string(), challenge.clone()));
            if challenge_method != CodeChallengeMethod::None {
                loopback.push((
                    "code_challenge_method".to_string(),
                    challenge_method.as_str().to_string(),
                ));
            }
        }
        let authorize_uri = client.authorize_uri.clone().unwrap_or_else(|| {
            format!("{}{AUTHORIZE_PATH}", self.config.public_api_base_url())
        });
        let callback = with_query(&authorize_uri, &loopback)?;

        let mut login_params: Vec<(String, String)> = request
            .login_parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        login_params.push(("redirect_uri".to_string(), callback));
        login_params.push(("client_id".to_string(), params.client_id.to_string()));

        let login_uri = client.login_uri.clone().unwrap_or_else(|| {
            format!("{}{LOGIN_PATH}", self.config.auth_webui_base_url())
        });
        let location = match Url::parse(&login_uri)?.fragment() {
            Some(fragment) if !fragment.is_empty() => {
                let (base, _) = login_uri.split_once('#').unwrap_or((login_uri.as_str(), ""));
                format!("{base}#{}", merge_fragment_query(fragment, &login_params))
            }
            _ => with_query(&login_uri, &login_params)?,
        };
        Ok(AuthorizeReply::Login(location))
    }

    fn factor_setup_redirect(&self, params: &Params<'_>, missing: &[FactorType]) -> AuthorizeReply {
        let mut loopback = vec![
            ("prompt", "login".to_string()),
            ("response_type", params.response_type.to_string()),
            ("scope", params.scope.join(" ")),
            ("client_id", params.client_id.to_string()),
            ("redirect_uri", params.redirect_uri.to_string()),
        ];
        if let Some(state) = params.state {
            loopback.push(("state", state.to_string()));
        }
        let authorize = format!(
            "{}{AUTHORIZE_PATH}?{}",
            self.config.public_api_base_url(),
            form_urlencoded::Serializer::new(String::new())
                .extend_pairs(loopback)
                .finish()
        );
        let setup = missing
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        // Browsers decode the fragment once, so the nested URL is encoded twice.
        let nested: String = form_urlencoded::byte_serialize(authorize.as_bytes()).collect();
        let fragment_query = form_urlencoded::Serializer::new(String::new())
            .append_pair("setup", &setup)
            .append_pair("redirect_uri", &nested)
            .finish();
        let (base, fragment) = HOME_PATH.split_once('#').unwrap_or((HOME_PATH, ""));
        AuthorizeReply::Redirect(format!(
            "{}{base}#{fragment}?{fragment_query}",
            self.config.auth_webui_base_url()
        ))
    }

    /// Redirect with `error` to the client, or to the generic error page when
    /// there is no usable redirect URI.
    fn error_reply(
        &self,
        error: OAuthError,
        redirect_uri: Option<&str>,
        description: Option<&str>,
        state: Option<&str>,
    ) -> AuthorizeReply {
        let mut pairs = vec![("error".to_string(), error.as_str().to_string())];
        if let Some(description) = description {
            pairs.push(("error_description".to_string(), description.to_string()));
        }
        if let Some(state) = state {
            pairs.push(("state".to_string(), state.to_string()));
        }

        if let Some(mut url) = redirect_uri.and_then(|uri| Url::parse(uri).ok()) {
            let existing: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| !pairs.iter().any(|(key, _)| key == k))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.set_fragment(None);
            url.query_pairs_mut()
                .clear()
                .extend_pairs(pairs)
                .extend_pairs(existing);
            return AuthorizeReply::Redirect(url.to_string());
        }

        AuthorizeReply::Redirect(format!(
            "{}{AUTHORIZE_PATH}?{}",
            self.config.public_api_base_url(),
            form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish()
        ))
    }

    /// Only reached once `redirect_uri` is known to belong to the client.
    async fn unsupported_response_type(&self, params: &Params<'_>) -> AuthorizeReply {
        warn!(
            client_id = params.client_id,
            response_type = params.response_type,
            "unsupported response_type"
        );
        self.audit_error(params.client_id, "unsupported_response_type", None, json!({
            "response_type": params.response_type,
        }))
        .await;
        self.error_reply(
            OAuthError::UnsupportedResponseType,
            Some(params.redirect_uri),
            None,
            params.state,
        )
    }

    async fn audit_error(&self, client_id: &str, error: &str, cid: Option<&str>, details: Value) {
        let mut record = json!({"client_id": client_id, "error": error});
        if let Some(cid) = cid {
            record["cid"] = json!(cid);
        }
        if let (Value::Object(record), Value::Object(details)) = (&mut record, details) {
            record.extend(details);
        }
        self.audit.append(AuditCode::AuthorizeError, record).await;
    }
}

/// `redirect_uri` with `code` and `state` set; other parameters kept.
fn success_redirect(redirect_uri: &str, code: &str, state: Option<&str>) -> Result<String> {
    let mut url = Url::parse(redirect_uri)?;
    let existing: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "code" && (state.is_none() || k != "state"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear().extend_pairs(existing);
        if let Some(state) = state {
            query.append_pair("state", state);
        }
        query.append_pair("code", code);
    }
    Ok(url.to_string())
}

/// `uri` with `params` replacing same-named query parameters.
fn with_query(uri: &str, params: &[(String, String)]) -> Result<String> {
    let mut url = Url::parse(uri)?;
    let existing: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !params.iter().any(|(key, _)| key == k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(existing)
        .extend_pairs(params);
    Ok(url.to_string())
}

/// Merge `params` into the query part of a `path?query` fragment.
fn merge_fragment_query(fragment: &str, params: &[(String, String)]) -> String {
    let (path, query) = fragment.split_once('?').unwrap_or((fragment, ""));
    let existing = form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| !params.iter().any(|(key, _)| key == k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(existing)
        .extend_pairs(params)
        .finish();
    format!("{path}?{query}")
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::validation(format!("invalid url: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        oidc::{tests::fixture as oidc_fixture, ClientRegistration},
        session::{CookieData, SessionContribution, SessionCredentials},
    };

    #[test]
    fn success_keeps_params_but_state_and_code_win() -> anyhow::Result<()> {
        let location = success_redirect(
            "https://app.example.com/cb?keep=1&state=old&code=old",
            "c0de",
            Some("s1"),
        )?;
        let url = Url::parse(&location)?;
        let pairs: BTreeMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["keep"], "1");
        assert_eq!(pairs["state"], "s1");
        assert_eq!(pairs["code"], "c0de");
        assert_eq!(url.query_pairs().count(), 3);
        Ok(())
    }

    #[test]
    fn fragment_query_merges() {
        let merged = merge_fragment_query(
            "/login?ldid=a",
            &[
                ("ldid".to_string(), "b".to_string()),
                ("client_id".to_string(), "app".to_string()),
            ],
        );
        assert_eq!(merged, "/login?ldid=b&client_id=app");
    }

    struct Fixture {
        flow: AuthorizeFlow,
        sessions: SessionService,
        tenants: TenantService,
        audit: AuditService,
        alice: String,
    }

    async fn fixture(config: AuthConfig) -> anyhow::Result<Fixture> {
        let base = oidc_fixture().await?;
        let clients = ClientService::new(base.store.clone());
        clients
            .register(ClientRegistration {
                client_id: Some("app".to_string()),
                redirect_uris: vec!["https://app.example.com/cb".to_string()],
                ..ClientRegistration::default()
            })
            .await?;
        let audit = AuditService::new(base.store.clone());
        let cookies = CookieService::new(
            &config,
            base.factory.clone(),
            clients.clone(),
            base.oidc.clone(),
        )?;
        let flow = AuthorizeFlow::new(
            config,
            clients,
            base.sessions.clone(),
            base.tenants.clone(),
            base.credentials.clone(),
            base.oidc.clone(),
            cookies,
            audit.clone(),
        );
        Ok(Fixture {
            flow,
            sessions: base.sessions,
            tenants: base.tenants,
            audit,
            alice: base.alice,
        })
    }

    fn config() -> AuthConfig {
        AuthConfig::new(
            "https://auth.example.com/api".to_string(),
            "https://auth.example.com".to_string(),
        )
    }

    fn request(scope: &str, prompt: Option<&str>) -> AuthorizeRequest {
        AuthorizeRequest {
            response_type: Some("code".to_string()),
            client_id: Some("app".to_string()),
            redirect_uri: Some("https://app.example.com/cb".to_string()),
            scope: Some(scope.to_string()),
            state: Some("xyz".to_string()),
            prompt: prompt.map(ToString::to_string),
            ..AuthorizeRequest::default()
        }
    }

    async fn root(f: &Fixture) -> anyhow::Result<Session> {
        Ok(f
            .sessions
            .create_session(
                SessionType::Root,
                None,
                None,
                vec![
                    SessionContribution::Credentials(SessionCredentials {
                        id: f.alice.clone(),
                        ..SessionCredentials::default()
                    }),
                    SessionContribution::Cookie(CookieData::generate(None)),
                ],
            )
            .await?)
    }

    fn query(location: &str) -> anyhow::Result<BTreeMap<String, String>> {
        Ok(Url::parse(location)?.query_pairs().into_owned().collect())
    }

    #[tokio::test]
    async fn prompt_none_without_session_is_login_required() -> anyhow::Result<()> {
        let f = fixture(config()).await?;
        let reply = f.flow.authorize(&request("openid", Some("none")), None).await;
        let q = query(reply.location())?;
        assert_eq!(q["error"], "login_required");
        assert_eq!(q["state"], "xyz");
        assert!(reply.location().starts_with("https://app.example.com/cb"));
        assert_eq!(f.audit.list(Some(AuditCode::AuthorizeError)).await?.len(), 1);
        assert!(f.audit.list(Some(AuditCode::AuthorizeSuccess)).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn missing_session_goes_to_login_with_loopback() -> anyhow::Result<()> {
        let f = fixture(config()).await?;
        let mut req = request("openid tenant", None);
        req.login_parameters
            .insert("ldid".to_string(), "smslogin".to_string());
        let reply = f.flow.authorize(&req, None).await;
        let AuthorizeReply::Login(location) = reply else {
            anyhow::bail!("expected a login redirect, got {reply:?}");
        };
        assert!(location.starts_with("https://auth.example.com/#/login?"));
        let (_, fragment_query) = location
            .split_once("#/login?")
            .ok_or_else(|| anyhow::anyhow!("no fragment query"))?;
        let q: BTreeMap<String, String> = form_urlencoded::parse(fragment_query.as_bytes())
            .into_owned()
            .collect();
        assert_eq!(q["ldid"], "smslogin");
        assert_eq!(q["client_id"], "app");
        let loopback = query(&q["redirect_uri"])?;
        assert_eq!(loopback["scope"], "openid tenant");
        assert_eq!(loopback["state"], "xyz");
        assert!(q["redirect_uri"].starts_with("https://auth.example.com/api/openidconnect/authorize"));
        Ok(())
    }

    #[tokio::test]
    async fn authorized_request_redirects_with_code() -> anyhow::Result<()> {
        let f = fixture(config()).await?;
        f.tenants.create("acme", None, None, None).await?;
        f.tenants.assign(&f.alice, "acme").await?;
        let root = root(&f).await?;

        let reply = f
            .flow
            .authorize(&request("openid tenant:acme", None), Some(root.clone()))
            .await;
        let q = query(reply.location())?;
        assert_eq!(q["state"], "xyz");
        assert!(q.contains_key("code"), "{reply:?}");

        let children = f.sessions.list_children(&root.id).await?;
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].session_type, SessionType::Openidconnect);
        assert!(children[0].authorization.authz.contains_key("acme"));
        assert_eq!(
            f.tenants.get_last_authorized_tenants(&f.alice).await?,
            vec!["acme".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_tenant_is_access_denied() -> anyhow::Result<()> {
        let f = fixture(config()).await?;
        f.tenants.create("acme", None, None, None).await?;
        f.tenants.create("beta", None, None, None).await?;
        f.tenants.assign(&f.alice, "acme").await?;
        let root = root(&f).await?;

        let reply = f
            .flow
            .authorize(&request("openid tenant:beta", None), Some(root))
            .await;
        assert_eq!(query(reply.location())?["error"], "access_denied");
        let errors = f.audit.list(Some(AuditCode::AuthorizeError)).await?;
        assert_eq!(errors[0].details["error"], "access_denied:unauthorized_tenant");
        Ok(())
    }

    #[tokio::test]
    async fn request_errors() -> anyhow::Result<()> {
        let f = fixture(config()).await?;

        let mut no_scope = request("openid", None);
        no_scope.scope = None;
        let reply = f.flow.authorize(&no_scope, None).await;
        assert_eq!(query(reply.location())?["error"], "invalid_request");

        let reply = f.flow.authorize(&request("profile", None), None).await;
        assert_eq!(query(reply.location())?["error"], "invalid_scope");

        let mut token = request("openid", None);
        token.response_type = Some("token".to_string());
        let reply = f.flow.authorize(&token, None).await;
        assert_eq!(query(reply.location())?["error"], "unsupported_response_type");

        let mut foreign = request("openid", None);
        foreign.redirect_uri = Some("https://evil.example.com/cb".to_string());
        let reply = f.flow.authorize(&foreign, None).await;
        assert!(reply
            .location()
            .starts_with("https://auth.example.com/api/openidconnect/authorize?error=invalid_request"));

        let reply = f
            .flow
            .authorize(&request("openid", Some("consent")), None)
            .await;
        assert_eq!(query(reply.location())?["error"], "invalid_request");
        Ok(())
    }

    #[tokio::test]
    async fn every_error_exit_is_audited() -> anyhow::Result<()> {
        let f = fixture(config()).await?;
        let endpoint = "https://auth.example.com/api/openidconnect/authorize?";

        let mut no_scope = request("openid", None);
        no_scope.scope = None;
        let mut ghost = request("openid", None);
        ghost.client_id = Some("nope".to_string());
        let mut ghost_token = ghost.clone();
        ghost_token.response_type = Some("token".to_string());
        let mut foreign = request("openid", None);
        foreign.redirect_uri = Some("https://evil.example.com/cb".to_string());
        let mut foreign_token = foreign.clone();
        foreign_token.response_type = Some("token".to_string());
        let mut bad_secret = request("openid", None);
        bad_secret.client_secret = Some("nope".to_string());
        let mut token = request("openid", None);
        token.response_type = Some("token".to_string());

        let cases = [
            (no_scope, "invalid_request", "https://app.example.com/cb?"),
            (ghost, "invalid_request", endpoint),
            (ghost_token, "invalid_request", endpoint),
            (foreign, "invalid_request", endpoint),
            (foreign_token, "invalid_request", endpoint),
            (bad_secret, "unauthorized_client", "https://app.example.com/cb?"),
            (token, "unsupported_response_type", "https://app.example.com/cb?"),
        ];
        for (req, error, target) in &cases {
            let reply = f.flow.authorize(req, None).await;
            assert!(reply.location().starts_with(target), "{reply:?}");
            assert_eq!(query(reply.location())?["error"], *error);
        }

        let errors = f.audit.list(Some(AuditCode::AuthorizeError)).await?;
        assert_eq!(errors.len(), cases.len());
        assert!(errors.iter().any(|r| r.details.get("error") == Some(&json!("invalid_client"))
            && r.details.get("client_id") == Some(&json!("nope"))));
        assert!(errors
            .iter()
            .any(|r| r.details.get("missing") == Some(&json!(["scope"]))));
        Ok(())
    }

    #[tokio::test]
    async fn prompt_login_ends_root_session() -> anyhow::Result<()> {
        let f = fixture(config()).await?;
        let root = root(&f).await?;
        let reply = f
            .flow
            .authorize(&request("openid", Some("login")), Some(root.clone()))
            .await;
        assert!(matches!(reply, AuthorizeReply::Login(_)));
        assert!(f.sessions.get(&root.id).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn enforced_factor_redirects_to_setup() -> anyhow::Result<()> {
        let f = fixture(config().with_enforce_factors(vec![FactorType::Totp])).await?;
        let root = root(&f).await?;
        let reply = f
            .flow
            .authorize(&request("openid", None), Some(root))
            .await;
        let AuthorizeReply::Redirect(location) = reply else {
            anyhow::bail!("expected a redirect");
        };
        assert!(location.starts_with("https://auth.example.com/#/?setup=totp&redirect_uri="));
        Ok(())
    }
}

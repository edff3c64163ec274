//! Login handshake orchestration: prologue, attempts, factor preparation
//! steps and root session issuance.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::BTreeSet, sync::Arc, time::Instant};
use tracing::{debug, info, warn};
use url::form_urlencoded;

use super::{
    factors::{SMS_CODE_KEY, WEBAUTHN_KEY},
    DescriptorEngine, FactorType, LoginDescriptor, LoginSession, LoginSessionStore,
    NewLoginSession, RequestContext,
};
use crate::{
    audit::{AuditCode, AuditService},
    authz::{RbacService, TenantService},
    config::AuthConfig,
    cookie::CookieService,
    credentials::{CredentialsService, M2M_PROVIDER_TYPE},
    crypto::ClientPublicKey,
    notification::{Destination, NotificationProvider},
    session::{Session, SessionContribution, SessionCredentials, SessionService, SessionType},
    Error, Result,
};

const SMS_CODE_DIGITS: u32 = 6;

#[derive(Clone, Debug, Deserialize)]
pub struct PrologueRequest {
    pub ident: String,
    /// Client X25519 public key, base64url.
    pub key: String,
    /// Query string of the login page (`expiration`, `ldid`).
    #[serde(default)]
    pub qs: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Prologue {
    pub lsid: String,
    pub lds: Vec<LoginDescriptor>,
    /// Server public key for this login session, base64url.
    pub key: String,
}

#[derive(Debug)]
pub enum LoginOutcome {
    /// Uniform failure; the cause only reaches logs and audit.
    Failed,
    Success {
        session: Box<Session>,
        /// Sealed `{"result": "OK", "cid", "sid"}`.
        body: Vec<u8>,
    },
}

/// What a root session is built from, whatever flow produced it.
#[derive(Clone, Debug)]
pub struct RootSessionRequest<'a> {
    pub credentials_id: &'a str,
    pub descriptor: LoginDescriptor,
    pub available_factors: Vec<FactorType>,
    pub expiration: Option<Duration>,
    pub track_id: Option<String>,
    /// Resources stripped from every grant set.
    pub exclude: &'a [&'a str],
    pub extra: Vec<SessionContribution>,
    /// Issue a root cookie.
    pub cookie: bool,
}

#[derive(Clone)]
pub struct AuthenticationService {
    config: AuthConfig,
    login_sessions: LoginSessionStore,
    engine: DescriptorEngine,
    sessions: SessionService,
    tenants: TenantService,
    rbac: RbacService,
    cookies: CookieService,
    audit: AuditService,
    notifications: Arc<dyn NotificationProvider>,
}

fn parse_qs(qs: Option<&str>) -> (Option<i64>, Vec<String>) {
    let Some(qs) = qs else {
        return (None, Vec::new());
    };
    let mut expiration = None;
    let mut preferred = Vec::new();
    for (key, value) in form_urlencoded::parse(qs.trim_start_matches('?').as_bytes()) {
        match key.as_ref() {
            "expiration" if expiration.is_none() => match value.parse::<f64>() {
                #[allow(clippy::cast_possible_truncation)]
                Ok(seconds) if seconds > 0.0 => expiration = Some(seconds as i64),
                _ => warn!(expiration = %value, "ignoring unparsable expiration"),
            },
            "ldid" => preferred.push(value.into_owned()),
            _ => {}
        }
    }
    (expiration, preferred)
}

fn random_code() -> String {
    let max = 10u32.pow(SMS_CODE_DIGITS);
    format!(
        "{:0width$}",
        OsRng.gen_range(0..max),
        width = SMS_CODE_DIGITS as usize
    )
}

/// Stored scratch entry still usable at `now`.
fn is_fresh(entry: Option<&Value>, now: DateTime<Utc>) -> bool {
    entry
        .and_then(|e| e.get("expires_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .is_some_and(|exp| exp > now)
}

impl AuthenticationService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: AuthConfig,
        login_sessions: LoginSessionStore,
        engine: DescriptorEngine,
        sessions: SessionService,
        tenants: TenantService,
        rbac: RbacService,
        cookies: CookieService,
        audit: AuditService,
        notifications: Arc<dyn NotificationProvider>,
    ) -> Self {
        Self {
            config,
            login_sessions,
            engine,
            sessions,
            tenants,
            rbac,
            cookies,
            audit,
            notifications,
        }
    }

    fn credentials(&self) -> &CredentialsService {
        self.engine.verifier().credentials()
    }

    #[must_use]
    pub fn login_sessions(&self) -> &LoginSessionStore {
        &self.login_sessions
    }

    /// Open a login session for `ident`.
    ///
    /// Unknown identifiers, machine credentials and credentials without a
    /// usable descriptor all get a decoy session with the fallback
    /// descriptors; the response never tells them apart.
    ///
    /// # Errors
    /// `Validation` for a malformed client key, otherwise storage failures.
    pub async fn login_prologue(
        &self,
        request: &PrologueRequest,
        ctx: &RequestContext,
    ) -> Result<Prologue> {
        let client_key = ClientPublicKey::parse(&request.key)?;
        let (expiration, preferred) = parse_qs(request.qs.as_deref());

        let mut credentials_id = self
            .credentials()
            .locate(&request.ident)
            .await?
            .unwrap_or_default();
        if credentials_id.is_empty() {
            warn!(ident = %request.ident, "cannot locate credentials");
        } else if self.credentials().provider_type(&credentials_id)? == M2M_PROVIDER_TYPE {
            warn!(cid = %credentials_id, "machine credentials cannot log in interactively");
            credentials_id.clear();
        }

        let mut descriptors = if credentials_id.is_empty() {
            Vec::new()
        } else {
            self.engine
                .prepare_descriptors(&credentials_id, ctx, &preferred)
                .await?
        };
        if descriptors.is_empty() {
            if !credentials_id.is_empty() {
                warn!(cid = %credentials_id, "no usable login descriptor");
            }
            credentials_id.clear();
            descriptors = self.engine.fallback_descriptors();
            warn!(ident = %request.ident, "creating decoy login session");
        }

        let login_session = self
            .login_sessions
            .create(NewLoginSession {
                ident: &request.ident,
                credentials_id: &credentials_id,
                client_public_key: &client_key,
                descriptors,
                expiration: None,
                requested_session_expiration: expiration,
            })
            .await?;
        Ok(Prologue {
            key: login_session.public_key()?,
            lsid: login_session.id,
            lds: login_session.login_descriptors,
        })
    }

    /// One sealed login attempt.
    ///
    /// The attempt is charged before anything else is looked at. Every
    /// failure returns [`LoginOutcome::Failed`] no sooner than the
    /// configured latency floor.
    ///
    /// # Errors
    /// Only storage failures; authentication failures are an outcome.
    pub async fn login(
        &self,
        lsid: &str,
        sealed: &[u8],
        ctx: &RequestContext,
        track_id: Option<String>,
    ) -> Result<LoginOutcome> {
        let started = Instant::now();

        let login_session = match self.login_sessions.charge_attempt(lsid).await {
            Ok(login_session) => login_session,
            Err(err) if err.is_gone() || matches!(err, Error::AttemptsExhausted) => {
                warn!(lsid = %lsid, "login failed: {err}");
                return Ok(self.fail(started, None, ctx).await);
            }
            Err(err) => return Err(err),
        };

        let payload = match login_session
            .decrypt(sealed)
            .and_then(|plain| serde_json::from_slice::<Value>(&plain).map_err(|_| Error::Decryption))
        {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    lsid = %lsid,
                    ident = %login_session.ident,
                    cid = %login_session.credentials_id,
                    "login failed: {err}"
                );
                return Ok(self.fail(started, Some(&login_session), ctx).await);
            }
        };

        let Some(descriptor) = self
            .engine
            .validate_attempt(&login_session, &payload, ctx)
            .await
        else {
            warn!(
                lsid = %lsid,
                ident = %login_session.ident,
                cid = %login_session.credentials_id,
                remaining = login_session.remaining_attempts,
                "login failed: authentication failed"
            );
            return Ok(self.fail(started, Some(&login_session), ctx).await);
        };

        let available_factors: BTreeSet<FactorType> = login_session
            .login_descriptors
            .iter()
            .flat_map(LoginDescriptor::factor_types)
            .collect();
        let session = self
            .create_root_session(RootSessionRequest {
                credentials_id: &login_session.credentials_id,
                descriptor: descriptor.clone(),
                available_factors: available_factors.into_iter().collect(),
                expiration: login_session
                    .requested_session_expiration
                    .map(Duration::seconds),
                track_id,
                exclude: &[],
                extra: Vec::new(),
                cookie: true,
            })
            .await?;
        self.login_sessions.delete(lsid).await?;

        self.audit
            .append(
                AuditCode::LoginSuccess,
                json!({
                    "cid": login_session.credentials_id,
                    "sid": session.id,
                    "descriptor": descriptor.id,
                    "ips": ctx.from,
                }),
            )
            .await;
        info!(cid = %login_session.credentials_id, sid = %session.id, "login successful");

        let body = login_session.encrypt(
            json!({
                "result": "OK",
                "cid": login_session.credentials_id,
                "sid": session.id,
            })
            .to_string()
            .as_bytes(),
        )?;
        Ok(LoginOutcome::Success {
            session: Box::new(session),
            body,
        })
    }

    async fn fail(
        &self,
        started: Instant,
        login_session: Option<&LoginSession>,
        ctx: &RequestContext,
    ) -> LoginOutcome {
        // The last attempt was just spent.
        if let Some(spent) = login_session.filter(|l| l.remaining_attempts <= 0) {
            if let Err(err) = self.login_sessions.delete(&spent.id).await {
                warn!(lsid = %spent.id, "failed to delete exhausted login session: {err}");
            }
        }
        self.audit
            .append(
                AuditCode::LoginFailed,
                json!({
                    "cid": login_session.map(|l| l.credentials_id.as_str()).unwrap_or_default(),
                    "ips": ctx.from,
                }),
            )
            .await;
        let floor = self.config.login_failure_floor();
        if let Some(remaining) = floor.checked_sub(started.elapsed()) {
            tokio::time::sleep(remaining).await;
        }
        LoginOutcome::Failed
    }

    /// Build and persist a root session for `request.credentials_id`.
    ///
    /// Authorization covers every tenant the credentials belong to.
    ///
    /// # Errors
    /// `NotFound` when the credentials are gone, otherwise storage failures.
    pub async fn create_root_session(&self, request: RootSessionRequest<'_>) -> Result<Session> {
        let cid = request.credentials_id;
        let credentials = self.credentials().get(cid).await?;
        let tenants: BTreeSet<String> = self.tenants.get_tenants(cid).await?.into_iter().collect();
        let authz = self
            .rbac
            .compute_authorization(cid, &tenants, request.exclude)
            .await?;

        let mut contributions = vec![
            SessionContribution::Credentials(SessionCredentials::from(&credentials)),
            SessionContribution::Authorization(authz),
            SessionContribution::Authentication {
                descriptor: request.descriptor,
                available_factors: request.available_factors,
            },
            SessionContribution::TrackId(
                request
                    .track_id
                    .unwrap_or_else(|| ulid::Ulid::new().to_string()),
            ),
        ];
        if request.cookie {
            contributions.push(SessionContribution::Cookie(self.cookies.root_cookie()));
        }
        contributions.extend(request.extra);

        self.sessions
            .create_session(
                SessionType::Root,
                None,
                Some(request.expiration.unwrap_or_else(|| self.config.session_ttl())),
                contributions,
            )
            .await
    }

    fn open_request(login_session: &LoginSession, sealed: &[u8]) -> Result<Value> {
        let plain = login_session.decrypt(sealed)?;
        serde_json::from_slice(&plain).map_err(|_| Error::Decryption)
    }

    fn seal_reply(login_session: &LoginSession, reply: &Value) -> Result<Vec<u8>> {
        login_session.encrypt(reply.to_string().as_bytes())
    }

    /// Send a one-time code by SMS and keep it in the login session.
    ///
    /// A retransmitted request while the code is still fresh is answered
    /// without sending again. Decoy sessions answer OK and send nothing.
    ///
    /// # Errors
    /// `NotFound`/`Expired`/`AttemptsExhausted` for an unusable login
    /// session, `Decryption` for a request not sealed for it.
    pub async fn sms_login(&self, lsid: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        let login_session = self.login_sessions.get(lsid).await?;
        let request = Self::open_request(&login_session, sealed)?;

        let factor = request
            .get("factor_id")
            .or_else(|| request.get("factor_type"))
            .and_then(Value::as_str)
            .and_then(FactorType::parse);
        if factor != Some(FactorType::SmsCode) {
            warn!(lsid = %lsid, "sms login for an unsupported factor");
            return Self::seal_reply(&login_session, &json!({"result": "FAILED"}));
        }
        if login_session.is_fake() {
            debug!(lsid = %lsid, "sms login on decoy session");
            return Self::seal_reply(&login_session, &json!({"result": "OK"}));
        }

        let now = Utc::now();
        if is_fresh(login_session.data.get(SMS_CODE_KEY), now) {
            debug!(lsid = %lsid, "sms code already sent");
            return Self::seal_reply(&login_session, &json!({"result": "OK"}));
        }

        let phone = match self.credentials().get(&login_session.credentials_id).await {
            Ok(credentials) => credentials.phone.filter(|p| !p.is_empty()),
            Err(err) => {
                warn!(cid = %login_session.credentials_id, "cannot load credentials: {err}");
                None
            }
        };
        let Some(phone) = phone else {
            warn!(cid = %login_session.credentials_id, "no phone number for sms login");
            return Self::seal_reply(&login_session, &json!({"result": "FAILED"}));
        };

        let code = random_code();
        let expires_at = now + self.config.sms_code_ttl();
        if let Err(err) = self
            .notifications
            .send_otp(&Destination::Sms(phone), &code)
            .await
        {
            warn!(cid = %login_session.credentials_id, "sms delivery failed: {err}");
            return Self::seal_reply(&login_session, &json!({"result": "FAILED"}));
        }
        self.login_sessions
            .set_data(
                lsid,
                SMS_CODE_KEY,
                json!({"code": code, "expires_at": expires_at.to_rfc3339()}),
            )
            .await?;
        info!(cid = %login_session.credentials_id, "sms code sent");
        Self::seal_reply(&login_session, &json!({"result": "OK"}))
    }

    /// Hand out WebAuthn request options and remember them for the attempt.
    ///
    /// Options already stored in the login session are returned again.
    ///
    /// # Errors
    /// As [`Self::sms_login`].
    pub async fn webauthn_login(&self, lsid: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        let login_session = self.login_sessions.get(lsid).await?;
        let request = Self::open_request(&login_session, sealed)?;

        if request.get("factor_type").and_then(Value::as_str) != Some(FactorType::WebAuthn.as_str())
        {
            return Self::seal_reply(
                &login_session,
                &json!({"result": "FAILED", "message": "Unsupported factor type."}),
            );
        }
        if let Some(options) = login_session.data.get(WEBAUTHN_KEY) {
            debug!(lsid = %lsid, "reusing webauthn challenge");
            return Self::seal_reply(&login_session, options);
        }

        let timeout_ms = (login_session.expires_at - Utc::now())
            .num_milliseconds()
            .max(0);
        let mut options = if login_session.is_fake() {
            decoy_webauthn_options()
        } else {
            match self
                .engine
                .verifier()
                .webauthn()
                .authentication_options(&login_session.credentials_id)
                .await
            {
                Ok(options) => options,
                Err(err) => {
                    warn!(cid = %login_session.credentials_id, "webauthn options failed: {err}");
                    return Self::seal_reply(&login_session, &json!({"result": "FAILED"}));
                }
            }
        };
        if let Value::Object(map) = &mut options {
            map.insert("timeout".to_string(), json!(timeout_ms));
        }
        self.login_sessions
            .set_data(lsid, WEBAUTHN_KEY, options.clone())
            .await?;
        Self::seal_reply(&login_session, &options)
    }

    /// Root-less session for a machine credential that passed Basic auth.
    ///
    /// # Errors
    /// `NotFound` for unknown credentials, otherwise storage failures.
    pub async fn create_m2m_session(
        &self,
        credentials_id: &str,
        ctx: &RequestContext,
    ) -> Result<Session> {
        let credentials = self.credentials().get(credentials_id).await?;
        let tenants: BTreeSet<String> = self
            .tenants
            .get_tenants(credentials_id)
            .await?
            .into_iter()
            .collect();
        let authz = self
            .rbac
            .compute_authorization(credentials_id, &tenants, &[])
            .await?;
        let session = self
            .sessions
            .create_session(
                SessionType::M2m,
                None,
                Some(self.config.session_ttl()),
                vec![
                    SessionContribution::Credentials(SessionCredentials::from(&credentials)),
                    SessionContribution::Authorization(authz),
                    SessionContribution::Authentication {
                        descriptor: LoginDescriptor::m2m(),
                        available_factors: vec![FactorType::M2mBasicAuth],
                    },
                    SessionContribution::TrackId(ulid::Ulid::new().to_string()),
                ],
            )
            .await?;
        self.audit
            .append(
                AuditCode::M2mSessionCreated,
                json!({"cid": credentials_id, "sid": session.id, "ips": ctx.from}),
            )
            .await;
        Ok(session)
    }

    /// End `session` and everything derived from it.
    ///
    /// For an impersonated session the impersonator's session is returned
    /// when it is still alive and carries a cookie, so the caller can put
    /// that cookie back.
    ///
    /// # Errors
    /// Storage failures only.
    pub async fn logout(&self, session: &Session) -> Result<Option<Session>> {
        let deleted = self.sessions.delete(&session.id).await?;
        self.audit
            .append(
                AuditCode::Logout,
                json!({"cid": session.credentials_id(), "sid": session.id}),
            )
            .await;
        info!(sid = %session.id, deleted, "logged out");

        let Some(impersonator_sid) = session.authentication.impersonator_session_id.as_deref()
        else {
            return Ok(None);
        };
        match self.sessions.get(impersonator_sid).await {
            Ok(impersonator) if impersonator.cookie.is_some() => {
                info!(sid = %impersonator.id, "restoring impersonator session");
                Ok(Some(impersonator))
            }
            Ok(_) => {
                debug!(sid = %impersonator_sid, "impersonator session has no cookie");
                Ok(None)
            }
            Err(err) if err.is_gone() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Same shape as real request options so decoy sessions look alike.
fn decoy_webauthn_options() -> Value {
    let mut challenge = [0u8; 32];
    OsRng.fill_bytes(&mut challenge);
    json!({
        "challenge": Base64UrlUnpadded::encode_string(&challenge),
        "allowCredentials": [],
        "userVerification": "preferred",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        authz::{ResourceService, RoleService},
        credentials::MemoryCredentialProvider,
        crypto::{envelope::ClientKeyPair, SecretKey},
        login::{default_descriptor_templates, FactorVerifier},
        notification::testing::RecordingProvider,
        oidc::{AuthorizationCodeStore, ClientService, ClientSessionFactory, OidcService},
        otp::OtpService,
        storage::{DocumentStore, MemoryStore},
        webauthn::testing::EchoWebAuthn,
    };
    use secrecy::SecretString;

    struct Fixture {
        authn: AuthenticationService,
        sessions: SessionService,
        audit: AuditService,
        people: Arc<MemoryCredentialProvider>,
        notifications: Arc<RecordingProvider>,
    }

    async fn fixture(attempts: i32) -> anyhow::Result<Fixture> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let config = AuthConfig::new(
            "https://auth.example.com/api".to_string(),
            "https://auth.example.com".to_string(),
        )
        .with_login_attempts(attempts)
        .with_login_failure_floor_ms(0);
        let people = Arc::new(MemoryCredentialProvider::new("default"));
        let machines = Arc::new(MemoryCredentialProvider::m2m("machines"));
        let credentials = CredentialsService::new(vec![people.clone(), machines]);
        let sessions = SessionService::new(store.clone());
        let roles = RoleService::new(store.clone());
        ResourceService::new(store.clone(), roles.clone())
            .ensure_builtin()
            .await?;
        let audit = AuditService::new(store.clone());
        let tenants = TenantService::new(
            store.clone(),
            roles.clone(),
            sessions.clone(),
            audit.clone(),
            "",
        );
        let rbac = RbacService::new(roles);
        let otp = OtpService::new(
            store.clone(),
            SecretKey::ephemeral(),
            "Portunus",
            Duration::minutes(5),
        );
        let verifier =
            FactorVerifier::new(credentials.clone(), otp, Arc::new(EchoWebAuthn::default()));
        let engine = DescriptorEngine::new(default_descriptor_templates(), verifier);
        let factory = ClientSessionFactory::new(credentials, rbac.clone(), sessions.clone());
        let clients = ClientService::new(store.clone());
        let oidc = OidcService::new(
            factory.clone(),
            AuthorizationCodeStore::new(store.clone(), Duration::seconds(60)),
        );
        let cookies = CookieService::new(&config, factory, clients, oidc)?;
        let notifications = Arc::new(RecordingProvider::default());
        let authn = AuthenticationService::new(
            config.clone(),
            LoginSessionStore::new(store, attempts, config.login_session_ttl()),
            engine,
            sessions.clone(),
            tenants,
            rbac,
            cookies,
            audit.clone(),
            notifications.clone(),
        );
        Ok(Fixture {
            authn,
            sessions,
            audit,
            people,
            notifications,
        })
    }

    async fn prologue(
        f: &Fixture,
        client: &ClientKeyPair,
        ident: &str,
    ) -> anyhow::Result<Prologue> {
        Ok(f
            .authn
            .login_prologue(
                &PrologueRequest {
                    ident: ident.to_string(),
                    key: client.public_key().encode(),
                    qs: None,
                },
                &RequestContext::default(),
            )
            .await?)
    }

    fn seal(client: &ClientKeyPair, prologue: &Prologue, payload: &Value) -> anyhow::Result<Vec<u8>> {
        Ok(client.encrypt(&prologue.key, payload.to_string().as_bytes())?)
    }

    #[test]
    fn login_page_query_string() {
        let (expiration, preferred) = parse_qs(Some("?expiration=3600&ldid=totp&ldid=default"));
        assert_eq!(expiration, Some(3600));
        assert_eq!(preferred, vec!["totp".to_string(), "default".to_string()]);
        assert_eq!(parse_qs(Some("expiration=soon")), (None, Vec::new()));
    }

    #[tokio::test]
    async fn password_login_issues_root_session() -> anyhow::Result<()> {
        let f = fixture(3).await?;
        let password = SecretString::from("correct horse");
        let cid = f
            .people
            .create("alice", None, None, Some(&password))
            .await?;
        let client = ClientKeyPair::generate();
        let prologue = prologue(&f, &client, "alice").await?;
        assert_eq!(prologue.lds[0].id, "default");

        let sealed = seal(&client, &prologue, &json!({"password": "correct horse"}))?;
        let outcome = f
            .authn
            .login(&prologue.lsid, &sealed, &RequestContext::default(), None)
            .await?;
        let LoginOutcome::Success { session, body } = outcome else {
            anyhow::bail!("expected success");
        };
        assert_eq!(session.session_type, SessionType::Root);
        assert_eq!(session.credentials_id(), cid);
        assert!(session.cookie.is_some());
        assert!(session.track_id.is_some());

        let reply: Value = serde_json::from_slice(&client.decrypt(&prologue.key, &body)?)?;
        assert_eq!(reply["result"], "OK");
        assert_eq!(reply["sid"], session.id.as_str());

        assert!(f.authn.login_sessions().get(&prologue.lsid).await.is_err());
        assert_eq!(f.audit.list(Some(AuditCode::LoginSuccess)).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failures_spend_attempts_until_the_session_is_gone() -> anyhow::Result<()> {
        let f = fixture(3).await?;
        let password = SecretString::from("correct horse");
        f.people.create("alice", None, None, Some(&password)).await?;
        let client = ClientKeyPair::generate();
        let prologue = prologue(&f, &client, "alice").await?;
        let wrong = seal(&client, &prologue, &json!({"password": "wrong"}))?;

        for expected_remaining in [2, 1] {
            let outcome = f
                .authn
                .login(&prologue.lsid, &wrong, &RequestContext::default(), None)
                .await?;
            assert!(matches!(outcome, LoginOutcome::Failed));
            assert_eq!(
                f.authn.login_sessions().get(&prologue.lsid).await?.remaining_attempts,
                expected_remaining
            );
        }
        let outcome = f
            .authn
            .login(&prologue.lsid, &wrong, &RequestContext::default(), None)
            .await?;
        assert!(matches!(outcome, LoginOutcome::Failed));
        assert!(matches!(
            f.authn.login_sessions().get(&prologue.lsid).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(f.audit.list(Some(AuditCode::LoginFailed)).await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_machine_idents_get_decoys() -> anyhow::Result<()> {
        let f = fixture(3).await?;
        let password = SecretString::from("pw");
        f.people.create("alice", None, None, Some(&password)).await?;
        let client = ClientKeyPair::generate();

        let real = prologue(&f, &client, "alice").await?;
        let unknown = prologue(&f, &client, "nobody").await?;
        assert_eq!(
            serde_json::to_value(&real.lds)?,
            serde_json::to_value(&unknown.lds)?
        );
        assert!(f
            .authn
            .login_sessions()
            .get(&unknown.lsid)
            .await?
            .is_fake());

        let sealed = seal(&client, &unknown, &json!({"password": "pw"}))?;
        let outcome = f
            .authn
            .login(&unknown.lsid, &sealed, &RequestContext::default(), None)
            .await?;
        assert!(matches!(outcome, LoginOutcome::Failed));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_payload_is_a_plain_failure() -> anyhow::Result<()> {
        let f = fixture(3).await?;
        let client = ClientKeyPair::generate();
        let prologue = prologue(&f, &client, "nobody").await?;
        let outcome = f
            .authn
            .login(&prologue.lsid, b"not sealed", &RequestContext::default(), None)
            .await?;
        assert!(matches!(outcome, LoginOutcome::Failed));
        let outcome = f
            .authn
            .login("no-such-lsid", b"x", &RequestContext::default(), None)
            .await?;
        assert!(matches!(outcome, LoginOutcome::Failed));
        Ok(())
    }

    #[tokio::test]
    async fn sms_login_sends_once_and_code_logs_in() -> anyhow::Result<()> {
        let f = fixture(3).await?;
        let password = SecretString::from("pw");
        f.people
            .create("alice", None, Some("+420123456789"), Some(&password))
            .await?;
        let client = ClientKeyPair::generate();
        let prologue = prologue(&f, &client, "alice").await?;

        let request = seal(&client, &prologue, &json!({"factor_id": "smscode"}))?;
        for _ in 0..2 {
            let reply = f.authn.sms_login(&prologue.lsid, &request).await?;
            let reply: Value = serde_json::from_slice(&client.decrypt(&prologue.key, &reply)?)?;
            assert_eq!(reply["result"], "OK");
        }
        let sent = f.notifications.sent.lock().await.clone();
        assert_eq!(sent.len(), 1);
        let code = sent[0].1.clone();

        let attempt = seal(
            &client,
            &prologue,
            &json!({"descriptor": "smslogin", "password": "pw", "smscode": code}),
        )?;
        let outcome = f
            .authn
            .login(&prologue.lsid, &attempt, &RequestContext::default(), None)
            .await?;
        assert!(matches!(outcome, LoginOutcome::Success { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn logout_restores_impersonator_with_cookie() -> anyhow::Result<()> {
        let f = fixture(3).await?;
        let boss = f.people.create("boss", None, None, None).await?;
        let alice = f.people.create("alice", None, None, None).await?;
        let boss_session = f
            .authn
            .create_root_session(RootSessionRequest {
                credentials_id: &boss,
                descriptor: LoginDescriptor::m2m(),
                available_factors: Vec::new(),
                expiration: None,
                track_id: None,
                exclude: &[],
                extra: Vec::new(),
                cookie: true,
            })
            .await?;
        let impersonated = f
            .authn
            .create_root_session(RootSessionRequest {
                credentials_id: &alice,
                descriptor: LoginDescriptor::impersonation(),
                available_factors: Vec::new(),
                expiration: None,
                track_id: None,
                exclude: &[],
                extra: vec![SessionContribution::Impersonation {
                    impersonator_session_id: boss_session.id.clone(),
                    impersonator_credentials_id: boss.clone(),
                }],
                cookie: true,
            })
            .await?;

        let restored = f.authn.logout(&impersonated).await?;
        assert_eq!(restored.map(|s| s.id), Some(boss_session.id.clone()));
        assert!(f.sessions.get(&impersonated.id).await.is_err());

        f.sessions.delete(&boss_session.id).await?;
        assert!(f.authn.logout(&boss_session).await?.is_none());
        Ok(())
    }
}

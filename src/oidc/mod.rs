//! OAuth2 / OpenID Connect.
//!
//! Flow Overview:
//! 1) `authorize` validates the request against the client registration,
//!    resolves the root session and tenant scope, and derives a client
//!    session from the root session.
//! 2) Cookie clients get a cookie session; everything else gets an
//!    openidconnect session.
//! 3) A single-use authorization code bound to the new session is returned
//!    through the redirect and later exchanged, with the PKCE verifier, for
//!    the session.

use chrono::Duration;
use std::collections::BTreeSet;
use tracing::{info, warn};

mod authorize;
mod client;
mod code;
mod pkce;

pub use authorize::{AuthorizeFlow, AuthorizeReply, AuthorizeRequest, OAuthError};
pub use client::{Client, ClientError, ClientRegistration, ClientService, RedirectUriValidation};
pub use code::{AuthorizationCode, AuthorizationCodeStore};
pub use pkce::{validate_challenge, verify as verify_code_verifier, CodeChallengeMethod};

use crate::{
    authz::{resource_id, RbacService},
    credentials::CredentialsService,
    session::{
        CookieData, OAuth2Data, Session, SessionContribution, SessionCredentials, SessionService,
        SessionType,
    },
    Error, Result,
};

/// Scopes that carry the root session's authentication details over.
const AUTHN_INFO_SCOPES: &[&str] = &["profile", "userinfo:authn", "userinfo:*"];

/// Derives client sessions (cookie and openidconnect) from a root session.
#[derive(Clone)]
pub struct ClientSessionFactory {
    credentials: CredentialsService,
    rbac: RbacService,
    sessions: SessionService,
}

impl ClientSessionFactory {
    #[must_use]
    pub fn new(credentials: CredentialsService, rbac: RbacService, sessions: SessionService) -> Self {
        Self {
            credentials,
            rbac,
            sessions,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    /// Build a child of `root` for `oauth2.client_id`.
    ///
    /// Identity attributes are limited by scope (`email`, `phone`). An
    /// impersonated root never passes superuser or impersonate on.
    ///
    /// # Errors
    /// `NotFound` when the root session or its credentials are gone.
    pub async fn create(
        &self,
        root: &Session,
        session_type: SessionType,
        oauth2: OAuth2Data,
        tenants: &BTreeSet<String>,
        expiration: Option<Duration>,
        cookie: Option<CookieData>,
    ) -> Result<Session> {
        let cid = root.credentials_id();
        let scope = &oauth2.scope;
        let has_scope = |s: &str| scope.iter().any(|item| item == s);

        let credentials = self.credentials.get(cid).await?;
        let mut snapshot = SessionCredentials::from(&credentials);
        if !has_scope("email") {
            snapshot.email = None;
        }
        if !has_scope("phone") {
            snapshot.phone = None;
        }

        let impersonated = root.authentication.is_impersonated();
        let exclude: &[&str] = if impersonated {
            &[resource_id::SUPERUSER, resource_id::IMPERSONATE]
        } else {
            &[]
        };
        let authz = self
            .rbac
            .compute_authorization(cid, tenants, exclude)
            .await?;

        let mut contributions = vec![
            SessionContribution::Credentials(snapshot),
            SessionContribution::Authorization(authz),
            SessionContribution::OAuth2(oauth2.clone()),
        ];
        if AUTHN_INFO_SCOPES.iter().any(|s| has_scope(s)) {
            if let Some(descriptor) = root.authentication.login_descriptor.clone() {
                contributions.push(SessionContribution::Authentication {
                    descriptor,
                    available_factors: root.authentication.available_factors.clone(),
                });
            }
        }
        if let (Some(impersonator_session_id), Some(impersonator_credentials_id)) = (
            root.authentication.impersonator_session_id.clone(),
            root.authentication.impersonator_credentials_id.clone(),
        ) {
            contributions.push(SessionContribution::Impersonation {
                impersonator_session_id,
                impersonator_credentials_id,
            });
        }
        if let Some(cookie) = cookie {
            contributions.push(SessionContribution::Cookie(cookie));
        }

        self.sessions
            .create_session(session_type, Some(&root.id), expiration, contributions)
            .await
    }
}

/// Parameters carried from the authorize request into an openidconnect session.
#[derive(Clone, Debug, Default)]
pub struct OidcSessionRequest<'a> {
    pub client_id: &'a str,
    pub scope: Vec<String>,
    pub nonce: Option<&'a str>,
    pub redirect_uri: Option<&'a str>,
    pub code_challenge: Option<&'a str>,
    pub code_challenge_method: CodeChallengeMethod,
    pub expiration: Option<Duration>,
}

#[derive(Clone)]
pub struct OidcService {
    factory: ClientSessionFactory,
    codes: AuthorizationCodeStore,
}

impl OidcService {
    #[must_use]
    pub fn new(factory: ClientSessionFactory, codes: AuthorizationCodeStore) -> Self {
        Self { factory, codes }
    }

    #[must_use]
    pub fn codes(&self) -> &AuthorizationCodeStore {
        &self.codes
    }

    /// Derive an openidconnect session and mint its authorization code.
    ///
    /// # Errors
    /// As [`ClientSessionFactory::create`], or a storage failure.
    pub async fn create_oidc_session(
        &self,
        root: &Session,
        tenants: &BTreeSet<String>,
        request: OidcSessionRequest<'_>,
    ) -> Result<(Session, String)> {
        let oauth2 = OAuth2Data {
            client_id: request.client_id.to_string(),
            scope: request.scope,
            nonce: request.nonce.map(ToString::to_string),
            redirect_uri: request.redirect_uri.map(ToString::to_string),
            code_challenge: request.code_challenge.map(ToString::to_string),
            code_challenge_method: (request.code_challenge_method != CodeChallengeMethod::None)
                .then(|| request.code_challenge_method.as_str().to_string()),
        };
        let session = self
            .factory
            .create(
                root,
                SessionType::Openidconnect,
                oauth2,
                tenants,
                request.expiration,
                None,
            )
            .await?;
        let code = self
            .codes
            .generate(
                &session.id,
                request.client_id,
                request.redirect_uri,
                request.code_challenge,
                request.code_challenge_method,
            )
            .await?;
        info!(sid = %session.id, client_id = %request.client_id, "openidconnect session created");
        Ok((session, code))
    }

    /// Redeem a code for its session.
    ///
    /// The code is spent whatever the outcome; a failed PKCE or client check
    /// also deletes the session it was bound to.
    ///
    /// # Errors
    /// `NotFound`/`Expired` for a bad code, `AccessDenied` when the verifier
    /// or client id does not match.
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<Session> {
        let record = self.codes.pop(code).await?;

        let client_matches = client_id.is_none_or(|id| id == record.client_id);
        let verified = match (&record.code_challenge, record.code_challenge_method) {
            (None, CodeChallengeMethod::None) => true,
            (Some(challenge), method) => {
                verify_code_verifier(method, challenge, code_verifier)
            }
            (None, _) => false,
        };
        if !client_matches || !verified {
            warn!(
                sid = %record.session_id,
                client_id = %record.client_id,
                client_matches,
                verified,
                "authorization code exchange rejected"
            );
            self.factory.sessions().delete(&record.session_id).await?;
            return Err(Error::access_denied(record.client_id, "authorization_code"));
        }

        self.factory.sessions().get(&record.session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::AuditService,
        authz::{ResourceService, RoleService, TenantService},
        credentials::MemoryCredentialProvider,
        storage::{DocumentStore, MemoryStore},
    };
    use std::sync::Arc;

    pub(crate) struct Fixture {
        pub store: Arc<dyn DocumentStore>,
        pub credentials: CredentialsService,
        pub oidc: OidcService,
        pub factory: ClientSessionFactory,
        pub sessions: SessionService,
        pub roles: RoleService,
        pub tenants: TenantService,
        pub alice: String,
    }

    pub(crate) async fn fixture() -> anyhow::Result<Fixture> {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let people = Arc::new(MemoryCredentialProvider::new("default"));
        let alice = people
            .create("alice", Some("alice@example.com"), Some("+420123"), None)
            .await?;
        let credentials = CredentialsService::new(vec![people]);
        let sessions = SessionService::new(store.clone());
        let roles = RoleService::new(store.clone());
        ResourceService::new(store.clone(), roles.clone())
            .ensure_builtin()
            .await?;
        let tenants = TenantService::new(
            store.clone(),
            roles.clone(),
            sessions.clone(),
            AuditService::new(store.clone()),
            "",
        );
        let factory = ClientSessionFactory::new(
            credentials.clone(),
            RbacService::new(roles.clone()),
            sessions.clone(),
        );
        let oidc = OidcService::new(
            factory.clone(),
            AuthorizationCodeStore::new(store.clone(), Duration::seconds(60)),
        );
        Ok(Fixture {
            store,
            credentials,
            oidc,
            factory,
            sessions,
            roles,
            tenants,
            alice,
        })
    }

    async fn root(f: &Fixture, impersonated: bool) -> anyhow::Result<Session> {
        let mut contributions = vec![SessionContribution::Credentials(SessionCredentials {
            id: f.alice.clone(),
            ..SessionCredentials::default()
        })];
        if impersonated {
            contributions.push(SessionContribution::Impersonation {
                impersonator_session_id: "boss-session".to_string(),
                impersonator_credentials_id: "memory:default:boss".to_string(),
            });
        }
        Ok(f
            .sessions
            .create_session(SessionType::Root, None, None, contributions)
            .await?)
    }

    fn scope(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn code_exchange_checks_pkce() -> anyhow::Result<()> {
        let f = fixture().await?;
        let root = root(&f, false).await?;
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        let request = || OidcSessionRequest {
            client_id: "app",
            scope: scope(&["openid"]),
            code_challenge: Some(challenge),
            code_challenge_method: CodeChallengeMethod::S256,
            ..OidcSessionRequest::default()
        };

        let (session, code) = f
            .oidc
            .create_oidc_session(&root, &BTreeSet::new(), request())
            .await?;
        let exchanged = f
            .oidc
            .exchange_authorization_code(&code, Some(verifier), Some("app"))
            .await?;
        assert_eq!(exchanged.id, session.id);
        assert!(f.oidc.exchange_authorization_code(&code, Some(verifier), None).await.is_err());

        let (session, code) = f
            .oidc
            .create_oidc_session(&root, &BTreeSet::new(), request())
            .await?;
        assert!(matches!(
            f.oidc
                .exchange_authorization_code(&code, Some("wrong-verifier-wrong-verifier-wrong-verifier"), None)
                .await,
            Err(Error::AccessDenied { .. })
        ));
        assert!(f.sessions.get(&session.id).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn scope_limits_identity_and_impersonation_strips_powers() -> anyhow::Result<()> {
        let f = fixture().await?;
        f.roles
            .create(
                "*/root",
                None,
                &[
                    resource_id::SUPERUSER.to_string(),
                    resource_id::IMPERSONATE.to_string(),
                ],
            )
            .await?;
        f.roles.assign(&f.alice, "*/root").await?;

        let plain_root = root(&f, false).await?;
        let plain = f
            .factory
            .create(
                &plain_root,
                SessionType::Openidconnect,
                OAuth2Data {
                    client_id: "app".to_string(),
                    scope: scope(&["openid", "email"]),
                    ..OAuth2Data::default()
                },
                &BTreeSet::new(),
                None,
                None,
            )
            .await?;
        assert_eq!(plain.credentials.email.as_deref(), Some("alice@example.com"));
        assert_eq!(plain.credentials.phone, None);
        assert!(crate::authz::is_superuser(&plain.authorization.authz));

        let impersonated_root = root(&f, true).await?;
        let impersonated = f
            .factory
            .create(
                &impersonated_root,
                SessionType::Openidconnect,
                OAuth2Data {
                    client_id: "app".to_string(),
                    scope: scope(&["openid"]),
                    ..OAuth2Data::default()
                },
                &BTreeSet::new(),
                None,
                None,
            )
            .await?;
        assert!(impersonated.authentication.is_impersonated());
        assert!(impersonated.authorization.authz["*"].is_empty());
        Ok(())
    }
}

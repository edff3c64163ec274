//! External login: signing in through a third-party OpenID Connect provider.
//!
//! Flow Overview:
//! 1) `initialize_login` (or `initialize_pairing` from a signed-in session)
//!    stores a single-use state record and returns the provider URL.
//! 2) The provider redirects to the callback; `finalize` consumes the state,
//!    verifies the identity and either signs in the credentials linked to it
//!    or links it to the credentials that started the pairing.
//!
//! Links are stored under `<provider>:<sub>`, so one external identity maps
//! to at most one set of credentials.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

mod provider;

pub use provider::{ExternalIdentity, GenericOAuth2Provider, IdentityProvider, ProviderConfig};

use crate::{
    audit::{AuditCode, AuditService},
    config::AuthConfig,
    login::{AuthenticationService, FactorType, LoginDescriptor, RootSessionRequest},
    session::{ExternalLoginRef, Session, SessionContribution},
    storage::{collections, encode, fetch, find_all, DocumentStore, Filter, StorageError},
    Error, Result,
};

pub const CALLBACK_PATH: &str = "/public/ext-login/callback";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Login,
    Link,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LoginState {
    provider: String,
    nonce: String,
    action: StateAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    redirect_uri: Option<String>,
    /// Credentials being paired, for `Link`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    credentials_id: Option<String>,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub provider: String,
    pub sub: String,
    pub credentials_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum ExternalLoginOutcome {
    LoggedIn {
        session: Box<Session>,
        redirect_uri: Option<String>,
    },
    Linked {
        link: ExternalLink,
        redirect_uri: Option<String>,
    },
}

fn link_id(provider: &str, sub: &str) -> String {
    format!("{provider}:{sub}")
}

fn random_token() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

#[derive(Clone)]
pub struct ExternalLoginService {
    config: AuthConfig,
    store: Arc<dyn DocumentStore>,
    authn: AuthenticationService,
    audit: AuditService,
    providers: BTreeMap<String, Arc<dyn IdentityProvider>>,
}

impl ExternalLoginService {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        store: Arc<dyn DocumentStore>,
        authn: AuthenticationService,
        audit: AuditService,
        providers: Vec<Arc<dyn IdentityProvider>>,
    ) -> Self {
        Self {
            config,
            store,
            authn,
            audit,
            providers: providers
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
        }
    }

    /// `(name, label)` of every configured provider.
    #[must_use]
    pub fn providers(&self) -> Vec<(String, String)> {
        self.providers
            .values()
            .map(|p| (p.name().to_string(), p.label().to_string()))
            .collect()
    }

    #[must_use]
    pub fn callback_uri(&self) -> String {
        format!(
            "{}{CALLBACK_PATH}",
            self.config.public_api_base_url().trim_end_matches('/')
        )
    }

    fn provider(&self, name: &str) -> Result<&Arc<dyn IdentityProvider>> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::not_found(format!("external login provider {name}")))
    }

    async fn begin(
        &self,
        provider: &str,
        action: StateAction,
        credentials_id: Option<&str>,
        redirect_uri: Option<String>,
    ) -> Result<String> {
        let idp = self.provider(provider)?;
        let state = random_token();
        let record = LoginState {
            provider: provider.to_string(),
            nonce: random_token(),
            action,
            redirect_uri,
            credentials_id: credentials_id.map(ToString::to_string),
            expires_at: Utc::now() + self.config.login_session_ttl(),
        };
        self.store
            .insert(
                collections::EXTERNAL_LOGIN_STATES,
                &state,
                encode(&record)?,
                Some(record.expires_at),
            )
            .await?;
        debug!(provider, ?action, "external login started");
        idp.authorize_uri(&self.callback_uri(), &state, &record.nonce)
    }

    /// Provider URL for signing in with `provider`.
    ///
    /// # Errors
    /// `NotFound` for an unknown provider, otherwise storage failures.
    pub async fn initialize_login(
        &self,
        provider: &str,
        redirect_uri: Option<String>,
    ) -> Result<String> {
        self.begin(provider, StateAction::Login, None, redirect_uri)
            .await
    }

    /// Provider URL for linking `provider` to the credentials of `session`.
    ///
    /// # Errors
    /// `AccessDenied` for anonymous or impersonated sessions, `NotFound` for
    /// an unknown provider.
    pub async fn initialize_pairing(
        &self,
        session: &Session,
        provider: &str,
        redirect_uri: Option<String>,
    ) -> Result<String> {
        if session.authentication.is_anonymous || session.authentication.is_impersonated() {
            return Err(Error::access_denied(
                session.credentials_id(),
                "external login pairing",
            ));
        }
        self.begin(
            provider,
            StateAction::Link,
            Some(session.credentials_id()),
            redirect_uri,
        )
        .await
    }

    async fn pop_state(&self, state: &str) -> Result<LoginState> {
        let doc = fetch::<LoginState>(
            self.store.as_ref(),
            collections::EXTERNAL_LOGIN_STATES,
            state,
        )
        .await
        .map_err(|err| match err {
            StorageError::NotFound { .. } => Error::not_found("external login state"),
            other => other.into(),
        })?;
        if !self
            .store
            .delete(collections::EXTERNAL_LOGIN_STATES, state)
            .await?
        {
            return Err(Error::not_found("external login state"));
        }
        if doc.value.expires_at <= Utc::now() {
            return Err(Error::Expired("external login state".to_string()));
        }
        Ok(doc.value)
    }

    /// Complete the flow started with `state`.
    ///
    /// # Errors
    /// `NotFound`/`Expired` for an unknown or used state, `ExternalProvider`
    /// when the provider rejects the code or the token does not verify,
    /// `NotFound` when a login identity is not linked to any credentials and
    /// `Conflict` when a pairing identity is already linked elsewhere.
    pub async fn finalize(&self, state: &str, code: &str) -> Result<ExternalLoginOutcome> {
        let record = self.pop_state(state).await?;
        let result = self.complete(&record, code).await;
        match &result {
            Ok(ExternalLoginOutcome::LoggedIn { session, .. }) => {
                self.audit
                    .append(
                        AuditCode::ExternalLoginSuccess,
                        json!({
                            "provider": record.provider,
                            "cid": session.credentials_id(),
                            "sid": session.id,
                        }),
                    )
                    .await;
            }
            Ok(ExternalLoginOutcome::Linked { link, .. }) => {
                info!(provider = %link.provider, cid = %link.credentials_id, "external identity linked");
            }
            Err(err) => {
                warn!(provider = %record.provider, action = ?record.action, "external login failed: {err}");
                self.audit
                    .append(
                        AuditCode::ExternalLoginFailed,
                        json!({
                            "provider": record.provider,
                            "cid": record.credentials_id,
                        }),
                    )
                    .await;
            }
        }
        result
    }

    async fn complete(&self, record: &LoginState, code: &str) -> Result<ExternalLoginOutcome> {
        let identity = self
            .provider(&record.provider)?
            .user_info(code, &self.callback_uri(), &record.nonce)
            .await?;

        match (record.action, record.credentials_id.as_deref()) {
            (StateAction::Link, Some(cid)) => {
                let link = self.link(&record.provider, &identity, cid).await?;
                Ok(ExternalLoginOutcome::Linked {
                    link,
                    redirect_uri: record.redirect_uri.clone(),
                })
            }
            (StateAction::Link, None) => Err(Error::validation("pairing state without credentials")),
            (StateAction::Login, _) => {
                let link = self.get_link(&record.provider, &identity.sub).await?;
                let session = self
                    .authn
                    .create_root_session(RootSessionRequest {
                        credentials_id: &link.credentials_id,
                        descriptor: LoginDescriptor::external(&record.provider),
                        available_factors: vec![FactorType::External],
                        expiration: None,
                        track_id: None,
                        exclude: &[],
                        extra: vec![SessionContribution::ExternalLogin(ExternalLoginRef {
                            provider: record.provider.clone(),
                            subject: identity.sub.clone(),
                        })],
                        cookie: true,
                    })
                    .await?;
                Ok(ExternalLoginOutcome::LoggedIn {
                    session: Box::new(session),
                    redirect_uri: record.redirect_uri.clone(),
                })
            }
        }
    }

    async fn link(
        &self,
        provider: &str,
        identity: &ExternalIdentity,
        credentials_id: &str,
    ) -> Result<ExternalLink> {
        let link = ExternalLink {
            provider: provider.to_string(),
            sub: identity.sub.clone(),
            credentials_id: credentials_id.to_string(),
            email: identity.email.clone(),
            created_at: Utc::now(),
        };
        self.store
            .insert(
                collections::EXTERNAL_LOGINS,
                &link_id(provider, &identity.sub),
                encode(&link)?,
                None,
            )
            .await?;
        Ok(link)
    }

    /// # Errors
    /// `NotFound` when the identity is not linked.
    pub async fn get_link(&self, provider: &str, sub: &str) -> Result<ExternalLink> {
        fetch::<ExternalLink>(
            self.store.as_ref(),
            collections::EXTERNAL_LOGINS,
            &link_id(provider, sub),
        )
        .await
        .map(|doc| doc.value)
        .map_err(|err| match err {
            StorageError::NotFound { .. } => Error::not_found("external login"),
            other => other.into(),
        })
    }

    /// # Errors
    /// Storage failures only.
    pub async fn list_links(&self, credentials_id: &str) -> Result<Vec<ExternalLink>> {
        Ok(find_all::<ExternalLink>(
            self.store.as_ref(),
            collections::EXTERNAL_LOGINS,
            &Filter::all().eq("/credentials_id", credentials_id),
        )
        .await?
        .into_iter()
        .map(|doc| doc.value)
        .collect())
    }

    /// Remove a link owned by `credentials_id`.
    ///
    /// # Errors
    /// `NotFound` when no such link belongs to the credentials.
    pub async fn unlink(&self, credentials_id: &str, provider: &str, sub: &str) -> Result<()> {
        let link = self.get_link(provider, sub).await?;
        if link.credentials_id != credentials_id {
            return Err(Error::not_found("external login"));
        }
        self.store
            .delete(collections::EXTERNAL_LOGINS, &link_id(provider, sub))
            .await?;
        info!(provider, cid = %credentials_id, "external identity unlinked");
        Ok(())
    }

    /// # Errors
    /// Returns an error if the backend fails.
    pub async fn delete_expired(&self) -> Result<u64> {
        Ok(self
            .store
            .delete_expired(collections::EXTERNAL_LOGIN_STATES, Utc::now())
            .await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::testing::services;
    use async_trait::async_trait;
    use url::Url;

    /// Accepts any code and reports the identity the code names.
    pub(crate) struct StubProvider;

    #[async_trait]
    impl IdentityProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn label(&self) -> &str {
            "Stub IdP"
        }

        fn authorize_uri(&self, redirect_uri: &str, state: &str, nonce: &str) -> Result<String> {
            let mut uri = Url::parse("https://idp.example.com/authorize")?;
            uri.query_pairs_mut()
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("state", state)
                .append_pair("nonce", nonce);
            Ok(uri.into())
        }

        async fn user_info(
            &self,
            code: &str,
            _redirect_uri: &str,
            _nonce: &str,
        ) -> Result<ExternalIdentity> {
            if code == "bad" {
                return Err(Error::ExternalProvider("invalid_grant".to_string()));
            }
            Ok(ExternalIdentity {
                sub: code.to_string(),
                email: Some(format!("{code}@idp.example.com")),
                ..ExternalIdentity::default()
            })
        }
    }

    pub(crate) fn state_of(uri: &str) -> anyhow::Result<String> {
        Url::parse(uri)?
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| anyhow::anyhow!("no state"))
    }

    pub(crate) async fn service() -> anyhow::Result<(crate::services::testing::Harness, ExternalLoginService)> {
        let h = services().await?;
        let svc = ExternalLoginService::new(
            h.services.config.clone(),
            h.services.store.clone(),
            h.services.authn.clone(),
            h.services.audit.clone(),
            vec![Arc::new(StubProvider)],
        );
        Ok((h, svc))
    }

    #[tokio::test]
    async fn pairing_then_login() -> anyhow::Result<()> {
        let (h, svc) = service().await?;
        let cid = h.people.create("alice", None, None, None).await?;
        let root = h
            .services
            .authn
            .create_root_session(RootSessionRequest {
                credentials_id: &cid,
                descriptor: LoginDescriptor::m2m(),
                available_factors: Vec::new(),
                expiration: None,
                track_id: None,
                exclude: &[],
                extra: Vec::new(),
                cookie: true,
            })
            .await?;

        let uri = svc.initialize_pairing(&root, "stub", None).await?;
        assert!(Url::parse(&uri)?
            .query_pairs()
            .any(|(k, v)| k == "redirect_uri" && v == svc.callback_uri()));
        let outcome = svc.finalize(&state_of(&uri)?, "u-1").await?;
        assert!(matches!(outcome, ExternalLoginOutcome::Linked { .. }));
        assert_eq!(svc.list_links(&cid).await?.len(), 1);

        let uri = svc
            .initialize_login("stub", Some("https://app.example.com/".to_string()))
            .await?;
        let ExternalLoginOutcome::LoggedIn {
            session,
            redirect_uri,
        } = svc.finalize(&state_of(&uri)?, "u-1").await?
        else {
            anyhow::bail!("expected login");
        };
        assert_eq!(session.credentials_id(), cid);
        assert_eq!(
            session.authentication.login_factors,
            vec![FactorType::External]
        );
        assert_eq!(
            session.authentication.external_login,
            Some(ExternalLoginRef {
                provider: "stub".to_string(),
                subject: "u-1".to_string(),
            })
        );
        assert!(session.cookie.is_some());
        assert_eq!(redirect_uri.as_deref(), Some("https://app.example.com/"));
        Ok(())
    }

    #[tokio::test]
    async fn state_is_single_use() -> anyhow::Result<()> {
        let (_h, svc) = service().await?;
        let state = state_of(&svc.initialize_login("stub", None).await?)?;
        // Not linked, so the login fails, but the state is spent either way.
        assert!(matches!(svc.finalize(&state, "nobody").await, Err(Error::NotFound(_))));
        assert!(matches!(svc.finalize(&state, "nobody").await, Err(Error::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_audited() -> anyhow::Result<()> {
        let (h, svc) = service().await?;
        let state = state_of(&svc.initialize_login("stub", None).await?)?;
        assert!(matches!(
            svc.finalize(&state, "bad").await,
            Err(Error::ExternalProvider(_))
        ));
        assert_eq!(
            h.services
                .audit
                .list(Some(AuditCode::ExternalLoginFailed))
                .await?
                .len(),
            1
        );
        assert!(matches!(
            svc.initialize_login("nope", None).await,
            Err(Error::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn identity_links_to_one_credential_only() -> anyhow::Result<()> {
        let (h, svc) = service().await?;
        let alice = h.people.create("alice", None, None, None).await?;
        let bob = h.people.create("bob", None, None, None).await?;
        for cid in [&alice, &bob] {
            let root = h
                .services
                .authn
                .create_root_session(RootSessionRequest {
                    credentials_id: cid,
                    descriptor: LoginDescriptor::m2m(),
                    available_factors: Vec::new(),
                    expiration: None,
                    track_id: None,
                    exclude: &[],
                    extra: Vec::new(),
                    cookie: false,
                })
                .await?;
            let state = state_of(&svc.initialize_pairing(&root, "stub", None).await?)?;
            let result = svc.finalize(&state, "shared").await;
            if cid == &alice {
                assert!(result.is_ok());
            } else {
                assert!(matches!(result, Err(Error::Conflict(_))));
            }
        }
        assert!(svc.unlink(&bob, "stub", "shared").await.is_err());
        svc.unlink(&alice, "stub", "shared").await?;
        assert!(svc.list_links(&alice).await?.is_empty());
        Ok(())
    }
}

//! Service wiring.
//!
//! Every service is a cheap clone over shared handles; [`Services`] builds
//! them once in dependency order and is what the HTTP layer and the CLI hold.

use std::sync::Arc;

use crate::{
    audit::AuditService,
    authz::{RbacService, ResourceService, RoleService, TenantService},
    config::AuthConfig,
    cookie::CookieService,
    credentials::{CredentialProvider, CredentialsService},
    crypto::SecretKey,
    external_login::{ExternalLoginService, IdentityProvider},
    housekeeping::Housekeeping,
    impersonation::ImpersonationService,
    introspection::IntrospectionService,
    login::{AuthenticationService, DescriptorEngine, FactorVerifier, LoginSessionStore},
    notification::{LogNotificationProvider, NotificationProvider},
    oidc::{AuthorizationCodeStore, AuthorizeFlow, ClientService, ClientSessionFactory, OidcService},
    otp::OtpService,
    session::SessionService,
    storage::DocumentStore,
    webauthn::{DisabledWebAuthn, WebAuthnVerifier},
    Result,
};

/// Pluggable parts that live outside the document store.
pub struct Collaborators {
    pub credential_providers: Vec<Arc<dyn CredentialProvider>>,
    pub notifications: Arc<dyn NotificationProvider>,
    pub webauthn: Arc<dyn WebAuthnVerifier>,
    pub identity_providers: Vec<Arc<dyn IdentityProvider>>,
    /// Seals TOTP secrets at rest.
    pub secret_key: SecretKey,
}

impl Collaborators {
    #[must_use]
    pub fn new(credential_providers: Vec<Arc<dyn CredentialProvider>>) -> Self {
        Self {
            credential_providers,
            notifications: Arc::new(LogNotificationProvider),
            webauthn: Arc::new(DisabledWebAuthn),
            identity_providers: Vec::new(),
            secret_key: SecretKey::ephemeral(),
        }
    }

    #[must_use]
    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationProvider>) -> Self {
        self.notifications = notifications;
        self
    }

    #[must_use]
    pub fn with_webauthn(mut self, webauthn: Arc<dyn WebAuthnVerifier>) -> Self {
        self.webauthn = webauthn;
        self
    }

    #[must_use]
    pub fn with_identity_providers(mut self, providers: Vec<Arc<dyn IdentityProvider>>) -> Self {
        self.identity_providers = providers;
        self
    }

    #[must_use]
    pub fn with_secret_key(mut self, key: SecretKey) -> Self {
        self.secret_key = key;
        self
    }
}

#[derive(Clone)]
pub struct Services {
    pub config: AuthConfig,
    pub store: Arc<dyn DocumentStore>,
    pub credentials: CredentialsService,
    pub sessions: SessionService,
    pub resources: ResourceService,
    pub roles: RoleService,
    pub tenants: TenantService,
    pub rbac: RbacService,
    pub otp: OtpService,
    pub clients: ClientService,
    pub oidc: OidcService,
    pub cookies: CookieService,
    pub authorize: AuthorizeFlow,
    pub audit: AuditService,
    pub authn: AuthenticationService,
    pub impersonation: ImpersonationService,
    pub introspection: IntrospectionService,
    pub external_logins: ExternalLoginService,
    pub housekeeping: Housekeeping,
}

impl Services {
    /// Build every service over `store` and make sure the built-in
    /// resources exist.
    ///
    /// # Errors
    /// `Validation` for an unusable cookie configuration, otherwise storage
    /// failures while seeding resources.
    pub async fn new(
        config: AuthConfig,
        store: Arc<dyn DocumentStore>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let credentials = CredentialsService::new(collaborators.credential_providers);
        let sessions = SessionService::new(store.clone());
        let roles = RoleService::new(store.clone());
        let resources = ResourceService::new(store.clone(), roles.clone());
        resources.ensure_builtin().await?;
        let audit = AuditService::new(store.clone());
        let tenants = TenantService::new(
            store.clone(),
            roles.clone(),
            sessions.clone(),
            audit.clone(),
            config.tenant_id_extra_chars(),
        );
        let rbac = RbacService::new(roles.clone());
        let otp = OtpService::new(
            store.clone(),
            collaborators.secret_key,
            config.totp_issuer(),
            config.totp_registration_timeout(),
        );

        let clients = ClientService::new(store.clone());
        let factory = ClientSessionFactory::new(credentials.clone(), rbac.clone(), sessions.clone());
        let codes = AuthorizationCodeStore::new(store.clone(), config.authorization_code_ttl());
        let oidc = OidcService::new(factory.clone(), codes.clone());
        let cookies = CookieService::new(&config, factory, clients.clone(), oidc.clone())?;

        let verifier = FactorVerifier::new(credentials.clone(), otp.clone(), collaborators.webauthn);
        let engine = DescriptorEngine::new(config.descriptor_templates().to_vec(), verifier);
        let login_sessions = LoginSessionStore::new(
            store.clone(),
            config.login_attempts(),
            config.login_session_ttl(),
        );
        let authn = AuthenticationService::new(
            config.clone(),
            login_sessions.clone(),
            engine,
            sessions.clone(),
            tenants.clone(),
            rbac.clone(),
            cookies.clone(),
            audit.clone(),
            collaborators.notifications,
        );

        let authorize = AuthorizeFlow::new(
            config.clone(),
            clients.clone(),
            sessions.clone(),
            tenants.clone(),
            credentials.clone(),
            oidc.clone(),
            cookies.clone(),
            audit.clone(),
        );
        let impersonation =
            ImpersonationService::new(authn.clone(), sessions.clone(), rbac.clone(), audit.clone());
        let introspection = IntrospectionService::new(
            credentials.clone(),
            sessions.clone(),
            authn.clone(),
            cookies.clone(),
        );
        let external_logins = ExternalLoginService::new(
            config.clone(),
            store.clone(),
            authn.clone(),
            audit.clone(),
            collaborators.identity_providers,
        );
        let housekeeping = Housekeeping::new(
            sessions.clone(),
            login_sessions,
            otp.clone(),
            codes,
            external_logins.clone(),
        );

        Ok(Self {
            config,
            store,
            credentials,
            sessions,
            resources,
            roles,
            tenants,
            rbac,
            otp,
            clients,
            oidc,
            cookies,
            authorize,
            audit,
            authn,
            impersonation,
            introspection,
            external_logins,
            housekeeping,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        credentials::MemoryCredentialProvider, notification::testing::RecordingProvider,
        storage::MemoryStore, webauthn::testing::EchoWebAuthn,
    };

    pub(crate) struct Harness {
        pub services: Services,
        pub people: Arc<MemoryCredentialProvider>,
        pub machines: Arc<MemoryCredentialProvider>,
        pub notifications: Arc<RecordingProvider>,
    }

    pub(crate) fn config() -> AuthConfig {
        AuthConfig::new(
            "https://auth.example.com/api".to_string(),
            "https://auth.example.com".to_string(),
        )
        .with_login_failure_floor_ms(0)
        .with_cookie_domain(Some("example.com".to_string()))
    }

    pub(crate) async fn services_with(config: AuthConfig) -> anyhow::Result<Harness> {
        let people = Arc::new(MemoryCredentialProvider::new("default"));
        let machines = Arc::new(MemoryCredentialProvider::m2m("machines"));
        let notifications = Arc::new(RecordingProvider::default());
        let collaborators = Collaborators::new(vec![people.clone(), machines.clone()])
            .with_notifications(notifications.clone())
            .with_webauthn(Arc::new(EchoWebAuthn::default()));
        let services = Services::new(config, Arc::new(MemoryStore::new()), collaborators).await?;
        Ok(Harness {
            services,
            people,
            machines,
            notifications,
        })
    }

    /// In-memory services with one people provider and one m2m provider.
    pub(crate) async fn services() -> anyhow::Result<Harness> {
        services_with(config()).await
    }
}

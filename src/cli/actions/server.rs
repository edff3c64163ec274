use crate::{
    api,
    authz::resource_id,
    cli::commands::{auth, external_login},
    config::AuthConfig,
    credentials::MemoryCredentialProvider,
    crypto::SecretKey,
    external_login::{GenericOAuth2Provider, IdentityProvider, ProviderConfig},
    services::{Collaborators, Services},
    storage::{DocumentStore, MemoryStore, PgStore},
    Error,
};
use anyhow::{Context, Result};
use base64ct::{Base64, Encoding};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{info, warn};

const ADMIN_ROLE: &str = "*/admin";

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub auth: auth::Options,
    pub external_login: Option<external_login::Options>,
    pub log_json: bool,
}

fn auth_config(options: &auth::Options) -> AuthConfig {
    AuthConfig::new(options.public_api_url.clone(), options.webui_url.clone())
        .with_login_attempts(options.login_attempts)
        .with_session_ttl_seconds(options.session_ttl_seconds)
        .with_cookie_domain(options.cookie_domain.clone())
        .with_cookie_secure(options.cookie_secure)
        .with_housekeeping_interval_seconds(options.housekeeping_interval_seconds)
}

fn secret_key(options: &auth::Options) -> Result<SecretKey> {
    let Some(encoded) = &options.secret_key else {
        warn!("no secret key configured; TOTP secrets will not survive a restart");
        return Ok(SecretKey::ephemeral());
    };
    let bytes = Base64::decode_vec(encoded.expose_secret().trim())
        .map_err(|err| anyhow::anyhow!("secret key is not valid base64: {err}"))?;
    Ok(SecretKey::from_bytes(&bytes)?)
}

async fn store(dsn: Option<&str>) -> Result<Arc<dyn DocumentStore>> {
    match dsn {
        Some(dsn) => {
            let store = PgStore::connect(dsn)
                .await
                .context("Failed to connect to the database")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("no DSN configured; using the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn identity_providers(
    options: Option<&external_login::Options>,
) -> Result<Vec<Arc<dyn IdentityProvider>>> {
    let Some(options) = options else {
        return Ok(Vec::new());
    };
    let mut config = ProviderConfig::from_issuer(&options.name, &options.issuer, &options.client_id)
        .with_context(|| format!("invalid issuer for external login {}", options.name))?;
    if let Some(secret) = &options.client_secret {
        config = config.with_client_secret(secret.clone());
    }
    let provider = GenericOAuth2Provider::new(config)?;
    info!(provider = %options.name, "external login enabled");
    Ok(vec![Arc::new(provider)])
}

/// Ignore `Conflict`: the record is already there from an earlier start.
fn tolerate_existing<T>(result: crate::Result<T>) -> crate::Result<()> {
    match result {
        Ok(_) | Err(Error::Conflict(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

async fn bootstrap_admin(
    services: &Services,
    people: &MemoryCredentialProvider,
    options: &auth::Options,
) -> Result<()> {
    let (Some(username), Some(password)) = (&options.admin_user, &options.admin_password) else {
        return Ok(());
    };
    let cid = people
        .create(username, None, None, Some(password))
        .await
        .context("Failed to create the bootstrap superuser")?;
    tolerate_existing(
        services
            .roles
            .create(
                ADMIN_ROLE,
                Some("Bootstrap superusers"),
                &[resource_id::SUPERUSER.to_string()],
            )
            .await,
    )?;
    tolerate_existing(services.roles.assign(&cid, ADMIN_ROLE).await)?;
    info!(cid = %cid, "bootstrap superuser ready");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

/// Execute the server action.
///
/// # Errors
/// Returns an error if the store cannot be reached, the configuration is
/// unusable, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let config = auth_config(&args.auth);
    let store = store(args.dsn.as_deref()).await?;

    let people = Arc::new(MemoryCredentialProvider::new("default"));
    let machines = Arc::new(MemoryCredentialProvider::m2m("machines"));
    let collaborators = Collaborators::new(vec![people.clone(), machines])
        .with_secret_key(secret_key(&args.auth)?)
        .with_identity_providers(identity_providers(args.external_login.as_ref())?);

    let services = Services::new(config, store, collaborators)
        .await
        .context("Failed to initialize services")?;
    bootstrap_admin(&services, &people, &args.auth).await?;

    let sweeper = services
        .housekeeping
        .clone()
        .spawn(services.config.housekeeping_interval());

    let result = api::serve(args.port, Arc::new(services), shutdown_signal()).await;
    sweeper.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn options() -> auth::Options {
        auth::Options {
            public_api_url: "https://auth.example.com/api".to_string(),
            webui_url: "https://auth.example.com".to_string(),
            secret_key: None,
            cookie_domain: None,
            cookie_secure: true,
            login_attempts: 3,
            session_ttl_seconds: 3600,
            housekeeping_interval_seconds: 30,
            admin_user: Some("root".to_string()),
            admin_password: Some(SecretString::from("toor")),
        }
    }

    #[test]
    fn secret_key_must_be_32_bytes() {
        let mut opts = options();
        assert!(secret_key(&opts).is_ok());

        opts.secret_key = Some(SecretString::from(Base64::encode_string(&[7u8; 32])));
        assert!(secret_key(&opts).is_ok());

        opts.secret_key = Some(SecretString::from(Base64::encode_string(&[7u8; 16])));
        assert!(secret_key(&opts).is_err());

        opts.secret_key = Some(SecretString::from("not base64!"));
        assert!(secret_key(&opts).is_err());
    }

    #[test]
    fn config_follows_options() {
        let config = auth_config(&options());
        assert_eq!(config.login_attempts(), 3);
        assert_eq!(config.housekeeping_interval().as_secs(), 30);
    }

    #[tokio::test]
    async fn bootstrap_admin_is_superuser_and_idempotent() -> anyhow::Result<()> {
        let people = Arc::new(MemoryCredentialProvider::new("default"));
        let services = Services::new(
            auth_config(&options()),
            Arc::new(MemoryStore::new()),
            Collaborators::new(vec![people.clone()]),
        )
        .await?;

        bootstrap_admin(&services, &people, &options()).await?;
        let cid = services.credentials.locate("root").await?;
        assert!(cid.is_some());
        if let Some(cid) = cid {
            let grants = services
                .rbac
                .compute_authorization(&cid, &std::collections::BTreeSet::new(), &[])
                .await?;
            assert!(crate::authz::is_superuser(&grants));
        }

        // A second start against the same store keeps the role.
        let fresh = MemoryCredentialProvider::new("default");
        bootstrap_admin(&services, &fresh, &options()).await?;
        Ok(())
    }
}

use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_EXT_LOGIN_NAME: &str = "ext-login-name";
pub const ARG_EXT_LOGIN_ISSUER: &str = "ext-login-issuer";
pub const ARG_EXT_LOGIN_CLIENT_ID: &str = "ext-login-client-id";
pub const ARG_EXT_LOGIN_CLIENT_SECRET: &str = "ext-login-client-secret";

/// One OpenID Connect provider to sign in with.
#[derive(Debug, Clone)]
pub struct Options {
    pub name: String,
    pub issuer: String,
    pub client_id: String,
    pub client_secret: Option<SecretString>,
}

impl Options {
    /// `None` unless a provider name is configured.
    ///
    /// # Errors
    /// Returns an error if a provider is named but its issuer or client id is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Option<Self>> {
        let Some(name) = matches.get_one::<String>(ARG_EXT_LOGIN_NAME).cloned() else {
            return Ok(None);
        };
        let read_required = |id: &str| -> anyhow::Result<String> {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };
        Ok(Some(Self {
            name,
            issuer: read_required(ARG_EXT_LOGIN_ISSUER)?,
            client_id: read_required(ARG_EXT_LOGIN_CLIENT_ID)?,
            client_secret: matches
                .get_one::<String>(ARG_EXT_LOGIN_CLIENT_SECRET)
                .cloned()
                .map(SecretString::from),
        }))
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_EXT_LOGIN_NAME)
                .long(ARG_EXT_LOGIN_NAME)
                .help("Name of an external OpenID Connect provider, e.g. google")
                .env("PORTUNUS_EXT_LOGIN_NAME")
                .requires_all([ARG_EXT_LOGIN_ISSUER, ARG_EXT_LOGIN_CLIENT_ID]),
        )
        .arg(
            Arg::new(ARG_EXT_LOGIN_ISSUER)
                .long(ARG_EXT_LOGIN_ISSUER)
                .help("Issuer URL of the external provider")
                .env("PORTUNUS_EXT_LOGIN_ISSUER"),
        )
        .arg(
            Arg::new(ARG_EXT_LOGIN_CLIENT_ID)
                .long(ARG_EXT_LOGIN_CLIENT_ID)
                .help("Client id registered with the external provider")
                .env("PORTUNUS_EXT_LOGIN_CLIENT_ID"),
        )
        .arg(
            Arg::new(ARG_EXT_LOGIN_CLIENT_SECRET)
                .long(ARG_EXT_LOGIN_CLIENT_SECRET)
                .help("Client secret registered with the external provider")
                .env("PORTUNUS_EXT_LOGIN_CLIENT_SECRET")
                .hide_env_values(true),
        )
}

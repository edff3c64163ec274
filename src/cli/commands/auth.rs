use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_PUBLIC_API_URL: &str = "public-api-url";
pub const ARG_WEBUI_URL: &str = "webui-url";
pub const ARG_SECRET_KEY: &str = "secret-key";
pub const ARG_COOKIE_DOMAIN: &str = "cookie-domain";
pub const ARG_COOKIE_INSECURE: &str = "cookie-insecure";
pub const ARG_LOGIN_ATTEMPTS: &str = "login-attempts";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_HOUSEKEEPING_INTERVAL: &str = "housekeeping-interval-seconds";
pub const ARG_ADMIN_USER: &str = "admin-user";
pub const ARG_ADMIN_PASSWORD: &str = "admin-password";

#[derive(Debug, Clone)]
pub struct Options {
    pub public_api_url: String,
    pub webui_url: String,
    /// Base64, 32 bytes; an ephemeral key is generated when absent.
    pub secret_key: Option<SecretString>,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub login_attempts: i32,
    pub session_ttl_seconds: i64,
    pub housekeeping_interval_seconds: u64,
    pub admin_user: Option<String>,
    pub admin_password: Option<SecretString>,
}

impl Options {
    /// Parse authentication arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the base URLs are missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let read_required = |id: &str| -> anyhow::Result<String> {
            matches
                .get_one::<String>(id)
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };
        let read_optional = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            public_api_url: read_required(ARG_PUBLIC_API_URL)?,
            webui_url: read_required(ARG_WEBUI_URL)?,
            secret_key: read_optional(ARG_SECRET_KEY).map(SecretString::from),
            cookie_domain: read_optional(ARG_COOKIE_DOMAIN),
            cookie_secure: !matches.get_flag(ARG_COOKIE_INSECURE),
            login_attempts: matches
                .get_one::<i32>(ARG_LOGIN_ATTEMPTS)
                .copied()
                .unwrap_or(10),
            session_ttl_seconds: matches
                .get_one::<i64>(ARG_SESSION_TTL)
                .copied()
                .unwrap_or(43_200),
            housekeeping_interval_seconds: matches
                .get_one::<u64>(ARG_HOUSEKEEPING_INTERVAL)
                .copied()
                .unwrap_or(60),
            admin_user: read_optional(ARG_ADMIN_USER),
            admin_password: read_optional(ARG_ADMIN_PASSWORD).map(SecretString::from),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_endpoint_args(command);
    let command = with_session_args(command);
    with_admin_args(command)
}

fn with_endpoint_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PUBLIC_API_URL)
                .long(ARG_PUBLIC_API_URL)
                .help("Public base URL of this API, used for loopback and callback URLs")
                .env("PORTUNUS_PUBLIC_API_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_WEBUI_URL)
                .long(ARG_WEBUI_URL)
                .help("Base URL of the login web UI")
                .env("PORTUNUS_WEBUI_URL")
                .default_value("http://localhost:3000"),
        )
        .arg(
            Arg::new(ARG_COOKIE_DOMAIN)
                .long(ARG_COOKIE_DOMAIN)
                .help("Domain attribute of the root session cookie")
                .env("PORTUNUS_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_COOKIE_INSECURE)
                .long(ARG_COOKIE_INSECURE)
                .help("Drop the Secure attribute from cookies (plain HTTP development only)")
                .env("PORTUNUS_COOKIE_INSECURE")
                .action(ArgAction::SetTrue),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SECRET_KEY)
                .long(ARG_SECRET_KEY)
                .help("Base64 encoded 32 byte key sealing TOTP secrets at rest")
                .env("PORTUNUS_SECRET_KEY")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_LOGIN_ATTEMPTS)
                .long(ARG_LOGIN_ATTEMPTS)
                .help("Attempts allowed per login session")
                .env("PORTUNUS_LOGIN_ATTEMPTS")
                .default_value("10")
                .value_parser(clap::value_parser!(i32).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Root session lifetime in seconds")
                .env("PORTUNUS_SESSION_TTL_SECONDS")
                .default_value("43200")
                .value_parser(clap::value_parser!(i64).range(60..)),
        )
        .arg(
            Arg::new(ARG_HOUSEKEEPING_INTERVAL)
                .long(ARG_HOUSEKEEPING_INTERVAL)
                .help("Seconds between sweeps of expired records")
                .env("PORTUNUS_HOUSEKEEPING_INTERVAL_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}

fn with_admin_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ADMIN_USER)
                .long(ARG_ADMIN_USER)
                .help("Bootstrap a superuser with this username")
                .env("PORTUNUS_ADMIN_USER")
                .requires(ARG_ADMIN_PASSWORD),
        )
        .arg(
            Arg::new(ARG_ADMIN_PASSWORD)
                .long(ARG_ADMIN_PASSWORD)
                .help("Password of the bootstrap superuser")
                .env("PORTUNUS_ADMIN_PASSWORD")
                .hide_env_values(true),
        )
}

//! Runtime configuration shared by the authentication services.

use chrono::Duration;

use crate::login::{default_descriptor_templates, FactorType, LoginDescriptor};

const DEFAULT_LOGIN_ATTEMPTS: i32 = 10;
const DEFAULT_LOGIN_SESSION_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_SESSION_TTL_SECONDS: i64 = 12 * 60 * 60;
const DEFAULT_AUTHORIZATION_CODE_TTL_SECONDS: i64 = 60;
const DEFAULT_TOTP_REGISTRATION_TIMEOUT_SECONDS: i64 = 5 * 60;
const DEFAULT_SMS_CODE_TTL_SECONDS: i64 = 5 * 60;
const DEFAULT_LOGIN_FAILURE_FLOOR_MS: u64 = 250;
const DEFAULT_HOUSEKEEPING_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_COOKIE_NAME: &str = "PortunusSCI";
const DEFAULT_TOTP_ISSUER: &str = "Portunus";

#[derive(Clone, Debug)]
pub struct AuthConfig {
    public_api_base_url: String,
    auth_webui_base_url: String,
    login_attempts: i32,
    login_session_ttl_seconds: i64,
    session_ttl_seconds: i64,
    authorization_code_ttl_seconds: i64,
    enforce_factors: Vec<FactorType>,
    descriptor_templates: Vec<LoginDescriptor>,
    cookie_name: String,
    cookie_domain: Option<String>,
    cookie_secure: bool,
    totp_issuer: String,
    totp_registration_timeout_seconds: i64,
    sms_code_ttl_seconds: i64,
    login_failure_floor_ms: u64,
    housekeeping_interval_seconds: u64,
    tenant_id_extra_chars: String,
}

impl AuthConfig {
    #[must_use]
    pub fn new(public_api_base_url: String, auth_webui_base_url: String) -> Self {
        Self {
            public_api_base_url: public_api_base_url.trim_end_matches('/').to_string(),
            auth_webui_base_url: auth_webui_base_url.trim_end_matches('/').to_string(),
            login_attempts: DEFAULT_LOGIN_ATTEMPTS,
            login_session_ttl_seconds: DEFAULT_LOGIN_SESSION_TTL_SECONDS,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            authorization_code_ttl_seconds: DEFAULT_AUTHORIZATION_CODE_TTL_SECONDS,
            enforce_factors: Vec::new(),
            descriptor_templates: default_descriptor_templates(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_domain: None,
            cookie_secure: true,
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
            totp_registration_timeout_seconds: DEFAULT_TOTP_REGISTRATION_TIMEOUT_SECONDS,
            sms_code_ttl_seconds: DEFAULT_SMS_CODE_TTL_SECONDS,
            login_failure_floor_ms: DEFAULT_LOGIN_FAILURE_FLOOR_MS,
            housekeeping_interval_seconds: DEFAULT_HOUSEKEEPING_INTERVAL_SECONDS,
            tenant_id_extra_chars: String::new(),
        }
    }

    #[must_use]
    pub fn with_login_attempts(mut self, attempts: i32) -> Self {
        self.login_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_login_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.login_session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_authorization_code_ttl_seconds(mut self, seconds: i64) -> Self {
        self.authorization_code_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_enforce_factors(mut self, factors: Vec<FactorType>) -> Self {
        self.enforce_factors = factors;
        self
    }

    #[must_use]
    pub fn with_descriptor_templates(mut self, templates: Vec<LoginDescriptor>) -> Self {
        self.descriptor_templates = templates;
        self
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: String) -> Self {
        self.cookie_name = name;
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_totp_issuer(mut self, issuer: String) -> Self {
        self.totp_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_totp_registration_timeout_seconds(mut self, seconds: i64) -> Self {
        self.totp_registration_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_sms_code_ttl_seconds(mut self, seconds: i64) -> Self {
        self.sms_code_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_login_failure_floor_ms(mut self, millis: u64) -> Self {
        self.login_failure_floor_ms = millis;
        self
    }

    #[must_use]
    pub fn with_housekeeping_interval_seconds(mut self, seconds: u64) -> Self {
        self.housekeeping_interval_seconds = seconds.max(1);
        self
    }

    #[must_use]
    pub fn with_tenant_id_extra_chars(mut self, chars: String) -> Self {
        self.tenant_id_extra_chars = chars;
        self
    }

    #[must_use]
    pub fn public_api_base_url(&self) -> &str {
        &self.public_api_base_url
    }

    #[must_use]
    pub fn auth_webui_base_url(&self) -> &str {
        &self.auth_webui_base_url
    }

    #[must_use]
    pub fn login_attempts(&self) -> i32 {
        self.login_attempts
    }

    #[must_use]
    pub fn login_session_ttl(&self) -> Duration {
        Duration::seconds(self.login_session_ttl_seconds)
    }

    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_seconds)
    }

    #[must_use]
    pub fn authorization_code_ttl(&self) -> Duration {
        Duration::seconds(self.authorization_code_ttl_seconds)
    }

    #[must_use]
    pub fn enforce_factors(&self) -> &[FactorType] {
        &self.enforce_factors
    }

    #[must_use]
    pub fn descriptor_templates(&self) -> &[LoginDescriptor] {
        &self.descriptor_templates
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.cookie_secure
    }

    #[must_use]
    pub fn totp_issuer(&self) -> &str {
        &self.totp_issuer
    }

    #[must_use]
    pub fn totp_registration_timeout(&self) -> Duration {
        Duration::seconds(self.totp_registration_timeout_seconds)
    }

    #[must_use]
    pub fn sms_code_ttl(&self) -> Duration {
        Duration::seconds(self.sms_code_ttl_seconds)
    }

    #[must_use]
    pub fn login_failure_floor(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.login_failure_floor_ms)
    }

    #[must_use]
    pub fn housekeeping_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.housekeeping_interval_seconds)
    }

    #[must_use]
    pub fn tenant_id_extra_chars(&self) -> &str {
        &self.tenant_id_extra_chars
    }
}

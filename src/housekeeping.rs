//! Periodic removal of expired records.
//!
//! Reads never hand out expired documents, so the sweep only reclaims space;
//! a missed run costs nothing but storage.

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::{
    task::JoinHandle,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument};

use crate::{
    external_login::ExternalLoginService, login::LoginSessionStore, oidc::AuthorizationCodeStore,
    otp::OtpService, session::SessionService,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: u64,
    pub login_sessions: u64,
    pub prepared_totp: u64,
    pub authorization_codes: u64,
    pub external_login_states: u64,
}

impl SweepReport {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.sessions
            + self.login_sessions
            + self.prepared_totp
            + self.authorization_codes
            + self.external_login_states
    }
}

#[derive(Clone)]
pub struct Housekeeping {
    sessions: SessionService,
    login_sessions: LoginSessionStore,
    otp: OtpService,
    codes: AuthorizationCodeStore,
    external_logins: ExternalLoginService,
}

/// Count from one collection; a failing collection does not stop the others.
fn count(collection: &str, result: crate::Result<u64>) -> u64 {
    result.unwrap_or_else(|err| {
        error!(collection, "housekeeping failed: {err}");
        0
    })
}

impl Housekeeping {
    #[must_use]
    pub fn new(
        sessions: SessionService,
        login_sessions: LoginSessionStore,
        otp: OtpService,
        codes: AuthorizationCodeStore,
        external_logins: ExternalLoginService,
    ) -> Self {
        Self {
            sessions,
            login_sessions,
            otp,
            codes,
            external_logins,
        }
    }

    /// One pass over every collection with an expiry.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            sessions: count("sessions", self.sessions.delete_expired().await),
            login_sessions: count("login_sessions", self.login_sessions.delete_expired().await),
            prepared_totp: count("prepared_totp", self.otp.delete_expired_prepared().await),
            authorization_codes: count(
                "authorization_codes",
                self.codes.delete_expired().await,
            ),
            external_login_states: count(
                "external_login_states",
                self.external_logins.delete_expired().await,
            ),
        };
        if report.total() > 0 {
            info!(
                sessions = report.sessions,
                login_sessions = report.login_sessions,
                prepared_totp = report.prepared_totp,
                authorization_codes = report.authorization_codes,
                external_login_states = report.external_login_states,
                "expired records removed"
            );
        } else {
            debug!("nothing to sweep");
        }
        report
    }

    /// Sweep every `period`, give or take 10%, until the task is aborted.
    #[must_use]
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        let mut rng = StdRng::from_entropy();
        let jittered = period.mul_f64(rng.gen_range(0.9..1.1));
        tokio::spawn(async move {
            let mut ticker = interval(jittered);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

//! Map validated CLI matches to an action.

use crate::cli::{
    actions::{server::Args, Action},
    commands::{auth, external_login, logging, ARG_DSN, ARG_PORT},
};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .filter(|dsn| !dsn.trim().is_empty());

    Ok(Action::Server(Args {
        port,
        dsn,
        auth: auth::Options::parse(matches)?,
        external_login: external_login::Options::parse(matches)?,
        log_json: matches.get_flag(logging::ARG_LOG_JSON),
    }))
}

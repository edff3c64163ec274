//! Route handlers and the request plumbing they share.

pub mod authorize;
pub mod external_login;
pub mod health;
pub mod impersonate;
pub mod introspect;
pub mod login;

use axum::{
    http::{header, HeaderMap, HeaderValue},
    response::Response,
};
use std::collections::HashMap;
use tracing::error;

use crate::{
    login::RequestContext,
    services::Services,
    session::Session,
    Result,
};

/// Header map and client address chain for the login flow.
pub(crate) fn request_context(headers: &HeaderMap) -> RequestContext {
    let map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    let from = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();
    RequestContext::new(map, from)
}

pub(crate) fn cookie_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::COOKIE).and_then(|v| v.to_str().ok())
}

/// The root session behind the request's root cookie, if any.
pub(crate) async fn root_session(services: &Services, headers: &HeaderMap) -> Result<Option<Session>> {
    services
        .cookies
        .session_from_cookie_header(cookie_header(headers), None)
        .await
}

/// Append a `Set-Cookie` header; a value that is not a valid header is logged and dropped.
pub(crate) fn add_cookie(response: &mut Response, set_cookie: &str) {
    match HeaderValue::from_str(set_cookie) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(err) => error!("Failed to build Set-Cookie header: {err}"),
    }
}

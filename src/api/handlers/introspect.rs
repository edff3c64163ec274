use axum::{
    body::Bytes,
    extract::{Extension, Query},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::IntoParams;

use super::{cookie_header, request_context};
use crate::{
    introspection::{basic_challenge, identity_headers},
    services::Services,
    session::Session,
    Error,
};

/// `200 OK` carrying the identity headers of `session`.
fn identity(session: &Session) -> Response {
    let mut response = StatusCode::OK.into_response();
    for (name, value) in identity_headers(session) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        } else {
            debug!(header = name, "identity value is not a valid header");
        }
    }
    response
}

fn unauthorized(challenge: Option<String>) -> Response {
    let mut response = StatusCode::UNAUTHORIZED.into_response();
    if let Some(value) = challenge.and_then(|c| HeaderValue::from_str(&c).ok()) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

#[utoipa::path(
    post,
    path= "/m2m/nginx",
    request_body(content = String, description = "Authorization value when the header is absent"),
    responses (
        (status = 200, description = "Authenticated; identity in the x-credentials-id, x-session-id, x-tenants, x-resources, x-username and x-track-id headers"),
        (status = 401, description = "Missing or wrong machine credentials"),
    ),
    tag= "introspection"
)]
#[instrument(skip(services, headers, body))]
pub async fn m2m_nginx(
    services: Extension<Arc<Services>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string());

    match services
        .introspection
        .m2m_basic(&authorization, &request_context(&headers))
        .await
    {
        Ok(session) => identity(&session),
        Err(Error::AccessDenied { .. }) => unauthorized(Some(basic_challenge())),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CookieIntrospection {
    /// Cookie client; the root cookie when absent.
    client_id: Option<String>,
}

#[utoipa::path(
    post,
    path= "/cookie/nginx",
    params(CookieIntrospection),
    responses (
        (status = 200, description = "Valid cookie; identity in the x-* headers"),
        (status = 401, description = "No cookie or no live session behind it"),
    ),
    tag= "introspection"
)]
#[instrument(skip(services, headers, query))]
pub async fn cookie_nginx(
    services: Extension<Arc<Services>>,
    headers: HeaderMap,
    Query(query): Query<CookieIntrospection>,
) -> Response {
    match services
        .introspection
        .cookie(cookie_header(&headers), query.client_id.as_deref())
        .await
    {
        Ok(session) => identity(&session),
        Err(Error::AccessDenied { .. }) => unauthorized(None),
        Err(err) => err.into_response(),
    }
}

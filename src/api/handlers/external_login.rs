use axum::{
    extract::{Extension, Path, Query},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{instrument, warn};
use utoipa::IntoParams;

use super::{add_cookie, authorize::found, root_session};
use crate::{api::failed, external_login::ExternalLoginOutcome, services::Services};

#[derive(Debug, Deserialize, IntoParams)]
pub struct Initialize {
    /// Where to land once the provider round trip is over.
    redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct Callback {
    state: Option<String>,
    code: Option<String>,
    /// Set by the provider when the user declined or the request was bad.
    error: Option<String>,
}

fn login_error(services: &Services) -> Response {
    found(&format!(
        "{}/#/login?error=external_login_failed",
        services.config.auth_webui_base_url().trim_end_matches('/')
    ))
}

fn landing(services: &Services, redirect_uri: Option<String>) -> Response {
    found(&redirect_uri.unwrap_or_else(|| services.config.auth_webui_base_url().to_string()))
}

#[utoipa::path(
    get,
    path= "/public/ext-login/{provider}/initialize",
    params(("provider" = String, Path), Initialize),
    responses (
        (status = 302, description = "To the provider's authorization endpoint"),
        (status = 404, description = "Unknown provider"),
    ),
    tag= "external-login"
)]
#[instrument(skip(services, query))]
pub async fn initialize(
    services: Extension<Arc<Services>>,
    Path(provider): Path<String>,
    Query(query): Query<Initialize>,
) -> Response {
    match services
        .external_logins
        .initialize_login(&provider, query.redirect_uri)
        .await
    {
        Ok(location) => found(&location),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path= "/public/ext-login/{provider}/pair",
    params(("provider" = String, Path), Initialize),
    responses (
        (status = 302, description = "To the provider's authorization endpoint"),
        (status = 401, description = "No root session"),
        (status = 403, description = "Anonymous or impersonated session"),
        (status = 404, description = "Unknown provider"),
    ),
    tag= "external-login"
)]
#[instrument(skip(services, headers, query))]
pub async fn pair(
    services: Extension<Arc<Services>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(query): Query<Initialize>,
) -> Response {
    let session = match root_session(&services, &headers).await {
        Ok(Some(session)) => session,
        Ok(None) => return failed(),
        Err(err) => return err.into_response(),
    };
    match services
        .external_logins
        .initialize_pairing(&session, &provider, query.redirect_uri)
        .await
    {
        Ok(location) => found(&location),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path= "/public/ext-login/callback",
    params(Callback),
    responses (
        (status = 302, description = "Signed in or linked, back to the requested page; on failure to the login page with `error=external_login_failed`"),
    ),
    tag= "external-login"
)]
#[instrument(skip(services, query))]
pub async fn callback(
    services: Extension<Arc<Services>>,
    Query(query): Query<Callback>,
) -> Response {
    if let Some(error) = &query.error {
        warn!(error, "external provider returned an error");
        return login_error(&services);
    }
    let (Some(state), Some(code)) = (query.state.as_deref(), query.code.as_deref()) else {
        warn!("external login callback without state or code");
        return login_error(&services);
    };

    match services.external_logins.finalize(state, code).await {
        Ok(ExternalLoginOutcome::LoggedIn {
            session,
            redirect_uri,
        }) => {
            let mut response = landing(&services, redirect_uri);
            match services.cookies.set_cookie_header(&session) {
                Ok(cookie) => add_cookie(&mut response, &cookie),
                Err(err) => {
                    warn!(sid = %session.id, "external login without cookie: {err}");
                    return login_error(&services);
                }
            }
            response
        }
        Ok(ExternalLoginOutcome::Linked { redirect_uri, .. }) => landing(&services, redirect_uri),
        Err(_) => login_error(&services),
    }
}

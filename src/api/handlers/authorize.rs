use axum::{
    extract::{Extension, Form, Query},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, instrument, warn};
use utoipa::IntoParams;

use super::{add_cookie, root_session};
use crate::{
    oidc::{AuthorizeReply, AuthorizeRequest},
    services::Services,
};

/// `302 Found` to `location`.
pub(crate) fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(err) => {
            error!("Invalid redirect location: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn run(services: &Services, headers: &HeaderMap, request: &AuthorizeRequest) -> Response {
    let session = match root_session(services, headers).await {
        Ok(session) => session,
        Err(err) => {
            warn!("cannot resolve root session: {err}");
            None
        }
    };
    match services.authorize.authorize(request, session).await {
        AuthorizeReply::Redirect(location) => found(&location),
        AuthorizeReply::Login(location) => {
            let mut response = found(&location);
            add_cookie(&mut response, &services.cookies.delete_cookie_header(None));
            response
        }
    }
}

#[utoipa::path(
    get,
    path= "/openidconnect/authorize",
    params(
        ("response_type" = String, Query, description = "Only `code` is supported"),
        ("client_id" = String, Query),
        ("redirect_uri" = String, Query),
        ("scope" = String, Query, description = "Space separated; `openid` or `cookie` plus tenant and other scopes"),
        ("state" = Option<String>, Query),
        ("prompt" = Option<String>, Query, description = "`none`, `login` or `select_account`"),
        ("nonce" = Option<String>, Query),
        ("code_challenge" = Option<String>, Query),
        ("code_challenge_method" = Option<String>, Query, description = "`plain` or `S256`"),
    ),
    responses (
        (status = 302, description = "Back to the client with `code` or `error`, or to the login page"),
    ),
    tag= "openidconnect"
)]
#[instrument(skip(services, headers, request))]
pub async fn authorize_get(
    services: Extension<Arc<Services>>,
    headers: HeaderMap,
    Query(request): Query<AuthorizeRequest>,
) -> Response {
    run(&services, &headers, &request).await
}

#[utoipa::path(
    post,
    path= "/openidconnect/authorize",
    request_body(content = String, content_type = "application/x-www-form-urlencoded", description = "Same parameters as the GET variant"),
    responses (
        (status = 302, description = "Back to the client with `code` or `error`, or to the login page"),
    ),
    tag= "openidconnect"
)]
#[instrument(skip(services, headers, request))]
pub async fn authorize_post(
    services: Extension<Arc<Services>>,
    headers: HeaderMap,
    Form(request): Form<AuthorizeRequest>,
) -> Response {
    run(&services, &headers, &request).await
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CookieEntry {
    /// Authorization code issued for a cookie client.
    code: String,
}

#[utoipa::path(
    get,
    path= "/cookie/entry",
    params(CookieEntry),
    responses (
        (status = 302, description = "Client cookie set, back to the redirect URI bound to the code"),
        (status = 200, description = "Client cookie set"),
        (status = 404, description = "Unknown or used code"),
    ),
    tag= "openidconnect"
)]
#[instrument(skip(services, query))]
pub async fn cookie_entry(
    services: Extension<Arc<Services>>,
    Query(query): Query<CookieEntry>,
) -> Response {
    let (session, cookie) = match services.cookies.cookie_entry(&query.code).await {
        Ok(entry) => entry,
        Err(err) => return err.into_response(),
    };
    let mut response = match session.oauth2.as_ref().and_then(|o| o.redirect_uri.as_deref()) {
        Some(redirect_uri) => found(redirect_uri),
        None => Json(json!({"result": "OK"})).into_response(),
    };
    add_cookie(&mut response, &cookie);
    response
}

#[cfg(test)]
mod tests {
    use crate::{
        api::router,
        oidc::ClientRegistration,
        services::testing::services,
    };
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn anonymous_authorize_goes_to_login_and_clears_cookie() -> anyhow::Result<()> {
        let h = services().await?;
        h.services
            .clients
            .register(ClientRegistration {
                client_id: Some("app".to_string()),
                redirect_uris: vec!["https://app.example.com/cb".to_string()],
                ..ClientRegistration::default()
            })
            .await?;
        let app = router(Arc::new(h.services));

        let response = app
            .oneshot(
                Request::get(
                    "/openidconnect/authorize?response_type=code&client_id=app&scope=openid&redirect_uri=https%3A%2F%2Fapp.example.com%2Fcb&state=s1",
                )
                .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(location.starts_with("https://auth.example.com/#/login"));
        assert!(response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|c| c.contains("Max-Age=0")));
        Ok(())
    }

    #[tokio::test]
    async fn missing_parameters_are_invalid_request() -> anyhow::Result<()> {
        let h = services().await?;
        let app = router(Arc::new(h.services));
        let response = app
            .oneshot(
                Request::post("/openidconnect/authorize")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(
                        "client_id=app&redirect_uri=https%3A%2F%2Fapp.example.com%2Fcb",
                    ))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(location.contains("error=invalid_request"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_cookie_entry_code_is_not_found() -> anyhow::Result<()> {
        let h = services().await?;
        let response = router(Arc::new(h.services))
            .oneshot(Request::get("/cookie/entry?code=nope").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }
}

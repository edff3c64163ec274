//! HTTP surface.
//!
//! Handlers are thin: they translate requests into service calls and service
//! results into responses. The services are shared through an
//! `Extension<Arc<Services>>`.

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Extension, Router,
};
use serde_json::json;
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, warn, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

use crate::{services::Services, storage::StorageError, Error};

pub(crate) mod handlers;
mod openapi;

pub use openapi::openapi;

use handlers::{authorize, external_login, health, impersonate, introspect, login};

/// Every route, layered the same way in production and in tests.
#[must_use]
pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_origin(webui_origin(services.config.auth_webui_base_url()))
        .allow_credentials(true);

    Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/public/login.prologue", put(login::prologue))
        .route("/public/login/:lsid", put(login::login))
        .route("/public/login/:lsid/smslogin", put(login::sms_login))
        .route("/public/login/:lsid/webauthn", put(login::webauthn_login))
        .route("/public/logout", put(login::logout))
        .route(
            "/openidconnect/authorize",
            get(authorize::authorize_get).post(authorize::authorize_post),
        )
        .route("/cookie/entry", get(authorize::cookie_entry))
        .route("/m2m/nginx", post(introspect::m2m_nginx))
        .route("/cookie/nginx", post(introspect::cookie_nginx))
        .route("/impersonate", put(impersonate::impersonate))
        .route(
            "/public/ext-login/:provider/initialize",
            get(external_login::initialize),
        )
        .route(
            "/public/ext-login/:provider/pair",
            get(external_login::pair),
        )
        .route("/public/ext-login/callback", get(external_login::callback))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(services)),
        )
}

/// Serve until `shutdown` resolves.
///
/// # Errors
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(
    port: u16,
    services: Arc<Services>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(services);

    let listener = TcpListener::bind(format!("::0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

/// `scheme://host[:port]` of the web UI; any origin when it cannot be parsed.
fn webui_origin(base_url: &str) -> AllowOrigin {
    let origin = Url::parse(base_url).ok().and_then(|parsed| {
        let host = parsed.host_str()?;
        let port = parsed
            .port()
            .map_or_else(String::new, |port| format!(":{port}"));
        HeaderValue::from_str(&format!("{}://{host}{port}", parsed.scheme())).ok()
    });
    match origin {
        Some(origin) => AllowOrigin::exact(origin),
        None => {
            warn!(base_url, "cannot derive CORS origin from web UI URL");
            AllowOrigin::mirror_request()
        }
    }
}

/// The one failure shape of the authentication endpoints.
pub(crate) fn failed() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"result": "FAILED"})),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_)
            | Self::Expired(_)
            | Self::TenantNotFound(_)
            | Self::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::AttemptsExhausted | Self::Decryption => return failed(),
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::AccessDenied { .. }
            | Self::TenantAccessDenied { .. }
            | Self::NoTenants(_)
            | Self::NotEditable(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) | Self::Storage(StorageError::VersionConflict { .. }) => {
                StatusCode::CONFLICT
            }
            Self::ExternalProvider(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidSessionComposition(_) | Self::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("request failed: {self}");
            return (status, Json(json!({"result": "ERROR"}))).into_response();
        }
        (
            status,
            Json(json!({"result": "ERROR", "message": self.to_string()})),
        )
            .into_response()
    }
}

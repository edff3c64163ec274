use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

use super::{add_cookie, request_context, root_session};
use crate::{
    api::failed,
    login::{LoginOutcome, PrologueRequest},
    services::Services,
};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginPrologue {
    /// Username, email or phone number.
    ident: String,
    /// Client X25519 public key, base64url.
    key: String,
    /// Query string of the login page.
    qs: Option<String>,
}

fn sealed(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}

#[utoipa::path(
    put,
    path= "/public/login.prologue",
    request_body = LoginPrologue,
    responses (
        (status = 200, description = "Login session id, descriptors and the server public key"),
        (status = 400, description = "Malformed client key"),
    ),
    tag= "login"
)]
#[instrument(skip(services, headers, payload))]
pub async fn prologue(
    services: Extension<Arc<Services>>,
    headers: HeaderMap,
    Json(payload): Json<LoginPrologue>,
) -> Response {
    let request = PrologueRequest {
        ident: payload.ident,
        key: payload.key,
        qs: payload.qs,
    };
    match services
        .authn
        .login_prologue(&request, &request_context(&headers))
        .await
    {
        Ok(prologue) => Json(prologue).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    put,
    path= "/public/login/{lsid}",
    params(("lsid" = String, Path, description = "Login session id")),
    request_body(content = String, content_type = "application/octet-stream", description = "Sealed factor values"),
    responses (
        (status = 200, description = "Sealed result; the root cookie is set"),
        (status = 401, description = "Login failed"),
    ),
    tag= "login"
)]
#[instrument(skip(services, headers, body))]
pub async fn login(
    services: Extension<Arc<Services>>,
    Path(lsid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let track_id = match root_session(&services, &headers).await {
        Ok(session) => session.and_then(|s| s.track_id),
        Err(err) => {
            warn!("cannot resolve current session: {err}");
            None
        }
    };
    let outcome = services
        .authn
        .login(&lsid, &body, &request_context(&headers), track_id)
        .await;
    match outcome {
        Ok(LoginOutcome::Success { session, body }) => {
            let mut response = sealed(body);
            match services.cookies.set_cookie_header(&session) {
                Ok(cookie) => add_cookie(&mut response, &cookie),
                Err(err) => warn!(sid = %session.id, "root session without cookie: {err}"),
            }
            response
        }
        Ok(LoginOutcome::Failed) => failed(),
        Err(err) => err.into_response(),
    }
}

async fn preparation_step(
    services: &Services,
    lsid: &str,
    body: &[u8],
    webauthn: bool,
) -> Response {
    let reply = if webauthn {
        services.authn.webauthn_login(lsid, body).await
    } else {
        services.authn.sms_login(lsid, body).await
    };
    match reply {
        Ok(body) => sealed(body),
        Err(err) if err.is_gone() => {
            debug!(lsid, "preparation step on unusable login session: {err}");
            failed()
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    put,
    path= "/public/login/{lsid}/smslogin",
    params(("lsid" = String, Path, description = "Login session id")),
    request_body(content = String, content_type = "application/octet-stream"),
    responses (
        (status = 200, description = "Sealed result"),
        (status = 401, description = "Unknown or exhausted login session"),
    ),
    tag= "login"
)]
#[instrument(skip(services, body))]
pub async fn sms_login(
    services: Extension<Arc<Services>>,
    Path(lsid): Path<String>,
    body: Bytes,
) -> Response {
    preparation_step(&services, &lsid, &body, false).await
}

#[utoipa::path(
    put,
    path= "/public/login/{lsid}/webauthn",
    params(("lsid" = String, Path, description = "Login session id")),
    request_body(content = String, content_type = "application/octet-stream"),
    responses (
        (status = 200, description = "Sealed WebAuthn request options"),
        (status = 401, description = "Unknown or exhausted login session"),
    ),
    tag= "login"
)]
#[instrument(skip(services, body))]
pub async fn webauthn_login(
    services: Extension<Arc<Services>>,
    Path(lsid): Path<String>,
    body: Bytes,
) -> Response {
    preparation_step(&services, &lsid, &body, true).await
}

#[utoipa::path(
    put,
    path= "/public/logout",
    responses (
        (status = 200, description = "Session tree deleted; the cookie is cleared or the impersonator's restored"),
        (status = 401, description = "No session"),
    ),
    tag= "login"
)]
#[instrument(skip(services, headers))]
pub async fn logout(services: Extension<Arc<Services>>, headers: HeaderMap) -> Response {
    let session = match root_session(&services, &headers).await {
        Ok(Some(session)) => session,
        Ok(None) => return failed(),
        Err(err) => return err.into_response(),
    };
    let restored = match services.authn.logout(&session).await {
        Ok(restored) => restored,
        Err(err) => return err.into_response(),
    };

    let mut response = Json(json!({"result": "OK"})).into_response();
    let cookie = restored
        .as_ref()
        .and_then(|impersonator| services.cookies.set_cookie_header(impersonator).ok())
        .unwrap_or_else(|| services.cookies.delete_cookie_header(None));
    add_cookie(&mut response, &cookie);
    response
}

#[cfg(test)]
mod tests {
    use crate::{
        api::{router, tests::body_json},
        crypto::envelope::ClientKeyPair,
        services::testing::services,
    };
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn login_over_http_sets_root_cookie() -> anyhow::Result<()> {
        let h = services().await?;
        h.people
            .create("alice", None, None, Some(&SecretString::from("pw")))
            .await?;
        let app = router(Arc::new(h.services));
        let client = ClientKeyPair::generate();

        let response = app
            .clone()
            .oneshot(
                Request::put("/public/login.prologue")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        json!({"ident": "alice", "key": client.public_key().encode()}).to_string(),
                    ))?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let prologue = body_json(response).await?;
        let lsid = prologue["lsid"].as_str().unwrap_or_default().to_string();
        let server_key = prologue["key"].as_str().unwrap_or_default().to_string();

        let wrong = client.encrypt(&server_key, json!({"password": "nope"}).to_string().as_bytes())?;
        let response = app
            .clone()
            .oneshot(Request::put(format!("/public/login/{lsid}")).body(Body::from(wrong))?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await?, json!({"result": "FAILED"}));

        let right = client.encrypt(&server_key, json!({"password": "pw"}).to_string().as_bytes())?;
        let response = app
            .clone()
            .oneshot(Request::put(format!("/public/login/{lsid}")).body(Body::from(right))?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(set_cookie.starts_with("PortunusSCI="));
        let sealed = to_bytes(response.into_body(), usize::MAX).await?;
        let reply: Value = serde_json::from_slice(&client.decrypt(&server_key, &sealed)?)?;
        assert_eq!(reply["result"], "OK");

        let cookie = set_cookie.split(';').next().unwrap_or_default().to_string();
        let response = app
            .clone()
            .oneshot(
                Request::put("/public/logout")
                    .header(header::COOKIE, cookie.as_str())
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let cleared = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(cleared.contains("Max-Age=0"));

        let response = app
            .oneshot(
                Request::put("/public/logout")
                    .header(header::COOKIE, cookie.as_str())
                    .body(Body::empty())?,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_login_session_fails_uniformly() -> anyhow::Result<()> {
        let h = services().await?;
        let app = router(Arc::new(h.services));
        for uri in ["/public/login/nope", "/public/login/nope/smslogin"] {
            let response = app
                .clone()
                .oneshot(Request::put(uri).body(Body::from(vec![0u8; 40]))?)
                .await?;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
        Ok(())
    }
}

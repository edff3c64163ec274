use axum::{
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{instrument, warn};
use utoipa::ToSchema;

use super::{add_cookie, root_session};
use crate::{api::failed, services::Services};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Impersonate {
    /// Credentials to act as.
    credentials_id: String,
}

#[utoipa::path(
    put,
    path= "/impersonate",
    request_body = Impersonate,
    responses (
        (status = 200, description = "Impersonated root session created; its cookie replaces the operator's"),
        (status = 401, description = "No root session"),
        (status = 403, description = "Impersonation denied"),
    ),
    tag= "login"
)]
#[instrument(skip(services, headers, payload))]
pub async fn impersonate(
    services: Extension<Arc<Services>>,
    headers: HeaderMap,
    Json(payload): Json<Impersonate>,
) -> Response {
    let operator = match root_session(&services, &headers).await {
        Ok(Some(session)) => session,
        Ok(None) => return failed(),
        Err(err) => return err.into_response(),
    };
    let session = match services
        .impersonation
        .impersonate(&operator, &payload.credentials_id)
        .await
    {
        Ok(session) => session,
        Err(err) => return err.into_response(),
    };

    let mut response = Json(json!({"result": "OK", "sid": session.id})).into_response();
    match services.cookies.set_cookie_header(&session) {
        Ok(cookie) => add_cookie(&mut response, &cookie),
        Err(err) => warn!(sid = %session.id, "impersonated session without cookie: {err}"),
    }
    response
}

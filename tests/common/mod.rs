#![allow(dead_code)]

use anyhow::{anyhow, Result};
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, Response, StatusCode},
    Router,
};
use portunus::{
    api,
    config::AuthConfig,
    credentials::MemoryCredentialProvider,
    crypto::envelope::ClientKeyPair,
    services::{Collaborators, Services},
    storage::MemoryStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

pub struct App {
    pub services: Arc<Services>,
    pub router: Router,
    pub people: Arc<MemoryCredentialProvider>,
}

pub async fn app() -> Result<App> {
    let config = AuthConfig::new(
        "https://auth.example.com/api".to_string(),
        "https://auth.example.com".to_string(),
    )
    .with_login_failure_floor_ms(0);
    let people = Arc::new(MemoryCredentialProvider::new("default"));
    let services = Arc::new(
        Services::new(
            config,
            Arc::new(MemoryStore::new()),
            Collaborators::new(vec![people.clone()]),
        )
        .await?,
    );
    Ok(App {
        router: api::router(services.clone()),
        services,
        people,
    })
}

pub async fn body_json(response: Response<Body>) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn header<'a>(response: &'a Response<Body>, name: header::HeaderName) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// The `name=value` part of a `Set-Cookie` header.
pub fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split(';').next().unwrap_or_default().to_string()
}

pub struct Handshake {
    pub lsid: String,
    pub server_key: String,
    pub client: ClientKeyPair,
    pub descriptors: Value,
}

pub async fn prologue(router: &Router, ident: &str, qs: Option<&str>) -> Result<Handshake> {
    let client = ClientKeyPair::generate();
    let response = router
        .clone()
        .oneshot(
            Request::put("/public/login.prologue")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"ident": ident, "key": client.public_key().encode(), "qs": qs})
                        .to_string(),
                ))?,
        )
        .await?;
    if response.status() != StatusCode::OK {
        return Err(anyhow!("prologue failed: {}", response.status()));
    }
    let body = body_json(response).await?;
    Ok(Handshake {
        lsid: body["lsid"].as_str().unwrap_or_default().to_string(),
        server_key: body["key"].as_str().unwrap_or_default().to_string(),
        descriptors: body["lds"].clone(),
        client,
    })
}

/// Send one sealed login attempt; returns the raw response.
pub async fn attempt(router: &Router, handshake: &Handshake, factors: &Value) -> Result<Response<Body>> {
    let sealed = handshake
        .client
        .encrypt(&handshake.server_key, factors.to_string().as_bytes())?;
    Ok(router
        .clone()
        .oneshot(Request::put(format!("/public/login/{}", handshake.lsid)).body(Body::from(sealed))?)
        .await?)
}

/// Full password login; returns the root cookie pair.
pub async fn login(router: &Router, ident: &str, password: &str) -> Result<String> {
    let handshake = prologue(router, ident, None).await?;
    let response = attempt(router, &handshake, &json!({"password": password})).await?;
    if response.status() != StatusCode::OK {
        return Err(anyhow!("login failed: {}", response.status()));
    }
    Ok(cookie_pair(header(&response, header::SET_COOKIE)))
}

//! HTTP surface: status, CORS preflight, the authenticated provider
//! proxy mount, signed-URL file serving, and the TLS setup landing
//! page.

use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use hub_tools::path::validate_file_path;

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Constant-time token comparison via SHA-256 digests, which also
/// normalizes lengths.
pub fn token_eq(a: &str, b: &str) -> bool {
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

/// The client address for rate limiting; honors `X-Forwarded-For` only
/// behind a trusted proxy.
pub fn client_addr(state: &AppState, headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    if state.config.server.trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return forwarded;
        }
    }
    addr.ip()
}

/// Enforce the `x-hub-token` header with the failed-auth rate limiter.
pub fn verify_hub_token(
    state: &AppState,
    headers: &HeaderMap,
    addr: IpAddr,
) -> Result<(), Response> {
    if let Some(remaining) = state.rate_limiter.check(addr) {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", remaining.as_secs().to_string())],
            "too many failed attempts",
        )
            .into_response());
    }

    let provided = headers
        .get("x-hub-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let ok = state
        .config
        .auth_token
        .as_deref()
        .is_some_and(|expected| token_eq(expected, provided));
    if ok {
        state.rate_limiter.record_success(addr);
        Ok(())
    } else {
        state.rate_limiter.record_failure(addr);
        Err((StatusCode::UNAUTHORIZED, "invalid hub token").into_response())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CORS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ALLOWED_HEADERS: &str =
    "content-type, x-hub-token, x-api-provider, anthropic-version, authorization";

/// Preflight response: origin is either `*` or the single matching
/// entry from the configured allowlist (with `Vary: Origin`).
pub async fn preflight(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-methods", "GET, POST, OPTIONS")
        .header("access-control-allow-headers", ALLOWED_HEADERS)
        .header("access-control-allow-private-network", "true")
        .header("access-control-max-age", "600");

    let allowlist = &state.config.server.allowed_origins;
    if allowlist.is_empty() {
        builder = builder.header("access-control-allow-origin", "*");
    } else if let Some(origin) = headers.get("origin").and_then(|v| v.to_str().ok()) {
        if allowlist.iter().any(|entry| entry == origin) {
            builder = builder
                .header("access-control-allow-origin", origin)
                .header("vary", "Origin");
        }
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signed file URLs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn file_signature(secret: &str, agent_id: &str, path: &str, exp: u64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{agent_id}/{path}:{exp}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Mint a signed relative URL for one agent file.
pub fn sign_file_url(secret: &str, agent_id: &str, path: &str, exp: u64) -> String {
    let sig = file_signature(secret, agent_id, path, exp);
    format!("/agents/{agent_id}/files/{path}?sig={sig}&exp={exp}")
}

fn mime_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or_default() {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "txt" | "md" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[derive(Deserialize)]
pub struct SignedQuery {
    sig: String,
    exp: u64,
}

/// GET /agents/{agent_id}/files/{path} — signature is verified before
/// any file I/O; the usual path-traversal rules apply.
pub async fn serve_agent_file(
    State(state): State<AppState>,
    AxumPath((agent_id, path)): AxumPath<(String, String)>,
    Query(query): Query<SignedQuery>,
) -> Response {
    let Some(secret) = state.config.auth_token.as_deref() else {
        return (StatusCode::FORBIDDEN, "file serving requires an auth token").into_response();
    };

    let now = chrono::Utc::now().timestamp();
    if now < 0 || query.exp < now as u64 {
        return (StatusCode::FORBIDDEN, "link expired").into_response();
    }
    let expected = file_signature(secret, &agent_id, &path, query.exp);
    if !token_eq(&expected, &query.sig) {
        return (StatusCode::FORBIDDEN, "bad signature").into_response();
    }

    let files_root = match state.store.files_root(&agent_id) {
        Ok(root) => root,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let target = match validate_file_path(&path, &files_root) {
        Ok(target) => target,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match tokio::fs::read(&target).await {
        Ok(bytes) => (
            StatusCode::OK,
            [("content-type", mime_for(&path))],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "no such file").into_response(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Misc routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn status() -> impl IntoResponse {
    axum::Json(serde_json::json!({ "ok": true }))
}

const TLS_SETUP_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>agenthub — TLS setup</title></head>
<body>
<h1>Certificate accepted</h1>
<p>Your browser now trusts this hub's certificate. You can close this
tab and return to the app.</p>
</body>
</html>
"#;

async fn tls_setup() -> impl IntoResponse {
    Html(TLS_SETUP_PAGE)
}

/// Assemble the full axum router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route(
            "/api/*rest",
            post(crate::proxy::http_proxy).options(preflight),
        )
        .route(
            "/agents/:agent_id/files/*path",
            get(serve_agent_file).options(preflight),
        )
        .route("/tls-setup", get(tls_setup))
        .route("/ws", get(crate::ws::ws_handler))
        .route("/stream", get(crate::stream_server::stream_ws))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(
            crate::proxy::MAX_PROXY_BODY + 1024,
        ))
        .with_state(state)
}

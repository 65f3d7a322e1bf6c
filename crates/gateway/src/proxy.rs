//! API proxy — shared-key forwarding of streamed LLM requests.
//!
//! Two modes share one core: an HTTP surface (`POST /api/{provider}/…`,
//! authenticated with `x-hub-token`) that pumps the upstream body back
//! unchanged, and a WebSocket surface (`api_proxy_request`) that wraps
//! upstream chunks as `api_stream_chunk` messages. Providers configured
//! as CLI proxies are served by a subprocess adapter whose canonical
//! events are re-serialized as SSE.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;

use hub_domain::config::HubConfig;
use hub_domain::error::{Error, Result};
use hub_domain::tool::ChatMessage;
use hub_protocol::ServerMessage;
use hub_providers::cli::{render_prompt, CliAdapter};
use hub_providers::client::upstream_base;

use crate::http::{client_addr, verify_hub_token};
use crate::state::AppState;

pub const MAX_PROXY_BODY: usize = 10 * 1024 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routing table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve an `/api/...` request path to `(provider, upstream_url)`.
///
/// `/api/anthropic/*`, `/api/openai/*`, `/api/gemini/*`, `/api/ollama/*`
/// map to their upstreams; the legacy `/api/v1/messages` path is
/// Anthropic.
pub fn resolve_http_route(path: &str, config: &HubConfig) -> Result<(String, String)> {
    let rest = path.strip_prefix("/api/").unwrap_or(path);

    // Legacy Anthropic path.
    if rest == "v1/messages" {
        return Ok((
            "anthropic".into(),
            "https://api.anthropic.com/v1/messages".into(),
        ));
    }

    let (provider, upstream_path) = match rest.split_once('/') {
        Some((provider, tail)) => (provider, format!("/{tail}")),
        None => (rest, String::new()),
    };

    let url = upstream_url_for(provider, &upstream_path, config)?;
    Ok((provider.to_string(), url))
}

pub fn upstream_url_for(provider: &str, upstream_path: &str, config: &HubConfig) -> Result<String> {
    let configured = config
        .providers
        .get(provider)
        .and_then(|p| p.endpoint.as_deref());
    let base = upstream_base(provider, configured).ok_or_else(|| Error::Proxy {
        provider: provider.to_string(),
        message: format!("unknown provider {provider} with no configured endpoint"),
    })?;
    Ok(format!("{base}{upstream_path}"))
}

pub fn api_key_for(provider: &str, config: &HubConfig) -> Option<String> {
    config
        .providers
        .get(provider)
        .and_then(|p| p.api_key.clone())
        .or_else(|| config.shared_api_keys.get(provider).cloned())
}

fn event_to_sse(event: &hub_domain::stream::StreamEvent) -> String {
    format!(
        "data: {}\n\n",
        serde_json::to_string(event).unwrap_or_else(|_| "{}".into())
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WebSocket mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serve one `api_proxy_request`: chunks flow back to the requesting
/// client as `api_stream_chunk` until `api_stream_end` (or `api_error`).
pub async fn handle_ws_proxy(
    state: AppState,
    sink: crate::clients::ClientSink,
    id: String,
    provider: String,
    path: String,
    body: Value,
) {
    // CLI-proxied providers bypass HTTP.
    if let Some(cli_config) = state.config.cli_providers.get(&provider) {
        let adapter = CliAdapter::new(cli_config.clone());
        let model = body
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let messages: Vec<ChatMessage> = body
            .get("messages")
            .cloned()
            .and_then(|m| serde_json::from_value(m).ok())
            .unwrap_or_default();
        let system = body
            .get("system")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let prompt = render_prompt(system.as_deref(), &messages);

        match adapter.stream_events(&model, prompt).await {
            Ok(mut stream) => {
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) => {
                            let chunk = event_to_sse(&event);
                            if sink
                                .send(ServerMessage::ApiStreamChunk {
                                    id: id.clone(),
                                    chunk,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = sink
                                .send(ServerMessage::ApiError {
                                    id,
                                    error: e.to_string(),
                                })
                                .await;
                            return;
                        }
                    }
                }
                let _ = sink.send(ServerMessage::ApiStreamEnd { id }).await;
            }
            Err(e) => {
                let _ = sink
                    .send(ServerMessage::ApiError {
                        id,
                        error: e.to_string(),
                    })
                    .await;
            }
        }
        return;
    }

    // HTTP providers: raw passthrough.
    let url = match upstream_url_for(&provider, &path, &state.config) {
        Ok(url) => url,
        Err(e) => {
            let _ = sink
                .send(ServerMessage::ApiError {
                    id,
                    error: e.to_string(),
                })
                .await;
            return;
        }
    };
    let api_key = api_key_for(&provider, &state.config);

    match state
        .api
        .forward_raw(&provider, &url, api_key.as_deref(), &body)
        .await
    {
        Ok(resp) => {
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                let _ = sink
                    .send(ServerMessage::ApiError {
                        id,
                        error: format!("HTTP {} - {}", status.as_u16(), text),
                    })
                    .await;
                return;
            }
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        let chunk = String::from_utf8_lossy(&bytes).into_owned();
                        if sink
                            .send(ServerMessage::ApiStreamChunk {
                                id: id.clone(),
                                chunk,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = sink
                            .send(ServerMessage::ApiError {
                                id,
                                error: format!("stream broke: {e}"),
                            })
                            .await;
                        return;
                    }
                }
            }
            let _ = sink.send(ServerMessage::ApiStreamEnd { id }).await;
        }
        Err(e) => {
            let _ = sink
                .send(ServerMessage::ApiError {
                    id,
                    error: e.to_string(),
                })
                .await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// POST /api/{...} — authenticated streamed provider proxy.
pub async fn http_proxy(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(rest): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let addr = client_addr(&state, &headers, addr);
    if let Err(resp) = verify_hub_token(&state, &headers, addr) {
        return resp;
    }
    if body.len() > MAX_PROXY_BODY {
        return (StatusCode::PAYLOAD_TOO_LARGE, "body exceeds 10 MiB").into_response();
    }
    let body_json: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("bad JSON: {e}")).into_response(),
    };

    let full_path = format!("/api/{rest}");
    let (provider, url) = match resolve_http_route(&full_path, &state.config) {
        Ok(route) => route,
        Err(e) => return (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    };

    // CLI providers answer with SSE-serialized canonical events.
    if let Some(cli_config) = state.config.cli_providers.get(&provider) {
        let adapter = CliAdapter::new(cli_config.clone());
        let model = body_json
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let messages: Vec<ChatMessage> = body_json
            .get("messages")
            .cloned()
            .and_then(|m| serde_json::from_value(m).ok())
            .unwrap_or_default();
        let system = body_json
            .get("system")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let prompt = render_prompt(system.as_deref(), &messages);

        return match adapter.stream_events(&model, prompt).await {
            Ok(stream) => {
                let sse = stream.map(|event| match event {
                    Ok(event) => Ok::<_, std::io::Error>(event_to_sse(&event).into_bytes()),
                    Err(e) => Err(std::io::Error::other(e.to_string())),
                });
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(sse))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
        };
    }

    let api_key = api_key_for(&provider, &state.config);
    match state
        .api
        .forward_raw(&provider, &url, api_key.as_deref(), &body_json)
        .await
    {
        Ok(resp) => {
            let status =
                StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let stream = resp
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| std::io::Error::other(e.to_string())));
            Response::builder()
                .status(status)
                .header("content-type", content_type)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_ollama() -> HubConfig {
        let mut config = HubConfig::default();
        config.providers.insert(
            "ollama".into(),
            hub_domain::config::ProviderConfig {
                api_key: None,
                endpoint: Some("http://127.0.0.1:11434".into()),
            },
        );
        config
    }

    #[test]
    fn fixed_provider_routes() {
        let config = HubConfig::default();
        let (provider, url) =
            resolve_http_route("/api/anthropic/v1/messages", &config).unwrap();
        assert_eq!(provider, "anthropic");
        assert_eq!(url, "https://api.anthropic.com/v1/messages");

        let (provider, url) =
            resolve_http_route("/api/openai/v1/chat/completions", &config).unwrap();
        assert_eq!(provider, "openai");
        assert_eq!(url, "https://api.openai.com/v1/chat/completions");

        let (provider, url) = resolve_http_route(
            "/api/gemini/v1beta/models/gemini-pro:streamGenerateContent",
            &config,
        )
        .unwrap();
        assert_eq!(provider, "gemini");
        assert!(url.starts_with("https://generativelanguage.googleapis.com/"));
    }

    #[test]
    fn legacy_messages_path_is_anthropic() {
        let (provider, url) = resolve_http_route("/api/v1/messages", &HubConfig::default()).unwrap();
        assert_eq!(provider, "anthropic");
        assert_eq!(url, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn ollama_requires_configured_endpoint() {
        assert!(resolve_http_route("/api/ollama/api/chat", &HubConfig::default()).is_err());
        let (provider, url) =
            resolve_http_route("/api/ollama/api/chat", &config_with_ollama()).unwrap();
        assert_eq!(provider, "ollama");
        assert_eq!(url, "http://127.0.0.1:11434/api/chat");
    }

    #[test]
    fn api_key_prefers_provider_override() {
        let mut config = HubConfig::default();
        config
            .shared_api_keys
            .insert("anthropic".into(), "shared".into());
        assert_eq!(api_key_for("anthropic", &config).as_deref(), Some("shared"));
        config.providers.insert(
            "anthropic".into(),
            hub_domain::config::ProviderConfig {
                api_key: Some("override".into()),
                endpoint: None,
            },
        );
        assert_eq!(
            api_key_for("anthropic", &config).as_deref(),
            Some("override")
        );
    }
}

//! The hub WebSocket endpoint: first-frame authentication, exhaustive
//! message routing, per-client fan-out, and symmetric teardown on
//! disconnect.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

use hub_protocol::{AgentAction, ClientMessage, ServerMessage};
use hub_tools::executor::ToolExecutor;
use hub_tools::registry::builtin_tools;

use crate::clients::ConnectedClient;
use crate::http::{client_addr, token_eq};
use crate::intervene::compose_notification;
use crate::runner::build_executor_deps;
use crate::state::AppState;

/// Close code sent on authentication failure.
const CLOSE_AUTH_FAILED: u16 = 4001;
const AUTH_DEADLINE: Duration = Duration::from_secs(10);

/// GET /ws — upgrade to the hub protocol socket.
///
/// Plain `ws://` is accepted from loopback, RFC1918 and link-local
/// peers; a public peer must arrive over TLS (`wss://`).
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let peer = client_addr(&state, &headers, addr);
    if !crate::fetch::is_private_ip(&peer) && state.config.server.tls.is_none() {
        return (
            axum::http::StatusCode::FORBIDDEN,
            "public clients must connect over wss",
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
        .into_response()
}

async fn send_msg(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(msg).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

async fn close_with(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, peer: std::net::IpAddr) {
    let (mut sink, mut source) = socket.split();

    // ── Authentication: the first frame must be `auth` ────────────
    let first = tokio::time::timeout(AUTH_DEADLINE, source.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = first else {
        close_with(&mut sink, CLOSE_AUTH_FAILED, "auth required").await;
        return;
    };
    let Ok(ClientMessage::Auth { token }) = serde_json::from_str::<ClientMessage>(&text) else {
        let _ = send_msg(
            &mut sink,
            &ServerMessage::AuthResult {
                success: false,
                hub_id: None,
                hub_name: None,
                shared_providers: vec![],
                http_api_url: None,
                error: Some("first message must be auth".into()),
            },
        )
        .await;
        close_with(&mut sink, CLOSE_AUTH_FAILED, "auth required").await;
        return;
    };

    if let Some(remaining) = state.rate_limiter.check(peer) {
        let _ = send_msg(
            &mut sink,
            &ServerMessage::AuthResult {
                success: false,
                hub_id: None,
                hub_name: None,
                shared_providers: vec![],
                http_api_url: None,
                error: Some(format!(
                    "too many failed attempts; retry in {}s",
                    remaining.as_secs()
                )),
            },
        )
        .await;
        close_with(&mut sink, CLOSE_AUTH_FAILED, "rate limited").await;
        return;
    }

    let authentic = state
        .config
        .auth_token
        .as_deref()
        .is_some_and(|expected| token_eq(expected, &token));
    if !authentic {
        state.rate_limiter.record_failure(peer);
        let _ = send_msg(
            &mut sink,
            &ServerMessage::AuthResult {
                success: false,
                hub_id: None,
                hub_name: None,
                shared_providers: vec![],
                http_api_url: None,
                error: Some("invalid token".into()),
            },
        )
        .await;
        close_with(&mut sink, CLOSE_AUTH_FAILED, "auth failed").await;
        return;
    }
    state.rate_limiter.record_success(peer);

    // ── Welcome ───────────────────────────────────────────────────
    let mut shared_providers: Vec<String> = state
        .config
        .shared_api_keys
        .keys()
        .chain(state.config.cli_providers.keys())
        .cloned()
        .collect();
    shared_providers.sort();
    shared_providers.dedup();

    let http_host = state
        .config
        .server
        .public_host
        .clone()
        .unwrap_or_else(|| state.config.server.host.clone());
    let scheme = if state.config.server.tls.is_some() {
        "https"
    } else {
        "http"
    };
    let welcome = ServerMessage::AuthResult {
        success: true,
        hub_id: Some(state.config.hub.id.clone()),
        hub_name: Some(state.config.hub.name.clone()),
        shared_providers,
        http_api_url: Some(format!(
            "{scheme}://{http_host}:{}",
            state.config.server.port
        )),
        error: None,
    };
    if send_msg(&mut sink, &welcome).await.is_err() {
        return;
    }
    let _ = send_msg(
        &mut sink,
        &ServerMessage::AnnounceTools {
            tools: builtin_tools(),
        },
    )
    .await;

    // ── Register and run the message loop ─────────────────────────
    let client_id = uuid::Uuid::new_v4().to_string();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(256);
    state.clients.register(ConnectedClient {
        client_id: client_id.clone(),
        remote_addr: peer,
        connected_at: chrono::Utc::now(),
        sink: outbound.clone(),
        subscriptions: Default::default(),
    });

    // Writer: outbound messages keep their production order.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if send_msg(&mut sink, &msg).await.is_err() {
                break;
            }
        }
    });

    // Reader: inbound messages process in arrival order.
    while let Some(Ok(msg)) = source.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => {
                    handle_message(&state, &client_id, &outbound, msg).await;
                }
                Err(_) => {
                    let kind = serde_json::from_str::<serde_json::Value>(&text)
                        .ok()
                        .and_then(|v| {
                            v.get("type").and_then(|t| t.as_str()).map(str::to_owned)
                        })
                        .unwrap_or_else(|| "<unparseable>".into());
                    let _ = outbound
                        .send(ServerMessage::Error {
                            id: None,
                            message: format!("unknown message type: {kind}"),
                        })
                        .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // ── Symmetric teardown ────────────────────────────────────────
    writer.abort();
    disconnect_cleanup(&state, &client_id).await;
}

/// Release every resource a client held: subscriptions, pending browser
/// tool correlations, interventions, screencasts, stream tokens, and
/// push visibility.
async fn disconnect_cleanup(state: &AppState, client_id: &str) {
    state.clients.remove(client_id);
    let failed = state.router.fail_pending_for_client(client_id);

    for session in state.intervene.release_all_for_client(client_id) {
        let snapshot = match state.browse.get(&session.agent_id).await {
            Some(page) => Some(page.snapshot().await),
            None => None,
        };
        let note = compose_notification(&session, snapshot.as_deref());
        state.agents.intervene_end(&session.agent_id, note).await;
        state.clients.fanout(
            &session.agent_id,
            &ServerMessage::InterveneEnded {
                agent_id: session.agent_id.clone(),
                reason: "client disconnected".into(),
            },
        );
    }

    state.screencast.stop_all_for_client(client_id).await;
    state.stream_tokens.revoke_for_client(client_id);
    state.push.client_disconnected(client_id);

    tracing::info!(
        client_id = %client_id,
        failed_tool_requests = failed,
        "client disconnected"
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_message(
    state: &AppState,
    client_id: &str,
    outbound: &mpsc::Sender<ServerMessage>,
    msg: ClientMessage,
) {
    match msg {
        // Auth is only valid as the first frame; here it is a protocol
        // error.
        ClientMessage::Auth { .. } => {
            let _ = outbound
                .send(ServerMessage::Error {
                    id: None,
                    message: "already authenticated".into(),
                })
                .await;
        }

        ClientMessage::ToolRequest {
            id,
            name,
            input,
            agent_id,
        } => {
            if let Some(agent_id) = agent_id.as_deref() {
                state.clients.touch_agent(client_id, agent_id);
            }
            let state = state.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let result = if name == "browse" {
                    exec_browse_tool(&state, agent_id.as_deref(), &input).await
                } else {
                    let (tools, hooks) = match agent_id.as_deref() {
                        Some(agent) => match state.store.load(agent).await {
                            Ok(Some((session, _))) => (
                                session.config.tools,
                                session.hooks.unwrap_or_default(),
                            ),
                            _ => (Vec::new(), Vec::new()),
                        },
                        None => (Vec::new(), Vec::new()),
                    };
                    let deps = build_executor_deps(
                        agent_id.as_deref().unwrap_or_default(),
                        tools,
                        hooks,
                        None,
                        &state.runner_deps,
                    );
                    ToolExecutor::execute(&name, input, &deps).await
                };
                let _ = outbound.send(ServerMessage::ToolResult { id, result }).await;
            });
        }

        ClientMessage::FetchRequest {
            id,
            url,
            method,
            headers,
            body,
        } => {
            let state = state.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                if !state.config.fetch_proxy.enabled {
                    let _ = outbound
                        .send(ServerMessage::FetchResult {
                            id,
                            status: None,
                            headers: vec![],
                            body: None,
                            error: Some("fetch proxy is disabled".into()),
                        })
                        .await;
                    return;
                }
                let req = crate::fetch::FetchRequest {
                    url,
                    method: method.unwrap_or_else(|| "GET".into()),
                    headers,
                    body,
                };
                let reply = match state.fetcher.fetch(req).await {
                    Ok(resp) => ServerMessage::FetchResult {
                        id,
                        status: Some(resp.status),
                        headers: resp.headers,
                        body: Some(resp.body),
                        error: None,
                    },
                    Err(e) => ServerMessage::FetchResult {
                        id,
                        status: None,
                        headers: vec![],
                        body: None,
                        error: Some(e.to_string()),
                    },
                };
                let _ = outbound.send(reply).await;
            });
        }

        ClientMessage::ApiProxyRequest {
            id,
            provider,
            path,
            body,
        } => {
            let state = state.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                crate::proxy::handle_ws_proxy(state, outbound, id, provider, path, body).await;
            });
        }

        // ── Agent lifecycle ───────────────────────────────────────
        ClientMessage::PersistAgent { id, session, state: store_state } => {
            let agent_id = session.agent_id.clone();
            state.clients.touch_agent(client_id, &agent_id);
            let reply = match state.agents.persist(session, store_state).await {
                Ok(()) => ServerMessage::PersistResult {
                    id,
                    agent_id,
                    ok: true,
                    error: None,
                },
                Err(e) => ServerMessage::PersistResult {
                    id,
                    agent_id,
                    ok: false,
                    error: Some(e.to_string()),
                },
            };
            let _ = outbound.send(reply).await;
        }

        ClientMessage::RestoreAgent { id, agent_id } => {
            state.clients.touch_agent(client_id, &agent_id);
            let reply = match state.agents.restore(&agent_id).await {
                Ok(Some((session, store_state))) => ServerMessage::RestoreResult {
                    id,
                    agent_id,
                    ok: true,
                    session: Some(session),
                    state: Some(store_state),
                    error: None,
                },
                Ok(None) => ServerMessage::RestoreResult {
                    id,
                    agent_id,
                    ok: false,
                    session: None,
                    state: None,
                    error: Some("no such agent".into()),
                },
                Err(e) => ServerMessage::RestoreResult {
                    id,
                    agent_id,
                    ok: false,
                    session: None,
                    state: None,
                    error: Some(e.to_string()),
                },
            };
            let _ = outbound.send(reply).await;
        }

        ClientMessage::ListHubAgents { id } => {
            let _ = outbound
                .send(ServerMessage::HubAgents {
                    id,
                    agents: state.agents.list(),
                })
                .await;
        }

        ClientMessage::AgentAction {
            id,
            agent_id,
            action,
        } => {
            state.clients.touch_agent(client_id, &agent_id);
            if action == AgentAction::Delete {
                state.browse.close(&agent_id).await;
            }
            let reply = match state.agents.action(&agent_id, action).await {
                Ok(()) => ServerMessage::ActionResult {
                    id,
                    ok: true,
                    error: None,
                },
                Err(e) => ServerMessage::ActionResult {
                    id,
                    ok: false,
                    error: Some(e.to_string()),
                },
            };
            let _ = outbound.send(reply).await;
        }

        ClientMessage::SendMessage { agent_id, text } => {
            state.clients.touch_agent(client_id, &agent_id);
            if let Err(e) = state.agents.post_message(&agent_id, text).await {
                let _ = outbound
                    .send(ServerMessage::Error {
                        id: None,
                        message: e.to_string(),
                    })
                    .await;
            }
        }

        ClientMessage::SubscribeAgent { agent_id } => {
            state.clients.subscribe(client_id, &agent_id);
        }
        ClientMessage::UnsubscribeAgent { agent_id } => {
            state.clients.unsubscribe(client_id, &agent_id);
        }

        // ── Browser-side mirrors ──────────────────────────────────
        ClientMessage::DomStateUpdate { agent_id, state: dom } => {
            let stores = state.runner_deps.stores.stores_for(&agent_id);
            if let Err(e) = stores.state.set("dom", dom) {
                tracing::debug!(agent_id = %agent_id, error = %e, "dom mirror refused");
            }
        }
        ClientMessage::StateWriteThrough {
            agent_id,
            key,
            value,
        } => {
            let stores = state.runner_deps.stores.stores_for(&agent_id);
            if let Err(e) = stores.state.set(&key, value) {
                let _ = outbound
                    .send(ServerMessage::Error {
                        id: None,
                        message: format!("state write-through refused: {e}"),
                    })
                    .await;
            }
        }

        // ── Push ──────────────────────────────────────────────────
        ClientMessage::PushSubscribe { id, subscription } => {
            let reply = match state.push.subscribe(client_id, subscription) {
                Ok(()) => ServerMessage::PushResult {
                    id,
                    ok: true,
                    error: None,
                },
                Err(e) => ServerMessage::PushResult {
                    id,
                    ok: false,
                    error: Some(e),
                },
            };
            let _ = outbound.send(reply).await;
        }
        ClientMessage::PushVerifyPin { id, pin } => {
            let ok = state.push.verify_pin(client_id, &pin);
            let _ = outbound
                .send(ServerMessage::PushResult {
                    id,
                    ok,
                    error: (!ok).then(|| "pin mismatch".into()),
                })
                .await;
        }
        ClientMessage::PushUnsubscribe { id } => {
            let ok = state.push.unsubscribe(client_id);
            let _ = outbound
                .send(ServerMessage::PushResult {
                    id,
                    ok,
                    error: None,
                })
                .await;
        }
        ClientMessage::VisibilityState { visible } => {
            state.push.set_visibility(client_id, visible);
        }

        // ── Correlation completions ───────────────────────────────
        ClientMessage::BrowserToolResult { id, result } => {
            state.router.complete(&id, result);
        }
        ClientMessage::SkillApprovalResponse { id, approved } => {
            state.approvals.resolve(&id, approved);
        }

        // ── Intervene ─────────────────────────────────────────────
        ClientMessage::BrowseInterveneRequest { id, agent_id, mode } => {
            let granted = state.intervene.request(&agent_id, client_id, mode);
            if granted {
                state.agents.intervene_start(&agent_id).await;
                state.clients.touch_agent(client_id, &agent_id);
            }
            let _ = outbound
                .send(ServerMessage::InterveneResult {
                    id,
                    granted,
                    reason: (!granted)
                        .then(|| "another client is already intervening".into()),
                })
                .await;
        }

        ClientMessage::BrowseInterveneInput { agent_id, event } => {
            if state.intervene.record_input(&agent_id, client_id, &event) {
                if let Some(page) = state.browse.get(&agent_id).await {
                    if let Err(e) = page.dispatch_input(&event).await {
                        tracing::debug!(agent_id = %agent_id, error = %e, "input dispatch failed");
                    }
                }
            }
        }

        ClientMessage::BrowseInterveneRelease { id, agent_id } => {
            match state.intervene.release(&agent_id, Some(client_id)) {
                Some(session) => {
                    let snapshot = match state.browse.get(&agent_id).await {
                        Some(page) => Some(page.snapshot().await),
                        None => None,
                    };
                    let note = compose_notification(&session, snapshot.as_deref());
                    state.agents.intervene_end(&agent_id, note).await;
                    state.clients.fanout(
                        &agent_id,
                        &ServerMessage::InterveneEnded {
                            agent_id: agent_id.clone(),
                            reason: "released".into(),
                        },
                    );
                    let _ = outbound
                        .send(ServerMessage::InterveneResult {
                            id,
                            granted: true,
                            reason: None,
                        })
                        .await;
                }
                None => {
                    let _ = outbound
                        .send(ServerMessage::InterveneResult {
                            id,
                            granted: false,
                            reason: Some("no intervention held by this client".into()),
                        })
                        .await;
                }
            }
        }

        // ── Screencast ────────────────────────────────────────────
        ClientMessage::BrowseStreamRequest { id, agent_id } => {
            let token = state.stream_tokens.mint(&agent_id, client_id);
            let host = state
                .config
                .server
                .public_host
                .clone()
                .unwrap_or_else(|| state.config.server.host.clone());
            let scheme = if state.config.server.tls.is_some() {
                "wss"
            } else {
                "ws"
            };
            let _ = outbound
                .send(ServerMessage::StreamToken {
                    id,
                    token,
                    url: format!("{scheme}://{host}:{}/stream", state.config.server.port),
                })
                .await;
        }
        ClientMessage::BrowseStreamStop { id, agent_id } => {
            state.screencast.stop(client_id, &agent_id).await;
            let _ = outbound.send(ServerMessage::StreamStopped { id }).await;
        }
    }
}

/// The `browse` tool surface used by `tool_request`: drive the agent's
/// page directly (navigate, snapshot).
pub async fn exec_browse_tool(
    state: &AppState,
    agent_id: Option<&str>,
    input: &serde_json::Value,
) -> hub_domain::tool::ToolOutcome {
    use hub_domain::tool::ToolOutcome;

    let Some(agent_id) = agent_id else {
        return ToolOutcome::error("browse requires an agent id");
    };
    if !state.browse.enabled() {
        return ToolOutcome::error("browse is not enabled on this hub");
    }
    let action = input
        .get("action")
        .and_then(|v| v.as_str())
        .unwrap_or("snapshot");
    match action {
        "navigate" => {
            let Some(url) = input.get("url").and_then(|v| v.as_str()) else {
                return ToolOutcome::error("navigate requires a url");
            };
            match state.browse.ensure(agent_id).await {
                Ok(page) => match page
                    .conn
                    .command(
                        "Page.navigate",
                        json!({ "url": url }),
                        Some(&page.session_id),
                    )
                    .await
                {
                    Ok(_) => ToolOutcome::ok(format!("navigated to {url}")),
                    Err(e) => ToolOutcome::error(e.to_string()),
                },
                Err(e) => ToolOutcome::error(e.to_string()),
            }
        }
        "snapshot" => match state.browse.ensure(agent_id).await {
            Ok(page) => ToolOutcome::ok(page.snapshot().await),
            Err(e) => ToolOutcome::error(e.to_string()),
        },
        other => ToolOutcome::error(format!("unknown browse action: {other}")),
    }
}

//! The screencast stream server: a dedicated WebSocket endpoint that
//! carries binary frames to one viewer.
//!
//! Authentication uses single-use tokens minted by the hub in response
//! to `browse_stream_request`. A token is bound to one
//! `(agent_id, client_id)` pair and expires unused after one minute.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use hub_protocol::StreamClientMessage;

use crate::state::AppState;

const TOKEN_TTL: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// One-shot tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TokenEntry {
    agent_id: String,
    client_id: String,
    minted_at: Instant,
}

#[derive(Default)]
pub struct StreamTokenStore {
    tokens: Mutex<HashMap<String, TokenEntry>>,
}

impl StreamTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&self, agent_id: &str, client_id: &str) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.tokens.lock().insert(
            token.clone(),
            TokenEntry {
                agent_id: agent_id.to_string(),
                client_id: client_id.to_string(),
                minted_at: Instant::now(),
            },
        );
        token
    }

    /// Redeem a token. Single use: a second redemption fails.
    pub fn redeem(&self, token: &str) -> Option<(String, String)> {
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, e| e.minted_at.elapsed() < TOKEN_TTL);
        tokens
            .remove(token)
            .map(|e| (e.agent_id, e.client_id))
    }

    /// Revoke every unredeemed token belonging to a client.
    pub fn revoke_for_client(&self, client_id: &str) {
        self.tokens.lock().retain(|_, e| e.client_id != client_id);
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /stream — upgrade to the screencast socket.
pub async fn stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state))
}

async fn handle_stream_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut source) = socket.split();

    // First message must be stream_auth with a redeemable token.
    let auth = tokio::time::timeout(Duration::from_secs(10), source.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = auth else {
        return;
    };
    let Ok(StreamClientMessage::StreamAuth { token }) = serde_json::from_str(&text) else {
        return;
    };
    let Some((agent_id, client_id)) = state.stream_tokens.redeem(&token) else {
        tracing::warn!("stream socket presented an invalid token");
        return;
    };

    let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<u8>>(32);
    if let Err(e) = state
        .screencast
        .start(&client_id, &agent_id, frame_tx)
        .await
    {
        tracing::warn!(agent_id = %agent_id, error = %e, "screencast start failed");
        return;
    }

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                match frame {
                    Some(bytes) => {
                        if sink.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(StreamClientMessage::FrameAck { frame_num }) =
                            serde_json::from_str(&text)
                        {
                            state
                                .screencast
                                .handle_ack(&client_id, &agent_id, frame_num)
                                .await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.screencast.stop(&client_id, &agent_id).await;
}

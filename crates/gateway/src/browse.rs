//! Per-agent browse sessions.
//!
//! When the `browse` tool is enabled, each agent can own one browser
//! page, created lazily over CDP and closed when the agent is deleted.
//! The intervene input executor and the screencast manager both work
//! against these sessions.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use hub_domain::config::BrowseConfig;
use hub_domain::error::{Error, Result};
use hub_protocol::InputEvent;

use crate::cdp::CdpConnection;

pub struct BrowseSession {
    pub agent_id: String,
    pub target_id: String,
    /// Flat CDP session id for the page.
    pub session_id: String,
    pub conn: Arc<CdpConnection>,
}

impl BrowseSession {
    /// Dispatch one human input event to the page.
    pub async fn dispatch_input(&self, event: &InputEvent) -> Result<()> {
        match event {
            InputEvent::MouseMove { x, y } => {
                self.conn
                    .command(
                        "Input.dispatchMouseEvent",
                        json!({ "type": "mouseMoved", "x": x, "y": y }),
                        Some(&self.session_id),
                    )
                    .await?;
            }
            InputEvent::Click { x, y, button } => {
                let button = match button {
                    1 => "middle",
                    2 => "right",
                    _ => "left",
                };
                for kind in ["mousePressed", "mouseReleased"] {
                    self.conn
                        .command(
                            "Input.dispatchMouseEvent",
                            json!({
                                "type": kind,
                                "x": x,
                                "y": y,
                                "button": button,
                                "clickCount": 1,
                            }),
                            Some(&self.session_id),
                        )
                        .await?;
                }
            }
            InputEvent::Scroll { delta_x, delta_y } => {
                self.conn
                    .command(
                        "Input.dispatchMouseEvent",
                        json!({
                            "type": "mouseWheel",
                            "x": 0,
                            "y": 0,
                            "deltaX": delta_x,
                            "deltaY": delta_y,
                        }),
                        Some(&self.session_id),
                    )
                    .await?;
            }
            InputEvent::KeyDown { key } => {
                for kind in ["keyDown", "keyUp"] {
                    self.conn
                        .command(
                            "Input.dispatchKeyEvent",
                            json!({ "type": kind, "key": key }),
                            Some(&self.session_id),
                        )
                        .await?;
                }
            }
            InputEvent::Text { text } => {
                self.conn
                    .command(
                        "Input.insertText",
                        json!({ "text": text }),
                        Some(&self.session_id),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// A terse accessibility-style snapshot of the page for intervene
    /// notifications: URL, title, and visible text (truncated).
    pub async fn snapshot(&self) -> String {
        let expr = "JSON.stringify({url: location.href, title: document.title, \
                    text: (document.body ? document.body.innerText : '').slice(0, 2000)})";
        match self
            .conn
            .command(
                "Runtime.evaluate",
                json!({ "expression": expr, "returnByValue": true }),
                Some(&self.session_id),
            )
            .await
        {
            Ok(result) => result
                .pointer("/result/value")
                .and_then(|v| v.as_str())
                .unwrap_or("{}")
                .to_string(),
            Err(e) => format!("{{\"error\":\"snapshot failed: {e}\"}}"),
        }
    }
}

pub struct BrowseManager {
    config: BrowseConfig,
    conn: Mutex<Option<Arc<CdpConnection>>>,
    sessions: Mutex<HashMap<String, Arc<BrowseSession>>>,
}

impl BrowseManager {
    pub fn new(config: BrowseConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled && self.config.cdp_url.is_some()
    }

    async fn connection(&self) -> Result<Arc<CdpConnection>> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let url = self
            .config
            .cdp_url
            .as_deref()
            .ok_or_else(|| Error::Config("browse.cdp_url is not configured".into()))?;
        let conn = Arc::new(CdpConnection::connect(url).await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Get the agent's page session, creating it on first use.
    pub async fn ensure(&self, agent_id: &str) -> Result<Arc<BrowseSession>> {
        if !self.enabled() {
            return Err(Error::Config("browse is not enabled".into()));
        }
        if let Some(session) = self.sessions.lock().await.get(agent_id) {
            return Ok(session.clone());
        }

        let conn = self.connection().await?;
        let target = conn
            .command(
                "Target.createTarget",
                json!({
                    "url": "about:blank",
                    "width": self.config.viewport.width,
                    "height": self.config.viewport.height,
                }),
                None,
            )
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Other("createTarget returned no targetId".into()))?
            .to_string();
        let attach = conn
            .command(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = attach
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Other("attachToTarget returned no sessionId".into()))?
            .to_string();

        let session = Arc::new(BrowseSession {
            agent_id: agent_id.to_string(),
            target_id,
            session_id,
            conn,
        });
        self.sessions
            .lock()
            .await
            .insert(agent_id.to_string(), session.clone());
        tracing::info!(agent_id = %agent_id, "browse session created");
        Ok(session)
    }

    pub async fn get(&self, agent_id: &str) -> Option<Arc<BrowseSession>> {
        self.sessions.lock().await.get(agent_id).cloned()
    }

    /// Close the agent's page (agent deletion).
    pub async fn close(&self, agent_id: &str) {
        let session = self.sessions.lock().await.remove(agent_id);
        if let Some(session) = session {
            let _ = session
                .conn
                .command(
                    "Target.closeTarget",
                    json!({ "targetId": session.target_id }),
                    None,
                )
                .await;
            tracing::info!(agent_id = %agent_id, "browse session closed");
        }
    }
}

//! Browser tool router — correlates hub-issued tool requests with
//! browser-supplied results.
//!
//! Flow: generate a correlation id, pick the target client (last-active
//! for the agent, else first authenticated), send
//! `browser_tool_request`, await `browser_tool_result` with a timeout.
//! Disconnect of the target client resolves all of its pending entries
//! with an error; after any disconnect the pending map holds nothing
//! for that client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use hub_domain::tool::ToolOutcome;
use hub_protocol::ServerMessage;

use crate::clients::ClientRegistry;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

struct PendingRequest {
    client_id: String,
    tx: oneshot::Sender<ToolOutcome>,
}

pub struct BrowserToolRouter {
    clients: Arc<ClientRegistry>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    timeout: Duration,
}

impl BrowserToolRouter {
    pub fn new(clients: Arc<ClientRegistry>, timeout: Duration) -> Self {
        Self {
            clients,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Round-trip a tool call to a browser. Every failure mode (no
    /// client, send failure, disconnect, timeout) yields an error
    /// outcome rather than an Err.
    pub async fn dispatch(
        &self,
        agent_id: Option<&str>,
        tool_name: &str,
        input: Value,
    ) -> ToolOutcome {
        let Some((client_id, sink)) = self.clients.route_client_for(agent_id) else {
            return ToolOutcome::error(format!(
                "tool {tool_name} requires a connected browser and none is available"
            ));
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                client_id: client_id.clone(),
                tx,
            },
        );

        let msg = ServerMessage::BrowserToolRequest {
            id: request_id.clone(),
            hub_agent_id: agent_id.unwrap_or_default().to_string(),
            tool_name: tool_name.to_string(),
            input,
        };
        if sink.send(msg).await.is_err() {
            self.pending.lock().remove(&request_id);
            return ToolOutcome::error(format!("failed to reach browser client {client_id}"));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                // Sender dropped: the client disconnected and its
                // pending entries were drained.
                ToolOutcome::error(format!(
                    "browser client {client_id} disconnected before responding"
                ))
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                ToolOutcome::error(format!(
                    "browser tool {tool_name} timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        }
    }

    /// Called on `browser_tool_result`. Unknown ids are logged and
    /// dropped (late replies after a timeout).
    pub fn complete(&self, request_id: &str, result: ToolOutcome) {
        match self.pending.lock().remove(request_id) {
            Some(pending) => {
                let _ = pending.tx.send(result);
            }
            None => {
                tracing::warn!(request_id = %request_id, "result for unknown browser tool request");
            }
        }
    }

    /// Drain every pending entry owned by a disconnecting client.
    /// Returns the number of requests failed.
    pub fn fail_pending_for_client(&self, client_id: &str) -> usize {
        let mut pending = self.pending.lock();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.client_id == client_id)
            .map(|(id, _)| id.clone())
            .collect();
        let count = ids.len();
        for id in ids {
            if let Some(p) = pending.remove(&id) {
                let _ = p
                    .tx
                    .send(ToolOutcome::error("browser client disconnected".to_string()));
            }
        }
        if count > 0 {
            tracing::warn!(client_id = %client_id, failed = count, "failed in-flight browser tool requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait::async_trait]
impl hub_tools::executor::BrowserRoute for BrowserToolRouter {
    fn available(&self) -> bool {
        !self.clients.is_empty()
    }

    async fn route(&self, agent_id: Option<&str>, tool_name: &str, input: Value) -> ToolOutcome {
        self.dispatch(agent_id, tool_name, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ConnectedClient;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    fn setup() -> (
        Arc<ClientRegistry>,
        Arc<BrowserToolRouter>,
        mpsc::Receiver<ServerMessage>,
    ) {
        let clients = Arc::new(ClientRegistry::new());
        let (tx, rx) = mpsc::channel(16);
        clients.register(ConnectedClient {
            client_id: "c1".into(),
            remote_addr: [127, 0, 0, 1].into(),
            connected_at: chrono::Utc::now(),
            sink: tx,
            subscriptions: HashSet::new(),
        });
        let router = Arc::new(BrowserToolRouter::new(
            clients.clone(),
            Duration::from_millis(200),
        ));
        (clients, router, rx)
    }

    #[tokio::test]
    async fn dispatch_completes_via_result() {
        let (_clients, router, mut rx) = setup();

        let router_clone = router.clone();
        let responder = tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            let ServerMessage::BrowserToolRequest { id, tool_name, .. } = msg else {
                panic!("expected browser_tool_request");
            };
            assert_eq!(tool_name, "dom");
            router_clone.complete(&id, ToolOutcome::ok("clicked"));
        });

        let outcome = router
            .dispatch(Some("a1"), "dom", serde_json::json!({}))
            .await;
        responder.await.unwrap();
        assert!(!outcome.is_error);
        assert_eq!(outcome.content, "clicked");
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_times_out() {
        let (_clients, router, _rx) = setup();
        let outcome = router
            .dispatch(Some("a1"), "dom", serde_json::json!({}))
            .await;
        assert!(outcome.is_error);
        assert!(outcome.content.contains("timed out"));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn no_client_yields_error() {
        let clients = Arc::new(ClientRegistry::new());
        let router = BrowserToolRouter::new(clients, Duration::from_secs(1));
        let outcome = router.dispatch(None, "dom", serde_json::json!({})).await;
        assert!(outcome.is_error);
        assert!(outcome.content.contains("connected browser"));
    }

    #[tokio::test]
    async fn disconnect_drains_pending() {
        let (_clients, router, mut rx) = setup();

        let router_clone = router.clone();
        let disconnector = tokio::spawn(async move {
            let _ = rx.recv().await;
            assert_eq!(router_clone.pending_count(), 1);
            router_clone.fail_pending_for_client("c1");
        });

        let outcome = router
            .dispatch(Some("a1"), "dom", serde_json::json!({}))
            .await;
        disconnector.await.unwrap();
        assert!(outcome.is_error);
        assert!(outcome.content.contains("disconnected"));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_result_is_ignored() {
        let (_clients, router, _rx) = setup();
        // No pending entry with this id.
        router.complete("ghost", ToolOutcome::ok("late"));
        assert_eq!(router.pending_count(), 0);
    }
}

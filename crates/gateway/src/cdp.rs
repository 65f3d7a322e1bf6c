//! Minimal Chrome DevTools Protocol client over WebSocket.
//!
//! One connection per browser endpoint. Commands are id-correlated
//! request/reply pairs; events fan out on a broadcast channel. The
//! intervene input executor, the browse session manager, and the
//! screencast manager all share this layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use hub_domain::error::{Error, Result};

/// A protocol event (a message without an `id`).
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
    /// Flat-session id the event belongs to, when any.
    pub session_id: Option<String>,
}

pub struct CdpConnection {
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>,
    outbound: mpsc::Sender<String>,
    events: broadcast::Sender<CdpEvent>,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl CdpConnection {
    /// Connect to a CDP WebSocket endpoint
    /// (e.g. `ws://127.0.0.1:9222/devtools/browser/<id>`).
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Other(format!("cdp connect {url}: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(64);
        let (events, _) = broadcast::channel(256);
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let pending_reader = pending.clone();
        let events_reader = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                let Message::Text(text) = msg else { continue };
                let Ok(v) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if let Some(id) = v.get("id").and_then(|i| i.as_u64()) {
                    if let Some(tx) = pending_reader.lock().remove(&id) {
                        let result = match v.get("error") {
                            Some(err) => Err(Error::Other(format!("cdp error: {err}"))),
                            None => Ok(v.get("result").cloned().unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(result);
                    }
                } else if let Some(method) = v.get("method").and_then(|m| m.as_str()) {
                    let _ = events_reader.send(CdpEvent {
                        method: method.to_string(),
                        params: v.get("params").cloned().unwrap_or(Value::Null),
                        session_id: v
                            .get("sessionId")
                            .and_then(|s| s.as_str())
                            .map(str::to_owned),
                    });
                }
            }
            // Connection closed: fail everything still waiting.
            let mut map = pending_reader.lock();
            for (_, tx) in map.drain() {
                let _ = tx.send(Err(Error::Other("cdp connection closed".into())));
            }
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            events,
            reader,
            writer,
        })
    }

    /// Send a command, optionally bound to a flat session, and await
    /// its result.
    pub async fn command(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut msg = json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session_id {
            msg["sessionId"] = Value::String(session.to_string());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.outbound.send(msg.to_string()).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::Other("cdp connection closed".into()));
        }

        match tokio::time::timeout(std::time::Duration::from_secs(30), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Other("cdp connection closed".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::Timeout(format!("cdp command {method} timed out")))
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A tiny CDP-ish server: replies `{"id":N,"result":{"echo":...}}`
    /// to every command and pushes one event after the first command.
    async fn spawn_fake_cdp() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            while let Some(Ok(Message::Text(text))) = source.next().await {
                let v: Value = serde_json::from_str(&text).unwrap();
                let id = v["id"].as_u64().unwrap();
                let reply = json!({ "id": id, "result": { "echo": v["method"] } });
                sink.send(Message::Text(reply.to_string())).await.unwrap();
                let event = json!({
                    "method": "Page.screencastFrame",
                    "params": { "sessionId": 7 },
                    "sessionId": "page-1",
                });
                sink.send(Message::Text(event.to_string())).await.unwrap();
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn command_roundtrip_and_events() {
        let url = spawn_fake_cdp().await;
        let conn = CdpConnection::connect(&url).await.unwrap();
        let mut events = conn.subscribe();

        let result = conn
            .command("Page.enable", json!({}), Some("page-1"))
            .await
            .unwrap();
        assert_eq!(result["echo"], "Page.enable");

        let event = events.recv().await.unwrap();
        assert_eq!(event.method, "Page.screencastFrame");
        assert_eq!(event.session_id.as_deref(), Some("page-1"));
        assert_eq!(event.params["sessionId"], 7);
    }

    #[tokio::test]
    async fn concurrent_commands_correlate() {
        let url = spawn_fake_cdp().await;
        let conn = Arc::new(CdpConnection::connect(&url).await.unwrap());

        let a = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.command("A.a", json!({}), None).await })
        };
        let b = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.command("B.b", json!({}), None).await })
        };
        assert_eq!(a.await.unwrap().unwrap()["echo"], "A.a");
        assert_eq!(b.await.unwrap().unwrap()["echo"], "B.b");
    }
}

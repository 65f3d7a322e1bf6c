//! Registry of authenticated WebSocket clients and their agent
//! subscriptions.
//!
//! Each connected client has an outbound channel drained by its socket
//! writer task, a subscription set, and per-agent last-activity
//! tracking used by the browser tool router to pick a target.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use hub_protocol::ServerMessage;

pub type ClientSink = mpsc::Sender<ServerMessage>;

pub struct ConnectedClient {
    pub client_id: String,
    pub remote_addr: std::net::IpAddr,
    pub connected_at: DateTime<Utc>,
    pub sink: ClientSink,
    pub subscriptions: HashSet<String>,
}

pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ConnectedClient>>,
    /// agent_id → client_id that most recently acted on the agent.
    last_active: RwLock<HashMap<String, String>>,
    /// Registration order, for first-authenticated fallback routing.
    order: RwLock<Vec<String>>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            last_active: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, client: ConnectedClient) {
        let id = client.client_id.clone();
        tracing::info!(client_id = %id, addr = %client.remote_addr, "client authenticated");
        self.order.write().push(id.clone());
        self.clients.write().insert(id, client);
    }

    /// Remove a client and return the agent ids it was subscribed to.
    /// The removal is atomic with respect to fan-out: after this
    /// returns, no further events reach the client.
    pub fn remove(&self, client_id: &str) -> Vec<String> {
        self.order.write().retain(|id| id != client_id);
        self.last_active
            .write()
            .retain(|_, cid| cid != client_id);
        match self.clients.write().remove(client_id) {
            Some(client) => {
                tracing::info!(client_id = %client_id, "client removed");
                client.subscriptions.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn subscribe(&self, client_id: &str, agent_id: &str) -> bool {
        let mut clients = self.clients.write();
        match clients.get_mut(client_id) {
            Some(client) => {
                client.subscriptions.insert(agent_id.to_string());
                drop(clients);
                self.touch_agent(client_id, agent_id);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, client_id: &str, agent_id: &str) -> bool {
        let mut clients = self.clients.write();
        match clients.get_mut(client_id) {
            Some(client) => client.subscriptions.remove(agent_id),
            None => false,
        }
    }

    /// Record that a client acted on an agent (message sent, tool
    /// request, subscription). Used for routing.
    pub fn touch_agent(&self, client_id: &str, agent_id: &str) {
        self.last_active
            .write()
            .insert(agent_id.to_string(), client_id.to_string());
    }

    /// The client browser-bound traffic for an agent should go to: the
    /// last-active client for the agent, or the first authenticated
    /// client.
    pub fn route_client_for(&self, agent_id: Option<&str>) -> Option<(String, ClientSink)> {
        let clients = self.clients.read();
        if let Some(agent_id) = agent_id {
            if let Some(client_id) = self.last_active.read().get(agent_id) {
                if let Some(client) = clients.get(client_id) {
                    return Some((client.client_id.clone(), client.sink.clone()));
                }
            }
        }
        let order = self.order.read();
        order
            .iter()
            .find_map(|id| clients.get(id))
            .map(|c| (c.client_id.clone(), c.sink.clone()))
    }

    pub fn sink_for(&self, client_id: &str) -> Option<ClientSink> {
        self.clients.read().get(client_id).map(|c| c.sink.clone())
    }

    /// Fan an event out to every client subscribed to an agent.
    pub fn fanout(&self, agent_id: &str, message: &ServerMessage) {
        let clients = self.clients.read();
        for client in clients.values() {
            if client.subscriptions.contains(agent_id) {
                // try_send: a slow client drops events rather than
                // stalling the runner.
                if client.sink.try_send(message.clone()).is_err() {
                    tracing::debug!(
                        client_id = %client.client_id,
                        agent_id = %agent_id,
                        "dropping event for slow client"
                    );
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_client(id: &str) -> (ConnectedClient, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ConnectedClient {
                client_id: id.into(),
                remote_addr: [127, 0, 0, 1].into(),
                connected_at: Utc::now(),
                sink: tx,
                subscriptions: HashSet::new(),
            },
            rx,
        )
    }

    #[test]
    fn subscribe_and_fanout() {
        let registry = ClientRegistry::new();
        let (c1, mut rx1) = make_client("c1");
        let (c2, mut rx2) = make_client("c2");
        registry.register(c1);
        registry.register(c2);
        registry.subscribe("c1", "agent-a");

        let msg = ServerMessage::AgentEventMsg {
            agent_id: "agent-a".into(),
            event: hub_protocol::AgentEvent::TextDelta { text: "x".into() },
        };
        registry.fanout("agent-a", &msg);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn remove_returns_subscriptions_and_stops_fanout() {
        let registry = ClientRegistry::new();
        let (c1, mut rx1) = make_client("c1");
        registry.register(c1);
        registry.subscribe("c1", "a");
        registry.subscribe("c1", "b");

        let mut subs = registry.remove("c1");
        subs.sort();
        assert_eq!(subs, vec!["a", "b"]);

        registry.fanout("a", &ServerMessage::AgentEventMsg {
            agent_id: "a".into(),
            event: hub_protocol::AgentEvent::TextDelta { text: "x".into() },
        });
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn routing_prefers_last_active_then_first() {
        let registry = ClientRegistry::new();
        let (c1, _rx1) = make_client("c1");
        let (c2, _rx2) = make_client("c2");
        registry.register(c1);
        registry.register(c2);

        // No activity: first authenticated client wins.
        let (id, _) = registry.route_client_for(Some("agent-a")).unwrap();
        assert_eq!(id, "c1");

        registry.touch_agent("c2", "agent-a");
        let (id, _) = registry.route_client_for(Some("agent-a")).unwrap();
        assert_eq!(id, "c2");

        // Removing the last-active client falls back to the first.
        registry.remove("c2");
        let (id, _) = registry.route_client_for(Some("agent-a")).unwrap();
        assert_eq!(id, "c1");
    }

    #[test]
    fn route_none_when_no_clients() {
        let registry = ClientRegistry::new();
        assert!(registry.route_client_for(Some("a")).is_none());
        assert!(registry.route_client_for(None).is_none());
    }
}

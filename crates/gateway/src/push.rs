//! Push manager — per-client push subscriptions with PIN verification
//! and visibility tracking.
//!
//! A subscription arrives unverified; the hub derives a six-digit PIN
//! from the auth token and the client id, the trusted surface displays
//! it, and `push_verify_pin` activates the subscription. Visibility
//! state gates notification fan-out: visible clients are reached over
//! their socket, hidden clients through their push subscription.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

struct Subscription {
    subscription: Value,
    verified: bool,
}

pub struct PushManager {
    /// VAPID configuration. Delivery goes through the subscription
    /// endpoint this signs for; absent config disables push entirely.
    vapid: Option<hub_domain::config::PushConfig>,
    auth_token: String,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    visibility: Mutex<HashMap<String, bool>>,
}

impl PushManager {
    pub fn new(vapid: Option<hub_domain::config::PushConfig>, auth_token: String) -> Self {
        Self {
            vapid,
            auth_token,
            subscriptions: Mutex::new(HashMap::new()),
            visibility: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.vapid.is_some()
    }

    /// Derive the verification PIN for a client.
    pub fn pin_for(&self, client_id: &str) -> String {
        let digest = Sha256::digest(format!("{}:{}", self.auth_token, client_id).as_bytes());
        let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 1_000_000;
        format!("{n:06}")
    }

    /// Store an unverified subscription. Returns an error message when
    /// push is not configured.
    pub fn subscribe(&self, client_id: &str, subscription: Value) -> Result<(), String> {
        if !self.enabled() {
            return Err("push is not configured on this hub".into());
        }
        self.subscriptions.lock().insert(
            client_id.to_string(),
            Subscription {
                subscription,
                verified: false,
            },
        );
        Ok(())
    }

    /// Verify a subscription with the PIN shown on the trusted surface.
    pub fn verify_pin(&self, client_id: &str, pin: &str) -> bool {
        let expected = self.pin_for(client_id);
        let mut subscriptions = self.subscriptions.lock();
        match subscriptions.get_mut(client_id) {
            Some(sub) if pin == expected => {
                sub.verified = true;
                tracing::info!(client_id = %client_id, "push subscription verified");
                true
            }
            _ => false,
        }
    }

    pub fn unsubscribe(&self, client_id: &str) -> bool {
        self.subscriptions.lock().remove(client_id).is_some()
    }

    pub fn set_visibility(&self, client_id: &str, visible: bool) {
        self.visibility
            .lock()
            .insert(client_id.to_string(), visible);
    }

    pub fn is_visible(&self, client_id: &str) -> bool {
        self.visibility
            .lock()
            .get(client_id)
            .copied()
            .unwrap_or(true)
    }

    /// Verified subscriptions for clients that are currently hidden
    /// (push is only useful when the page cannot show the event).
    pub fn deliverable_subscriptions(&self) -> Vec<(String, Value)> {
        let visibility = self.visibility.lock();
        self.subscriptions
            .lock()
            .iter()
            .filter(|(_, s)| s.verified)
            .filter(|(client_id, _)| !visibility.get(*client_id).copied().unwrap_or(true))
            .map(|(client_id, s)| (client_id.clone(), s.subscription.clone()))
            .collect()
    }

    /// Forget a disconnecting client's visibility state (its
    /// subscription survives reconnects).
    pub fn client_disconnected(&self, client_id: &str) {
        self.visibility.lock().remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> PushManager {
        PushManager::new(
            Some(hub_domain::config::PushConfig {
                vapid_public_key: "pub".into(),
                vapid_private_key: "priv".into(),
                subject: None,
            }),
            "secret".into(),
        )
    }

    #[test]
    fn pin_verification_flow() {
        let mgr = manager();
        mgr.subscribe("c1", json!({"endpoint": "https://push.example/x"}))
            .unwrap();
        assert!(!mgr.verify_pin("c1", "000000") || mgr.pin_for("c1") == "000000");
        let pin = mgr.pin_for("c1");
        assert!(mgr.verify_pin("c1", &pin));
        // Unknown client never verifies.
        assert!(!mgr.verify_pin("ghost", &pin));
    }

    #[test]
    fn pins_differ_per_client() {
        let mgr = manager();
        assert_ne!(mgr.pin_for("c1"), mgr.pin_for("c2"));
    }

    #[test]
    fn unconfigured_push_refuses_subscriptions() {
        let mgr = PushManager::new(None, "secret".into());
        assert!(mgr.subscribe("c1", json!({})).is_err());
    }

    #[test]
    fn delivery_targets_hidden_verified_clients() {
        let mgr = manager();
        mgr.subscribe("c1", json!({"endpoint": "e1"})).unwrap();
        mgr.subscribe("c2", json!({"endpoint": "e2"})).unwrap();
        let pin = mgr.pin_for("c1");
        mgr.verify_pin("c1", &pin);

        // Both visible: nothing to push.
        assert!(mgr.deliverable_subscriptions().is_empty());

        mgr.set_visibility("c1", false);
        mgr.set_visibility("c2", false);
        // Only the verified hidden client is deliverable.
        let targets = mgr.deliverable_subscriptions();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "c1");
    }
}

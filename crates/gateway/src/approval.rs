//! Pending skill approvals — correlation-id slots resolved by
//! `skill_approval_response`.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ApprovalStore {
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    timeout: Duration,
}

impl Default for ApprovalStore {
    fn default() -> Self {
        Self::new(APPROVAL_TIMEOUT)
    }
}

impl ApprovalStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a pending approval and wait for its resolution.
    /// Returns `false` on timeout or if the responder disappears.
    pub async fn wait(&self, id: String) -> bool {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(approved)) => approved,
            _ => {
                self.pending.lock().remove(&id);
                false
            }
        }
    }

    /// Resolve a pending approval. Returns `true` if it existed.
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        match self.pending.lock().remove(id) {
            Some(tx) => {
                let _ = tx.send(approved);
                true
            }
            None => false,
        }
    }

    /// Deny everything a disconnecting client could have answered.
    pub fn deny_all(&self) {
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(false);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_unblocks_waiter() {
        let store = std::sync::Arc::new(ApprovalStore::new(Duration::from_secs(5)));
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait("ap1".into()).await })
        };
        // Give the waiter time to register.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.resolve("ap1", true));
        assert!(waiter.await.unwrap());
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_denies() {
        let store = ApprovalStore::new(Duration::from_millis(20));
        assert!(!store.wait("ap1".into()).await);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_resolution_is_noop() {
        let store = ApprovalStore::default();
        assert!(!store.resolve("ghost", true));
    }
}

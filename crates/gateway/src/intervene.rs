//! Intervene manager — lets a human pause an agent and hand-drive its
//! browser page.
//!
//! At most one intervention per agent. `visible` sessions record a
//! summarized input log (consecutive mouse moves collapse to the last
//! position, consecutive scrolls to a net delta); `private` sessions
//! never record event details. A background sweep expires sessions idle
//! past the timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use hub_protocol::{InputEvent, InterveneMode};

pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One collapsed entry in a visible session's event log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    MouseMove { x: f64, y: f64 },
    Click { x: f64, y: f64, button: u8 },
    Scroll { delta_x: f64, delta_y: f64 },
    Key { key: String },
    Text,
}

#[derive(Debug, Clone)]
pub struct InterveneSession {
    pub agent_id: String,
    pub client_id: String,
    pub mode: InterveneMode,
    pub started_at: DateTime<Utc>,
    pub last_activity: Instant,
    pub event_log: Vec<LogEntry>,
}

pub struct InterveneManager {
    sessions: Mutex<HashMap<String, InterveneSession>>,
    timeout: Duration,
}

impl Default for InterveneManager {
    fn default() -> Self {
        Self::new(INACTIVITY_TIMEOUT)
    }
}

impl InterveneManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Request an intervention. Returns `false` when the agent already
    /// has an intervener.
    pub fn request(&self, agent_id: &str, client_id: &str, mode: InterveneMode) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(agent_id) {
            return false;
        }
        sessions.insert(
            agent_id.to_string(),
            InterveneSession {
                agent_id: agent_id.to_string(),
                client_id: client_id.to_string(),
                mode,
                started_at: Utc::now(),
                last_activity: Instant::now(),
                event_log: Vec::new(),
            },
        );
        tracing::info!(agent_id = %agent_id, client_id = %client_id, ?mode, "intervention started");
        true
    }

    /// Record an input event from the intervener. Returns `false` when
    /// the client does not hold the intervention.
    pub fn record_input(&self, agent_id: &str, client_id: &str, event: &InputEvent) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(agent_id) else {
            return false;
        };
        if session.client_id != client_id {
            return false;
        }
        session.last_activity = Instant::now();
        if session.mode == InterveneMode::Private {
            // Never record details in private mode.
            return true;
        }

        match event {
            InputEvent::MouseMove { x, y } => {
                if let Some(LogEntry::MouseMove { x: lx, y: ly }) = session.event_log.last_mut() {
                    *lx = *x;
                    *ly = *y;
                } else {
                    session.event_log.push(LogEntry::MouseMove { x: *x, y: *y });
                }
            }
            InputEvent::Scroll { delta_x, delta_y } => {
                if let Some(LogEntry::Scroll {
                    delta_x: dx,
                    delta_y: dy,
                }) = session.event_log.last_mut()
                {
                    *dx += *delta_x;
                    *dy += *delta_y;
                } else {
                    session.event_log.push(LogEntry::Scroll {
                        delta_x: *delta_x,
                        delta_y: *delta_y,
                    });
                }
            }
            InputEvent::Click { x, y, button } => {
                session.event_log.push(LogEntry::Click {
                    x: *x,
                    y: *y,
                    button: *button,
                });
            }
            InputEvent::KeyDown { key } => {
                session.event_log.push(LogEntry::Key { key: key.clone() });
            }
            InputEvent::Text { .. } => {
                session.event_log.push(LogEntry::Text);
            }
        }
        true
    }

    /// Release an intervention. `client_id` must match the holder;
    /// a system-initiated release supplies `None`.
    pub fn release(&self, agent_id: &str, client_id: Option<&str>) -> Option<InterveneSession> {
        let mut sessions = self.sessions.lock();
        match sessions.get(agent_id) {
            Some(session) => {
                if let Some(requester) = client_id {
                    if session.client_id != requester {
                        return None;
                    }
                }
                let session = sessions.remove(agent_id);
                tracing::info!(agent_id = %agent_id, "intervention released");
                session
            }
            None => None,
        }
    }

    /// Release every intervention held by a disconnecting client.
    pub fn release_all_for_client(&self, client_id: &str) -> Vec<InterveneSession> {
        let mut sessions = self.sessions.lock();
        let ids: Vec<String> = sessions
            .values()
            .filter(|s| s.client_id == client_id)
            .map(|s| s.agent_id.clone())
            .collect();
        ids.iter().filter_map(|id| sessions.remove(id)).collect()
    }

    /// Remove and return every session idle past the timeout.
    pub fn sweep_expired(&self) -> Vec<InterveneSession> {
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| now.duration_since(s.last_activity) > self.timeout)
            .map(|s| s.agent_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| {
                tracing::info!(agent_id = %id, "intervention expired");
                sessions.remove(id)
            })
            .collect()
    }

    pub fn active(&self, agent_id: &str) -> bool {
        self.sessions.lock().contains_key(agent_id)
    }
}

/// Compose the notification injected into the runner when an
/// intervention ends: the event summary (or a hidden-input marker) plus
/// a fresh page snapshot.
pub fn compose_notification(session: &InterveneSession, snapshot: Option<&str>) -> String {
    let mut out = String::from("A human operator intervened on your browser page.\n");
    match session.mode {
        InterveneMode::Private => {
            out.push_str("Input details were hidden (private mode).\n");
        }
        InterveneMode::Visible => {
            if session.event_log.is_empty() {
                out.push_str("No input was performed.\n");
            } else {
                out.push_str("Actions performed:\n");
                for entry in &session.event_log {
                    match entry {
                        LogEntry::MouseMove { x, y } => {
                            out.push_str(&format!("- mouse moved to ({x:.0}, {y:.0})\n"));
                        }
                        LogEntry::Click { x, y, .. } => {
                            out.push_str(&format!("- click at ({x:.0}, {y:.0})\n"));
                        }
                        LogEntry::Scroll { delta_x, delta_y } => {
                            out.push_str(&format!(
                                "- scrolled by ({delta_x:.0}, {delta_y:.0})\n"
                            ));
                        }
                        LogEntry::Key { key } => {
                            out.push_str(&format!("- pressed {key}\n"));
                        }
                        LogEntry::Text => out.push_str("- typed text\n"),
                    }
                }
            }
        }
    }
    if let Some(snapshot) = snapshot {
        out.push_str("Current page snapshot:\n");
        out.push_str(snapshot);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mv(x: f64, y: f64) -> InputEvent {
        InputEvent::MouseMove { x, y }
    }

    #[test]
    fn single_intervener_per_agent() {
        let mgr = InterveneManager::default();
        assert!(mgr.request("a1", "c1", InterveneMode::Visible));
        assert!(!mgr.request("a1", "c2", InterveneMode::Visible));
        // A different agent is independent.
        assert!(mgr.request("a2", "c2", InterveneMode::Private));
    }

    #[test]
    fn release_requires_matching_client() {
        let mgr = InterveneManager::default();
        mgr.request("a1", "c1", InterveneMode::Visible);
        assert!(mgr.release("a1", Some("c2")).is_none());
        assert!(mgr.active("a1"));
        assert!(mgr.release("a1", Some("c1")).is_some());
        assert!(!mgr.active("a1"));

        // System release needs no client id.
        mgr.request("a1", "c1", InterveneMode::Visible);
        assert!(mgr.release("a1", None).is_some());
    }

    #[test]
    fn mousemoves_collapse_clicks_do_not() {
        let mgr = InterveneManager::default();
        mgr.request("a1", "c1", InterveneMode::Visible);
        for i in 0..200 {
            mgr.record_input("a1", "c1", &mv(i as f64, i as f64));
        }
        for _ in 0..3 {
            mgr.record_input(
                "a1",
                "c1",
                &InputEvent::Click {
                    x: 10.0,
                    y: 20.0,
                    button: 0,
                },
            );
        }
        let session = mgr.release("a1", Some("c1")).unwrap();
        let moves = session
            .event_log
            .iter()
            .filter(|e| matches!(e, LogEntry::MouseMove { .. }))
            .count();
        let clicks = session
            .event_log
            .iter()
            .filter(|e| matches!(e, LogEntry::Click { .. }))
            .count();
        assert_eq!(moves, 1);
        assert_eq!(clicks, 3);
        assert_eq!(
            session.event_log[0],
            LogEntry::MouseMove { x: 199.0, y: 199.0 }
        );

        let note = compose_notification(&session, None);
        assert_eq!(note.matches("- click at").count(), 3);
        assert_eq!(note.matches("- mouse moved to").count(), 1);
    }

    #[test]
    fn scrolls_collapse_to_net_delta() {
        let mgr = InterveneManager::default();
        mgr.request("a1", "c1", InterveneMode::Visible);
        for _ in 0..5 {
            mgr.record_input(
                "a1",
                "c1",
                &InputEvent::Scroll {
                    delta_x: 0.0,
                    delta_y: 10.0,
                },
            );
        }
        let session = mgr.release("a1", Some("c1")).unwrap();
        assert_eq!(
            session.event_log,
            vec![LogEntry::Scroll {
                delta_x: 0.0,
                delta_y: 50.0
            }]
        );
    }

    #[test]
    fn private_mode_records_nothing() {
        let mgr = InterveneManager::default();
        mgr.request("a1", "c1", InterveneMode::Private);
        mgr.record_input("a1", "c1", &mv(1.0, 2.0));
        mgr.record_input(
            "a1",
            "c1",
            &InputEvent::Text {
                text: "secret password".into(),
            },
        );
        let session = mgr.release("a1", Some("c1")).unwrap();
        assert!(session.event_log.is_empty());
        let note = compose_notification(&session, None);
        assert!(note.contains("hidden"));
        assert!(!note.contains("secret"));
    }

    #[test]
    fn wrong_client_input_rejected() {
        let mgr = InterveneManager::default();
        mgr.request("a1", "c1", InterveneMode::Visible);
        assert!(!mgr.record_input("a1", "c2", &mv(1.0, 1.0)));
        assert!(!mgr.record_input("ghost", "c1", &mv(1.0, 1.0)));
    }

    #[test]
    fn sweep_expires_idle_sessions() {
        let mgr = InterveneManager::new(Duration::from_millis(0));
        mgr.request("a1", "c1", InterveneMode::Visible);
        std::thread::sleep(Duration::from_millis(5));
        let expired = mgr.sweep_expired();
        assert_eq!(expired.len(), 1);
        assert!(!mgr.active("a1"));
    }

    #[test]
    fn disconnect_releases_client_sessions() {
        let mgr = InterveneManager::default();
        mgr.request("a1", "c1", InterveneMode::Visible);
        mgr.request("a2", "c1", InterveneMode::Private);
        mgr.request("a3", "c2", InterveneMode::Visible);
        let released = mgr.release_all_for_client("c1");
        assert_eq!(released.len(), 2);
        assert!(mgr.active("a3"));
    }
}

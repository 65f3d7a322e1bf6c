//! Screencast manager — per-client CDP screencasts with adaptive
//! quality.
//!
//! For each `(client_id, agent_id)` pair the manager starts a CDP
//! screencast on the agent's page and forwards every frame as a binary
//! message over the stream server socket. Acks reference the
//! hub-assigned frame number; the manager maps them back to the CDP
//! session id for `Page.screencastFrameAck` and measures round-trip
//! time to steer JPEG quality.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use hub_domain::config::Viewport;
use hub_domain::error::Result;
use hub_protocol::frame::{encode, ScreencastFrame};

use crate::browse::{BrowseManager, BrowseSession};

pub const MIN_QUALITY: u8 = 20;
pub const MAX_QUALITY: u8 = 80;
pub const INITIAL_QUALITY: u8 = 60;
pub const MAX_PENDING_FRAMES: usize = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adaptive quality
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// RTT buckets: fast acks push quality up, slow acks push it down.
pub fn quality_delta(rtt: Duration) -> i32 {
    let ms = rtt.as_millis();
    if ms < 50 {
        5
    } else if ms < 100 {
        2
    } else if ms > 300 {
        -10
    } else if ms > 200 {
        -5
    } else {
        0
    }
}

pub fn clamp_quality(quality: i32) -> u8 {
    quality.clamp(MIN_QUALITY as i32, MAX_QUALITY as i32) as u8
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending frame tracking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct PendingFrame {
    pub cdp_ack_id: i64,
    pub sent_at: Instant,
}

/// Send-ordered pending frames, capped so a stalled client cannot grow
/// the map without bound. Acks arrive in any order.
#[derive(Default)]
pub struct PendingFrames {
    entries: VecDeque<(u32, PendingFrame)>,
}

impl PendingFrames {
    pub fn insert(&mut self, frame_num: u32, frame: PendingFrame) {
        while self.entries.len() >= MAX_PENDING_FRAMES {
            self.entries.pop_front();
        }
        self.entries.push_back((frame_num, frame));
    }

    pub fn take(&mut self, frame_num: u32) -> Option<PendingFrame> {
        let pos = self.entries.iter().position(|(n, _)| *n == frame_num)?;
        self.entries.remove(pos).map(|(_, f)| f)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cast sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CastSession {
    pub client_id: String,
    pub agent_id: String,
    page: Arc<BrowseSession>,
    quality: Mutex<u8>,
    next_frame: AtomicU32,
    pending: Mutex<PendingFrames>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CastSession {
    async fn start_screencast(&self, viewport: Viewport, quality: u8) -> Result<()> {
        self.page
            .conn
            .command(
                "Page.startScreencast",
                json!({
                    "format": "jpeg",
                    "quality": quality,
                    "maxWidth": viewport.width,
                    "maxHeight": viewport.height,
                    "everyNthFrame": 1,
                }),
                Some(&self.page.session_id),
            )
            .await?;
        Ok(())
    }
}

pub struct ScreencastManager {
    browse: Arc<BrowseManager>,
    viewport: Viewport,
    sessions: Mutex<HashMap<(String, String), Arc<CastSession>>>,
}

impl ScreencastManager {
    pub fn new(browse: Arc<BrowseManager>, viewport: Viewport) -> Self {
        Self {
            browse,
            viewport,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a screencast for one client. Frames are pushed onto
    /// `frame_tx` as encoded binary messages.
    pub async fn start(
        &self,
        client_id: &str,
        agent_id: &str,
        frame_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let page = self.browse.ensure(agent_id).await?;
        let session = Arc::new(CastSession {
            client_id: client_id.to_string(),
            agent_id: agent_id.to_string(),
            page: page.clone(),
            quality: Mutex::new(INITIAL_QUALITY),
            next_frame: AtomicU32::new(1),
            pending: Mutex::new(PendingFrames::default()),
            pump: Mutex::new(None),
        });

        session.start_screencast(self.viewport, INITIAL_QUALITY).await?;

        // Frame pump: CDP screencastFrame events → binary frames.
        let pump_session = session.clone();
        let mut events = page.conn.subscribe();
        let pump = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.method != "Page.screencastFrame"
                    || event.session_id.as_deref() != Some(&pump_session.page.session_id)
                {
                    continue;
                }
                let Some(data) = event.params.get("data").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Ok(jpeg) = base64::engine::general_purpose::STANDARD.decode(data) else {
                    continue;
                };
                let ack_id = event
                    .params
                    .get("sessionId")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                let width = event
                    .params
                    .pointer("/metadata/deviceWidth")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u16;
                let height = event
                    .params
                    .pointer("/metadata/deviceHeight")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u16;

                let frame_num = pump_session.next_frame.fetch_add(1, Ordering::Relaxed);
                let quality = *pump_session.quality.lock();
                pump_session.pending.lock().insert(
                    frame_num,
                    PendingFrame {
                        cdp_ack_id: ack_id,
                        sent_at: Instant::now(),
                    },
                );

                let bytes = encode(&ScreencastFrame {
                    frame_num,
                    width,
                    height,
                    quality,
                    jpeg,
                });
                if frame_tx.send(bytes).await.is_err() {
                    // Viewer socket closed.
                    break;
                }
            }
        });
        *session.pump.lock() = Some(pump);

        self.sessions
            .lock()
            .insert((client_id.to_string(), agent_id.to_string()), session);
        tracing::info!(client_id = %client_id, agent_id = %agent_id, "screencast started");
        Ok(())
    }

    /// Handle a viewer ack: measure RTT, adapt quality, and forward the
    /// ack to CDP so the browser keeps producing frames.
    pub async fn handle_ack(&self, client_id: &str, agent_id: &str, frame_num: u32) {
        let session = {
            let sessions = self.sessions.lock();
            sessions
                .get(&(client_id.to_string(), agent_id.to_string()))
                .cloned()
        };
        let Some(session) = session else { return };

        let Some(pending) = session.pending.lock().take(frame_num) else {
            return;
        };

        let rtt = pending.sent_at.elapsed();
        let delta = quality_delta(rtt);
        let mut restart_quality = None;
        if delta != 0 {
            let mut quality = session.quality.lock();
            let updated = clamp_quality(*quality as i32 + delta);
            if updated != *quality {
                *quality = updated;
                restart_quality = Some(updated);
            }
        }

        let _ = session
            .page
            .conn
            .command(
                "Page.screencastFrameAck",
                json!({ "sessionId": pending.cdp_ack_id }),
                Some(&session.page.session_id),
            )
            .await;

        // CDP only applies quality at start, so a change means a
        // restart.
        if let Some(quality) = restart_quality {
            let _ = session.start_screencast(self.viewport, quality).await;
        }
    }

    pub async fn stop(&self, client_id: &str, agent_id: &str) {
        let session = self
            .sessions
            .lock()
            .remove(&(client_id.to_string(), agent_id.to_string()));
        let Some(session) = session else { return };

        if let Some(pump) = session.pump.lock().take() {
            pump.abort();
        }

        // Only stop the CDP screencast when no other client watches
        // this agent.
        let others_watching = self
            .sessions
            .lock()
            .keys()
            .any(|(_, aid)| aid == agent_id);
        if !others_watching {
            let _ = session
                .page
                .conn
                .command(
                    "Page.stopScreencast",
                    json!({}),
                    Some(&session.page.session_id),
                )
                .await;
        }
        tracing::info!(client_id = %client_id, agent_id = %agent_id, "screencast stopped");
    }

    pub async fn stop_all_for_client(&self, client_id: &str) {
        let agent_ids: Vec<String> = self
            .sessions
            .lock()
            .keys()
            .filter(|(cid, _)| cid == client_id)
            .map(|(_, aid)| aid.clone())
            .collect();
        for agent_id in agent_ids {
            self.stop(client_id, &agent_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_buckets() {
        assert_eq!(quality_delta(Duration::from_millis(10)), 5);
        assert_eq!(quality_delta(Duration::from_millis(49)), 5);
        assert_eq!(quality_delta(Duration::from_millis(50)), 2);
        assert_eq!(quality_delta(Duration::from_millis(99)), 2);
        assert_eq!(quality_delta(Duration::from_millis(150)), 0);
        assert_eq!(quality_delta(Duration::from_millis(201)), -5);
        assert_eq!(quality_delta(Duration::from_millis(301)), -10);
    }

    #[test]
    fn quality_clamps_to_bounds() {
        assert_eq!(clamp_quality(10), MIN_QUALITY);
        assert_eq!(clamp_quality(95), MAX_QUALITY);
        assert_eq!(clamp_quality(55), 55);
    }

    #[test]
    fn pending_map_caps_and_culls_oldest() {
        let mut pending = PendingFrames::default();
        for n in 0..150u32 {
            pending.insert(
                n,
                PendingFrame {
                    cdp_ack_id: n as i64,
                    sent_at: Instant::now(),
                },
            );
        }
        assert_eq!(pending.len(), MAX_PENDING_FRAMES);
        // The oldest 50 were culled.
        assert!(pending.take(10).is_none());
        assert!(pending.take(149).is_some());
        assert_eq!(pending.len(), MAX_PENDING_FRAMES - 1);
    }

    #[test]
    fn acks_resolve_out_of_order() {
        let mut pending = PendingFrames::default();
        for n in 1..=3u32 {
            pending.insert(
                n,
                PendingFrame {
                    cdp_ack_id: n as i64,
                    sent_at: Instant::now(),
                },
            );
        }
        assert_eq!(pending.take(2).unwrap().cdp_ack_id, 2);
        assert_eq!(pending.take(3).unwrap().cdp_ack_id, 3);
        assert_eq!(pending.take(1).unwrap().cdp_ack_id, 1);
        assert!(pending.is_empty());
    }
}

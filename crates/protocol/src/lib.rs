//! Hub wire protocol: WebSocket message catalogs and screencast binary
//! framing.
//!
//! Every message is a JSON object with a mandatory `type` discriminant;
//! most carry a string correlation `id`. Inbound messages that fail to
//! parse into [`ClientMessage`] are answered with `error{id?, message}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hub_domain::session::{AgentStoreState, AgentSummary, SerializedSession};
use hub_domain::tool::{ToolDefinition, ToolOutcome};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared payload types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Intervention visibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterveneMode {
    Visible,
    Private,
}

/// A human input event relayed from the intervening client's browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InputEvent {
    MouseMove { x: f64, y: f64 },
    Click { x: f64, y: f64, button: u8 },
    Scroll { delta_x: f64, delta_y: f64 },
    KeyDown { key: String },
    Text { text: String },
}

/// Lifecycle verbs accepted by `agent_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentAction {
    Pause,
    Resume,
    Stop,
    Delete,
}

/// Runner events fanned out to subscribed clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResultEvent {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
        total_cost_usd: f64,
    },
    TurnComplete {
        turn_id: String,
    },
    State {
        state: hub_domain::session::AgentRunState,
    },
    BudgetExceeded {
        reason: String,
        message: String,
    },
    Error {
        message: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client → Hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first message on every connection.
    Auth {
        token: String,
    },

    ToolRequest {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
        /// Hub agent the call runs against, when applicable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
    },

    FetchRequest {
        id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    ApiProxyRequest {
        id: String,
        provider: String,
        path: String,
        body: Value,
    },

    PersistAgent {
        id: String,
        session: SerializedSession,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<AgentStoreState>,
    },
    RestoreAgent {
        id: String,
        agent_id: String,
    },
    ListHubAgents {
        id: String,
    },
    AgentAction {
        id: String,
        agent_id: String,
        action: AgentAction,
    },
    SendMessage {
        agent_id: String,
        text: String,
    },
    SubscribeAgent {
        agent_id: String,
    },
    UnsubscribeAgent {
        agent_id: String,
    },

    /// Browser-side DOM state mirrored into the hub store.
    DomStateUpdate {
        agent_id: String,
        state: Value,
    },
    /// Browser-side storage write mirrored into the hub state store.
    StateWriteThrough {
        agent_id: String,
        key: String,
        value: Value,
    },

    PushSubscribe {
        id: String,
        subscription: Value,
    },
    PushVerifyPin {
        id: String,
        pin: String,
    },
    PushUnsubscribe {
        id: String,
    },
    VisibilityState {
        visible: bool,
    },

    /// Reply to a hub-issued `browser_tool_request`.
    BrowserToolResult {
        id: String,
        result: ToolOutcome,
    },
    /// Reply to a hub-issued `skill_approval_request`.
    SkillApprovalResponse {
        id: String,
        approved: bool,
    },

    BrowseInterveneRequest {
        id: String,
        agent_id: String,
        mode: InterveneMode,
    },
    BrowseInterveneRelease {
        id: String,
        agent_id: String,
    },
    BrowseInterveneInput {
        agent_id: String,
        event: InputEvent,
    },
    BrowseStreamRequest {
        id: String,
        agent_id: String,
    },
    BrowseStreamStop {
        id: String,
        agent_id: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub → Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hub_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hub_name: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        shared_providers: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        http_api_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AnnounceTools {
        tools: Vec<ToolDefinition>,
    },

    ToolResult {
        id: String,
        result: ToolOutcome,
    },
    FetchResult {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    ApiStreamChunk {
        id: String,
        chunk: String,
    },
    ApiStreamEnd {
        id: String,
    },
    ApiError {
        id: String,
        error: String,
    },

    PersistResult {
        id: String,
        agent_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RestoreResult {
        id: String,
        agent_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session: Option<SerializedSession>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<AgentStoreState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    HubAgents {
        id: String,
        agents: Vec<AgentSummary>,
    },
    ActionResult {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A runner event for an agent the client subscribed to.
    #[serde(rename = "agent_event")]
    AgentEventMsg {
        agent_id: String,
        event: AgentEvent,
    },

    /// Hub-issued request to run a tool in the client's browser.
    BrowserToolRequest {
        id: String,
        hub_agent_id: String,
        tool_name: String,
        input: Value,
    },
    /// Hub-issued request to approve a skill installation.
    SkillApprovalRequest {
        id: String,
        agent_id: String,
        skill_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    InterveneResult {
        id: String,
        granted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    InterveneEnded {
        agent_id: String,
        reason: String,
    },
    StreamToken {
        id: String,
        token: String,
        url: String,
    },
    StreamStopped {
        id: String,
    },

    PushResult {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream server messages (screencast socket)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Text messages on the dedicated screencast WebSocket. Frames
/// themselves travel as binary (see [`frame`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamClientMessage {
    /// Must be the first message; `token` is the single-use token minted
    /// by `browse_stream_request`.
    StreamAuth { token: String },
    /// Acknowledge receipt of a frame by its hub-assigned number.
    FrameAck { frame_num: u32 },
}

pub mod frame {
    //! Screencast binary frame layout:
    //! `[u32 frame_num][u16 width][u16 height][u8 quality][jpeg bytes]`,
    //! multi-byte fields little-endian.

    /// Fixed header size in bytes.
    pub const HEADER_LEN: usize = 4 + 2 + 2 + 1;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ScreencastFrame {
        pub frame_num: u32,
        pub width: u16,
        pub height: u16,
        pub quality: u8,
        pub jpeg: Vec<u8>,
    }

    pub fn encode(frame: &ScreencastFrame) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + frame.jpeg.len());
        out.extend_from_slice(&frame.frame_num.to_le_bytes());
        out.extend_from_slice(&frame.width.to_le_bytes());
        out.extend_from_slice(&frame.height.to_le_bytes());
        out.push(frame.quality);
        out.extend_from_slice(&frame.jpeg);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<ScreencastFrame> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        Some(ScreencastFrame {
            frame_num: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            width: u16::from_le_bytes(bytes[4..6].try_into().ok()?),
            height: u16::from_le_bytes(bytes[6..8].try_into().ok()?),
            quality: bytes[8],
            jpeg: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_tags() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"auth","token":"secret"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Auth { .. }));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"tool_request","id":"r1","name":"state","input":{"action":"get"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::ToolRequest { id, name, .. } => {
                assert_eq!(id, "r1");
                assert_eq!(name, "state");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn server_message_type_tag_is_snake_case() {
        let msg = ServerMessage::AuthResult {
            success: true,
            hub_id: Some("hub".into()),
            hub_name: Some("agenthub".into()),
            shared_providers: vec!["anthropic".into()],
            http_api_url: Some("http://127.0.0.1:3006".into()),
            error: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "auth_result");
        assert_eq!(json["success"], true);
    }

    #[test]
    fn agent_event_fanout_shape() {
        let msg = ServerMessage::AgentEventMsg {
            agent_id: "a1".into(),
            event: AgentEvent::TextDelta { text: "hi".into() },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "agent_event");
        assert_eq!(json["event"]["type"], "text_delta");
    }

    #[test]
    fn frame_roundtrip() {
        let f = frame::ScreencastFrame {
            frame_num: 0x01020304,
            width: 1280,
            height: 720,
            quality: 60,
            jpeg: vec![0xff, 0xd8, 0xff, 0xd9],
        };
        let bytes = frame::encode(&f);
        // Little-endian header check.
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(frame::decode(&bytes).unwrap(), f);
    }

    #[test]
    fn frame_decode_rejects_short_input() {
        assert!(frame::decode(&[1, 2, 3]).is_none());
    }
}

//! The serialized agent session model (version 2) and the agent store
//! state that is persisted next to it.
//!
//! A session is immutable at rest: the runner owns the live copy and
//! emits full snapshots to the session store at turn completion and on
//! state transitions. Version 1 sessions carried the model, provider,
//! tool list and token totals as flat fields; `migrate` lifts those into
//! `config` and `metadata`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tool::ChatMessage;

pub const SESSION_VERSION: u32 = 2;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection info for the hub an agent was persisted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConnection {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<String>,
}

/// Outbound network policy for an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    #[serde(default)]
    pub allow_fetch: bool,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
}

/// Agent configuration carried inside the serialized session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub: Option<HubConnection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_budget_usd: Option<f64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Files, dependencies, hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    Utf8,
    Base64,
}

/// One file in the agent's serialized workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
    pub encoding: FileEncoding,
}

/// A skill the session depends on, with an inline fallback body used
/// when the hub has no skill of that name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillDependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionDependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDependencies {
    #[serde(default)]
    pub skills: Vec<SkillDependency>,
    #[serde(default)]
    pub extensions: Vec<ExtensionDependency>,
}

/// When a hook rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    PreTool,
    PostTool,
}

/// What a matched hook decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookDecision {
    Allow,
    Deny,
}

/// A declarative tool hook. A `deny` decision on a pre-tool hook
/// short-circuits execution; the decision message becomes the tool
/// result shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRule {
    pub event: HookEvent,
    /// Tool name the rule applies to; `None` matches every tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub decision: HookDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
}

/// A complete at-rest agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedSession {
    pub version: u32,
    pub agent_id: String,
    pub config: SessionConfig,
    #[serde(default)]
    pub conversation: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<SessionDependencies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<Vec<HookRule>>,
    #[serde(default)]
    pub metadata: SessionMetadata,
}

impl SerializedSession {
    /// Deserialize a session from raw JSON, migrating version 1
    /// documents to the current shape.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self> {
        let version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(1);
        match version {
            2 => serde_json::from_value(raw.clone()).map_err(Error::Json),
            1 => migrate_v1(raw),
            other => Err(Error::Storage(format!(
                "unsupported session version {other}"
            ))),
        }
    }
}

/// Lift a v1 session's flat fields into `config` / `metadata`.
fn migrate_v1(raw: &serde_json::Value) -> Result<SerializedSession> {
    let agent_id = raw
        .get("agentId")
        .or_else(|| raw.get("agent_id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Storage("v1 session missing agentId".into()))?
        .to_string();

    let str_field = |name: &str| -> Option<String> {
        raw.get(name).and_then(|v| v.as_str()).map(str::to_owned)
    };

    let config = SessionConfig {
        model: str_field("model").unwrap_or_default(),
        provider: str_field("provider").unwrap_or_default(),
        tools: raw
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default(),
        max_tokens: raw
            .get("maxTokens")
            .or_else(|| raw.get("max_tokens"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
        hub: None,
        network: None,
        token_budget: None,
        cost_budget_usd: None,
    };

    let metadata = SessionMetadata {
        created_at: raw
            .get("createdAt")
            .or_else(|| raw.get("created_at"))
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        serialized_at: None,
        total_tokens: raw
            .get("totalTokens")
            .or_else(|| raw.get("total_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        total_cost_usd: raw
            .get("totalCost")
            .or_else(|| raw.get("total_cost"))
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
    };

    let conversation: Vec<ChatMessage> = raw
        .get("conversation")
        .map(|v| serde_json::from_value(v.clone()))
        .transpose()
        .map_err(Error::Json)?
        .unwrap_or_default();

    tracing::debug!(agent_id = %agent_id, "migrated v1 session");

    Ok(SerializedSession {
        version: SESSION_VERSION,
        agent_id,
        config,
        conversation,
        storage: raw
            .get("storage")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        files: None,
        dependencies: None,
        hooks: None,
        metadata,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent store state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runner lifecycle state as persisted alongside the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRunState {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

/// The small mutable record saved next to `session.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStoreState {
    pub state: AgentRunState,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
    pub saved_at: DateTime<Utc>,
}

impl AgentStoreState {
    pub fn paused() -> Self {
        Self {
            state: AgentRunState::Paused,
            total_tokens: 0,
            total_cost: 0.0,
            saved_at: Utc::now(),
        }
    }
}

/// Summary row returned by the session store's `list()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub state: AgentRunState,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub saved_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ContentBlock, Role};

    fn sample_session() -> SerializedSession {
        SerializedSession {
            version: SESSION_VERSION,
            agent_id: "a1".into(),
            config: SessionConfig {
                model: "claude-sonnet-4-20250514".into(),
                provider: "anthropic".into(),
                tools: vec!["state".into(), "bash".into()],
                max_tokens: Some(4096),
                hub: None,
                network: None,
                token_budget: Some(100_000),
                cost_budget_usd: None,
            },
            conversation: vec![ChatMessage::user("hello").with_turn("t1")],
            storage: None,
            files: None,
            dependencies: None,
            hooks: None,
            metadata: SessionMetadata::default(),
        }
    }

    #[test]
    fn v2_roundtrip_is_bit_identical() {
        let session = sample_session();
        let json = serde_json::to_value(&session).unwrap();
        let back = SerializedSession::from_json(&json).unwrap();
        assert_eq!(back, session);
        // Re-serializing yields the same JSON document.
        assert_eq!(serde_json::to_value(&back).unwrap(), json);
    }

    #[test]
    fn v1_migration_lifts_flat_fields() {
        let raw = serde_json::json!({
            "version": 1,
            "agentId": "legacy",
            "model": "gpt-4o",
            "provider": "openai",
            "tools": ["state"],
            "maxTokens": 2048,
            "totalTokens": 1234,
            "totalCost": 0.5,
            "conversation": [],
        });
        let session = SerializedSession::from_json(&raw).unwrap();
        assert_eq!(session.version, SESSION_VERSION);
        assert_eq!(session.agent_id, "legacy");
        assert_eq!(session.config.model, "gpt-4o");
        assert_eq!(session.config.provider, "openai");
        assert_eq!(session.config.max_tokens, Some(2048));
        assert_eq!(session.metadata.total_tokens, 1234);
        assert!((session.metadata.total_cost_usd - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_version_treated_as_v1() {
        let raw = serde_json::json!({ "agentId": "old", "model": "m", "provider": "p" });
        let session = SerializedSession::from_json(&raw).unwrap();
        assert_eq!(session.version, SESSION_VERSION);
    }

    #[test]
    fn future_version_rejected() {
        let raw = serde_json::json!({ "version": 3, "agent_id": "x" });
        assert!(SerializedSession::from_json(&raw).is_err());
    }

    #[test]
    fn conversation_blocks_roundtrip() {
        let mut session = sample_session();
        session.conversation.push(ChatMessage {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "done".into() },
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "state".into(),
                    input: serde_json::json!({"action": "get", "key": "k"}),
                },
            ],
            turn_id: Some("t1".into()),
        });
        let json = serde_json::to_string(&session).unwrap();
        let back: SerializedSession = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}

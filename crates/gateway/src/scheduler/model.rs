//! Schedule data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-agent schedule cap.
pub const MAX_SCHEDULES_PER_AGENT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Cron,
    Event,
}

/// What firing a schedule does: wake the agent with a synthetic user
/// message, or execute a tool fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleAction {
    Message { message: String },
    Tool { tool: String, tool_input: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub hub_agent_id: String,
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    pub enabled: bool,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_condition: Option<String>,
    #[serde(flatten)]
    pub action: ScheduleAction,
}

impl Schedule {
    /// Key used for fire coalescing and in-flight tracking.
    pub fn flight_key(&self) -> (String, String) {
        (self.hub_agent_id.clone(), self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_serde_shape() {
        let s = Schedule {
            id: "s1".into(),
            hub_agent_id: "a1".into(),
            kind: ScheduleKind::Cron,
            enabled: true,
            run_count: 0,
            max_runs: Some(3),
            last_run_at: None,
            cron_expression: Some("*/5 * * * *".into()),
            event_name: None,
            event_condition: None,
            action: ScheduleAction::Message {
                message: "ping".into(),
            },
        };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["type"], "cron");
        assert_eq!(json["message"], "ping");
        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, "s1");
        assert!(matches!(back.action, ScheduleAction::Message { .. }));
    }

    #[test]
    fn tool_action_deserializes() {
        let json = serde_json::json!({
            "id": "s2",
            "hub_agent_id": "a1",
            "type": "event",
            "enabled": true,
            "event_name": "state:score",
            "event_condition": "> 100",
            "tool": "files",
            "tool_input": { "action": "list_files" },
        });
        let s: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(s.kind, ScheduleKind::Event);
        match &s.action {
            ScheduleAction::Tool { tool, tool_input } => {
                assert_eq!(tool, "files");
                assert_eq!(tool_input["action"], "list_files");
            }
            other => panic!("expected tool action, got {other:?}"),
        }
    }
}

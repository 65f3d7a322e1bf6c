//! The tool executor — one dispatch function for every tool call an
//! agent makes.
//!
//! The executor never fails: every error becomes a
//! `ToolOutcome { is_error: true }` the model can see. Collaborators are
//! injected as narrow capability traits so the executor has no direct
//! dependency on the runner, the scheduler, or the hub server.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};

use hub_domain::session::{HookDecision, HookEvent, HookRule};
use hub_domain::tool::{ChatMessage, ToolOutcome};

use crate::bash::{execute_bash, BashRequest};
use crate::files::{execute_files, FilesRequest};
use crate::state::AgentStateStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capability interfaces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Round-trips a tool call to a connected browser client.
#[async_trait::async_trait]
pub trait BrowserRoute: Send + Sync {
    /// `true` when at least one routable client is connected.
    fn available(&self) -> bool;
    async fn route(&self, agent_id: Option<&str>, tool_name: &str, input: Value) -> ToolOutcome;
}

/// The scheduler surface the `schedule` tool needs.
#[async_trait::async_trait]
pub trait ScheduleApi: Send + Sync {
    async fn handle(&self, agent_id: &str, input: Value) -> hub_domain::Result<Value>;
}

/// The skill manager surface the skill tools need.
#[async_trait::async_trait]
pub trait SkillApi: Send + Sync {
    async fn handle(&self, agent_id: Option<&str>, tool_name: &str, input: Value) -> ToolOutcome;
}

/// Closure handing the executor the current conversation, supplied by
/// the runner for `context_search`.
pub type MessageFetcher = Arc<dyn Fn() -> Vec<ChatMessage> + Send + Sync>;

/// Everything a tool call may need. All fields are optional; dispatch
/// degrades per tool when a side-channel is not wired.
#[derive(Default, Clone)]
pub struct ExecutorDeps {
    pub agent_id: Option<String>,
    pub state: Option<Arc<AgentStateStore>>,
    pub storage: Option<Arc<AgentStateStore>>,
    pub files_root: Option<PathBuf>,
    pub sandbox_dir: Option<PathBuf>,
    pub scheduler: Option<Arc<dyn ScheduleApi>>,
    pub skills: Option<Arc<dyn SkillApi>>,
    pub browser: Option<Arc<dyn BrowserRoute>>,
    pub get_messages: Option<MessageFetcher>,
    pub hooks: Vec<HookRule>,
    /// Tool names from the agent config (for `capabilities`).
    pub tool_names: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolExecutor;

impl ToolExecutor {
    /// Execute one tool call.
    pub async fn execute(name: &str, input: Value, deps: &ExecutorDeps) -> ToolOutcome {
        if let Some(outcome) = apply_pre_hooks(name, &deps.hooks) {
            return outcome;
        }
        let outcome = dispatch(name, input, deps).await;
        apply_post_hooks(name, &deps.hooks, outcome)
    }
}

fn apply_pre_hooks(tool: &str, hooks: &[HookRule]) -> Option<ToolOutcome> {
    for hook in hooks {
        if hook.event != HookEvent::PreTool {
            continue;
        }
        if hook.tool.as_deref().is_some_and(|t| t != tool) {
            continue;
        }
        if hook.decision == HookDecision::Deny {
            let message = hook
                .message
                .clone()
                .unwrap_or_else(|| format!("tool {tool} denied by hook"));
            return Some(ToolOutcome::error(message));
        }
    }
    None
}

fn apply_post_hooks(tool: &str, hooks: &[HookRule], outcome: ToolOutcome) -> ToolOutcome {
    for hook in hooks {
        if hook.event != HookEvent::PostTool {
            continue;
        }
        if hook.tool.as_deref().is_some_and(|t| t != tool) {
            continue;
        }
        if hook.decision == HookDecision::Deny {
            let message = hook
                .message
                .clone()
                .unwrap_or_else(|| format!("result of {tool} suppressed by hook"));
            return ToolOutcome::error(message);
        }
    }
    outcome
}

async fn dispatch(name: &str, input: Value, deps: &ExecutorDeps) -> ToolOutcome {
    match name {
        "capabilities" => capabilities(deps),

        "bash" => {
            let req: BashRequest = match serde_json::from_value(input) {
                Ok(r) => r,
                Err(e) => return ToolOutcome::error(format!("bad bash input: {e}")),
            };
            execute_bash(req, deps.sandbox_dir.as_deref()).await
        }

        "files" | "filesystem" => match &deps.files_root {
            Some(root) => {
                let req: FilesRequest = match serde_json::from_value(input) {
                    Ok(r) => r,
                    Err(e) => return ToolOutcome::error(format!("bad files input: {e}")),
                };
                match execute_files(req, root).await {
                    Ok(value) => ToolOutcome::json(&value),
                    Err(e) => ToolOutcome::error(e.to_string()),
                }
            }
            None => route_to_browser(name, input, deps).await,
        },

        "state" => match &deps.state {
            Some(store) => state_tool(store, input, true),
            None => route_to_browser(name, input, deps).await,
        },
        "storage" => match &deps.storage {
            Some(store) => state_tool(store, input, false),
            None => route_to_browser(name, input, deps).await,
        },

        "schedule" => {
            let (Some(scheduler), Some(agent_id)) = (&deps.scheduler, &deps.agent_id) else {
                return ToolOutcome::error("schedule tool requires a scheduler and an agent id");
            };
            match scheduler.handle(agent_id, input).await {
                Ok(value) => ToolOutcome::json(&value),
                Err(e) => ToolOutcome::error(e.to_string()),
            }
        }

        "context_search" => match &deps.get_messages {
            Some(fetch) => context_search(fetch(), &input),
            None => ToolOutcome::error("context_search is not available for this agent"),
        },

        "list_skills" | "get_skill" | "load_skill" | "create_skill" | "remove_skill" => {
            match &deps.skills {
                Some(skills) => skills.handle(deps.agent_id.as_deref(), name, input).await,
                None => ToolOutcome::error("no skill manager is configured"),
            }
        }

        "dom" | "runjs" | "view_state" | "audit_log" | "agent_respond" | "worker_message" => {
            route_to_browser(name, input, deps).await
        }

        other => ToolOutcome::error(format!("unknown tool: {other}")),
    }
}

async fn route_to_browser(name: &str, input: Value, deps: &ExecutorDeps) -> ToolOutcome {
    match &deps.browser {
        Some(browser) if browser.available() => {
            browser.route(deps.agent_id.as_deref(), name, input).await
        }
        _ => ToolOutcome::error(format!(
            "tool {name} requires a connected browser and none is available"
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn capabilities(deps: &ExecutorDeps) -> ToolOutcome {
    let browser = deps.browser.as_ref().is_some_and(|b| b.available());
    let value = json!({
        "agent_id": deps.agent_id,
        "tools": deps.tool_names,
        "channels": {
            "state": deps.state.is_some(),
            "storage": deps.storage.is_some(),
            "files": deps.files_root.is_some(),
            "bash_sandbox": deps.sandbox_dir.is_some(),
            "scheduler": deps.scheduler.is_some(),
            "skills": deps.skills.is_some(),
            "browser": browser,
            "context_search": deps.get_messages.is_some(),
        },
    });
    ToolOutcome::json(&value)
}

fn state_tool(store: &AgentStateStore, input: Value, escalations: bool) -> ToolOutcome {
    let action = input
        .get("action")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let key = input.get("key").and_then(|v| v.as_str());

    match action.as_str() {
        "get" => {
            let Some(key) = key else {
                return ToolOutcome::error("get requires a key");
            };
            match store.get(key) {
                Some(value) => ToolOutcome::json(&json!({ "key": key, "value": value })),
                None => ToolOutcome::error(format!("key not found: {key}")),
            }
        }
        "get_all" => ToolOutcome::json(&json!(store.get_all())),
        "set" => {
            let Some(key) = key else {
                return ToolOutcome::error("set requires a key");
            };
            let value = input.get("value").cloned().unwrap_or(Value::Null);
            match store.set(key, value) {
                Ok(()) => ToolOutcome::json(&json!({ "key": key, "ok": true })),
                Err(e) => ToolOutcome::error(e.to_string()),
            }
        }
        "delete" => {
            let Some(key) = key else {
                return ToolOutcome::error("delete requires a key");
            };
            ToolOutcome::json(&json!({ "key": key, "deleted": store.delete(key) }))
        }
        "set_escalation" if escalations => {
            let Some(key) = key else {
                return ToolOutcome::error("set_escalation requires a key");
            };
            let Some(condition) = input.get("condition").and_then(|v| v.as_str()) else {
                return ToolOutcome::error("set_escalation requires a condition");
            };
            let message = input
                .get("message")
                .and_then(|v| v.as_str())
                .map(str::to_owned);
            match store.set_escalation(key, condition, message) {
                Ok(()) => ToolOutcome::json(&json!({ "key": key, "ok": true })),
                Err(e) => ToolOutcome::error(e.to_string()),
            }
        }
        "clear_escalation" if escalations => {
            let Some(key) = key else {
                return ToolOutcome::error("clear_escalation requires a key");
            };
            ToolOutcome::json(&json!({ "key": key, "cleared": store.clear_escalation(key) }))
        }
        other => ToolOutcome::error(format!("unknown state action: {other}")),
    }
}

fn context_search(messages: Vec<ChatMessage>, input: &Value) -> ToolOutcome {
    let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
        return ToolOutcome::error("context_search requires a query");
    };
    let limit = input
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(5)
        .min(50) as usize;
    let needle = query.to_lowercase();

    let mut hits = Vec::new();
    for msg in &messages {
        let text = msg.text();
        if text.to_lowercase().contains(&needle) {
            hits.push(json!({
                "role": msg.role,
                "turn_id": msg.turn_id,
                "text": text,
            }));
            if hits.len() >= limit {
                break;
            }
        }
    }
    ToolOutcome::json(&json!({ "query": query, "matches": hits }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_domain::tool::Role;

    fn deps_with_state() -> ExecutorDeps {
        ExecutorDeps {
            state: Some(Arc::new(AgentStateStore::new())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_error_outcome() {
        let out = ToolExecutor::execute("nope", json!({}), &ExecutorDeps::default()).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn state_set_then_get() {
        let deps = deps_with_state();
        let out = ToolExecutor::execute(
            "state",
            json!({"action": "set", "key": "score", "value": 7}),
            &deps,
        )
        .await;
        assert!(!out.is_error, "{}", out.content);

        let out = ToolExecutor::execute("state", json!({"action": "get", "key": "score"}), &deps)
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains('7'));

        let out = ToolExecutor::execute(
            "state",
            json!({"action": "delete", "key": "score"}),
            &deps,
        )
        .await;
        assert!(!out.is_error);
        let out = ToolExecutor::execute("state", json!({"action": "get", "key": "score"}), &deps)
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn browser_tools_error_without_browser() {
        for name in ["dom", "runjs", "view_state", "audit_log", "agent_respond"] {
            let out = ToolExecutor::execute(name, json!({}), &ExecutorDeps::default()).await;
            assert!(out.is_error, "{name}");
            assert!(out.content.contains("connected browser"), "{name}");
        }
    }

    #[tokio::test]
    async fn state_routes_to_browser_when_unwired() {
        struct FakeBrowser;
        #[async_trait::async_trait]
        impl BrowserRoute for FakeBrowser {
            fn available(&self) -> bool {
                true
            }
            async fn route(
                &self,
                _agent_id: Option<&str>,
                tool_name: &str,
                _input: Value,
            ) -> ToolOutcome {
                ToolOutcome::ok(format!("browser ran {tool_name}"))
            }
        }
        let deps = ExecutorDeps {
            browser: Some(Arc::new(FakeBrowser)),
            ..Default::default()
        };
        let out = ToolExecutor::execute("state", json!({"action": "get_all"}), &deps).await;
        assert_eq!(out.content, "browser ran state");
    }

    #[tokio::test]
    async fn pre_hook_deny_short_circuits() {
        let deps = ExecutorDeps {
            state: Some(Arc::new(AgentStateStore::new())),
            hooks: vec![HookRule {
                event: HookEvent::PreTool,
                tool: Some("state".into()),
                decision: HookDecision::Deny,
                message: Some("state is off limits".into()),
            }],
            ..Default::default()
        };
        let out = ToolExecutor::execute(
            "state",
            json!({"action": "set", "key": "k", "value": 1}),
            &deps,
        )
        .await;
        assert!(out.is_error);
        assert_eq!(out.content, "state is off limits");
        // The store was never touched.
        assert!(deps.state.unwrap().get("k").is_none());
    }

    #[tokio::test]
    async fn context_search_finds_matches() {
        let messages = vec![
            ChatMessage::user("deploy the service"),
            ChatMessage {
                role: Role::Assistant,
                content: vec![hub_domain::tool::ContentBlock::Text {
                    text: "Deployed successfully".into(),
                }],
                turn_id: Some("t1".into()),
            },
        ];
        let deps = ExecutorDeps {
            get_messages: Some(Arc::new(move || messages.clone())),
            ..Default::default()
        };
        let out = ToolExecutor::execute("context_search", json!({"query": "deploy"}), &deps).await;
        assert!(!out.is_error);
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(parsed["matches"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn capabilities_reflects_wiring() {
        let deps = deps_with_state();
        let out = ToolExecutor::execute("capabilities", json!({}), &deps).await;
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(parsed["channels"]["state"], true);
        assert_eq!(parsed["channels"]["browser"], false);
    }
}

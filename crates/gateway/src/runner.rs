//! The agent runner — the per-agent LLM loop.
//!
//! Each hub-persisted agent has one runner task owning its live
//! session. Everything else talks to it through its mailbox (synthetic
//! user messages, pause/resume) or its shared signal flags (stop,
//! intervene), which are checked at every suspension point: reading the
//! next provider chunk, dispatching tools, and writing snapshots.
//!
//! A turn ends when the stop reason is not `tool_use`; only then is the
//! conversation persisted. Tool failures never abort a turn — they
//! come back as `is_error` tool results the model can react to.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use hub_domain::config::HubConfig;
use hub_domain::error::{Error, Result};
use hub_domain::session::{AgentRunState, AgentStoreState, SerializedSession};
use hub_domain::stream::{BlockDelta, BlockStart, StopReason, StreamEvent, Usage};
use hub_domain::tool::{ChatMessage, ContentBlock, Role, ToolOutcome};
use hub_protocol::AgentEvent;
use hub_providers::cli::{render_prompt, CliAdapter};
use hub_providers::client::{upstream_base, ApiClient};
use hub_sessions::SessionStore;
use hub_tools::executor::{ExecutorDeps, ToolExecutor};
use hub_tools::registry::tools_for;
use hub_tools::AgentStateStore;

use crate::router::BrowserToolRouter;
use crate::scheduler::Scheduler;
use crate::skills_api::SkillService;

const MAX_TOOL_LOOPS: usize = 25;
/// Turns kept verbatim in the request context; older turns collapse
/// into terse one-line summaries.
const RECENT_TURNS: usize = 8;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands & signals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
pub enum RunnerCommand {
    /// A user (or scheduler-synthesized) message. Starts a turn unless
    /// the agent is paused.
    UserMessage(String),
    /// A system-role note (e.g. an intervene-end notification) injected
    /// at the start of the next turn.
    SystemNote(String),
    Pause,
    Resume,
    /// Persist and exit the runner task.
    Shutdown,
}

/// Signals that must act mid-turn, outside the mailbox.
pub struct RunnerSignals {
    /// Stop the in-flight turn; set per turn, cleared at turn start.
    stop: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    /// While `true`, the runner blocks before its next provider call.
    intervene: watch::Sender<bool>,
    intervene_rx: watch::Receiver<bool>,
}

impl Default for RunnerSignals {
    fn default() -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let (intervene, intervene_rx) = watch::channel(false);
        Self {
            stop,
            stop_rx,
            intervene,
            intervene_rx,
        }
    }
}

impl RunnerSignals {
    pub fn request_stop(&self) {
        let _ = self.stop.send(true);
    }
    pub fn begin_intervene(&self) {
        let _ = self.intervene.send(true);
    }
    pub fn end_intervene(&self) {
        let _ = self.intervene.send(false);
    }
    fn clear_stop(&self) {
        let _ = self.stop.send(false);
    }
    fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }
}

/// Handle held by the agent manager.
pub struct RunnerHandle {
    pub agent_id: String,
    pub mailbox: mpsc::Sender<RunnerCommand>,
    pub signals: Arc<RunnerSignals>,
    pub state: watch::Receiver<AgentRunState>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Collaborators a runner needs; built once at hub boot and shared.
#[derive(Clone)]
pub struct RunnerDeps {
    pub config: Arc<HubConfig>,
    pub store: Arc<SessionStore>,
    pub api: Arc<ApiClient>,
    pub scheduler: Arc<Scheduler>,
    pub router: Arc<BrowserToolRouter>,
    pub skills: Arc<hub_skills::SkillManager>,
    pub approvals: Arc<crate::approval::ApprovalStore>,
    pub clients: Arc<crate::clients::ClientRegistry>,
    pub stores: Arc<StateRegistry>,
    /// Event fan-out to subscribed clients.
    pub emit: Arc<dyn Fn(&str, AgentEvent) + Send + Sync>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-agent state stores
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The runtime `state` and persistent `storage` stores for one agent.
#[derive(Clone)]
pub struct AgentStores {
    pub state: Arc<AgentStateStore>,
    pub storage: Arc<AgentStateStore>,
}

/// Shared registry so the runner and scheduler tool fires mutate the
/// same per-agent stores. Mutual exclusion lives inside each store.
#[derive(Default)]
pub struct StateRegistry {
    inner: parking_lot::Mutex<HashMap<String, AgentStores>>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stores_for(&self, agent_id: &str) -> AgentStores {
        self.inner
            .lock()
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentStores {
                state: Arc::new(AgentStateStore::new()),
                storage: Arc::new(AgentStateStore::new()),
            })
            .clone()
    }

    pub fn remove(&self, agent_id: &str) {
        self.inner.lock().remove(agent_id);
    }
}

/// Build executor deps for an agent outside a live turn (scheduler tool
/// fires). Inside a turn the runner adds its conversation closure.
pub fn build_executor_deps(
    agent_id: &str,
    tool_names: Vec<String>,
    hooks: Vec<hub_domain::session::HookRule>,
    get_messages: Option<hub_tools::executor::MessageFetcher>,
    deps: &RunnerDeps,
) -> ExecutorDeps {
    let stores = deps.stores.stores_for(agent_id);
    let skills_service = Arc::new(SkillService::new(
        deps.skills.clone(),
        deps.approvals.clone(),
        deps.clients.clone(),
        tool_names.clone(),
    ));
    ExecutorDeps {
        agent_id: Some(agent_id.to_string()),
        state: Some(stores.state),
        storage: Some(stores.storage),
        files_root: deps.store.files_root(agent_id).ok(),
        sandbox_dir: deps
            .config
            .sandbox_path
            .as_ref()
            .map(|root| root.join(agent_id)),
        scheduler: Some(deps.scheduler.clone()),
        skills: Some(skills_service),
        browser: Some(deps.router.clone()),
        get_messages,
        hooks,
        tool_names,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum BlockBuf {
    Text(String),
    ToolUse {
        id: Option<String>,
        name: String,
        json: String,
    },
}

/// Folds the canonical event sequence into an assistant message.
#[derive(Default)]
pub struct BlockAssembler {
    blocks: BTreeMap<usize, BlockBuf>,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns the text delta to forward, if any.
    pub fn feed(&mut self, event: &StreamEvent) -> Option<String> {
        match event {
            StreamEvent::MessageStart { usage } => {
                if self.usage.is_none() {
                    self.usage = usage.clone();
                }
                None
            }
            StreamEvent::ContentBlockStart { index, block } => {
                let buf = match block {
                    BlockStart::Text => BlockBuf::Text(String::new()),
                    BlockStart::ToolUse { id, name } => BlockBuf::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        json: String::new(),
                    },
                };
                self.blocks.insert(*index, buf);
                None
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                match (self.blocks.get_mut(index), delta) {
                    (Some(BlockBuf::Text(text)), BlockDelta::TextDelta { text: chunk }) => {
                        text.push_str(chunk);
                        Some(chunk.clone())
                    }
                    (
                        Some(BlockBuf::ToolUse { json, .. }),
                        BlockDelta::InputJsonDelta { partial_json },
                    ) => {
                        json.push_str(partial_json);
                        None
                    }
                    _ => None,
                }
            }
            StreamEvent::ContentBlockStop { .. } => None,
            StreamEvent::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = *stop_reason;
                }
                if usage.is_some() {
                    self.usage = usage.clone();
                }
                None
            }
            StreamEvent::MessageStop => None,
        }
    }

    /// Close the assembly into content blocks. Tool-use blocks without
    /// a provider id get a freshly minted one.
    pub fn finish(self) -> (Vec<ContentBlock>, StopReason, Usage) {
        let mut content = Vec::new();
        for (_, buf) in self.blocks {
            match buf {
                BlockBuf::Text(text) => {
                    if !text.is_empty() {
                        content.push(ContentBlock::Text { text });
                    }
                }
                BlockBuf::ToolUse { id, name, json } => {
                    let input: Value = if json.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&json).unwrap_or_else(|e| {
                            tracing::warn!(tool = %name, error = %e, "bad tool input json");
                            json!({})
                        })
                    };
                    content.push(ContentBlock::ToolUse {
                        id: id.unwrap_or_else(|| {
                            format!("toolu_{}", uuid::Uuid::new_v4().simple())
                        }),
                        name,
                        input,
                    });
                }
            }
        }
        (
            content,
            self.stop_reason.unwrap_or(StopReason::EndTurn),
            self.usage.unwrap_or_default(),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context strategy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

/// Terse summaries of old turns plus the recent turns verbatim.
pub fn build_context(conversation: &[ChatMessage], recent_turns: usize) -> Vec<ChatMessage> {
    // Group message indices by turn id; messages without one count as
    // their own group.
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current_turn: Option<&str> = None;
    for (i, msg) in conversation.iter().enumerate() {
        match (&msg.turn_id, current_turn) {
            (Some(turn), Some(prev)) if turn == prev => {
                groups.last_mut().unwrap().push(i);
            }
            (turn, _) => {
                current_turn = turn.as_deref();
                groups.push(vec![i]);
            }
        }
    }

    if groups.len() <= recent_turns {
        return conversation.to_vec();
    }

    let split = groups.len() - recent_turns;
    let mut summary_lines = Vec::new();
    for group in &groups[..split] {
        for &i in group {
            let msg = &conversation[i];
            let text = msg.text();
            if text.is_empty() {
                continue;
            }
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            summary_lines.push(format!("{role}: {}", truncate_str(&text, 120)));
        }
    }

    let mut out = Vec::new();
    if !summary_lines.is_empty() {
        out.push(ChatMessage::system(format!(
            "Summary of earlier conversation:\n{}",
            summary_lines.join("\n")
        )));
    }
    for group in &groups[split..] {
        for &i in group {
            out.push(conversation[i].clone());
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request building
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn content_block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use", "id": id, "name": name, "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

/// Build the request payload from the session.
pub fn build_request_body(session: &SerializedSession, context: &[ChatMessage]) -> Value {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();
    for msg in context {
        match msg.role {
            Role::System => system_parts.push(msg.text()),
            Role::User | Role::Assistant => {
                let role = if msg.role == Role::User {
                    "user"
                } else {
                    "assistant"
                };
                let content: Vec<Value> =
                    msg.content.iter().map(content_block_to_wire).collect();
                messages.push(json!({ "role": role, "content": content }));
            }
        }
    }

    let mut body = json!({
        "model": session.config.model,
        "max_tokens": session.config.max_tokens.unwrap_or(4096),
        "stream": true,
        "messages": messages,
    });
    if !system_parts.is_empty() {
        body["system"] = Value::String(system_parts.join("\n\n"));
    }
    let tools = tools_for(&session.config.tools);
    if !tools.is_empty() {
        body["tools"] = json!(tools
            .iter()
            .map(|t| json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.input_schema,
            }))
            .collect::<Vec<_>>());
    }
    body
}

/// Default per-million-token pricing by provider, used to estimate the
/// cumulative cost recorded in session metadata.
fn estimate_cost(provider: &str, usage: &Usage) -> f64 {
    let (input_per_mtok, output_per_mtok) = match provider {
        "anthropic" => (3.0, 15.0),
        "openai" => (2.5, 10.0),
        "gemini" => (1.25, 5.0),
        _ => (0.0, 0.0),
    };
    (usage.input_tokens as f64 * input_per_mtok + usage.output_tokens as f64 * output_per_mtok)
        / 1_000_000.0
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentRunner {
    agent_id: String,
    session: SerializedSession,
    run_state: AgentRunState,
    state_tx: watch::Sender<AgentRunState>,
    signals: Arc<RunnerSignals>,
    deps: RunnerDeps,
    state_store: Arc<AgentStateStore>,
    storage_store: Arc<AgentStateStore>,
    state_listener: u64,
    pending_system_notes: Vec<String>,
}

/// Spawn a runner for a loaded session. Returns the handle the agent
/// manager keeps.
pub fn spawn_runner(
    session: SerializedSession,
    initial_state: AgentRunState,
    deps: RunnerDeps,
    self_post: mpsc::Sender<RunnerCommand>,
    mailbox: mpsc::Receiver<RunnerCommand>,
) -> RunnerHandle {
    let agent_id = session.agent_id.clone();
    let signals = Arc::new(RunnerSignals::default());
    let (state_tx, state_rx) = watch::channel(initial_state);

    let stores = deps.stores.stores_for(&agent_id);
    let state_store = stores.state;
    let storage_store = stores.storage;
    if let Some(snapshot) = session.storage.clone() {
        storage_store.load_snapshot(snapshot);
    }

    // State mutations publish on the event bus; a firing escalation
    // rule wakes the agent with its message. The handle is removed when
    // the runner exits so respawns do not stack listeners.
    let state_listener = {
        let scheduler = deps.scheduler.clone();
        let store_for_listener = state_store.clone();
        let agent = agent_id.clone();
        let post = self_post.clone();
        state_store.add_listener(move |key, value| {
            scheduler.publish(&format!("state:{key}"), value);
            if let Some(message) = store_for_listener.evaluate_escalation(key, value) {
                let text = message.unwrap_or_else(|| {
                    format!("State key {key:?} triggered its escalation rule")
                });
                if post.try_send(RunnerCommand::UserMessage(text)).is_err() {
                    tracing::warn!(agent_id = %agent, "escalation message dropped (mailbox full)");
                }
            }
        })
    };

    let runner = AgentRunner {
        agent_id: agent_id.clone(),
        session,
        run_state: initial_state,
        state_tx,
        signals: signals.clone(),
        deps,
        state_store,
        storage_store,
        state_listener,
        pending_system_notes: Vec::new(),
    };

    let task = tokio::spawn(runner.run(mailbox));

    RunnerHandle {
        agent_id,
        mailbox: self_post,
        signals,
        state: state_rx,
        task,
    }
}

impl AgentRunner {
    fn set_state(&mut self, state: AgentRunState) {
        self.run_state = state;
        let _ = self.state_tx.send(state);
        (self.deps.emit)(&self.agent_id, AgentEvent::State { state });
    }

    fn emit(&self, event: AgentEvent) {
        (self.deps.emit)(&self.agent_id, event);
    }

    async fn run(mut self, mut mailbox: mpsc::Receiver<RunnerCommand>) {
        tracing::info!(agent_id = %self.agent_id, "runner started");
        while let Some(cmd) = mailbox.recv().await {
            match cmd {
                RunnerCommand::UserMessage(text) => {
                    let turn_id = uuid::Uuid::new_v4().to_string();
                    // An intervene notification waits for the next turn
                    // and rides in as a system-role message.
                    for note in self.pending_system_notes.drain(..) {
                        self.session
                            .conversation
                            .push(ChatMessage::system(note).with_turn(&turn_id));
                    }
                    self.session
                        .conversation
                        .push(ChatMessage::user(text).with_turn(&turn_id));

                    if self.run_state == AgentRunState::Paused {
                        tracing::debug!(agent_id = %self.agent_id, "message queued while paused");
                        continue;
                    }
                    self.run_turn(&turn_id).await;
                }
                RunnerCommand::SystemNote(note) => {
                    self.pending_system_notes.push(note);
                }
                RunnerCommand::Pause => {
                    self.set_state(AgentRunState::Paused);
                    self.persist().await;
                }
                RunnerCommand::Resume => {
                    if self.run_state == AgentRunState::Paused {
                        self.set_state(AgentRunState::Idle);
                        self.persist().await;
                    }
                }
                RunnerCommand::Shutdown => break,
            }
        }
        self.state_store.remove_listener(self.state_listener);
        self.set_state(AgentRunState::Stopped);
        self.persist().await;
        tracing::info!(agent_id = %self.agent_id, "runner stopped");
    }

    // ── Budgets ───────────────────────────────────────────────────

    fn budget_exceeded(&self) -> Option<(String, String)> {
        let meta = &self.session.metadata;
        if let Some(budget) = self.session.config.token_budget {
            if meta.total_tokens >= budget {
                return Some((
                    "tokens".into(),
                    format!("token budget exhausted ({} of {budget})", meta.total_tokens),
                ));
            }
        }
        if let Some(budget) = self.session.config.cost_budget_usd {
            if meta.total_cost_usd >= budget {
                return Some((
                    "cost".into(),
                    format!(
                        "cost budget exhausted (${:.4} of ${budget:.4})",
                        meta.total_cost_usd
                    ),
                ));
            }
        }
        None
    }

    // ── The turn ──────────────────────────────────────────────────

    async fn run_turn(&mut self, turn_id: &str) {
        if let Some((reason, message)) = self.budget_exceeded() {
            self.emit(AgentEvent::BudgetExceeded {
                reason,
                message,
            });
            self.set_state(AgentRunState::Paused);
            self.persist().await;
            return;
        }

        self.signals.clear_stop();
        self.set_state(AgentRunState::Running);
        let mut turn_usage = Usage::default();

        for _loop_idx in 0..MAX_TOOL_LOOPS {
            // Intervene gate: block before the provider call until the
            // human releases the page. A stop signal also breaks the
            // wait.
            let mut intervene_rx = self.signals.intervene_rx.clone();
            let mut stop_rx = self.signals.stop_rx.clone();
            while *intervene_rx.borrow() && !*stop_rx.borrow() {
                tokio::select! {
                    changed = intervene_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {}
                }
            }
            if self.signals.stopped() {
                self.abort_turn("stopped before provider call").await;
                return;
            }

            let context = build_context(&self.session.conversation, RECENT_TURNS);
            let body = build_request_body(&self.session, &context);

            let stream = match self.open_stream(&body, &context).await {
                Ok(stream) => stream,
                Err(e) => {
                    // Provider failure aborts the turn without a
                    // context save.
                    tracing::warn!(agent_id = %self.agent_id, error = %e, "provider request failed");
                    self.emit(AgentEvent::Error {
                        message: e.to_string(),
                    });
                    self.set_state(AgentRunState::Idle);
                    return;
                }
            };

            let (content, stop_reason, usage) = match self.consume_stream(stream).await {
                Some(assembled) => assembled,
                None => {
                    self.abort_turn("stopped while streaming").await;
                    return;
                }
            };

            turn_usage.input_tokens += usage.input_tokens;
            turn_usage.output_tokens += usage.output_tokens;

            let assistant = ChatMessage {
                role: Role::Assistant,
                content: content.clone(),
                turn_id: Some(turn_id.to_string()),
            };
            self.session.conversation.push(assistant);

            if stop_reason != StopReason::ToolUse {
                self.complete_turn(turn_id, &turn_usage).await;
                return;
            }

            // ── Tool dispatch ─────────────────────────────────────
            let calls: Vec<(String, String, Value)> = content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } => {
                        Some((id.clone(), name.clone(), input.clone()))
                    }
                    _ => None,
                })
                .collect();

            for (id, name, input) in &calls {
                self.emit(AgentEvent::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
            }

            if self.signals.stopped() {
                self.abort_turn("stopped before tool dispatch").await;
                return;
            }

            let exec_deps = self.executor_deps();
            // Concurrent execution; join_all keeps emission order so
            // results append in the order the model issued the calls.
            let futures: Vec<_> = calls
                .iter()
                .map(|(_, name, input)| {
                    let deps = &exec_deps;
                    async move { ToolExecutor::execute(name, input.clone(), deps).await }
                })
                .collect();
            let outcomes: Vec<ToolOutcome> = futures_util::future::join_all(futures).await;

            if self.signals.stopped() {
                // Tools were allowed to finish; their results are
                // discarded.
                self.abort_turn("stopped during tool execution").await;
                return;
            }

            for ((id, _name, _input), outcome) in calls.iter().zip(outcomes) {
                self.emit(AgentEvent::ToolResultEvent {
                    tool_use_id: id.clone(),
                    content: outcome.content.clone(),
                    is_error: outcome.is_error,
                });
                self.session.conversation.push(ChatMessage {
                    role: Role::User,
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content: outcome.content,
                        is_error: outcome.is_error,
                    }],
                    turn_id: Some(turn_id.to_string()),
                });
            }
        }

        tracing::warn!(agent_id = %self.agent_id, "tool loop limit reached");
        self.emit(AgentEvent::Error {
            message: format!("tool loop limit reached ({MAX_TOOL_LOOPS})"),
        });
        self.complete_turn(turn_id, &turn_usage).await;
    }

    async fn open_stream(
        &self,
        body: &Value,
        context: &[ChatMessage],
    ) -> Result<hub_domain::stream::BoxStream<'static, Result<StreamEvent>>> {
        let provider = self.session.config.provider.clone();

        // CLI-proxied providers bypass HTTP entirely.
        if let Some(cli_config) = self.deps.config.cli_providers.get(&provider) {
            let adapter = CliAdapter::new(cli_config.clone());
            let system = body.get("system").and_then(|v| v.as_str());
            let prompt = render_prompt(system, context);
            return adapter
                .stream_events(&self.session.config.model, prompt)
                .await;
        }

        let provider_cfg = self.deps.config.providers.get(&provider);
        let base = upstream_base(&provider, provider_cfg.and_then(|p| p.endpoint.as_deref()))
            .ok_or_else(|| Error::Proxy {
                provider: provider.clone(),
                message: "no endpoint configured".into(),
            })?;
        let path = match provider.as_str() {
            "anthropic" => "/v1/messages".to_string(),
            "gemini" => format!(
                "/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.session.config.model
            ),
            _ => "/v1/chat/completions".to_string(),
        };
        let url = format!("{base}{path}");
        let api_key = provider_cfg
            .and_then(|p| p.api_key.clone())
            .or_else(|| self.deps.config.shared_api_keys.get(&provider).cloned());

        self.deps
            .api
            .stream_events(&provider, &url, api_key.as_deref(), body)
            .await
    }

    /// Consume the provider stream into an assembled assistant message.
    /// Returns `None` when a stop signal interrupted the read.
    async fn consume_stream(
        &self,
        mut stream: hub_domain::stream::BoxStream<'static, Result<StreamEvent>>,
    ) -> Option<(Vec<ContentBlock>, StopReason, Usage)> {
        let mut assembler = BlockAssembler::new();
        let mut stop_rx = self.signals.stop_rx.clone();

        loop {
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => {
                            if let Some(text) = assembler.feed(&event) {
                                self.emit(AgentEvent::TextDelta { text });
                            }
                            if matches!(event, StreamEvent::MessageStop) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            // Stream-level errors surface but do not
                            // poison the session.
                            self.emit(AgentEvent::Error { message: e.to_string() });
                        }
                        None => break,
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return None;
                    }
                }
            }
        }
        Some(assembler.finish())
    }

    fn executor_deps(&self) -> ExecutorDeps {
        let conversation = self.session.conversation.clone();
        build_executor_deps(
            &self.agent_id,
            self.session.config.tools.clone(),
            self.session.hooks.clone().unwrap_or_default(),
            Some(Arc::new(move || conversation.clone())),
            &self.deps,
        )
    }

    async fn abort_turn(&mut self, why: &str) {
        tracing::info!(agent_id = %self.agent_id, why, "turn aborted");
        self.set_state(AgentRunState::Idle);
    }

    async fn complete_turn(&mut self, turn_id: &str, usage: &Usage) {
        let cost = estimate_cost(&self.session.config.provider, usage);
        self.session.metadata.total_tokens += usage.total();
        self.session.metadata.total_cost_usd += cost;

        self.emit(AgentEvent::Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: self.session.metadata.total_tokens,
            total_cost_usd: self.session.metadata.total_cost_usd,
        });
        self.emit(AgentEvent::TurnComplete {
            turn_id: turn_id.to_string(),
        });
        self.set_state(AgentRunState::Idle);
        self.persist().await;
    }

    async fn persist(&mut self) {
        self.session.metadata.serialized_at = Some(Utc::now());
        if self.session.metadata.created_at.is_none() {
            self.session.metadata.created_at = Some(Utc::now());
        }
        self.session.storage = Some(self.storage_store.snapshot());

        let state = AgentStoreState {
            state: self.run_state,
            total_tokens: self.session.metadata.total_tokens,
            total_cost: self.session.metadata.total_cost_usd,
            saved_at: Utc::now(),
        };
        if let Err(e) = self
            .deps
            .store
            .save(&self.agent_id, &self.session, &state)
            .await
        {
            // A failed persist pauses the agent; it remains restorable
            // from the last completed-turn snapshot.
            tracing::error!(agent_id = %self.agent_id, error = %e, "session persist failed");
            self.emit(AgentEvent::Error {
                message: format!("session persist failed: {e}"),
            });
            self.run_state = AgentRunState::Paused;
            let _ = self.state_tx.send(AgentRunState::Paused);
        }
    }
}

//! The scheduler: a minute-aligned cron tick and an event bus sharing
//! one agent-keyed schedule table.
//!
//! The scheduler is tick-driven (one timer total, not one per
//! schedule). Fire callbacks run outside the table lock; overlapping
//! fires of one schedule are coalesced — a new fire is skipped while
//! the prior one is still in flight.

pub mod cron;
pub mod model;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use hub_domain::error::{Error, Result};
use hub_tools::state::{evaluate_condition, parse_condition};

pub use cron::{local_timezone_name, validate_cron};
pub use model::{Schedule, ScheduleAction, ScheduleKind, MAX_SCHEDULES_PER_AGENT};

/// Posts a synthetic user message into an agent's runner.
pub type MessageSink = Arc<dyn Fn(String, String) + Send + Sync>;
/// Executes a tool fire-and-forget; the future resolves when the tool
/// call has finished (used for fire coalescing).
pub type ToolRunner =
    Arc<dyn Fn(String, String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Scheduler {
    table: Mutex<HashMap<String, Vec<Schedule>>>,
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
    message_sink: RwLock<Option<MessageSink>>,
    tool_runner: RwLock<Option<ToolRunner>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            message_sink: RwLock::new(None),
            tool_runner: RwLock::new(None),
        }
    }

    /// Post-construction wiring: the runner and executor are built
    /// after the scheduler, so the sinks arrive late.
    pub fn wire(&self, message_sink: MessageSink, tool_runner: ToolRunner) {
        *self.message_sink.write() = Some(message_sink);
        *self.tool_runner.write() = Some(tool_runner);
    }

    // ── CRUD ──────────────────────────────────────────────────────

    pub fn add(&self, schedule: Schedule) -> Result<()> {
        match schedule.kind {
            ScheduleKind::Cron => {
                let expr = schedule
                    .cron_expression
                    .as_deref()
                    .ok_or_else(|| Error::Schedule("cron schedule needs an expression".into()))?;
                validate_cron(expr).map_err(Error::Schedule)?;
            }
            ScheduleKind::Event => {
                let name = schedule
                    .event_name
                    .as_deref()
                    .ok_or_else(|| Error::Schedule("event schedule needs an event name".into()))?;
                if name.is_empty() {
                    return Err(Error::Schedule("event name must not be empty".into()));
                }
                if let Some(cond) = schedule.event_condition.as_deref() {
                    parse_condition(cond)
                        .map_err(|e| Error::Schedule(format!("bad event condition: {e}")))?;
                }
            }
        }

        let mut table = self.table.lock();
        let list = table.entry(schedule.hub_agent_id.clone()).or_default();
        if list.len() >= MAX_SCHEDULES_PER_AGENT {
            return Err(Error::Schedule(format!(
                "agent already has {MAX_SCHEDULES_PER_AGENT} schedules"
            )));
        }
        if list.iter().any(|s| s.id == schedule.id) {
            return Err(Error::Schedule(format!(
                "schedule id already exists: {}",
                schedule.id
            )));
        }
        tracing::info!(
            agent_id = %schedule.hub_agent_id,
            schedule_id = %schedule.id,
            kind = ?schedule.kind,
            "schedule added"
        );
        list.push(schedule);
        Ok(())
    }

    pub fn list(&self, agent_id: &str) -> Vec<Schedule> {
        self.table
            .lock()
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove(&self, agent_id: &str, schedule_id: &str) -> bool {
        let mut table = self.table.lock();
        match table.get_mut(agent_id) {
            Some(list) => {
                let before = list.len();
                list.retain(|s| s.id != schedule_id);
                before != list.len()
            }
            None => false,
        }
    }

    pub fn set_enabled(&self, agent_id: &str, schedule_id: &str, enabled: bool) -> bool {
        let mut table = self.table.lock();
        if let Some(schedule) = table
            .get_mut(agent_id)
            .and_then(|list| list.iter_mut().find(|s| s.id == schedule_id))
        {
            schedule.enabled = enabled;
            true
        } else {
            false
        }
    }

    /// Agent destruction removes every schedule it owns.
    pub fn remove_agent(&self, agent_id: &str) {
        if self.table.lock().remove(agent_id).is_some() {
            tracing::debug!(agent_id = %agent_id, "schedules removed with agent");
        }
    }

    // ── Cron tick ─────────────────────────────────────────────────

    /// Evaluate every enabled cron schedule against a local wall-clock
    /// minute. Duplicate firings within the same minute are prevented
    /// by recording `last_run_at` at minute resolution before firing.
    pub fn tick(self: &Arc<Self>, local_now: chrono::NaiveDateTime) {
        let now = Utc::now();
        let this_minute = now.format("%Y-%m-%d %H:%M").to_string();

        let due: Vec<Schedule> = {
            let mut table = self.table.lock();
            let mut due = Vec::new();
            for list in table.values_mut() {
                for schedule in list.iter_mut() {
                    if !schedule.enabled || schedule.kind != ScheduleKind::Cron {
                        continue;
                    }
                    let Some(expr) = schedule.cron_expression.as_deref() else {
                        continue;
                    };
                    if !cron::cron_matches(expr, &local_now) {
                        continue;
                    }
                    let already_fired = schedule
                        .last_run_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string() == this_minute)
                        .unwrap_or(false);
                    if already_fired {
                        continue;
                    }
                    schedule.last_run_at = Some(now);
                    due.push(schedule.clone());
                }
            }
            due
        };

        for schedule in due {
            self.fire(schedule);
        }
    }

    /// Run the minute-aligned tick loop until cancelled.
    pub async fn run_tick_loop(
        self: Arc<Self>,
        shutdown: tokio_util::sync::CancellationToken,
    ) {
        loop {
            // Sleep to the start of the next minute.
            let now = chrono::Local::now();
            let wait = 60 - now.timestamp() % 60;
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(wait as u64)) => {}
                _ = shutdown.cancelled() => return,
            }
            self.tick(chrono::Local::now().naive_local());
        }
    }

    // ── Event bus ─────────────────────────────────────────────────

    /// Publish an event. Enumerates event schedules whose name matches,
    /// evaluates their condition against the payload, and fires the
    /// matches. `changed` is truthy on any publication.
    pub fn publish(self: &Arc<Self>, event_name: &str, payload: &Value) {
        let matched: Vec<Schedule> = {
            let table = self.table.lock();
            table
                .values()
                .flatten()
                .filter(|s| {
                    s.enabled
                        && s.kind == ScheduleKind::Event
                        && s.event_name.as_deref() == Some(event_name)
                })
                .filter(|s| match s.event_condition.as_deref() {
                    None => true,
                    Some(raw) => match parse_condition(raw) {
                        Ok(cond) => evaluate_condition(&cond, payload, true),
                        Err(_) => false,
                    },
                })
                .cloned()
                .collect()
        };

        if !matched.is_empty() {
            tracing::debug!(event = %event_name, fired = matched.len(), "event published");
        }
        for schedule in matched {
            self.fire(schedule);
        }
    }

    // ── Firing ────────────────────────────────────────────────────

    fn fire(self: &Arc<Self>, schedule: Schedule) {
        let key = schedule.flight_key();
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(key.clone()) {
                tracing::debug!(
                    schedule_id = %schedule.id,
                    "coalescing overlapping fire"
                );
                return;
            }
        }

        // Count the run and auto-disable at max_runs before the action
        // executes, so a slow action cannot over-fire.
        {
            let mut table = self.table.lock();
            if let Some(live) = table
                .get_mut(&schedule.hub_agent_id)
                .and_then(|list| list.iter_mut().find(|s| s.id == schedule.id))
            {
                live.run_count += 1;
                live.last_run_at = Some(Utc::now());
                if live.max_runs.is_some_and(|max| live.run_count >= max) {
                    live.enabled = false;
                    tracing::info!(schedule_id = %live.id, "schedule reached max_runs, disabled");
                }
            }
        }

        let message_sink = self.message_sink.read().clone();
        let tool_runner = self.tool_runner.read().clone();
        let in_flight = self.in_flight.clone();

        match schedule.action.clone() {
            ScheduleAction::Message { message } => {
                if let Some(sink) = message_sink {
                    sink(schedule.hub_agent_id.clone(), message);
                } else {
                    tracing::warn!(schedule_id = %schedule.id, "no message sink wired");
                }
                in_flight.lock().remove(&key);
            }
            ScheduleAction::Tool { tool, tool_input } => {
                let Some(runner) = tool_runner else {
                    tracing::warn!(schedule_id = %schedule.id, "no tool runner wired");
                    in_flight.lock().remove(&key);
                    return;
                };
                let agent_id = schedule.hub_agent_id.clone();
                tokio::spawn(async move {
                    // The result is discarded; state changes the tool
                    // makes republish on the event bus by themselves.
                    runner(agent_id, tool, tool_input).await;
                    in_flight.lock().remove(&key);
                });
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl hub_tools::executor::ScheduleApi for Scheduler {
    async fn handle(&self, agent_id: &str, input: Value) -> Result<Value> {
        let action = input
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        match action {
            "add" => {
                let id = input
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let kind = match input.get("schedule_type").and_then(|v| v.as_str()) {
                    Some("event") => ScheduleKind::Event,
                    _ => ScheduleKind::Cron,
                };
                let action = if let Some(message) =
                    input.get("message").and_then(|v| v.as_str())
                {
                    ScheduleAction::Message {
                        message: message.to_string(),
                    }
                } else if let Some(tool) = input.get("tool").and_then(|v| v.as_str()) {
                    ScheduleAction::Tool {
                        tool: tool.to_string(),
                        tool_input: input.get("tool_input").cloned().unwrap_or(json!({})),
                    }
                } else {
                    return Err(Error::Schedule(
                        "schedule needs a message or a tool".into(),
                    ));
                };
                let schedule = Schedule {
                    id: id.clone(),
                    hub_agent_id: agent_id.to_string(),
                    kind,
                    enabled: true,
                    run_count: 0,
                    max_runs: input
                        .get("max_runs")
                        .and_then(|v| v.as_u64())
                        .map(|v| v as u32),
                    last_run_at: None,
                    cron_expression: input
                        .get("cron_expression")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    event_name: input
                        .get("event_name")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    event_condition: input
                        .get("event_condition")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    action,
                };
                self.add(schedule)?;
                Ok(json!({
                    "id": id,
                    "ok": true,
                    "timezone": local_timezone_name(),
                }))
            }
            "list" => Ok(json!({ "schedules": self.list(agent_id) })),
            "remove" => {
                let id = require_id(&input)?;
                Ok(json!({ "id": id, "removed": self.remove(agent_id, id) }))
            }
            "enable" => {
                let id = require_id(&input)?;
                Ok(json!({ "id": id, "enabled": self.set_enabled(agent_id, id, true) }))
            }
            "disable" => {
                let id = require_id(&input)?;
                Ok(json!({ "id": id, "disabled": self.set_enabled(agent_id, id, false) }))
            }
            other => Err(Error::Schedule(format!("unknown schedule action: {other}"))),
        }
    }
}

fn require_id(input: &Value) -> Result<&str> {
    input
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Schedule("missing schedule id".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cron_schedule(id: &str, agent: &str, expr: &str) -> Schedule {
        Schedule {
            id: id.into(),
            hub_agent_id: agent.into(),
            kind: ScheduleKind::Cron,
            enabled: true,
            run_count: 0,
            max_runs: None,
            last_run_at: None,
            cron_expression: Some(expr.into()),
            event_name: None,
            event_condition: None,
            action: ScheduleAction::Message {
                message: "ping".into(),
            },
        }
    }

    fn event_schedule(id: &str, agent: &str, event: &str, condition: Option<&str>) -> Schedule {
        Schedule {
            id: id.into(),
            hub_agent_id: agent.into(),
            kind: ScheduleKind::Event,
            enabled: true,
            run_count: 0,
            max_runs: None,
            last_run_at: None,
            cron_expression: None,
            event_name: Some(event.into()),
            event_condition: condition.map(str::to_owned),
            action: ScheduleAction::Message {
                message: "alert".into(),
            },
        }
    }

    fn wire_counter(scheduler: &Arc<Scheduler>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        scheduler.wire(
            Arc::new(move |_agent, _msg| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_agent, _tool, _input| Box::pin(async {})),
        );
        count
    }

    #[test]
    fn add_enforces_limits_and_uniqueness() {
        let scheduler = Scheduler::new();
        for i in 0..MAX_SCHEDULES_PER_AGENT {
            scheduler
                .add(cron_schedule(&format!("s{i}"), "a1", "* * * * *"))
                .unwrap();
        }
        assert!(scheduler
            .add(cron_schedule("overflow", "a1", "* * * * *"))
            .is_err());
        // A different agent still has room.
        scheduler
            .add(cron_schedule("s0", "a2", "* * * * *"))
            .unwrap();
        // Duplicate id on the same agent is refused.
        assert!(scheduler.add(cron_schedule("s0", "a2", "* * * * *")).is_err());
    }

    #[test]
    fn add_validates_cron_and_condition() {
        let scheduler = Scheduler::new();
        assert!(scheduler.add(cron_schedule("bad", "a", "not a cron")).is_err());
        assert!(scheduler
            .add(event_schedule("bad2", "a", "state:x", Some("garbage(")))
            .is_err());
        assert!(scheduler
            .add(event_schedule("ok", "a", "state:x", Some("> 100")))
            .is_ok());
    }

    #[tokio::test]
    async fn tick_fires_matching_minute_once() {
        let scheduler = Arc::new(Scheduler::new());
        let fired = wire_counter(&scheduler);
        scheduler
            .add(cron_schedule("s1", "a1", "*/5 * * * *"))
            .unwrap();

        let at_1205 = chrono::NaiveDate::from_ymd_opt(2024, 6, 15)
            .unwrap()
            .and_hms_opt(12, 5, 0)
            .unwrap();
        scheduler.tick(at_1205);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same minute again: deduplicated by last_run_at.
        scheduler.tick(at_1205);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A non-matching minute does not fire.
        let at_1206 = at_1205 + chrono::Duration::minutes(1);
        scheduler.tick(at_1206);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn event_condition_gates_fire() {
        let scheduler = Arc::new(Scheduler::new());
        let fired = wire_counter(&scheduler);
        scheduler
            .add(event_schedule("s1", "a1", "state:score", Some("> 100")))
            .unwrap();

        scheduler.publish("state:score", &json!(50));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        scheduler.publish("state:score", &json!(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Name mismatch never fires.
        scheduler.publish("state:other", &json!(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn changed_condition_fires_on_any_publication() {
        let scheduler = Arc::new(Scheduler::new());
        let fired = wire_counter(&scheduler);
        scheduler
            .add(event_schedule("s1", "a1", "tick", Some("changed")))
            .unwrap();
        scheduler.publish("tick", &json!(null));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn max_runs_auto_disables() {
        let scheduler = Arc::new(Scheduler::new());
        let fired = wire_counter(&scheduler);
        let mut s = event_schedule("s1", "a1", "e", None);
        s.max_runs = Some(2);
        scheduler.add(s).unwrap();

        for _ in 0..5 {
            scheduler.publish("e", &json!(1));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        let list = scheduler.list("a1");
        assert_eq!(list[0].run_count, 2);
        assert!(!list[0].enabled);
    }

    #[tokio::test]
    async fn agent_removal_drops_schedules() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.add(cron_schedule("s1", "a1", "* * * * *")).unwrap();
        scheduler.remove_agent("a1");
        assert!(scheduler.list("a1").is_empty());
    }

    #[tokio::test]
    async fn schedule_tool_surface() {
        use hub_tools::executor::ScheduleApi;
        let scheduler = Arc::new(Scheduler::new());
        let out = scheduler
            .handle(
                "a1",
                json!({
                    "action": "add",
                    "schedule_type": "cron",
                    "cron_expression": "*/5 * * * *",
                    "message": "ping",
                }),
            )
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert!(out["timezone"].as_str().unwrap().starts_with("UTC"));

        let out = scheduler.handle("a1", json!({"action": "list"})).await.unwrap();
        assert_eq!(out["schedules"].as_array().unwrap().len(), 1);

        let id = out["schedules"][0]["id"].as_str().unwrap().to_string();
        let out = scheduler
            .handle("a1", json!({"action": "disable", "id": id}))
            .await
            .unwrap();
        assert_eq!(out["disabled"], true);

        let err = scheduler
            .handle("a1", json!({"action": "add", "schedule_type": "cron",
                                  "cron_expression": "bogus", "message": "x"}))
            .await;
        assert!(err.is_err());
    }
}

//! Per-agent key/value state store with size caps, synchronous change
//! listeners, and escalation rules.
//!
//! The condition grammar is deliberately closed: the literals `always`
//! and `changed`, and comparisons `(> | < | >= | <= | == | !=) <scalar>`
//! where scalar is a number, boolean, or (quoted or bare) string. A
//! hand-written tokenizer keeps the surface small; there is no general
//! expression language here.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use hub_domain::error::{Error, Result};

pub const MAX_KEYS: usize = 1000;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;
pub const MAX_TOTAL_SIZE: usize = 10 * 1024 * 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Condition grammar
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Bool(bool),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Always,
    Changed,
    Cmp(CmpOp, Scalar),
}

/// Parse a condition string.
pub fn parse_condition(input: &str) -> Result<Condition> {
    let trimmed = input.trim();
    match trimmed {
        "always" => return Ok(Condition::Always),
        "changed" => return Ok(Condition::Changed),
        _ => {}
    }

    let (op, rest) = if let Some(rest) = trimmed.strip_prefix(">=") {
        (CmpOp::Ge, rest)
    } else if let Some(rest) = trimmed.strip_prefix("<=") {
        (CmpOp::Le, rest)
    } else if let Some(rest) = trimmed.strip_prefix("==") {
        (CmpOp::Eq, rest)
    } else if let Some(rest) = trimmed.strip_prefix("!=") {
        (CmpOp::Ne, rest)
    } else if let Some(rest) = trimmed.strip_prefix('>') {
        (CmpOp::Gt, rest)
    } else if let Some(rest) = trimmed.strip_prefix('<') {
        (CmpOp::Lt, rest)
    } else {
        return Err(Error::Storage(format!("invalid condition: {input:?}")));
    };

    let scalar = parse_scalar(rest.trim())?;
    Ok(Condition::Cmp(op, scalar))
}

fn parse_scalar(raw: &str) -> Result<Scalar> {
    if raw.is_empty() {
        return Err(Error::Storage("condition missing operand".into()));
    }
    if let Some(quoted) = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
    {
        return Ok(Scalar::Str(quoted.to_string()));
    }
    if raw == "true" {
        return Ok(Scalar::Bool(true));
    }
    if raw == "false" {
        return Ok(Scalar::Bool(false));
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Ok(Scalar::Number(n));
    }
    // Bare string.
    Ok(Scalar::Str(raw.to_string()))
}

/// Evaluate a condition against a value. `changed` is truthy whenever
/// the evaluation is triggered by a mutation or publication.
pub fn evaluate_condition(cond: &Condition, value: &Value, changed: bool) -> bool {
    match cond {
        Condition::Always => true,
        Condition::Changed => changed,
        Condition::Cmp(op, scalar) => compare(*op, value, scalar),
    }
}

fn compare(op: CmpOp, value: &Value, scalar: &Scalar) -> bool {
    match scalar {
        Scalar::Number(rhs) => {
            let Some(lhs) = value.as_f64() else {
                return false;
            };
            match op {
                CmpOp::Gt => lhs > *rhs,
                CmpOp::Lt => lhs < *rhs,
                CmpOp::Ge => lhs >= *rhs,
                CmpOp::Le => lhs <= *rhs,
                CmpOp::Eq => lhs == *rhs,
                CmpOp::Ne => lhs != *rhs,
            }
        }
        Scalar::Bool(rhs) => {
            let Some(lhs) = value.as_bool() else {
                return false;
            };
            match op {
                CmpOp::Eq => lhs == *rhs,
                CmpOp::Ne => lhs != *rhs,
                _ => false,
            }
        }
        Scalar::Str(rhs) => {
            let Some(lhs) = value.as_str() else {
                return false;
            };
            match op {
                CmpOp::Eq => lhs == rhs,
                CmpOp::Ne => lhs != rhs,
                CmpOp::Gt => lhs > rhs.as_str(),
                CmpOp::Lt => lhs < rhs.as_str(),
                CmpOp::Ge => lhs >= rhs.as_str(),
                CmpOp::Le => lhs <= rhs.as_str(),
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct EscalationRule {
    pub condition: Condition,
    pub message: Option<String>,
}

type Listener = Box<dyn Fn(&str, &Value) + Send + Sync>;

struct Inner {
    entries: HashMap<String, (Value, usize)>,
    total_size: usize,
}

/// The per-agent state store. `set` refuses any write that would exceed
/// the key-count, per-value, or total-size cap; listeners only fire
/// when the limit check passes.
pub struct AgentStateStore {
    inner: Mutex<Inner>,
    escalations: Mutex<HashMap<String, EscalationRule>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: Mutex<u64>,
}

impl Default for AgentStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                total_size: 0,
            }),
            escalations: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: Mutex::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().entries.get(key).map(|(v, _)| v.clone())
    }

    pub fn get_all(&self) -> HashMap<String, Value> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    /// Insert or replace a key. Size is estimated by JSON length;
    /// replacing a key only counts the delta against the total cap.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let value_size = serde_json::to_string(&value)
            .map(|s| s.len())
            .unwrap_or(0)
            + key.len();
        if value_size > MAX_VALUE_SIZE {
            return Err(Error::Storage(format!(
                "value for {key:?} exceeds {MAX_VALUE_SIZE} bytes"
            )));
        }

        {
            let mut inner = self.inner.lock();
            let existing = inner.entries.get(key).map(|(_, size)| *size);
            if existing.is_none() && inner.entries.len() >= MAX_KEYS {
                return Err(Error::Storage(format!(
                    "state store is full ({MAX_KEYS} keys)"
                )));
            }
            let new_total = inner.total_size - existing.unwrap_or(0) + value_size;
            if new_total > MAX_TOTAL_SIZE {
                return Err(Error::Storage(format!(
                    "state store would exceed {MAX_TOTAL_SIZE} bytes"
                )));
            }
            inner.entries.insert(key.to_string(), (value.clone(), value_size));
            inner.total_size = new_total;
        }

        self.notify(key, &value);
        Ok(())
    }

    /// Remove a key. Returns `true` if it existed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.entries.remove(key) {
                Some((_, size)) => {
                    inner.total_size -= size;
                    true
                }
                None => false,
            }
        };
        if removed {
            self.notify(key, &Value::Null);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    /// Replace the full contents (used when restoring a session
    /// snapshot). Bypasses listeners; caps still apply per entry.
    pub fn load_snapshot(&self, snapshot: HashMap<String, Value>) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_size = 0;
        for (key, value) in snapshot {
            let size = serde_json::to_string(&value)
                .map(|s| s.len())
                .unwrap_or(0)
                + key.len();
            if inner.entries.len() >= MAX_KEYS || inner.total_size + size > MAX_TOTAL_SIZE {
                tracing::warn!(key = %key, "snapshot entry dropped by store limits");
                continue;
            }
            inner.total_size += size;
            inner.entries.insert(key, (value, size));
        }
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.get_all()
    }

    // ── Listeners ─────────────────────────────────────────────────

    /// Register a synchronous change listener. Returns an opaque handle
    /// for deregistration.
    pub fn add_listener(&self, f: impl Fn(&str, &Value) + Send + Sync + 'static) -> u64 {
        let mut next = self.next_listener_id.lock();
        *next += 1;
        let id = *next;
        self.listeners.lock().push((id, Box::new(f)));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn notify(&self, key: &str, value: &Value) {
        let listeners = self.listeners.lock();
        for (_, listener) in listeners.iter() {
            listener(key, value);
        }
    }

    // ── Escalations ───────────────────────────────────────────────

    pub fn set_escalation(
        &self,
        key: &str,
        condition: &str,
        message: Option<String>,
    ) -> Result<()> {
        let condition = parse_condition(condition)?;
        self.escalations
            .lock()
            .insert(key.to_string(), EscalationRule { condition, message });
        Ok(())
    }

    pub fn clear_escalation(&self, key: &str) -> bool {
        self.escalations.lock().remove(key).is_some()
    }

    pub fn escalations(&self) -> HashMap<String, EscalationRule> {
        self.escalations.lock().clone()
    }

    /// Evaluate the escalation rule for `key` against a just-written
    /// value. Returns the rule's message when it fires.
    pub fn evaluate_escalation(&self, key: &str, value: &Value) -> Option<Option<String>> {
        let escalations = self.escalations.lock();
        let rule = escalations.get(key)?;
        if evaluate_condition(&rule.condition, value, true) {
            Some(rule.message.clone())
        } else {
            None
        }
    }
}

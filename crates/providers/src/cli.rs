//! CLI proxy adapter.
//!
//! Some providers are served by a local binary that speaks an
//! Anthropic-compatible contract over stdio: the hub writes a
//! pre-formatted prompt to stdin, the child prints JSON lines, and each
//! assistant line is converted into the canonical event sequence.
//!
//! Tool calls ride inside assistant text as `<tool_call>JSON</tool_call>`
//! blocks. The text before the first tool call is kept; trailing text
//! after the last one is an LLM-simulated continuation and is
//! discarded. `<tool_result>...</tool_result>` blocks in model output
//! are stripped. When history is re-submitted, assistant tool_use and
//! user tool_result blocks are serialized back to the same XML forms.
//!
//! The child is killed after the configured deadline (default 120 s).

use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use hub_domain::config::CliProviderConfig;
use hub_domain::error::{Error, Result};
use hub_domain::stream::{BlockDelta, BlockStart, StopReason, StreamEvent};
use hub_domain::tool::{ChatMessage, ContentBlock, Role};

use crate::fresh_tool_use_id;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-call XML extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";
const TOOL_RESULT_OPEN: &str = "<tool_result>";
const TOOL_RESULT_CLOSE: &str = "</tool_result>";

/// A tool call extracted from assistant text.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCall {
    pub name: String,
    pub input: Value,
}

/// Strip `<tool_result>` blocks the model hallucinated into its output.
fn strip_tool_results(text: &str) -> String {
    let mut out = String::new();
    let mut rest = text;
    while let Some(open) = rest.find(TOOL_RESULT_OPEN) {
        out.push_str(&rest[..open]);
        match rest[open..].find(TOOL_RESULT_CLOSE) {
            Some(close) => rest = &rest[open + close + TOOL_RESULT_CLOSE.len()..],
            None => return out, // unterminated block: drop the remainder
        }
    }
    out.push_str(rest);
    out
}

/// Split assistant text into the leading text and its tool calls.
/// Text after the last tool call is discarded.
pub fn split_tool_calls(text: &str) -> (String, Vec<ExtractedCall>) {
    let cleaned = strip_tool_results(text);
    let Some(first) = cleaned.find(TOOL_CALL_OPEN) else {
        return (cleaned.trim_end().to_string(), Vec::new());
    };

    let leading = cleaned[..first].trim_end().to_string();
    let mut calls = Vec::new();
    let mut rest = &cleaned[first..];

    while let Some(open) = rest.find(TOOL_CALL_OPEN) {
        let after_open = &rest[open + TOOL_CALL_OPEN.len()..];
        let Some(close) = after_open.find(TOOL_CALL_CLOSE) else {
            break;
        };
        let raw = after_open[..close].trim();
        match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => {
                let name = parsed
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let input = parsed
                    .get("input")
                    .or_else(|| parsed.get("arguments"))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                if !name.is_empty() {
                    calls.push(ExtractedCall { name, input });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed tool_call block");
            }
        }
        rest = &after_open[close + TOOL_CALL_CLOSE.len()..];
    }

    (leading, calls)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt rendering (round-trip serialization)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Render a conversation into the stdin prompt, serializing tool_use
/// and tool_result blocks back to their XML forms.
pub fn render_prompt(system: Option<&str>, messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    if let Some(system) = system {
        out.push_str("System: ");
        out.push_str(system);
        out.push_str("\n\n");
    }
    for msg in messages {
        let label = match msg.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        out.push_str(label);
        out.push_str(": ");
        for block in &msg.content {
            match block {
                ContentBlock::Text { text } => out.push_str(text),
                ContentBlock::ToolUse { name, input, .. } => {
                    out.push_str(TOOL_CALL_OPEN);
                    out.push_str(&json!({ "name": name, "input": input }).to_string());
                    out.push_str(TOOL_CALL_CLOSE);
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    out.push_str(TOOL_RESULT_OPEN);
                    out.push_str(
                        &json!({
                            "tool_use_id": tool_use_id,
                            "content": content,
                            "is_error": is_error,
                        })
                        .to_string(),
                    );
                    out.push_str(TOOL_RESULT_CLOSE);
                }
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str("Assistant:");
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct CliAdapter {
    config: CliProviderConfig,
}

impl CliAdapter {
    pub fn new(config: CliProviderConfig) -> Self {
        Self { config }
    }

    /// Argument template expansion: `{model}` is replaced with the
    /// requested model name.
    fn build_args(&self, model: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|a| a.replace("{model}", model))
            .collect()
    }

    /// Run the CLI for one turn, yielding canonical events.
    pub async fn stream_events(
        &self,
        model: &str,
        prompt: String,
    ) -> Result<hub_domain::stream::BoxStream<'static, Result<StreamEvent>>> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.build_args(model));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Proxy {
                provider: "cli".into(),
                message: format!("failed to spawn {}: {e}", self.config.command),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| Error::Proxy {
            provider: "cli".into(),
            message: "child has no stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::Proxy {
            provider: "cli".into(),
            message: "child has no stdout".into(),
        })?;

        let deadline = Duration::from_secs(self.config.timeout_secs);

        let stream = async_stream::stream! {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                yield Err(Error::Proxy {
                    provider: "cli".into(),
                    message: format!("writing prompt: {e}"),
                });
                return;
            }
            drop(stdin);

            let mut lines = BufReader::new(stdout).lines();
            let started = tokio::time::Instant::now();
            let mut next_block = 0usize;
            let mut message_started = false;
            let mut saw_tool_calls = false;

            loop {
                let remaining = deadline.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    let _ = child.start_kill();
                    yield Err(Error::Timeout(format!(
                        "cli provider exceeded {}s deadline",
                        deadline.as_secs()
                    )));
                    return;
                }
                let line = match tokio::time::timeout(remaining, lines.next_line()).await {
                    Ok(Ok(Some(line))) => line,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        yield Err(Error::Proxy {
                            provider: "cli".into(),
                            message: format!("reading stdout: {e}"),
                        });
                        return;
                    }
                    Err(_) => {
                        // Deadline reached mid-read: SIGKILL the child.
                        let _ = child.start_kill();
                        yield Err(Error::Timeout(format!(
                            "cli provider exceeded {}s deadline",
                            deadline.as_secs()
                        )));
                        return;
                    }
                };

                let Some(text) = assistant_text(&line) else {
                    continue;
                };
                let (leading, calls) = split_tool_calls(&text);

                if !message_started {
                    message_started = true;
                    yield Ok(StreamEvent::MessageStart { usage: None });
                }

                if !leading.is_empty() {
                    let index = next_block;
                    next_block += 1;
                    yield Ok(StreamEvent::ContentBlockStart {
                        index,
                        block: BlockStart::Text,
                    });
                    yield Ok(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::TextDelta { text: leading },
                    });
                    yield Ok(StreamEvent::ContentBlockStop { index });
                }

                for call in calls {
                    saw_tool_calls = true;
                    let index = next_block;
                    next_block += 1;
                    yield Ok(StreamEvent::ContentBlockStart {
                        index,
                        block: BlockStart::ToolUse {
                            id: Some(fresh_tool_use_id()),
                            name: call.name,
                        },
                    });
                    yield Ok(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: call.input.to_string(),
                        },
                    });
                    yield Ok(StreamEvent::ContentBlockStop { index });
                }
            }

            let status = child.wait().await;
            if let Ok(status) = &status {
                if !status.success() && !message_started {
                    yield Err(Error::Proxy {
                        provider: "cli".into(),
                        message: format!("cli exited with {status}"),
                    });
                    return;
                }
            }

            if !message_started {
                yield Ok(StreamEvent::MessageStart { usage: None });
            }
            let stop_reason = if saw_tool_calls {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            };
            yield Ok(StreamEvent::MessageDelta {
                stop_reason: Some(stop_reason),
                usage: None,
            });
            yield Ok(StreamEvent::MessageStop);
        };

        Ok(Box::pin(stream))
    }
}

/// Pull assistant text out of one stdout JSON line. Non-assistant lines
/// (tool events, result summaries, malformed output) return `None`.
fn assistant_text(line: &str) -> Option<String> {
    let v: Value = serde_json::from_str(line.trim()).ok()?;
    let line_type = v.get("type").and_then(|t| t.as_str());
    if let Some(t) = line_type {
        if t != "assistant" {
            return None;
        }
    }

    // Anthropic-shaped: message.content[] text blocks.
    if let Some(blocks) = v
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    {
        let text: String = blocks
            .iter()
            .filter_map(|b| {
                (b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| b.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("");
        if !text.is_empty() {
            return Some(text);
        }
        return None;
    }

    // Flat shapes: {"content": "..."} or {"text": "..."}.
    v.get("content")
        .or_else(|| v.get("text"))
        .and_then(|t| t.as_str())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn split_plain_text_has_no_calls() {
        let (text, calls) = split_tool_calls("just an answer");
        assert_eq!(text, "just an answer");
        assert!(calls.is_empty());
    }

    #[test]
    fn split_extracts_calls_and_discards_trailing_text() {
        let input = concat!(
            "Let me check.\n",
            "<tool_call>{\"name\":\"state\",\"input\":{\"action\":\"get\",\"key\":\"k\"}}</tool_call>",
            "\nHere is what I found: the value is 7."
        );
        let (text, calls) = split_tool_calls(input);
        assert_eq!(text, "Let me check.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "state");
        assert_eq!(calls[0].input["key"], "k");
    }

    #[test]
    fn split_strips_tool_result_blocks() {
        let input = concat!(
            "Before <tool_result>{\"content\":\"fake\"}</tool_result> after ",
            "<tool_call>{\"name\":\"bash\",\"input\":{\"command\":\"ls\"}}</tool_call>"
        );
        let (text, calls) = split_tool_calls(input);
        assert_eq!(text, "Before  after");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "bash");
    }

    #[test]
    fn split_tolerates_malformed_call_json() {
        let input = "<tool_call>not json</tool_call><tool_call>{\"name\":\"a\"}</tool_call>";
        let (_, calls) = split_tool_calls(input);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[0].input, json!({}));
    }

    #[test]
    fn render_prompt_round_trips_xml_forms() {
        let messages = vec![
            ChatMessage::user("get the key"),
            ChatMessage {
                role: Role::Assistant,
                content: vec![
                    ContentBlock::Text {
                        text: "checking".into(),
                    },
                    ContentBlock::ToolUse {
                        id: "toolu_1".into(),
                        name: "state".into(),
                        input: json!({"action": "get", "key": "k"}),
                    },
                ],
                turn_id: None,
            },
            ChatMessage {
                role: Role::User,
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".into(),
                    content: "7".into(),
                    is_error: false,
                }],
                turn_id: None,
            },
        ];
        let prompt = render_prompt(Some("be terse"), &messages);
        assert!(prompt.starts_with("System: be terse"));
        assert!(prompt.contains("<tool_call>{\"input\":{\"action\":\"get\",\"key\":\"k\"},\"name\":\"state\"}</tool_call>"));
        assert!(prompt.contains(TOOL_RESULT_OPEN));
        assert!(prompt.trim_end().ends_with("Assistant:"));
    }

    #[test]
    fn assistant_text_shapes() {
        assert_eq!(
            assistant_text(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}"#),
            Some("Hello".into())
        );
        assert_eq!(
            assistant_text(r#"{"content":"flat"}"#),
            Some("flat".into())
        );
        assert_eq!(assistant_text(r#"{"type":"system","x":1}"#), None);
        assert_eq!(assistant_text("not json"), None);
    }

    #[tokio::test]
    async fn cli_happy_path_ends_in_end_turn() {
        // `cat` is not a JSON emitter; use a shell one-liner instead.
        let config = CliProviderConfig {
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"cat >/dev/null; printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]}}'"#.into(),
            ],
            timeout_secs: 10,
        };
        let adapter = CliAdapter::new(config);
        let mut stream = adapter
            .stream_events("test-model", "User: hi\n\nAssistant:".into())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(ev) = stream.next().await {
            events.push(ev.unwrap());
        }
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
                ..
            } if text == "Hello"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                ..
            }
        )));
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[tokio::test]
    async fn cli_deadline_kills_child() {
        let config = CliProviderConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "sleep 30".into()],
            timeout_secs: 1,
        };
        let adapter = CliAdapter::new(config);
        let mut stream = adapter.stream_events("m", String::new()).await.unwrap();
        let mut saw_timeout = false;
        while let Some(ev) = stream.next().await {
            if matches!(ev, Err(Error::Timeout(_))) {
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
    }
}

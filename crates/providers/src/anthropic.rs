//! Anthropic-native SSE normalizer.
//!
//! The Anthropic Messages API already speaks the canonical event
//! sequence, so this normalizer is mostly a typed re-emission with
//! defensive parsing: unparseable payloads are skipped, and provider
//! `error` events surface as proxy errors.

use serde_json::Value;

use hub_domain::error::{Error, Result};
use hub_domain::stream::{BlockDelta, BlockStart, StopReason, StreamEvent, Usage};

use crate::SseNormalizer;

pub struct AnthropicNormalizer {
    usage: Option<Usage>,
}

impl AnthropicNormalizer {
    pub fn new() -> Self {
        Self { usage: None }
    }
}

impl Default for AnthropicNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_stop_reason(raw: &str) -> StopReason {
    match raw {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens").and_then(|v| v.as_u64());
    let output = v.get("output_tokens").and_then(|v| v.as_u64());
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(Usage {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
    })
}

impl SseNormalizer for AnthropicNormalizer {
    fn normalize(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => {
                tracing::debug!("skipping unparseable anthropic event");
                return Vec::new();
            }
        };
        let event_type = v.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let index = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

        match event_type {
            "message_start" => {
                self.usage = v
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .and_then(parse_usage);
                vec![Ok(StreamEvent::MessageStart {
                    usage: self.usage.clone(),
                })]
            }

            "content_block_start" => {
                let Some(block) = v.get("content_block") else {
                    return Vec::new();
                };
                let start = match block.get("type").and_then(|v| v.as_str()) {
                    Some("tool_use") => BlockStart::ToolUse {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .map(str::to_owned),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    },
                    _ => BlockStart::Text,
                };
                vec![Ok(StreamEvent::ContentBlockStart {
                    index,
                    block: start,
                })]
            }

            "content_block_delta" => {
                let Some(delta) = v.get("delta") else {
                    return Vec::new();
                };
                let delta = match delta.get("type").and_then(|v| v.as_str()) {
                    Some("text_delta") => BlockDelta::TextDelta {
                        text: delta
                            .get("text")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    },
                    Some("input_json_delta") => BlockDelta::InputJsonDelta {
                        partial_json: delta
                            .get("partial_json")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    },
                    _ => return Vec::new(),
                };
                vec![Ok(StreamEvent::ContentBlockDelta { index, delta })]
            }

            "content_block_stop" => vec![Ok(StreamEvent::ContentBlockStop { index })],

            "message_delta" => {
                if let Some(output) = v
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    let usage = self.usage.get_or_insert_with(Usage::default);
                    usage.output_tokens = output;
                }
                let stop_reason = v
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|v| v.as_str())
                    .map(parse_stop_reason);
                vec![Ok(StreamEvent::MessageDelta {
                    stop_reason,
                    usage: self.usage.clone(),
                })]
            }

            "message_stop" => vec![Ok(StreamEvent::MessageStop)],

            "error" => {
                let message = v
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown provider error");
                vec![Err(Error::Proxy {
                    provider: "anthropic".into(),
                    message: message.to_string(),
                })]
            }

            // ping and future event types.
            _ => Vec::new(),
        }
    }
}

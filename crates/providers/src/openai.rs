//! OpenAI-compatible SSE normalizer.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio and anything else that
//! follows the chat-completions streaming contract. Text content maps
//! to canonical block 0; each `tool_calls[i]` delta maps to block
//! `i + 1`. `[DONE]` is a valid terminator.

use std::collections::HashMap;

use serde_json::Value;

use hub_domain::error::Result;
use hub_domain::stream::{BlockDelta, BlockStart, StopReason, StreamEvent, Usage};

use crate::SseNormalizer;

pub struct OpenAiNormalizer {
    started: bool,
    text_block_open: bool,
    /// Open tool-call blocks: provider index → canonical block index.
    tool_blocks: HashMap<u64, usize>,
    usage: Option<Usage>,
}

impl OpenAiNormalizer {
    pub fn new() -> Self {
        Self {
            started: false,
            text_block_open: false,
            tool_blocks: HashMap::new(),
            usage: None,
        }
    }

    fn ensure_started(&mut self, events: &mut Vec<Result<StreamEvent>>) {
        if !self.started {
            self.started = true;
            events.push(Ok(StreamEvent::MessageStart { usage: None }));
        }
    }

    fn close_open_blocks(&mut self, events: &mut Vec<Result<StreamEvent>>) {
        if self.text_block_open {
            self.text_block_open = false;
            events.push(Ok(StreamEvent::ContentBlockStop { index: 0 }));
        }
        let mut indices: Vec<usize> = self.tool_blocks.values().copied().collect();
        indices.sort_unstable();
        for index in indices {
            events.push(Ok(StreamEvent::ContentBlockStop { index }));
        }
        self.tool_blocks.clear();
    }
}

impl Default for OpenAiNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_finish_reason(raw: &str) -> StopReason {
    match raw {
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        "content_filter" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

impl SseNormalizer for OpenAiNormalizer {
    fn normalize(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        let mut events = Vec::new();

        if data.trim() == "[DONE]" {
            self.close_open_blocks(&mut events);
            events.push(Ok(StreamEvent::MessageStop));
            return events;
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => {
                tracing::debug!("skipping unparseable openai event");
                return events;
            }
        };

        // Usage arrives on the final chunk (or with stream_options).
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            let prompt = usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.usage = Some(Usage {
                input_tokens: prompt,
                output_tokens: completion,
            });
        }

        let Some(choice) = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
        else {
            return events;
        };

        if let Some(delta) = choice.get("delta") {
            // Text content.
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    self.ensure_started(&mut events);
                    if !self.text_block_open {
                        self.text_block_open = true;
                        events.push(Ok(StreamEvent::ContentBlockStart {
                            index: 0,
                            block: BlockStart::Text,
                        }));
                    }
                    events.push(Ok(StreamEvent::ContentBlockDelta {
                        index: 0,
                        delta: BlockDelta::TextDelta {
                            text: text.to_string(),
                        },
                    }));
                }
            }

            // Tool call deltas.
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for tc in tool_calls {
                    let provider_idx = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                    let canonical = provider_idx as usize + 1;

                    if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                        let name = tc
                            .get("function")
                            .and_then(|f| f.get("name"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        self.ensure_started(&mut events);
                        self.tool_blocks.insert(provider_idx, canonical);
                        events.push(Ok(StreamEvent::ContentBlockStart {
                            index: canonical,
                            block: BlockStart::ToolUse {
                                id: Some(id.to_string()),
                                name: name.to_string(),
                            },
                        }));
                    }

                    if let Some(args) = tc
                        .get("function")
                        .and_then(|f| f.get("arguments"))
                        .and_then(|v| v.as_str())
                    {
                        if !args.is_empty() && self.tool_blocks.contains_key(&provider_idx) {
                            events.push(Ok(StreamEvent::ContentBlockDelta {
                                index: canonical,
                                delta: BlockDelta::InputJsonDelta {
                                    partial_json: args.to_string(),
                                },
                            }));
                        }
                    }
                }
            }
        }

        if let Some(finish) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.ensure_started(&mut events);
            self.close_open_blocks(&mut events);
            events.push(Ok(StreamEvent::MessageDelta {
                stop_reason: Some(parse_finish_reason(finish)),
                usage: self.usage.clone(),
            }));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(lines: &[&str]) -> Vec<StreamEvent> {
        let mut n = OpenAiNormalizer::new();
        lines
            .iter()
            .flat_map(|l| n.normalize(l))
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn text_stream_produces_canonical_sequence() {
        let events = feed(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#,
            "[DONE]",
        ]);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                block: BlockStart::Text
            }
        ));
        assert!(matches!(
            &events[2],
            StreamEvent::ContentBlockDelta { index: 0, delta: BlockDelta::TextDelta { text } } if text == "Hel"
        ));
        match &events[5] {
            StreamEvent::MessageDelta { stop_reason, usage } => {
                assert_eq!(*stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.as_ref().unwrap().input_tokens, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[test]
    fn tool_call_stream_maps_to_block_one() {
        let events = feed(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"state","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"action\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"get\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);
        assert!(matches!(
            &events[1],
            StreamEvent::ContentBlockStart {
                index: 1,
                block: BlockStart::ToolUse { id: Some(id), name }
            } if id == "call_1" && name == "state"
        ));
        let json: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(json, r#"{"action":"get"}"#);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ContentBlockStop { index: 1 })));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta {
                stop_reason: Some(StopReason::ToolUse),
                ..
            }
        )));
    }

    #[test]
    fn unparseable_chunk_skipped() {
        let mut n = OpenAiNormalizer::new();
        assert!(n.normalize("garbage").is_empty());
    }

    #[test]
    fn done_without_prior_finish_still_stops() {
        let events = feed(&[
            r#"{"choices":[{"delta":{"content":"x"}}]}"#,
            "[DONE]",
        ]);
        // The open text block is closed before the stop.
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ContentBlockStop { index: 0 })));
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }
}

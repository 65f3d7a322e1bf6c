//! Gemini SSE normalizer.
//!
//! Gemini streams whole `candidates[].content.parts[]` chunks. Text
//! parts map to canonical block 0; each `functionCall` part becomes a
//! complete tool_use block (start, one json delta, stop) with a freshly
//! minted id, since Gemini supplies none.

use serde_json::Value;

use hub_domain::error::Result;
use hub_domain::stream::{BlockDelta, BlockStart, StopReason, StreamEvent, Usage};

use crate::{fresh_tool_use_id, SseNormalizer};

pub struct GeminiNormalizer {
    started: bool,
    text_block_open: bool,
    next_block: usize,
    saw_function_call: bool,
    usage: Option<Usage>,
}

impl GeminiNormalizer {
    pub fn new() -> Self {
        Self {
            started: false,
            text_block_open: false,
            next_block: 1,
            saw_function_call: false,
            usage: None,
        }
    }

    fn ensure_started(&mut self, events: &mut Vec<Result<StreamEvent>>) {
        if !self.started {
            self.started = true;
            events.push(Ok(StreamEvent::MessageStart { usage: None }));
        }
    }
}

impl Default for GeminiNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SseNormalizer for GeminiNormalizer {
    fn normalize(&mut self, data: &str) -> Vec<Result<StreamEvent>> {
        let mut events = Vec::new();

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => {
                tracing::debug!("skipping unparseable gemini event");
                return events;
            }
        };

        if let Some(meta) = v.get("usageMetadata") {
            self.usage = Some(Usage {
                input_tokens: meta
                    .get("promptTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                output_tokens: meta
                    .get("candidatesTokenCount")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
            });
        }

        let Some(candidate) = v
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
        else {
            return events;
        };

        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
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

                if let Some(fc) = part.get("functionCall") {
                    self.ensure_started(&mut events);
                    self.saw_function_call = true;
                    let name = fc
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let args = fc.get("args").cloned().unwrap_or(Value::Object(
                        serde_json::Map::new(),
                    ));
                    let index = self.next_block;
                    self.next_block += 1;

                    events.push(Ok(StreamEvent::ContentBlockStart {
                        index,
                        block: BlockStart::ToolUse {
                            id: Some(fresh_tool_use_id()),
                            name,
                        },
                    }));
                    events.push(Ok(StreamEvent::ContentBlockDelta {
                        index,
                        delta: BlockDelta::InputJsonDelta {
                            partial_json: args.to_string(),
                        },
                    }));
                    events.push(Ok(StreamEvent::ContentBlockStop { index }));
                }
            }
        }

        if candidate
            .get("finishReason")
            .and_then(|v| v.as_str())
            .is_some()
        {
            self.ensure_started(&mut events);
            if self.text_block_open {
                self.text_block_open = false;
                events.push(Ok(StreamEvent::ContentBlockStop { index: 0 }));
            }
            let finish = candidate
                .get("finishReason")
                .and_then(|v| v.as_str())
                .unwrap_or("STOP");
            let stop_reason = if self.saw_function_call {
                StopReason::ToolUse
            } else if finish == "MAX_TOKENS" {
                StopReason::MaxTokens
            } else {
                StopReason::EndTurn
            };
            events.push(Ok(StreamEvent::MessageDelta {
                stop_reason: Some(stop_reason),
                usage: self.usage.clone(),
            }));
            events.push(Ok(StreamEvent::MessageStop));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(lines: &[&str]) -> Vec<StreamEvent> {
        let mut n = GeminiNormalizer::new();
        lines
            .iter()
            .flat_map(|l| n.normalize(l))
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn text_chunks_stream_as_block_zero() {
        let events = feed(&[
            r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2}}"#,
        ]);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                block: BlockStart::Text
            }
        ));
        match &events[events.len() - 2] {
            StreamEvent::MessageDelta { stop_reason, usage } => {
                assert_eq!(*stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.as_ref().unwrap().output_tokens, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));
    }

    #[test]
    fn function_call_becomes_complete_tool_block() {
        let events = feed(&[
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"state","args":{"action":"get"}}}]},"finishReason":"STOP"}]}"#,
        ]);
        let start = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::ToolUse { id, name },
                } => Some((*index, id.clone(), name.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(start.0, 1);
        assert!(start.1.unwrap().starts_with("toolu_"));
        assert_eq!(start.2, "state");
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta {
                stop_reason: Some(StopReason::ToolUse),
                ..
            }
        )));
    }

    #[test]
    fn fresh_ids_differ_per_call() {
        let events = feed(&[
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"a","args":{}}},{"functionCall":{"name":"b","args":{}}}]},"finishReason":"STOP"}]}"#,
        ]);
        let ids: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart {
                    block: BlockStart::ToolUse { id, .. },
                    ..
                } => id.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }
}

//! Provider adapters: three SSE normalizers (Anthropic native,
//! OpenAI-compatible, Gemini) behind one interface, the streaming API
//! client with provider auth injection, and the CLI proxy adapter.

pub mod anthropic;
pub mod cli;
pub mod client;
pub mod gemini;
pub mod openai;
pub mod sse;

use hub_domain::error::Result;
use hub_domain::stream::StreamEvent;

/// Normalizes one provider's SSE `data:` payloads into the canonical
/// event sequence. Implementations are stateful (tool-call assembly
/// spans several payloads) and must gracefully skip unparseable events.
pub trait SseNormalizer: Send {
    fn normalize(&mut self, data: &str) -> Vec<Result<StreamEvent>>;
}

/// Pick the normalizer for a provider name. Unknown providers use the
/// OpenAI-compatible shape, which is what most self-hosted endpoints
/// (including Ollama) speak.
pub fn normalizer_for(provider: &str) -> Box<dyn SseNormalizer> {
    match provider {
        "anthropic" => Box::new(anthropic::AnthropicNormalizer::new()),
        "gemini" => Box::new(gemini::GeminiNormalizer::new()),
        _ => Box::new(openai::OpenAiNormalizer::new()),
    }
}

/// Mint a tool-use id when the provider did not supply one.
pub(crate) fn fresh_tool_use_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}

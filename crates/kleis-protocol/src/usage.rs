use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Token counters extracted from an upstream response. All fields are
/// clamped non-negative at extraction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_read_tokens == 0
            && self.cache_write_tokens == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageProtocol {
    OpenAiResponses,
    OpenAiChat,
    Anthropic,
}

/// Folds SSE data payloads (or a buffered JSON body) into token usage.
///
/// OpenAI protocols emit usage from a single terminal payload; Anthropic
/// spreads it across `message_start` and `message_delta` events, so the
/// extractor accumulates and the last populated observation wins, emitted
/// only via `finish`.
#[derive(Debug)]
pub struct UsageExtractor {
    protocol: UsageProtocol,
    pending: Option<TokenUsage>,
}

impl UsageExtractor {
    pub fn new(protocol: UsageProtocol) -> Self {
        Self {
            protocol,
            pending: None,
        }
    }

    /// Feed one data payload. Non-JSON payloads and the `[DONE]` sentinel
    /// are ignored. Returns usage that should be emitted immediately.
    pub fn observe(&mut self, data: &str) -> Option<TokenUsage> {
        let trimmed = data.trim();
        if trimmed.is_empty() || trimmed == "[DONE]" {
            return None;
        }
        let Ok(payload) = serde_json::from_str::<JsonValue>(trimmed) else {
            return None;
        };
        match self.protocol {
            UsageProtocol::OpenAiResponses => observe_openai_responses(&payload),
            UsageProtocol::OpenAiChat => observe_openai_chat(&payload),
            UsageProtocol::Anthropic => {
                self.observe_anthropic(&payload);
                None
            }
        }
    }

    /// Stream end. Emits whatever the accumulating protocols still hold.
    pub fn finish(&mut self) -> Option<TokenUsage> {
        self.pending.take().filter(|usage| !usage.is_empty())
    }

    fn observe_anthropic(&mut self, payload: &JsonValue) {
        let kind = payload.get("type").and_then(|value| value.as_str());
        let usage = match kind {
            Some("message_start") => payload
                .get("message")
                .and_then(|message| message.get("usage")),
            // Non-streaming messages response carries usage at the top level.
            Some("message") => payload.get("usage"),
            Some("message_delta") => payload.get("usage"),
            _ => None,
        };
        let Some(usage) = usage.and_then(|value| value.as_object()) else {
            return;
        };

        let entry = self.pending.get_or_insert_with(TokenUsage::default);
        if let Some(value) = non_negative(usage.get("input_tokens")) {
            entry.input_tokens = value;
        }
        if let Some(value) = non_negative(usage.get("cache_read_input_tokens")) {
            entry.cache_read_tokens = value;
        }
        if let Some(value) = non_negative(usage.get("cache_creation_input_tokens")) {
            entry.cache_write_tokens = value;
        }
        if let Some(value) = non_negative(usage.get("output_tokens")) {
            entry.output_tokens = value;
        }
    }
}

fn observe_openai_responses(payload: &JsonValue) -> Option<TokenUsage> {
    let kind = payload.get("type").and_then(|value| value.as_str());
    if !matches!(kind, Some("response.completed") | Some("response.done")) {
        return None;
    }
    let usage = payload.get("response")?.get("usage")?.as_object()?;
    let input = non_negative(usage.get("input_tokens")).unwrap_or(0);
    let cached = non_negative(
        usage
            .get("input_tokens_details")
            .and_then(|details| details.get("cached_tokens")),
    )
    .unwrap_or(0);
    Some(TokenUsage {
        input_tokens: (input - cached).max(0),
        output_tokens: non_negative(usage.get("output_tokens")).unwrap_or(0),
        cache_read_tokens: cached,
        cache_write_tokens: 0,
    })
}

fn observe_openai_chat(payload: &JsonValue) -> Option<TokenUsage> {
    let usage = payload.get("usage")?.as_object()?;
    let prompt = non_negative(usage.get("prompt_tokens")).unwrap_or(0);
    let cached = non_negative(
        usage
            .get("prompt_tokens_details")
            .and_then(|details| details.get("cached_tokens")),
    )
    .unwrap_or(0);
    Some(TokenUsage {
        input_tokens: (prompt - cached).max(0),
        output_tokens: non_negative(usage.get("completion_tokens")).unwrap_or(0),
        cache_read_tokens: cached,
        cache_write_tokens: 0,
    })
}

fn non_negative(value: Option<&JsonValue>) -> Option<i64> {
    value?.as_i64().map(|value| value.max(0))
}

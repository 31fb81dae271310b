use std::borrow::Cow;
use std::sync::OnceLock;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use regex::Regex;
use tokio::sync::mpsc;

use kleis_protocol::{SseParser, TokenUsage, UsageExtractor, UsageProtocol};
use kleis_provider_core::ResponseTransform;

fn protocol_for(transform: ResponseTransform) -> UsageProtocol {
    match transform {
        ResponseTransform::OpenAiResponsesUsage => UsageProtocol::OpenAiResponses,
        ResponseTransform::OpenAiChatUsage => UsageProtocol::OpenAiChat,
        ResponseTransform::AnthropicUsage { .. } => UsageProtocol::Anthropic,
    }
}

fn rewrites_tool_names(transform: ResponseTransform) -> bool {
    matches!(
        transform,
        ResponseTransform::AnthropicUsage {
            rewrite_tool_names: true
        }
    )
}

static TOOL_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn tool_name_re() -> &'static Regex {
    TOOL_NAME_RE.get_or_init(|| {
        Regex::new(r#""name"\s*:\s*"mcp_([^"]+)""#).expect("tool name pattern compiles")
    })
}

/// Strip the `mcp_` prefix back out of any JSON `name` field in a chunk.
/// Intentionally event-type-agnostic: whatever matches the pattern is
/// rewritten.
pub fn rewrite_tool_names(chunk: Bytes) -> Bytes {
    let Ok(text) = std::str::from_utf8(&chunk) else {
        return chunk;
    };
    match tool_name_re().replace_all(text, "\"name\":\"$1\"") {
        Cow::Borrowed(_) => chunk,
        Cow::Owned(rewritten) => Bytes::from(rewritten),
    }
}

/// Tee an upstream SSE body: bytes are forwarded as-is (modulo the Claude
/// tool-name rewrite) while completed events feed the usage extractor.
/// Dropping the returned receiver cancels the upstream reader.
pub fn wrap_sse_stream<S, E>(
    mut upstream: S,
    transform: ResponseTransform,
    on_usage: impl Fn(TokenUsage) + Send + 'static,
) -> mpsc::Receiver<Bytes>
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let rewrite = rewrites_tool_names(transform);
    let mut parser = SseParser::new();
    let mut extractor = UsageExtractor::new(protocol_for(transform));

    tokio::spawn(async move {
        while let Some(item) = upstream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::debug!(error = %err, "upstream stream ended with error");
                    break;
                }
            };
            let chunk = if rewrite { rewrite_tool_names(chunk) } else { chunk };
            for payload in parser.push_bytes(&chunk) {
                if let Some(usage) = extractor.observe(&payload) {
                    on_usage(usage);
                }
            }
            if tx.send(chunk).await.is_err() {
                // Downstream hung up; stop reading upstream.
                return;
            }
        }
        // Flush a trailing partial event as if the stream had closed
        // cleanly, then emit accumulated usage.
        for payload in parser.finish() {
            if let Some(usage) = extractor.observe(&payload) {
                on_usage(usage);
            }
        }
        if let Some(usage) = extractor.finish() {
            on_usage(usage);
        }
    });

    rx
}

/// Non-SSE path: the whole body is parsed once through the same
/// extractor and re-emitted.
pub fn extract_from_json_body(
    body: &Bytes,
    transform: ResponseTransform,
    on_usage: impl Fn(TokenUsage),
) -> Bytes {
    let mut extractor = UsageExtractor::new(protocol_for(transform));
    if let Ok(text) = std::str::from_utf8(body) {
        if let Some(usage) = extractor.observe(text) {
            on_usage(usage);
        }
        if let Some(usage) = extractor.finish() {
            on_usage(usage);
        }
    }
    if rewrites_tool_names(transform) {
        rewrite_tool_names(body.clone())
    } else {
        body.clone()
    }
}

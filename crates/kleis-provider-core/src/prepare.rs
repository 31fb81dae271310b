use crate::headers::Headers;

/// How the orchestrator should wrap the upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTransform {
    OpenAiResponsesUsage,
    OpenAiChatUsage,
    AnthropicUsage {
        /// Strip the `mcp_` prefix back out of tool names in the stream.
        rewrite_tool_names: bool,
    },
}

/// Output of a provider preparer. The caller has already stripped
/// `authorization`, `x-api-key`, `host` and `content-length`; the preparer
/// owns everything it sets on `headers` and never mutates the account.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub upstream_url: String,
    pub headers: Headers,
    pub body: String,
    pub transform: Option<ResponseTransform>,
}

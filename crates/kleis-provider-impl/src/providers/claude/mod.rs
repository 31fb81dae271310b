use serde::Deserialize;

use kleis_provider_core::{
    OAuthAdapter, OAuthResult, OAuthStart, OAuthStartOptions, OAuthTokens, Provider,
    ProviderAccount,
};
use kleis_storage::Repository;

mod oauth;
mod prepare;

pub(crate) use prepare::prepare;

const DEFAULT_API_BASE_URL: &str = "https://api.anthropic.com";
const CLAUDE_AI_BASE_URL: &str = "https://claude.ai";
const CONSOLE_BASE_URL: &str = "https://console.anthropic.com";
const DEFAULT_REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OAUTH_SCOPE: &str = "user:profile user:inference user:sessions:claude_code";
const STATE_TTL_MS: i64 = 15 * 60 * 1000;
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

const HEADER_BETA: &str = "anthropic-beta";
const REQUIRED_BETAS: [&str; 4] = [
    "claude-code-20250219",
    "oauth-2025-04-20",
    "interleaved-thinking-2025-05-14",
    "fine-grained-tool-streaming-2025-05-14",
];
const CLAUDE_CODE_UA: &str = "claude-cli/2.1.27 (external, cli)";
const SYSTEM_IDENTITY: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
const TOOL_PREFIX: &str = "mcp_";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct ClaudeAdapter {
    repository: Repository,
}

impl ClaudeAdapter {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }
}

#[async_trait::async_trait]
impl OAuthAdapter for ClaudeAdapter {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    async fn start_oauth(
        &self,
        redirect_uri: Option<&str>,
        options: &OAuthStartOptions,
        now_ms: i64,
    ) -> OAuthResult<OAuthStart> {
        oauth::start(&self.repository, redirect_uri, options, now_ms).await
    }

    async fn complete_oauth(
        &self,
        state: &str,
        code: Option<&str>,
        now_ms: i64,
    ) -> OAuthResult<OAuthTokens> {
        oauth::complete(&self.repository, state, code, now_ms).await
    }

    async fn refresh_account(
        &self,
        account: &ProviderAccount,
        now_ms: i64,
    ) -> OAuthResult<OAuthTokens> {
        oauth::refresh(account, now_ms).await
    }
}

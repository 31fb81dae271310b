use serde::Deserialize;

use kleis_provider_core::{
    OAuthAdapter, OAuthResult, OAuthStart, OAuthStartOptions, OAuthTokens, Provider,
    ProviderAccount,
};
use kleis_storage::Repository;

mod oauth;
mod prepare;

pub(crate) use prepare::prepare;

const CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
const DEFAULT_DOMAIN: &str = "github.com";
const DEFAULT_API_BASE_URL: &str = "https://api.githubcopilot.com";
const EDITOR_VERSION: &str = "vscode/1.85.1";
/// Copilot tokens are rotated well before their hard expiry.
const EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;
const POLL_EXTRA_SECS: u64 = 3;

const HEADER_INTENT: &str = "Openai-Intent";
const INTENT_VALUE: &str = "conversation-edits";
const HEADER_INITIATOR: &str = "x-initiator";
const HEADER_VISION: &str = "Copilot-Vision-Request";

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: i64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeviceTokenPollResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CopilotTokenResponse {
    token: String,
    /// Unix seconds.
    expires_at: i64,
}

pub struct CopilotAdapter {
    repository: Repository,
}

impl CopilotAdapter {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }
}

#[async_trait::async_trait]
impl OAuthAdapter for CopilotAdapter {
    fn provider(&self) -> Provider {
        Provider::Copilot
    }

    async fn start_oauth(
        &self,
        _redirect_uri: Option<&str>,
        options: &OAuthStartOptions,
        now_ms: i64,
    ) -> OAuthResult<OAuthStart> {
        oauth::start(&self.repository, options, now_ms).await
    }

    async fn complete_oauth(
        &self,
        state: &str,
        _code: Option<&str>,
        now_ms: i64,
    ) -> OAuthResult<OAuthTokens> {
        oauth::complete(&self.repository, state, now_ms).await
    }

    async fn refresh_account(
        &self,
        account: &ProviderAccount,
        now_ms: i64,
    ) -> OAuthResult<OAuthTokens> {
        oauth::refresh(account, now_ms).await
    }
}

/// The Copilot token embeds `proxy-ep=<host>`; the API host swaps the
/// `proxy.` prefix for `api.`.
fn api_base_from_token(token: &str) -> Option<String> {
    let host = token
        .split(';')
        .find_map(|segment| segment.trim().strip_prefix("proxy-ep="))?;
    let host = host.trim();
    if host.is_empty() {
        return None;
    }
    let api_host = match host.strip_prefix("proxy.") {
        Some(rest) => format!("api.{rest}"),
        None => host.to_string(),
    };
    Some(format!("https://{api_host}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_ep_segment_becomes_api_host() {
        let token = "tid=x;exp=1;proxy-ep=proxy.enterprise.githubcopilot.com;sku=pro";
        assert_eq!(
            api_base_from_token(token).as_deref(),
            Some("https://api.enterprise.githubcopilot.com")
        );
    }

    #[test]
    fn token_without_proxy_ep_yields_none() {
        assert!(api_base_from_token("tid=x;exp=1").is_none());
    }
}

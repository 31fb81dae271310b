use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use kleis_provider_core::{
    OAuthAdapter, OAuthResult, OAuthStart, OAuthStartOptions, OAuthTokens, Provider,
    ProviderAccount,
};
use kleis_storage::Repository;

mod instructions;
mod oauth;
mod prepare;

pub(crate) use prepare::prepare;

const DEFAULT_ISSUER: &str = "https://auth.openai.com";
const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const OAUTH_SCOPE: &str = "openid profile email offline_access";
const DEFAULT_REDIRECT_URI: &str = "http://localhost:1455/auth/callback";
const DEFAULT_ORIGINATOR: &str = "opencode";
const RESPONSES_URL: &str = "https://chatgpt.com/backend-api/codex/responses";
const STATE_TTL_MS: i64 = 15 * 60 * 1000;
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Default)]
struct IdTokenClaims {
    email: Option<String>,
    account_id: Option<String>,
    organizations: Vec<String>,
}

pub struct CodexAdapter {
    repository: Repository,
}

impl CodexAdapter {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }
}

#[async_trait::async_trait]
impl OAuthAdapter for CodexAdapter {
    fn provider(&self) -> Provider {
        Provider::Codex
    }

    async fn start_oauth(
        &self,
        redirect_uri: Option<&str>,
        _options: &OAuthStartOptions,
        now_ms: i64,
    ) -> OAuthResult<OAuthStart> {
        oauth::start(&self.repository, redirect_uri, now_ms).await
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

/// Decode the JWT payload without verification; only claims we surface
/// are read.
fn parse_id_token_claims(id_token: &str) -> IdTokenClaims {
    let mut claims = IdTokenClaims::default();
    let mut parts = id_token.split('.');
    let (_h, payload_b64, _s) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if !h.is_empty() && !p.is_empty() && !s.is_empty() => (h, p, s),
        _ => return claims,
    };
    let payload_bytes = match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload_b64) {
        Ok(bytes) => bytes,
        Err(_) => return claims,
    };
    let payload = match serde_json::from_slice::<JsonValue>(&payload_bytes) {
        Ok(value) => value,
        Err(_) => return claims,
    };

    claims.email = payload
        .get("email")
        .and_then(|value| value.as_str())
        .or_else(|| {
            payload
                .get("https://api.openai.com/profile")
                .and_then(|profile| profile.get("email"))
                .and_then(|value| value.as_str())
        })
        .map(|value| value.to_string());

    if let Some(auth) = payload.get("https://api.openai.com/auth") {
        claims.account_id = auth
            .get("chatgpt_account_id")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());
        claims.organizations = auth
            .get("organizations")
            .and_then(|value| value.as_array())
            .map(|orgs| {
                orgs.iter()
                    .filter_map(|org| org.get("id").and_then(|id| id.as_str()))
                    .map(|id| id.to_string())
                    .collect()
            })
            .unwrap_or_default();
    }

    claims
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_token(payload: &JsonValue) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.{}",
            engine.encode(b"{\"alg\":\"none\"}"),
            engine.encode(serde_json::to_vec(payload).unwrap()),
            engine.encode(b"sig"),
        )
    }

    #[test]
    fn claims_parse_account_id_email_and_organizations() {
        let token = encode_token(&serde_json::json!({
            "email": "dev@example.com",
            "https://api.openai.com/auth": {
                "chatgpt_account_id": "acct-1",
                "organizations": [{"id": "org-1"}, {"id": "org-2"}],
            },
        }));
        let claims = parse_id_token_claims(&token);
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
        assert_eq!(claims.account_id.as_deref(), Some("acct-1"));
        assert_eq!(claims.organizations, vec!["org-1", "org-2"]);
    }

    #[test]
    fn malformed_tokens_yield_empty_claims() {
        let claims = parse_id_token_claims("not-a-jwt");
        assert!(claims.email.is_none());
        assert!(claims.account_id.is_none());
    }
}

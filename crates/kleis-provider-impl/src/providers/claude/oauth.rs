use serde_json::Value as JsonValue;

use kleis_provider_core::{
    AccountMetadata, ClaudeMetadata, ClaudeOAuthMode, OAuthError, OAuthMethod, OAuthStateRecord,
};

use super::*;
use crate::http_client::{http_err, shared_client};
use crate::oauth_common::{generate_pkce, generate_state, resolve_code_and_state, store_err};

pub(super) async fn start(
    repository: &Repository,
    redirect_uri: Option<&str>,
    options: &OAuthStartOptions,
    now_ms: i64,
) -> OAuthResult<OAuthStart> {
    let mode = options
        .mode
        .as_deref()
        .and_then(ClaudeOAuthMode::parse)
        .unwrap_or_default();
    let redirect_uri = redirect_uri.unwrap_or(DEFAULT_REDIRECT_URI).to_string();

    let state = generate_state();
    let pkce = generate_pkce();
    let metadata_json = serde_json::json!({
        "mode": mode_str(mode),
        "redirect_uri": redirect_uri,
    })
    .to_string();
    repository
        .insert_oauth_state(&OAuthStateRecord {
            state: state.clone(),
            provider: Provider::Claude,
            pkce_verifier: Some(pkce.code_verifier),
            metadata_json: Some(metadata_json),
            expires_at: now_ms + STATE_TTL_MS,
        })
        .await
        .map_err(store_err)?;

    let authorization_url = build_authorize_url(
        authorize_host(mode),
        &redirect_uri,
        &pkce.code_challenge,
        &state,
    );
    Ok(OAuthStart {
        authorization_url,
        state,
        method: OAuthMethod::Code,
        instructions: Some(
            "Open the authorization URL, approve access, then submit the code shown (or the callback URL)."
                .to_string(),
        ),
    })
}

pub(super) async fn complete(
    repository: &Repository,
    state: &str,
    code: Option<&str>,
    now_ms: i64,
) -> OAuthResult<OAuthTokens> {
    let Some(raw_code) = code else {
        return Err(OAuthError::MalformedResponse(
            "authorization code required".to_string(),
        ));
    };
    let (code, embedded_state) = resolve_code_and_state(raw_code)?;
    if let Some(embedded) = embedded_state.as_deref()
        && embedded != state
    {
        return Err(OAuthError::StateMismatch);
    }

    let Some(record) = repository
        .consume_oauth_state(state, Provider::Claude, now_ms)
        .await
        .map_err(store_err)?
    else {
        return Err(OAuthError::StateMissingOrExpired);
    };
    let Some(code_verifier) = record.pkce_verifier else {
        return Err(OAuthError::PkceMissing);
    };
    let metadata = record
        .metadata_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<JsonValue>(raw).ok());
    let mode = metadata
        .as_ref()
        .and_then(|meta| meta.get("mode"))
        .and_then(|value| value.as_str())
        .and_then(ClaudeOAuthMode::parse)
        .unwrap_or_default();
    let redirect_uri = metadata
        .as_ref()
        .and_then(|meta| meta.get("redirect_uri"))
        .and_then(|value| value.as_str())
        .unwrap_or(DEFAULT_REDIRECT_URI)
        .to_string();

    let payload = serde_json::json!({
        "grant_type": "authorization_code",
        "client_id": CLIENT_ID,
        "code": code,
        "redirect_uri": redirect_uri,
        "code_verifier": code_verifier,
        "state": state,
    });
    let tokens = post_token_endpoint(&payload).await?;
    let Some(refresh_token) = tokens.refresh_token.clone() else {
        return Err(OAuthError::MalformedResponse(
            "token response without refresh_token".to_string(),
        ));
    };

    let expires_at =
        now_ms + tokens.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS).max(1) * 1000;
    Ok(OAuthTokens {
        access_token: tokens.access_token,
        refresh_token,
        expires_at,
        account_id: None,
        metadata: AccountMetadata::Claude(ClaudeMetadata {
            mode,
            host: Some(authorize_host(mode).to_string()),
            betas: REQUIRED_BETAS.iter().map(|beta| beta.to_string()).collect(),
            user_agent: Some(CLAUDE_CODE_UA.to_string()),
            system_identity: Some(SYSTEM_IDENTITY.to_string()),
            tool_prefix: Some(TOOL_PREFIX.to_string()),
        }),
        label: None,
    })
}

pub(super) async fn refresh(account: &ProviderAccount, now_ms: i64) -> OAuthResult<OAuthTokens> {
    let payload = serde_json::json!({
        "grant_type": "refresh_token",
        "client_id": CLIENT_ID,
        "refresh_token": account.refresh_token,
    });
    let tokens = post_token_endpoint(&payload).await?;

    let refresh_token = tokens
        .refresh_token
        .clone()
        .unwrap_or_else(|| account.refresh_token.clone());
    let expires_at =
        now_ms + tokens.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS).max(1) * 1000;
    Ok(OAuthTokens {
        access_token: tokens.access_token,
        refresh_token,
        expires_at,
        account_id: account.account_id.clone(),
        metadata: account.metadata.clone(),
        label: account.label.clone(),
    })
}

fn mode_str(mode: ClaudeOAuthMode) -> &'static str {
    match mode {
        ClaudeOAuthMode::Max => "max",
        ClaudeOAuthMode::Console => "console",
    }
}

fn authorize_host(mode: ClaudeOAuthMode) -> &'static str {
    match mode {
        ClaudeOAuthMode::Max => CLAUDE_AI_BASE_URL,
        ClaudeOAuthMode::Console => CONSOLE_BASE_URL,
    }
}

fn build_authorize_url(host: &str, redirect_uri: &str, code_challenge: &str, state: &str) -> String {
    let qs = format!(
        "code=true&client_id={}&response_type=code&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(OAUTH_SCOPE),
        urlencoding::encode(code_challenge),
        urlencoding::encode(state),
    );
    format!("{}/oauth/authorize?{qs}", host.trim_end_matches('/'))
}

async fn post_token_endpoint(payload: &JsonValue) -> OAuthResult<TokenResponse> {
    let client = shared_client();
    let body =
        serde_json::to_vec(payload).map_err(|err| OAuthError::MalformedResponse(err.to_string()))?;
    let resp = client
        .post(format!(
            "{}/v1/oauth/token",
            DEFAULT_API_BASE_URL.trim_end_matches('/')
        ))
        .header("Content-Type", "application/json")
        .header("User-Agent", CLAUDE_CODE_UA)
        .header("accept", "application/json, text/plain, */*")
        .body(body)
        .send()
        .await
        .map_err(http_err)?;
    let status = resp.status();
    let bytes = resp.bytes().await.map_err(http_err)?;
    if !status.is_success() {
        return Err(OAuthError::TokenExchangeFailed {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).to_string(),
        });
    }
    serde_json::from_slice::<TokenResponse>(&bytes)
        .map_err(|err| OAuthError::MalformedResponse(err.to_string()))
}

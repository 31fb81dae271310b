use super::*;

use kleis_provider_core::{AccountMetadata, CodexMetadata, OAuthError, OAuthMethod, OAuthStateRecord};

use crate::http_client::{http_err, shared_client};
use crate::oauth_common::{generate_pkce, generate_state, resolve_code_and_state, store_err};

pub(super) async fn start(
    repository: &Repository,
    redirect_uri: Option<&str>,
    now_ms: i64,
) -> OAuthResult<OAuthStart> {
    let state = generate_state();
    let pkce = generate_pkce();
    let redirect_uri = redirect_uri.unwrap_or(DEFAULT_REDIRECT_URI).to_string();

    let metadata_json = serde_json::json!({ "redirect_uri": redirect_uri }).to_string();
    repository
        .insert_oauth_state(&OAuthStateRecord {
            state: state.clone(),
            provider: Provider::Codex,
            pkce_verifier: Some(pkce.code_verifier),
            metadata_json: Some(metadata_json),
            expires_at: now_ms + STATE_TTL_MS,
        })
        .await
        .map_err(store_err)?;

    let authorization_url = build_authorize_url(&redirect_uri, &pkce.code_challenge, &state);
    Ok(OAuthStart {
        authorization_url,
        state,
        method: OAuthMethod::Code,
        instructions: Some(
            "Open the authorization URL, sign in, then submit the callback code or URL."
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
        .consume_oauth_state(state, Provider::Codex, now_ms)
        .await
        .map_err(store_err)?
    else {
        return Err(OAuthError::StateMissingOrExpired);
    };
    let Some(code_verifier) = record.pkce_verifier else {
        return Err(OAuthError::PkceMissing);
    };
    let redirect_uri = record
        .metadata_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<JsonValue>(raw).ok())
        .and_then(|meta| {
            meta.get("redirect_uri")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string())
        })
        .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string());

    let tokens = exchange_code(&redirect_uri, &code_verifier, &code).await?;
    let Some(refresh_token) = tokens.refresh_token.clone() else {
        return Err(OAuthError::MalformedResponse(
            "token response without refresh_token".to_string(),
        ));
    };

    let claims = tokens
        .id_token
        .as_deref()
        .map(parse_id_token_claims)
        .unwrap_or_else(|| parse_id_token_claims(&tokens.access_token));
    let account_id = claims
        .account_id
        .clone()
        .or_else(|| claims.organizations.first().cloned());

    let expires_at =
        now_ms + tokens.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS).max(1) * 1000;
    Ok(OAuthTokens {
        access_token: tokens.access_token,
        refresh_token,
        expires_at,
        account_id,
        metadata: AccountMetadata::Codex(CodexMetadata {
            originator: Some(DEFAULT_ORIGINATOR.to_string()),
            chatgpt_account_id: claims.account_id,
            email: claims.email.clone(),
        }),
        label: claims.email,
    })
}

pub(super) async fn refresh(account: &ProviderAccount, now_ms: i64) -> OAuthResult<OAuthTokens> {
    let body = format!(
        "grant_type=refresh_token&refresh_token={}&client_id={}",
        urlencoding::encode(&account.refresh_token),
        urlencoding::encode(CLIENT_ID),
    );
    let tokens = post_token_endpoint(body).await?;

    // The response may omit the refresh token; the prior one stays valid.
    let refresh_token = tokens
        .refresh_token
        .clone()
        .unwrap_or_else(|| account.refresh_token.clone());

    let mut metadata = match &account.metadata {
        AccountMetadata::Codex(metadata) => metadata.clone(),
        _ => CodexMetadata::default(),
    };
    if let Some(id_token) = tokens.id_token.as_deref() {
        let claims = parse_id_token_claims(id_token);
        if claims.email.is_some() {
            metadata.email = claims.email;
        }
        if claims.account_id.is_some() {
            metadata.chatgpt_account_id = claims.account_id;
        }
    }

    let expires_at =
        now_ms + tokens.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS).max(1) * 1000;
    Ok(OAuthTokens {
        access_token: tokens.access_token,
        refresh_token,
        expires_at,
        account_id: account.account_id.clone(),
        metadata: AccountMetadata::Codex(metadata),
        label: account.label.clone(),
    })
}

fn build_authorize_url(redirect_uri: &str, code_challenge: &str, state: &str) -> String {
    let query = [
        ("response_type", "code"),
        ("client_id", CLIENT_ID),
        ("redirect_uri", redirect_uri),
        ("scope", OAUTH_SCOPE),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
        ("id_token_add_organizations", "true"),
        ("codex_cli_simplified_flow", "true"),
        ("state", state),
        ("originator", DEFAULT_ORIGINATOR),
    ];
    let qs = query
        .into_iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}/oauth/authorize?{qs}", DEFAULT_ISSUER.trim_end_matches('/'))
}

async fn exchange_code(
    redirect_uri: &str,
    code_verifier: &str,
    code: &str,
) -> OAuthResult<TokenResponse> {
    let body = format!(
        "grant_type=authorization_code&code={}&redirect_uri={}&client_id={}&code_verifier={}",
        urlencoding::encode(code),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(CLIENT_ID),
        urlencoding::encode(code_verifier),
    );
    post_token_endpoint(body).await
}

async fn post_token_endpoint(body: String) -> OAuthResult<TokenResponse> {
    let client = shared_client();
    let resp = client
        .post(format!("{}/oauth/token", DEFAULT_ISSUER.trim_end_matches('/')))
        .header("Content-Type", "application/x-www-form-urlencoded")
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

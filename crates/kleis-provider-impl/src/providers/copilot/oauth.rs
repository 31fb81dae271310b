use std::time::Duration;

use serde_json::Value as JsonValue;

use kleis_provider_core::{
    AccountMetadata, CopilotMetadata, OAuthError, OAuthMethod, OAuthStateRecord,
};

use super::*;
use crate::http_client::{http_err, shared_client};
use crate::oauth_common::{generate_state, store_err};

pub(super) async fn start(
    repository: &Repository,
    options: &OAuthStartOptions,
    now_ms: i64,
) -> OAuthResult<OAuthStart> {
    let domain = options
        .enterprise_domain
        .as_deref()
        .filter(|domain| !domain.trim().is_empty())
        .unwrap_or(DEFAULT_DOMAIN)
        .to_string();

    let device = request_device_code(&domain).await?;
    let interval = device.interval.unwrap_or(5).max(1);

    let state = generate_state();
    let metadata_json = serde_json::json!({
        "device_code": device.device_code,
        "interval": interval,
        "domain": domain,
    })
    .to_string();
    repository
        .insert_oauth_state(&OAuthStateRecord {
            state: state.clone(),
            provider: Provider::Copilot,
            pkce_verifier: None,
            metadata_json: Some(metadata_json),
            expires_at: now_ms + device.expires_in.max(1) * 1000,
        })
        .await
        .map_err(store_err)?;

    Ok(OAuthStart {
        authorization_url: device.verification_uri,
        state,
        method: OAuthMethod::Auto,
        instructions: Some(format!(
            "Open the verification URL and enter the code {}.",
            device.user_code
        )),
    })
}

pub(super) async fn complete(
    repository: &Repository,
    state: &str,
    now_ms: i64,
) -> OAuthResult<OAuthTokens> {
    let Some(record) = repository
        .consume_oauth_state(state, Provider::Copilot, now_ms)
        .await
        .map_err(store_err)?
    else {
        return Err(OAuthError::StateMissingOrExpired);
    };

    let metadata = record
        .metadata_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<JsonValue>(raw).ok())
        .ok_or_else(|| OAuthError::MalformedResponse("device state metadata".to_string()))?;
    let device_code = metadata
        .get("device_code")
        .and_then(|value| value.as_str())
        .ok_or_else(|| OAuthError::MalformedResponse("device_code missing".to_string()))?
        .to_string();
    let domain = metadata
        .get("domain")
        .and_then(|value| value.as_str())
        .unwrap_or(DEFAULT_DOMAIN)
        .to_string();
    let mut interval = metadata
        .get("interval")
        .and_then(|value| value.as_u64())
        .unwrap_or(5)
        .max(1);

    let github_token = poll_for_github_token(
        &domain,
        &device_code,
        &mut interval,
        record.expires_at,
        now_ms,
    )
    .await?;

    let enterprise_domain = (domain != DEFAULT_DOMAIN).then(|| domain.clone());
    exchange_github_token(&github_token, &domain, enterprise_domain, now_ms).await
}

pub(super) async fn refresh(account: &ProviderAccount, now_ms: i64) -> OAuthResult<OAuthTokens> {
    // The stored refresh token is the long-lived GitHub token; refresh
    // means exchanging it for a fresh Copilot token.
    let enterprise_domain = match &account.metadata {
        AccountMetadata::Copilot(metadata) => metadata.enterprise_domain.clone(),
        _ => None,
    };
    let domain = enterprise_domain.clone().unwrap_or_else(|| DEFAULT_DOMAIN.to_string());
    let mut tokens =
        exchange_github_token(&account.refresh_token, &domain, enterprise_domain, now_ms).await?;
    tokens.account_id = account.account_id.clone();
    tokens.label = account.label.clone();
    if let (AccountMetadata::Copilot(next), AccountMetadata::Copilot(prev)) =
        (&mut tokens.metadata, &account.metadata)
    {
        next.request_profile = prev.request_profile.clone();
    }
    Ok(tokens)
}

async fn request_device_code(domain: &str) -> OAuthResult<DeviceCodeResponse> {
    let client = shared_client();
    let resp = client
        .post(format!("https://{domain}/login/device/code"))
        .header("Accept", "application/json")
        .header("Content-Type", "application/json")
        .body(
            serde_json::json!({ "client_id": CLIENT_ID, "scope": "read:user" })
                .to_string(),
        )
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
    serde_json::from_slice::<DeviceCodeResponse>(&bytes)
        .map_err(|err| OAuthError::MalformedResponse(err.to_string()))
}

async fn poll_for_github_token(
    domain: &str,
    device_code: &str,
    interval: &mut u64,
    deadline_ms: i64,
    now_ms: i64,
) -> OAuthResult<String> {
    let client = shared_client();
    let mut elapsed_ms: i64 = 0;

    loop {
        if now_ms + elapsed_ms > deadline_ms {
            return Err(OAuthError::DeviceFlowTimeout);
        }

        let wait = Duration::from_secs(*interval + POLL_EXTRA_SECS);
        tokio::time::sleep(wait).await;
        elapsed_ms += wait.as_millis() as i64;
        tracing::debug!(domain, elapsed_ms, "polling device authorization");

        let resp = client
            .post(format!("https://{domain}/login/oauth/access_token"))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(
                serde_json::json!({
                    "client_id": CLIENT_ID,
                    "device_code": device_code,
                    "grant_type": "urn:ietf:params:oauth:grant-type:device_code",
                })
                .to_string(),
            )
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
        let poll = serde_json::from_slice::<DeviceTokenPollResponse>(&bytes)
            .map_err(|err| OAuthError::MalformedResponse(err.to_string()))?;

        if let Some(token) = poll.access_token
            && !token.trim().is_empty()
        {
            return Ok(token);
        }
        match poll.error.as_deref() {
            Some("authorization_pending") => continue,
            Some("slow_down") => {
                if let Some(new_interval) = poll.interval {
                    *interval = new_interval.max(1);
                }
                continue;
            }
            Some(error) => {
                return Err(OAuthError::TokenExchangeFailed {
                    status: status.as_u16(),
                    body: error.to_string(),
                });
            }
            None => {
                return Err(OAuthError::MalformedResponse(
                    "poll response without token or error".to_string(),
                ));
            }
        }
    }
}

async fn exchange_github_token(
    github_token: &str,
    domain: &str,
    enterprise_domain: Option<String>,
    now_ms: i64,
) -> OAuthResult<OAuthTokens> {
    let client = shared_client();
    let resp = client
        .get(format!("https://api.{domain}/copilot_internal/v2/token"))
        .header("Authorization", format!("token {github_token}"))
        .header("Accept", "application/json")
        .header("editor-version", EDITOR_VERSION)
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
    let token = serde_json::from_slice::<CopilotTokenResponse>(&bytes)
        .map_err(|err| OAuthError::MalformedResponse(err.to_string()))?;

    let expires_at = token.expires_at * 1000 - EXPIRY_BUFFER_MS;
    if expires_at <= now_ms {
        return Err(OAuthError::MalformedResponse(
            "copilot token already expired".to_string(),
        ));
    }

    let api_base_url = api_base_from_token(&token.token);
    Ok(OAuthTokens {
        access_token: token.token,
        refresh_token: github_token.to_string(),
        expires_at,
        account_id: None,
        metadata: AccountMetadata::Copilot(CopilotMetadata {
            api_base_url,
            enterprise_domain,
            request_profile: None,
        }),
        label: None,
    })
}

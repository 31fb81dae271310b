use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Request, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use kleis_common::{ServiceError, now_ms};
use kleis_core::auth::{extract_bearer, generate_api_key_value, generate_discovery_token};
use kleis_core::{AppState, ImportAccountInput, RateLimitScope};
use kleis_provider_core::{AccountMetadata, OAuthStartOptions, Provider, ProviderAccount};
use kleis_storage::{
    ApiKey, ApiKeyPatch, DeleteKeyOutcome, ModelUsageRow, NewApiKey, ProviderUsageRow, UsageTotals,
};

use crate::proxy::{client_ip, error_response, rate_limited_response};

const WINDOW_MIN_MS: i64 = 60_000;
const WINDOW_MAX_MS: i64 = 30 * 24 * 60 * 60 * 1000;
const WINDOW_DEFAULT_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
}

pub fn admin_router(app: Arc<AppState>) -> Router {
    let state = AdminState { app };

    Router::new()
        .route("/accounts", get(list_accounts))
        // `{id}` is an account id for row operations and a provider name
        // for flow operations; matchit requires one param name per
        // position.
        .route("/accounts/{id}/primary", post(set_primary_account))
        .route("/accounts/{id}/refresh", post(refresh_account))
        .route("/accounts/{id}/oauth/start", post(oauth_start))
        .route("/accounts/{id}/oauth/complete", post(oauth_complete))
        .route("/accounts/{id}/import", post(import_account))
        .route("/accounts/{id}", delete(delete_account))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/usage", get(keys_usage))
        .route("/keys/{id}", patch(patch_key).delete(delete_key))
        .route("/keys/{id}/revoke", post(revoke_key))
        .route("/keys/{id}/usage", get(key_usage))
        .route("/usage/dashboard", get(usage_dashboard))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

/// Static-token bearer with per-client-IP failure backoff. The provided
/// credential is never logged.
async fn admin_auth(State(state): State<AdminState>, req: Request<Body>, next: Next) -> Response {
    let client_ip = client_ip(req.headers());
    let now = now_ms();

    if let Err(retry_after) =
        state
            .app
            .rate_limiter
            .check(&client_ip, RateLimitScope::Admin, now)
    {
        return rate_limited_response(retry_after);
    }

    let provided = extract_bearer(
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok()),
        req.headers()
            .get("x-api-key")
            .and_then(|value| value.to_str().ok()),
    );
    let authorized = provided.is_some_and(|token| token == state.app.config.admin_token);
    if !authorized {
        state
            .app
            .rate_limiter
            .record_failure(&client_ip, RateLimitScope::Admin, now);
        return error_response(&ServiceError::unauthorized());
    }
    state
        .app
        .rate_limiter
        .record_success(&client_ip, RateLimitScope::Admin);
    next.run(req).await
}

// ---- Accounts ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountView {
    id: String,
    provider: &'static str,
    account_id: Option<String>,
    label: Option<String>,
    is_primary: bool,
    expires_at: i64,
    last_refresh_at: Option<i64>,
    last_refresh_status: Option<&'static str>,
    created_at: i64,
    updated_at: i64,
}

impl From<&ProviderAccount> for AccountView {
    fn from(account: &ProviderAccount) -> Self {
        Self {
            id: account.id.clone(),
            provider: account.provider.as_str(),
            account_id: account.account_id.clone(),
            label: account.label.clone(),
            is_primary: account.is_primary,
            expires_at: account.expires_at,
            last_refresh_at: account.last_refresh_at,
            last_refresh_status: account.last_refresh_status.map(|status| status.as_str()),
            created_at: account.created_at,
            updated_at: account.updated_at,
        }
    }
}

async fn list_accounts(State(state): State<AdminState>) -> Response {
    match state.app.repository.list_provider_accounts().await {
        Ok(accounts) => {
            let views: Vec<AccountView> = accounts.iter().map(AccountView::from).collect();
            Json(views).into_response()
        }
        Err(err) => error_response(&ServiceError::internal(err.to_string())),
    }
}

async fn set_primary_account(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state
        .app
        .repository
        .set_primary_provider_account(&id, now_ms())
        .await
    {
        Ok(Some(account)) => Json(AccountView::from(&account)).into_response(),
        Ok(None) => error_response(&ServiceError::not_found("provider account not found")),
        Err(err) => error_response(&ServiceError::internal(err.to_string())),
    }
}

async fn refresh_account(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.app.service.refresh_provider_account(&id, now_ms()).await {
        Ok(account) => Json(AccountView::from(&account)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthStartBody {
    redirect_uri: Option<String>,
    enterprise_domain: Option<String>,
    mode: Option<String>,
}

async fn oauth_start(
    State(state): State<AdminState>,
    Path(provider): Path<String>,
    body: Option<Json<OAuthStartBody>>,
) -> Response {
    let Some(provider) = Provider::parse(&provider) else {
        return error_response(&ServiceError::bad_request("unknown provider"));
    };
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let options = OAuthStartOptions {
        enterprise_domain: body.enterprise_domain,
        mode: body.mode,
    };
    match state
        .app
        .service
        .start_provider_oauth(provider, body.redirect_uri.as_deref(), &options, now_ms())
        .await
    {
        Ok(start) => Json(start).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct OAuthCompleteBody {
    state: String,
    #[serde(default)]
    code: Option<String>,
}

async fn oauth_complete(
    State(state): State<AdminState>,
    Path(provider): Path<String>,
    Json(body): Json<OAuthCompleteBody>,
) -> Response {
    let Some(provider) = Provider::parse(&provider) else {
        return error_response(&ServiceError::bad_request("unknown provider"));
    };
    match state
        .app
        .service
        .complete_provider_oauth(provider, &body.state, body.code.as_deref(), now_ms())
        .await
    {
        Ok(account) => Json(AccountView::from(&account)).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportBody {
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    label: Option<String>,
    access_token: String,
    refresh_token: String,
    expires_at: i64,
    #[serde(default)]
    metadata: Option<AccountMetadata>,
}

async fn import_account(
    State(state): State<AdminState>,
    Path(provider): Path<String>,
    Json(body): Json<ImportBody>,
) -> Response {
    let Some(provider) = Provider::parse(&provider) else {
        return error_response(&ServiceError::bad_request("unknown provider"));
    };
    let input = ImportAccountInput {
        provider,
        account_id: body.account_id,
        label: body.label,
        access_token: body.access_token,
        refresh_token: body.refresh_token,
        expires_at: body.expires_at,
        metadata: body.metadata,
    };
    match state.app.service.import_provider_account(input, now_ms()).await {
        Ok(account) => Json(AccountView::from(&account)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn delete_account(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.app.repository.delete_provider_account(&id, now_ms()).await {
        Ok(true) => Json(serde_json::json!({ "ok": true })).into_response(),
        Ok(false) => error_response(&ServiceError::not_found("provider account not found")),
        Err(err) => error_response(&ServiceError::internal(err.to_string())),
    }
}

// ---- Keys ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyView {
    id: String,
    key_preview: String,
    has_discovery_token: bool,
    label: Option<String>,
    provider_scopes: Option<Vec<&'static str>>,
    model_scopes: Option<Vec<String>>,
    expires_at: Option<i64>,
    revoked_at: Option<i64>,
    created_at: i64,
}

impl From<&ApiKey> for KeyView {
    fn from(key: &ApiKey) -> Self {
        Self {
            id: key.id.clone(),
            key_preview: preview(&key.key),
            has_discovery_token: key.models_discovery_token.is_some(),
            label: key.label.clone(),
            provider_scopes: key
                .provider_scopes
                .as_ref()
                .map(|scopes| scopes.iter().map(|scope| scope.as_str()).collect()),
            model_scopes: key.model_scopes.clone(),
            expires_at: key.expires_at,
            revoked_at: key.revoked_at,
            created_at: key.created_at,
        }
    }
}

fn preview(value: &str) -> String {
    if value.len() <= 12 {
        return value.to_string();
    }
    format!("{}…{}", &value[..10], &value[value.len() - 4..])
}

async fn list_keys(State(state): State<AdminState>) -> Response {
    match state.app.repository.list_api_keys().await {
        Ok(keys) => {
            let views: Vec<KeyView> = keys.iter().map(KeyView::from).collect();
            Json(views).into_response()
        }
        Err(err) => error_response(&ServiceError::internal(err.to_string())),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    provider_scopes: Option<Vec<String>>,
    #[serde(default)]
    model_scopes: Option<Vec<String>>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    with_discovery_token: bool,
}

async fn create_key(
    State(state): State<AdminState>,
    body: Option<Json<CreateKeyBody>>,
) -> Response {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let provider_scopes = match body.provider_scopes.map(parse_provider_scopes).transpose() {
        Ok(scopes) => scopes,
        Err(err) => return error_response(&err),
    };

    let key_value = generate_api_key_value();
    let discovery_token = body.with_discovery_token.then(generate_discovery_token);
    let input = NewApiKey {
        key: key_value.clone(),
        models_discovery_token: discovery_token.clone(),
        label: body.label,
        provider_scopes,
        model_scopes: body.model_scopes,
        expires_at: body.expires_at,
    };
    match state.app.repository.insert_api_key(&input, now_ms()).await {
        Ok(key) => {
            // The only response that ever carries the full key value.
            let mut payload = serde_json::to_value(KeyView::from(&key)).unwrap_or_default();
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("key".to_string(), JsonValue::String(key_value));
                if let Some(token) = discovery_token {
                    obj.insert("modelsDiscoveryToken".to_string(), JsonValue::String(token));
                }
            }
            Json(payload).into_response()
        }
        Err(err) => error_response(&ServiceError::internal(err.to_string())),
    }
}

fn parse_provider_scopes(raw: Vec<String>) -> Result<Vec<Provider>, ServiceError> {
    let mut scopes = Vec::with_capacity(raw.len());
    for name in raw {
        let Some(provider) = Provider::parse(&name) else {
            return Err(ServiceError::bad_request(format!(
                "unknown provider scope: {name}"
            )));
        };
        scopes.push(provider);
    }
    Ok(scopes)
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchKeyBody {
    #[serde(default, deserialize_with = "double_option")]
    label: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    provider_scopes: Option<Option<Vec<String>>>,
    #[serde(default, deserialize_with = "double_option")]
    model_scopes: Option<Option<Vec<String>>>,
    #[serde(default, deserialize_with = "double_option")]
    expires_at: Option<Option<i64>>,
}

async fn patch_key(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<PatchKeyBody>,
) -> Response {
    let provider_scopes = match body.provider_scopes {
        None => None,
        Some(None) => Some(None),
        Some(Some(raw)) => match parse_provider_scopes(raw) {
            Ok(scopes) => Some(Some(scopes)),
            Err(err) => return error_response(&err),
        },
    };
    let patch = ApiKeyPatch {
        label: body.label,
        provider_scopes,
        model_scopes: body.model_scopes,
        expires_at: body.expires_at,
    };
    match state.app.repository.update_api_key(&id, &patch).await {
        Ok(Some(key)) => Json(KeyView::from(&key)).into_response(),
        Ok(None) => error_response(&ServiceError::not_found("api key not found")),
        Err(err) => error_response(&ServiceError::internal(err.to_string())),
    }
}

async fn revoke_key(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.app.repository.revoke_api_key(&id, now_ms()).await {
        Ok(Some(key)) => Json(KeyView::from(&key)).into_response(),
        Ok(None) => error_response(&ServiceError::not_found("api key not found")),
        Err(err) => error_response(&ServiceError::internal(err.to_string())),
    }
}

async fn delete_key(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    match state.app.repository.delete_revoked_api_key(&id).await {
        Ok(DeleteKeyOutcome::Deleted) => Json(serde_json::json!({ "ok": true })).into_response(),
        Ok(DeleteKeyOutcome::NotRevoked) => error_response(&ServiceError::bad_request(
            "api key must be revoked before deletion",
        )),
        Ok(DeleteKeyOutcome::NotFound) => {
            error_response(&ServiceError::not_found("api key not found"))
        }
        Err(err) => error_response(&ServiceError::internal(err.to_string())),
    }
}

// ---- Usage ----

#[derive(Debug, Deserialize)]
struct WindowQuery {
    #[serde(rename = "windowMs")]
    window_ms: Option<i64>,
}

fn clamp_window(window_ms: Option<i64>) -> i64 {
    window_ms
        .unwrap_or(WINDOW_DEFAULT_MS)
        .clamp(WINDOW_MIN_MS, WINDOW_MAX_MS)
}

fn totals_json(totals: &UsageTotals) -> JsonValue {
    serde_json::json!({
        "requestCount": totals.request_count.unwrap_or(0),
        "successCount": totals.success_count.unwrap_or(0),
        "clientErrorCount": totals.client_error_count.unwrap_or(0),
        "serverErrorCount": totals.server_error_count.unwrap_or(0),
        "authErrorCount": totals.auth_error_count.unwrap_or(0),
        "rateLimitCount": totals.rate_limit_count.unwrap_or(0),
        "totalLatencyMs": totals.total_latency_ms.unwrap_or(0),
        "maxLatencyMs": totals.max_latency_ms.unwrap_or(0),
        "inputTokens": totals.input_tokens.unwrap_or(0),
        "outputTokens": totals.output_tokens.unwrap_or(0),
        "cacheReadTokens": totals.cache_read_tokens.unwrap_or(0),
        "cacheWriteTokens": totals.cache_write_tokens.unwrap_or(0),
        "lastRequestAt": totals.last_request_at,
    })
}

fn provider_row_json(row: &ProviderUsageRow) -> JsonValue {
    serde_json::json!({
        "provider": row.provider,
        "requestCount": row.request_count.unwrap_or(0),
        "successCount": row.success_count.unwrap_or(0),
        "clientErrorCount": row.client_error_count.unwrap_or(0),
        "serverErrorCount": row.server_error_count.unwrap_or(0),
        "authErrorCount": row.auth_error_count.unwrap_or(0),
        "rateLimitCount": row.rate_limit_count.unwrap_or(0),
        "totalLatencyMs": row.total_latency_ms.unwrap_or(0),
        "maxLatencyMs": row.max_latency_ms.unwrap_or(0),
        "inputTokens": row.input_tokens.unwrap_or(0),
        "outputTokens": row.output_tokens.unwrap_or(0),
        "cacheReadTokens": row.cache_read_tokens.unwrap_or(0),
        "cacheWriteTokens": row.cache_write_tokens.unwrap_or(0),
        "lastRequestAt": row.last_request_at,
    })
}

fn model_row_json(row: &ModelUsageRow) -> JsonValue {
    serde_json::json!({
        "provider": row.provider,
        "model": row.model,
        "requestCount": row.request_count.unwrap_or(0),
        "successCount": row.success_count.unwrap_or(0),
        "totalLatencyMs": row.total_latency_ms.unwrap_or(0),
        "maxLatencyMs": row.max_latency_ms.unwrap_or(0),
        "inputTokens": row.input_tokens.unwrap_or(0),
        "outputTokens": row.output_tokens.unwrap_or(0),
        "cacheReadTokens": row.cache_read_tokens.unwrap_or(0),
        "cacheWriteTokens": row.cache_write_tokens.unwrap_or(0),
        "lastRequestAt": row.last_request_at,
    })
}

async fn usage_dashboard(
    State(state): State<AdminState>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let window_ms = clamp_window(query.window_ms);
    let now = now_ms();
    let from = now - window_ms;

    let totals = state.app.repository.usage_totals(from, now).await;
    let by_provider = state.app.repository.usage_by_provider(from, now).await;
    let by_model = state.app.repository.usage_by_model(from, now).await;
    match (totals, by_provider, by_model) {
        (Ok(totals), Ok(by_provider), Ok(by_model)) => Json(serde_json::json!({
            "windowMs": window_ms,
            "totals": totals_json(&totals),
            "byProvider": by_provider.iter().map(provider_row_json).collect::<Vec<_>>(),
            "byModel": by_model.iter().map(model_row_json).collect::<Vec<_>>(),
        }))
        .into_response(),
        (Err(err), _, _) | (_, Err(err), _) | (_, _, Err(err)) => {
            error_response(&ServiceError::internal(err.to_string()))
        }
    }
}

async fn keys_usage(State(state): State<AdminState>, Query(query): Query<WindowQuery>) -> Response {
    let window_ms = clamp_window(query.window_ms);
    let now = now_ms();
    let from = now - window_ms;

    let rows = state.app.repository.usage_by_key(from, now).await;
    let keys = state.app.repository.list_api_keys().await;
    match (rows, keys) {
        (Ok(rows), Ok(keys)) => {
            let labeled: Vec<JsonValue> = rows
                .iter()
                .map(|row| {
                    let key = keys.iter().find(|key| key.id == row.api_key_id);
                    serde_json::json!({
                        "apiKeyId": row.api_key_id,
                        "label": key.and_then(|key| key.label.clone()),
                        "keyPreview": key.map(|key| preview(&key.key)),
                        "requestCount": row.request_count.unwrap_or(0),
                        "successCount": row.success_count.unwrap_or(0),
                        "clientErrorCount": row.client_error_count.unwrap_or(0),
                        "serverErrorCount": row.server_error_count.unwrap_or(0),
                        "authErrorCount": row.auth_error_count.unwrap_or(0),
                        "rateLimitCount": row.rate_limit_count.unwrap_or(0),
                        "totalLatencyMs": row.total_latency_ms.unwrap_or(0),
                        "maxLatencyMs": row.max_latency_ms.unwrap_or(0),
                        "inputTokens": row.input_tokens.unwrap_or(0),
                        "outputTokens": row.output_tokens.unwrap_or(0),
                        "cacheReadTokens": row.cache_read_tokens.unwrap_or(0),
                        "cacheWriteTokens": row.cache_write_tokens.unwrap_or(0),
                        "lastRequestAt": row.last_request_at,
                    })
                })
                .collect();
            Json(serde_json::json!({ "windowMs": window_ms, "keys": labeled })).into_response()
        }
        (Err(err), _) | (_, Err(err)) => error_response(&ServiceError::internal(err.to_string())),
    }
}

async fn key_usage(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let window_ms = clamp_window(query.window_ms);
    let now = now_ms();
    let from = now - window_ms;

    match state.app.repository.get_api_key(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(&ServiceError::not_found("api key not found")),
        Err(err) => return error_response(&ServiceError::internal(err.to_string())),
    }

    let totals = state.app.repository.usage_for_key(&id, from, now).await;
    let by_model = state.app.repository.usage_for_key_by_model(&id, from, now).await;
    match (totals, by_model) {
        (Ok(totals), Ok(by_model)) => Json(serde_json::json!({
            "windowMs": window_ms,
            "apiKeyId": id,
            "totals": totals_json(&totals),
            "byModel": by_model.iter().map(model_row_json).collect::<Vec<_>>(),
        }))
        .into_response(),
        (Err(err), _) | (_, Err(err)) => error_response(&ServiceError::internal(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_clamps_to_the_documented_range() {
        assert_eq!(clamp_window(None), WINDOW_DEFAULT_MS);
        assert_eq!(clamp_window(Some(10)), WINDOW_MIN_MS);
        assert_eq!(clamp_window(Some(WINDOW_MAX_MS * 2)), WINDOW_MAX_MS);
        assert_eq!(clamp_window(Some(120_000)), 120_000);
    }

    #[test]
    fn key_previews_never_contain_the_full_value() {
        let full = "kleis_0123456789abcdef0123456789abcdef";
        let masked = preview(full);
        assert!(masked.len() < full.len());
        assert!(masked.starts_with("kleis_"));
        assert!(!masked.contains("0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn patch_body_distinguishes_missing_from_null() {
        let body: PatchKeyBody = serde_json::from_str(r#"{"label": null}"#).unwrap();
        assert_eq!(body.label, Some(None));
        assert!(body.expires_at.is_none());

        let body: PatchKeyBody = serde_json::from_str(r#"{"label": "ci"}"#).unwrap();
        assert_eq!(body.label, Some(Some("ci".to_string())));
    }
}

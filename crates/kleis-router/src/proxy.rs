use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::{StreamExt, TryStreamExt};
use serde_json::Value as JsonValue;
use tokio_stream::wrappers::ReceiverStream;

use kleis_common::{ErrorKind, ServiceError, now_ms};
use kleis_core::auth::{authenticate, check_model_scope, check_provider_scope};
use kleis_core::models::ApiKeyScopes;
use kleis_core::passthrough::{extract_from_json_body, wrap_sse_stream};
use kleis_core::recorder::{RequestRecorder, UsageContext};
use kleis_core::{AppState, RateLimitScope};
use kleis_provider_core::{
    CanonicalProvider, Endpoint, Headers, ProxyRoute, resolve_model, route_for,
};
use kleis_provider_impl::http_client::shared_client;
use kleis_provider_impl::prepare::{PrepareInput, prepare_request};
use kleis_storage::ApiKey;

const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct ProxyState {
    pub app: Arc<AppState>,
}

#[derive(Clone)]
struct AuthedKey(ApiKey);

pub fn proxy_router(app: Arc<AppState>) -> Router {
    let state = ProxyState { app };

    let proxied = Router::new()
        .route("/openai/v1/responses", post(openai_responses))
        .route("/anthropic/v1/messages", post(anthropic_messages))
        .route("/copilot/v1/chat/completions", post(copilot_chat_completions))
        .route("/copilot/v1/responses", post(copilot_responses))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_auth));

    Router::new()
        .merge(proxied)
        .route("/healthz", get(healthz))
        .route("/api.json", get(models_registry))
        .with_state(state)
}

async fn proxy_auth(
    State(state): State<ProxyState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let client_ip = client_ip(req.headers());
    let now = now_ms();

    if let Err(retry_after) =
        state
            .app
            .rate_limiter
            .check(&client_ip, RateLimitScope::Proxy, now)
    {
        return rate_limited_response(retry_after);
    }

    let authorization = header_str(req.headers(), header::AUTHORIZATION.as_str());
    let x_api_key = header_str(req.headers(), "x-api-key");
    match authenticate(
        &state.app.repository,
        authorization.as_deref(),
        x_api_key.as_deref(),
        now,
    )
    .await
    {
        Ok(key) => {
            state
                .app
                .rate_limiter
                .record_success(&client_ip, RateLimitScope::Proxy);
            req.extensions_mut().insert(AuthedKey(key));
            next.run(req).await
        }
        Err(err) => {
            state
                .app
                .rate_limiter
                .record_failure(&client_ip, RateLimitScope::Proxy, now);
            error_response(&err)
        }
    }
}

async fn openai_responses(State(state): State<ProxyState>, req: Request<Body>) -> Response {
    dispatch(state, CanonicalProvider::Openai, Endpoint::Responses, req).await
}

async fn anthropic_messages(State(state): State<ProxyState>, req: Request<Body>) -> Response {
    dispatch(state, CanonicalProvider::Anthropic, Endpoint::Messages, req).await
}

async fn copilot_chat_completions(State(state): State<ProxyState>, req: Request<Body>) -> Response {
    dispatch(
        state,
        CanonicalProvider::GithubCopilot,
        Endpoint::ChatCompletions,
        req,
    )
    .await
}

async fn copilot_responses(State(state): State<ProxyState>, req: Request<Body>) -> Response {
    dispatch(state, CanonicalProvider::GithubCopilot, Endpoint::Responses, req).await
}

async fn dispatch(
    state: ProxyState,
    canonical: CanonicalProvider,
    endpoint: Endpoint,
    req: Request<Body>,
) -> Response {
    let Some(route) = route_for(canonical, endpoint) else {
        return error_response(&ServiceError::new(
            ErrorKind::ProviderNotSupported,
            "route not in the proxy table",
        ));
    };
    match proxy_call(state, route, req).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

/// One proxied request, end to end: authenticated key, model
/// normalization and scope checks, primary-account resolution, provider
/// preparation, upstream exchange, usage-wrapped response.
async fn proxy_call(
    state: ProxyState,
    route: &'static ProxyRoute,
    req: Request<Body>,
) -> Result<Response, ServiceError> {
    let started = Instant::now();
    let started_at = now_ms();

    let Some(AuthedKey(key)) = req.extensions().get::<AuthedKey>().cloned() else {
        return Err(ServiceError::unauthorized());
    };
    let recorder = RequestRecorder::new(
        state.app.repository.clone(),
        UsageContext::new(key.id.clone(), route.internal, route.endpoint.as_str()),
    );

    let (parts, body) = req.into_parts();
    let query = parts.uri.query().map(|query| query.to_string());
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| ServiceError::bad_request(format!("unreadable request body: {err}")))?;
    let mut body_text = String::from_utf8_lossy(&body_bytes).to_string();

    // Tolerant parse: a non-JSON body simply carries no model.
    let mut body_json = serde_json::from_str::<JsonValue>(&body_text).ok();
    let resolution = body_json
        .as_ref()
        .and_then(|json| json.get("model"))
        .and_then(|model| model.as_str())
        .map(|model| resolve_model(model, route));

    check_provider_scope(&key, route)?;
    check_model_scope(&key, resolution.as_ref())?;

    if let Some(resolution) = resolution.as_ref() {
        recorder.set_model(&resolution.upstream);
        if resolution.rewritten
            && let Some(obj) = body_json.as_mut().and_then(|json| json.as_object_mut())
        {
            obj.insert(
                "model".to_string(),
                JsonValue::String(resolution.upstream.clone()),
            );
            body_text = serde_json::to_string(obj)
                .map_err(|err| ServiceError::internal(err.to_string()))?;
        }
    }

    let account = match state
        .app
        .service
        .get_primary_provider_account(route.internal, started_at)
        .await
    {
        Ok(Some(account)) => account,
        Ok(None) => {
            recorder.record_request(400, elapsed_ms(started), now_ms());
            return Err(ServiceError::new(
                ErrorKind::AccountMissing,
                format!("no {} account is configured", route.internal),
            ));
        }
        Err(err) => {
            recorder.record_request(502, elapsed_ms(started), now_ms());
            return Err(ServiceError::new(ErrorKind::TokenRefreshFailed, err.message));
        }
    };
    recorder.set_account(&account.id);

    let headers = copy_request_headers(&parts.headers);
    let prepared = prepare_request(PrepareInput {
        route,
        query: query.as_deref(),
        headers,
        body_json,
        body_text,
        account: &account,
    })?;

    let upstream = send_upstream(&prepared.upstream_url, &prepared.headers, prepared.body).await;
    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(err) => {
            recorder.record_request(500, elapsed_ms(started), now_ms());
            return Err(ServiceError::internal(format!("upstream request failed: {err}")));
        }
    };

    let status = upstream.status().as_u16();

    // Wrap before recording: the buffered JSON path extracts its token
    // usage while the recorder still attaches it to the counter row.
    let response = match build_client_response(upstream, prepared.transform, recorder.clone()).await
    {
        Ok(response) => response,
        Err(err) => {
            recorder.record_request(500, elapsed_ms(started), now_ms());
            return Err(err);
        }
    };
    recorder.record_request(status, elapsed_ms(started), now_ms());
    tracing::debug!(
        provider = %route.internal,
        endpoint = route.endpoint.as_str(),
        status,
        latency_ms = elapsed_ms(started),
        "proxied request"
    );

    Ok(response)
}

async fn send_upstream(
    url: &str,
    headers: &Headers,
    body: String,
) -> Result<wreq::Response, wreq::Error> {
    let client = shared_client();
    let mut builder = client.post(url);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(body).send().await
}

async fn build_client_response(
    upstream: wreq::Response,
    transform: Option<kleis_provider_core::ResponseTransform>,
    recorder: Arc<RequestRecorder>,
) -> Result<Response, ServiceError> {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response_headers: Vec<(String, String)> = Vec::new();
    let mut is_sse = false;
    for (name, value) in upstream.headers() {
        let Ok(value) = value.to_str() else { continue };
        let lowered = name.as_str().to_ascii_lowercase();
        if lowered == "content-type" && value.starts_with("text/event-stream") {
            is_sse = true;
        }
        // Re-framed downstream: lengths change and the client's HTTP
        // stack must not try to decode a stripped encoding.
        if lowered == "content-encoding" || lowered == "content-length" {
            continue;
        }
        response_headers.push((name.as_str().to_string(), value.to_string()));
    }

    let body = match transform {
        Some(transform) if is_sse => {
            let usage_recorder = recorder.clone();
            let rx = wrap_sse_stream(upstream.bytes_stream().boxed(), transform, move |usage| {
                usage_recorder.on_token_usage(usage);
            });
            Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        }
        Some(transform) => {
            // Buffer the whole JSON body and extract before returning so
            // the usage notification lands while the recorder is still
            // in its pre-counter phase.
            let bytes = upstream.bytes().await.map_err(|err| {
                ServiceError::internal(format!("upstream body read failed: {err}"))
            })?;
            let usage_recorder = recorder.clone();
            let emitted = extract_from_json_body(&bytes, transform, move |usage| {
                usage_recorder.on_token_usage(usage);
            });
            Body::from(emitted)
        }
        None => Body::from_stream(
            upstream
                .bytes_stream()
                .map_err(|err| std::io::Error::other(err.to_string())),
        ),
    };

    let mut response = Response::builder().status(status);
    for (name, value) in response_headers {
        response = response.header(name, value);
    }
    response = response.header("x-kleis-request-id", uuid::Uuid::now_v7().to_string());
    response
        .body(body)
        .map_err(|err| ServiceError::internal(err.to_string()))
}

async fn healthz() -> Response {
    axum::Json(serde_json::json!({
        "ok": true,
        "service": "kleis",
        "now": now_ms(),
    }))
    .into_response()
}

#[derive(Debug, serde::Deserialize)]
struct RegistryQuery {
    /// `kmd_…` discovery token: scopes the registry to one key's view.
    token: Option<String>,
}

async fn models_registry(
    State(state): State<ProxyState>,
    Query(query): Query<RegistryQuery>,
) -> Response {
    let scopes = match query.token.as_deref() {
        None => None,
        Some(token) => {
            let found = state
                .app
                .repository
                .find_active_api_key_by_discovery_token(token, now_ms())
                .await;
            match found {
                Ok(Some(key)) => Some(ApiKeyScopes {
                    provider_scopes: key.provider_scopes,
                    model_scopes: key.model_scopes,
                }),
                Ok(None) => {
                    return error_response(&ServiceError::not_found("unknown discovery token"));
                }
                Err(err) => return error_response(&ServiceError::internal(err.to_string())),
            }
        }
    };

    match registry_payload(&state, scopes).await {
        Ok(payload) => axum::Json(payload).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn registry_payload(
    state: &ProxyState,
    scopes: Option<ApiKeyScopes>,
) -> Result<JsonValue, ServiceError> {
    let accounts = state
        .app
        .repository
        .list_provider_accounts()
        .await
        .map_err(|err| ServiceError::internal(err.to_string()))?;
    let mut configured: Vec<kleis_provider_core::Provider> = Vec::new();
    for account in accounts {
        if !configured.contains(&account.provider) {
            configured.push(account.provider);
        }
    }
    state
        .app
        .models
        .registry_json(&state.app.config.public_origin, &configured, scopes.as_ref())
        .await
}

fn copy_request_headers(headers: &HeaderMap) -> Headers {
    let mut copied: Headers = Vec::new();
    for (name, value) in headers {
        let lowered = name.as_str().to_ascii_lowercase();
        if matches!(
            lowered.as_str(),
            "authorization" | "x-api-key" | "host" | "content-length" | "accept-encoding"
        ) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            copied.push((name.as_str().to_string(), value.to_string()));
        }
    }
    copied
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// First of `cf-connecting-ip`, `x-forwarded-for` head, `x-real-ip`.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    if let Some(ip) = header_str(headers, "cf-connecting-ip") {
        let ip = ip.trim().to_string();
        if !ip.is_empty() {
            return ip;
        }
    }
    if let Some(forwarded) = header_str(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }
    if let Some(ip) = header_str(headers, "x-real-ip") {
        let ip = ip.trim().to_string();
        if !ip.is_empty() {
            return ip;
        }
    }
    "unknown".to_string()
}

pub(crate) fn rate_limited_response(retry_after_secs: i64) -> Response {
    let err = ServiceError::new(ErrorKind::TooManyRequests, "too many failed attempts");
    let mut response = error_response(&err);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        headers.insert(header::RETRY_AFTER, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

pub(crate) fn error_response(err: &ServiceError) -> Response {
    let status =
        StatusCode::from_u16(err.kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "error": {
            "kind": err.kind.as_str(),
            "message": err.message,
        },
    });
    (status, axum::Json(body)).into_response()
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn client_ip_prefers_cloudflare_then_forwarded_then_real_ip() {
        let map = headers(&[
            ("cf-connecting-ip", "1.1.1.1"),
            ("x-forwarded-for", "2.2.2.2, 3.3.3.3"),
            ("x-real-ip", "4.4.4.4"),
        ]);
        assert_eq!(client_ip(&map), "1.1.1.1");

        let map = headers(&[
            ("x-forwarded-for", "2.2.2.2, 3.3.3.3"),
            ("x-real-ip", "4.4.4.4"),
        ]);
        assert_eq!(client_ip(&map), "2.2.2.2");

        let map = headers(&[("x-real-ip", "4.4.4.4")]);
        assert_eq!(client_ip(&map), "4.4.4.4");

        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }

    #[test]
    fn proxy_auth_material_is_stripped_from_forwarded_headers() {
        let map = headers(&[
            ("authorization", "Bearer kleis_secret"),
            ("x-api-key", "kleis_secret"),
            ("host", "proxy.example"),
            ("content-length", "42"),
            ("anthropic-beta", "custom"),
        ]);
        let copied = copy_request_headers(&map);
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].0, "anthropic-beta");
    }

    #[test]
    fn rate_limited_responses_carry_retry_after_and_no_store() {
        let response = rate_limited_response(300);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "300"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
    }

    #[test]
    fn error_kinds_map_to_statuses_in_responses() {
        let response = error_response(&ServiceError::new(
            ErrorKind::AccountMissing,
            "no codex account is configured",
        ));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

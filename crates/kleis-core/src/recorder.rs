use std::sync::{Arc, Mutex};

use kleis_common::now_ms;
use kleis_protocol::TokenUsage;
use kleis_provider_core::Provider;
use kleis_storage::{BucketKey, Repository, UsageDelta};

/// Sentinel account id for requests that never resolved an upstream
/// account.
pub const MISSING_ACCOUNT_ID: &str = "__missing__";

const BUCKET_MS: i64 = 60_000;

#[derive(Debug, Clone)]
pub struct UsageContext {
    pub api_key_id: String,
    pub provider_account_id: String,
    pub provider: Provider,
    pub endpoint: String,
    pub model: Option<String>,
}

impl UsageContext {
    pub fn new(api_key_id: String, provider: Provider, endpoint: &str) -> Self {
        Self {
            api_key_id,
            provider_account_id: MISSING_ACCOUNT_ID.to_string(),
            provider,
            endpoint: endpoint.to_string(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    CountersPersisted,
}

struct RecorderInner {
    ctx: UsageContext,
    phase: Phase,
    latest_tokens: Option<TokenUsage>,
}

/// Per-request usage state machine. Token-usage notifications arriving
/// before the request counters are persisted ride along with them; later
/// ones become token-only upserts. All writes are fire-and-forget.
pub struct RequestRecorder {
    repository: Repository,
    inner: Mutex<RecorderInner>,
}

impl RequestRecorder {
    pub fn new(repository: Repository, ctx: UsageContext) -> Arc<Self> {
        Arc::new(Self {
            repository,
            inner: Mutex::new(RecorderInner {
                ctx,
                phase: Phase::Initial,
                latest_tokens: None,
            }),
        })
    }

    pub fn set_account(&self, provider_account_id: &str) {
        let mut inner = self.inner.lock().expect("recorder lock");
        inner.ctx.provider_account_id = provider_account_id.to_string();
    }

    pub fn set_model(&self, model: &str) {
        let mut inner = self.inner.lock().expect("recorder lock");
        inner.ctx.model = Some(model.to_string());
    }

    pub fn on_token_usage(self: &Arc<Self>, usage: TokenUsage) {
        let mut inner = self.inner.lock().expect("recorder lock");
        match inner.phase {
            Phase::Initial => {
                inner.latest_tokens = Some(usage);
            }
            Phase::CountersPersisted => {
                let occurred_at = now_ms();
                let key = bucket_key(&inner.ctx, occurred_at);
                drop(inner);
                let repository = self.repository.clone();
                tokio::spawn(async move {
                    if let Err(err) = repository
                        .record_token_usage(&key, &usage, occurred_at)
                        .await
                    {
                        tracing::debug!(error = %err, "token usage upsert failed");
                    }
                });
            }
        }
    }

    pub fn record_request(self: &Arc<Self>, status: u16, duration_ms: i64, occurred_at_ms: i64) {
        let (key, delta) = {
            let mut inner = self.inner.lock().expect("recorder lock");
            inner.phase = Phase::CountersPersisted;
            let tokens = inner.latest_tokens.take();
            let key = bucket_key(&inner.ctx, occurred_at_ms);
            let delta = request_delta(status, duration_ms, occurred_at_ms, tokens);
            (key, delta)
        };

        let repository = self.repository.clone();
        tokio::spawn(async move {
            if let Err(err) = repository.record_request_usage(&key, &delta).await {
                tracing::debug!(error = %err, "request usage upsert failed");
            }
        });
    }
}

pub fn bucket_start(occurred_at_ms: i64) -> i64 {
    occurred_at_ms.div_euclid(BUCKET_MS) * BUCKET_MS
}

fn bucket_key(ctx: &UsageContext, occurred_at_ms: i64) -> BucketKey {
    BucketKey {
        bucket_start: bucket_start(occurred_at_ms),
        api_key_id: ctx.api_key_id.clone(),
        provider_account_id: ctx.provider_account_id.clone(),
        provider: ctx.provider,
        endpoint: ctx.endpoint.clone(),
        model: ctx.model.clone().unwrap_or_default(),
    }
}

fn request_delta(
    status: u16,
    duration_ms: i64,
    occurred_at_ms: i64,
    tokens: Option<TokenUsage>,
) -> UsageDelta {
    let mut delta = UsageDelta {
        request_count: 1,
        total_latency_ms: duration_ms.max(0),
        max_latency_ms: duration_ms.max(0),
        last_request_at: occurred_at_ms,
        ..Default::default()
    };
    match status {
        401 | 403 => delta.auth_error_count = 1,
        429 => delta.rate_limit_count = 1,
        200..=399 => delta.success_count = 1,
        400..=499 => delta.client_error_count = 1,
        _ => delta.server_error_count = 1,
    }
    if let Some(tokens) = tokens {
        delta.input_tokens = tokens.input_tokens;
        delta.output_tokens = tokens.output_tokens;
        delta.cache_read_tokens = tokens.cache_read_tokens;
        delta.cache_write_tokens = tokens.cache_write_tokens;
    }
    delta
}

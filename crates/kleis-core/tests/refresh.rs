use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sea_orm::Database;

use kleis_common::now_ms;
use kleis_core::ProviderService;
use kleis_provider_core::{
    AccountMetadata, AdapterRegistry, OAuthAdapter, OAuthError, OAuthResult, OAuthStart,
    OAuthStartOptions, OAuthTokens, Provider, ProviderAccount,
};
use kleis_storage::{NewProviderAccount, Repository};

struct SlowRefreshAdapter {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl OAuthAdapter for SlowRefreshAdapter {
    fn provider(&self) -> Provider {
        Provider::Codex
    }

    async fn start_oauth(
        &self,
        _redirect_uri: Option<&str>,
        _options: &OAuthStartOptions,
        _now_ms: i64,
    ) -> OAuthResult<OAuthStart> {
        Err(OAuthError::MalformedResponse("not under test".to_string()))
    }

    async fn complete_oauth(
        &self,
        _state: &str,
        _code: Option<&str>,
        _now_ms: i64,
    ) -> OAuthResult<OAuthTokens> {
        Err(OAuthError::MalformedResponse("not under test".to_string()))
    }

    async fn refresh_account(
        &self,
        account: &ProviderAccount,
        now_ms: i64,
    ) -> OAuthResult<OAuthTokens> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(OAuthTokens {
            access_token: "B".to_string(),
            refresh_token: "R2".to_string(),
            expires_at: now_ms + 3_600_000,
            account_id: account.account_id.clone(),
            metadata: account.metadata.clone(),
            label: account.label.clone(),
        })
    }
}

async fn service_with_expired_account(
    calls: Arc<AtomicUsize>,
    now: i64,
) -> (ProviderService, String) {
    let db = Database::connect("sqlite::memory:").await.expect("sqlite");
    let repository = Repository::from_connection(db);
    repository.sync().await.expect("schema sync");

    let account = repository
        .upsert_provider_account(
            &NewProviderAccount {
                provider: Provider::Codex,
                account_id: Some("acct-1".to_string()),
                label: None,
                access_token: "A".to_string(),
                refresh_token: "R".to_string(),
                expires_at: now - 1_000,
                metadata: AccountMetadata::empty_for(Provider::Codex),
            },
            now - 10_000,
        )
        .await
        .expect("seed account");

    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(SlowRefreshAdapter { calls }));
    (ProviderService::new(repository, registry), account.id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_primary_reads_refresh_exactly_once() {
    let now = now_ms();
    let calls = Arc::new(AtomicUsize::new(0));
    let (service, account_id) = service_with_expired_account(calls.clone(), now).await;

    let (left, right) = tokio::join!(
        service.get_primary_provider_account(Provider::Codex, now),
        service.get_primary_provider_account(Provider::Codex, now),
    );

    let left = left.expect("left refresh").expect("left account");
    let right = right.expect("right refresh").expect("right account");
    assert_eq!(left.access_token, "B");
    assert_eq!(right.access_token, "B");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The advisory lease is clear once both callers return.
    let stored = service
        .repository()
        .get_provider_account(&account_id)
        .await
        .expect("read back")
        .expect("account exists");
    assert!(stored.refresh_lock_token.is_none());
    assert!(stored.refresh_lock_expires_at.is_none());
    assert_eq!(stored.refresh_token, "R2");
}

#[tokio::test]
async fn valid_token_skips_the_adapter_entirely() {
    let now = now_ms();
    let calls = Arc::new(AtomicUsize::new(0));
    let (service, account_id) = service_with_expired_account(calls.clone(), now).await;

    // Make the token valid again before reading.
    service
        .repository()
        .update_provider_account_tokens(
            &account_id,
            &kleis_storage::AccountTokenUpdate {
                access_token: "A".to_string(),
                refresh_token: "R".to_string(),
                expires_at: now + 3_600_000,
                account_id: None,
                metadata: None,
                label: None,
            },
            None,
            now,
        )
        .await
        .expect("make valid");

    let account = service
        .get_primary_provider_account(Provider::Codex, now)
        .await
        .expect("read")
        .expect("account");
    assert_eq!(account.access_token, "A");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_primary_returns_none() {
    let db = Database::connect("sqlite::memory:").await.expect("sqlite");
    let repository = Repository::from_connection(db);
    repository.sync().await.expect("schema sync");
    let service = ProviderService::new(repository, AdapterRegistry::new());

    let result = service
        .get_primary_provider_account(Provider::Claude, now_ms())
        .await
        .expect("query");
    assert!(result.is_none());
}

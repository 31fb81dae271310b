use sea_orm::Database;

use kleis_protocol::TokenUsage;
use kleis_provider_core::{AccountMetadata, OAuthStateRecord, Provider};
use kleis_storage::{
    AccountTokenUpdate, BucketKey, DeleteKeyOutcome, NewApiKey, NewProviderAccount, Repository,
    UsageDelta,
};

async fn fresh_repository() -> Repository {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    let repository = Repository::from_connection(db);
    repository.sync().await.expect("schema sync");
    repository
}

fn codex_account(account_id: &str) -> NewProviderAccount {
    NewProviderAccount {
        provider: Provider::Codex,
        account_id: Some(account_id.to_string()),
        label: None,
        access_token: "A".to_string(),
        refresh_token: "R".to_string(),
        expires_at: 10_000,
        metadata: AccountMetadata::empty_for(Provider::Codex),
    }
}

fn bucket_key(model: &str) -> BucketKey {
    BucketKey {
        bucket_start: 60_000,
        api_key_id: "key-1".to_string(),
        provider_account_id: "acct-1".to_string(),
        provider: Provider::Codex,
        endpoint: "responses".to_string(),
        model: model.to_string(),
    }
}

#[tokio::test]
async fn first_account_of_a_provider_becomes_primary() {
    let repository = fresh_repository().await;

    let first = repository
        .upsert_provider_account(&codex_account("acct-1"), 1_000)
        .await
        .expect("insert first");
    assert!(first.is_primary);

    let second = repository
        .upsert_provider_account(&codex_account("acct-2"), 2_000)
        .await
        .expect("insert second");
    assert!(!second.is_primary);

    let accounts = repository.list_provider_accounts().await.expect("list");
    let primaries = accounts.iter().filter(|account| account.is_primary).count();
    assert_eq!(primaries, 1);
}

#[tokio::test]
async fn upsert_by_upstream_id_updates_instead_of_duplicating() {
    let repository = fresh_repository().await;

    let original = repository
        .upsert_provider_account(&codex_account("acct-1"), 1_000)
        .await
        .expect("insert");

    let mut renewed = codex_account("acct-1");
    renewed.access_token = "A2".to_string();
    renewed.expires_at = 99_000;
    let updated = repository
        .upsert_provider_account(&renewed, 2_000)
        .await
        .expect("upsert");

    assert_eq!(updated.id, original.id);
    assert_eq!(updated.access_token, "A2");
    assert_eq!(updated.expires_at, 99_000);
    assert_eq!(repository.list_provider_accounts().await.unwrap().len(), 1);
}

#[tokio::test]
async fn set_primary_clears_the_previous_primary() {
    let repository = fresh_repository().await;

    let first = repository
        .upsert_provider_account(&codex_account("acct-1"), 1_000)
        .await
        .unwrap();
    let second = repository
        .upsert_provider_account(&codex_account("acct-2"), 2_000)
        .await
        .unwrap();

    let promoted = repository
        .set_primary_provider_account(&second.id, 3_000)
        .await
        .expect("set primary")
        .expect("target exists");
    assert!(promoted.is_primary);

    let demoted = repository
        .get_provider_account(&first.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!demoted.is_primary);
}

#[tokio::test]
async fn deleting_the_primary_promotes_the_most_recent_account() {
    let repository = fresh_repository().await;

    let first = repository
        .upsert_provider_account(&codex_account("acct-1"), 1_000)
        .await
        .unwrap();
    let _second = repository
        .upsert_provider_account(&codex_account("acct-2"), 2_000)
        .await
        .unwrap();
    let third = repository
        .upsert_provider_account(&codex_account("acct-3"), 3_000)
        .await
        .unwrap();

    assert!(repository.delete_provider_account(&first.id, 4_000).await.unwrap());

    let primary = repository
        .find_primary_provider_account(Provider::Codex)
        .await
        .unwrap()
        .expect("a primary remains");
    assert_eq!(primary.id, third.id);
}

#[tokio::test]
async fn oauth_state_is_consumed_exactly_once() {
    let repository = fresh_repository().await;

    let record = OAuthStateRecord {
        state: "st-1".to_string(),
        provider: Provider::Claude,
        pkce_verifier: Some("verifier".to_string()),
        metadata_json: None,
        expires_at: 10_000,
    };
    repository.insert_oauth_state(&record).await.unwrap();

    let consumed = repository
        .consume_oauth_state("st-1", Provider::Claude, 1_000)
        .await
        .unwrap();
    assert!(consumed.is_some());
    assert_eq!(consumed.unwrap().pkce_verifier.as_deref(), Some("verifier"));

    let again = repository
        .consume_oauth_state("st-1", Provider::Claude, 1_000)
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn expired_oauth_state_is_not_found() {
    let repository = fresh_repository().await;

    let record = OAuthStateRecord {
        state: "st-2".to_string(),
        provider: Provider::Codex,
        pkce_verifier: None,
        metadata_json: None,
        expires_at: 5_000,
    };
    repository.insert_oauth_state(&record).await.unwrap();

    assert!(
        repository
            .find_oauth_state("st-2", Provider::Codex, 5_000)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(repository.delete_expired_oauth_states(5_000).await.unwrap(), 1);
}

#[tokio::test]
async fn refresh_lock_is_exclusive_until_released_or_expired() {
    let repository = fresh_repository().await;
    let account = repository
        .upsert_provider_account(&codex_account("acct-1"), 1_000)
        .await
        .unwrap();

    assert!(
        repository
            .try_acquire_provider_account_refresh_lock(&account.id, "tok-a", 1_000, 21_000)
            .await
            .unwrap()
    );
    assert!(
        !repository
            .try_acquire_provider_account_refresh_lock(&account.id, "tok-b", 2_000, 22_000)
            .await
            .unwrap()
    );

    repository
        .release_provider_account_refresh_lock(&account.id, "tok-a")
        .await
        .unwrap();
    assert!(
        repository
            .try_acquire_provider_account_refresh_lock(&account.id, "tok-b", 3_000, 23_000)
            .await
            .unwrap()
    );

    // A stale lease can be stolen once it expires.
    assert!(
        repository
            .try_acquire_provider_account_refresh_lock(&account.id, "tok-c", 23_000, 43_000)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn token_update_requires_the_held_lock() {
    let repository = fresh_repository().await;
    let account = repository
        .upsert_provider_account(&codex_account("acct-1"), 1_000)
        .await
        .unwrap();

    let update = AccountTokenUpdate {
        access_token: "B".to_string(),
        refresh_token: "R2".to_string(),
        expires_at: 50_000,
        account_id: None,
        metadata: None,
        label: None,
    };

    // No lock held yet: conditional write must not apply.
    let denied = repository
        .update_provider_account_tokens(&account.id, &update, Some("tok-a"), 2_000)
        .await
        .unwrap();
    assert!(denied.is_none());

    assert!(
        repository
            .try_acquire_provider_account_refresh_lock(&account.id, "tok-a", 2_000, 22_000)
            .await
            .unwrap()
    );
    let applied = repository
        .update_provider_account_tokens(&account.id, &update, Some("tok-a"), 3_000)
        .await
        .unwrap()
        .expect("update applies under the lock");
    assert_eq!(applied.access_token, "B");
    assert_eq!(applied.refresh_token, "R2");
    assert_eq!(applied.expires_at, 50_000);
}

#[tokio::test]
async fn usage_buckets_sum_counters_and_keep_maxima() {
    let repository = fresh_repository().await;
    let key = bucket_key("gpt-5.1-codex");

    let first = UsageDelta {
        request_count: 1,
        success_count: 1,
        total_latency_ms: 120,
        max_latency_ms: 120,
        last_request_at: 61_000,
        ..Default::default()
    };
    let second = UsageDelta {
        request_count: 1,
        success_count: 1,
        total_latency_ms: 200,
        max_latency_ms: 200,
        last_request_at: 62_000,
        ..Default::default()
    };
    repository.record_request_usage(&key, &first).await.unwrap();
    repository.record_request_usage(&key, &second).await.unwrap();

    let tokens = TokenUsage {
        input_tokens: 10,
        output_tokens: 20,
        cache_read_tokens: 3,
        cache_write_tokens: 0,
    };
    repository.record_token_usage(&key, &tokens, 63_000).await.unwrap();

    let totals = repository.usage_totals(0, 120_000).await.unwrap();
    assert_eq!(totals.request_count, Some(2));
    assert_eq!(totals.success_count, Some(2));
    assert_eq!(totals.total_latency_ms, Some(320));
    assert_eq!(totals.max_latency_ms, Some(200));
    assert_eq!(totals.input_tokens, Some(10));
    assert_eq!(totals.output_tokens, Some(20));
    assert_eq!(totals.cache_read_tokens, Some(3));
    assert_eq!(totals.last_request_at, Some(63_000));
}

#[tokio::test]
async fn usage_rows_group_by_model() {
    let repository = fresh_repository().await;

    let delta = UsageDelta {
        request_count: 1,
        success_count: 1,
        total_latency_ms: 10,
        max_latency_ms: 10,
        last_request_at: 61_000,
        ..Default::default()
    };
    repository
        .record_request_usage(&bucket_key("gpt-5.2"), &delta)
        .await
        .unwrap();
    repository
        .record_request_usage(&bucket_key("gpt-5.1-codex"), &delta)
        .await
        .unwrap();

    let rows = repository.usage_by_model(0, 120_000).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.request_count == Some(1)));
}

#[tokio::test]
async fn api_key_lookup_honors_revocation_and_expiry() {
    let repository = fresh_repository().await;

    let key = repository
        .insert_api_key(
            &NewApiKey {
                key: "kleis_test".to_string(),
                models_discovery_token: Some("kmd_test".to_string()),
                label: Some("ci".to_string()),
                provider_scopes: Some(vec![Provider::Codex]),
                model_scopes: None,
                expires_at: Some(10_000),
            },
            1_000,
        )
        .await
        .unwrap();

    let found = repository
        .find_active_api_key_by_value("kleis_test", 5_000)
        .await
        .unwrap()
        .expect("active key resolves");
    assert_eq!(found.id, key.id);
    assert_eq!(found.provider_scopes.as_deref(), Some(&[Provider::Codex][..]));

    assert!(
        repository
            .find_active_api_key_by_value("kleis_test", 10_000)
            .await
            .unwrap()
            .is_none()
    );

    repository.revoke_api_key(&key.id, 6_000).await.unwrap();
    assert!(
        repository
            .find_active_api_key_by_value("kleis_test", 5_000)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn delete_key_refuses_unless_revoked_and_cascades_usage() {
    let repository = fresh_repository().await;

    let key = repository
        .insert_api_key(
            &NewApiKey {
                key: "kleis_doomed".to_string(),
                models_discovery_token: None,
                label: None,
                provider_scopes: None,
                model_scopes: None,
                expires_at: None,
            },
            1_000,
        )
        .await
        .unwrap();

    let mut bucket = bucket_key("gpt-5.2");
    bucket.api_key_id = key.id.clone();
    repository
        .record_request_usage(
            &bucket,
            &UsageDelta {
                request_count: 1,
                success_count: 1,
                last_request_at: 61_000,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        repository.delete_revoked_api_key(&key.id).await.unwrap(),
        DeleteKeyOutcome::NotRevoked
    );

    repository.revoke_api_key(&key.id, 2_000).await.unwrap();
    assert_eq!(
        repository.delete_revoked_api_key(&key.id).await.unwrap(),
        DeleteKeyOutcome::Deleted
    );
    assert_eq!(
        repository.delete_revoked_api_key(&key.id).await.unwrap(),
        DeleteKeyOutcome::NotFound
    );

    let totals = repository.usage_for_key(&key.id, 0, 120_000).await.unwrap();
    assert_eq!(totals.request_count.unwrap_or(0), 0);
}

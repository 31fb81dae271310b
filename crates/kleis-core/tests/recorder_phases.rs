use std::time::Duration;

use sea_orm::Database;

use kleis_core::recorder::{RequestRecorder, UsageContext};
use kleis_protocol::TokenUsage;
use kleis_provider_core::Provider;
use kleis_storage::{Repository, UsageTotals};

async fn fresh_repository() -> Repository {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    let repository = Repository::from_connection(db);
    repository.sync().await.expect("schema sync");
    repository
}

fn usage() -> TokenUsage {
    TokenUsage {
        input_tokens: 10,
        output_tokens: 20,
        cache_read_tokens: 3,
        cache_write_tokens: 0,
    }
}

/// The recorder persists in the background; poll until the predicate
/// holds or the test times out.
async fn wait_for_totals(
    repository: &Repository,
    predicate: impl Fn(&UsageTotals) -> bool,
) -> UsageTotals {
    for _ in 0..100 {
        let totals = repository
            .usage_totals(0, i64::MAX)
            .await
            .expect("totals query");
        if predicate(&totals) {
            return totals;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("usage totals never reached the expected state");
}

#[tokio::test(flavor = "multi_thread")]
async fn usage_observed_before_counters_rides_along_with_the_counter_row() {
    let repository = fresh_repository().await;
    let mut ctx = UsageContext::new("key-1".to_string(), Provider::Codex, "responses");
    ctx.provider_account_id = "acct-1".to_string();
    ctx.model = Some("gpt-5.1-codex".to_string());
    let recorder = RequestRecorder::new(repository.clone(), ctx);

    // Buffered JSON path: the extractor fires before counters persist.
    recorder.on_token_usage(usage());
    recorder.record_request(200, 120, 61_000);

    let totals = wait_for_totals(&repository, |totals| {
        totals.request_count == Some(1) && totals.input_tokens == Some(10)
    })
    .await;
    assert_eq!(totals.success_count, Some(1));
    assert_eq!(totals.output_tokens, Some(20));
    assert_eq!(totals.cache_read_tokens, Some(3));
    assert_eq!(totals.total_latency_ms, Some(120));
}

#[tokio::test(flavor = "multi_thread")]
async fn usage_observed_after_counters_becomes_a_token_only_upsert() {
    let repository = fresh_repository().await;
    let mut ctx = UsageContext::new("key-1".to_string(), Provider::Claude, "messages");
    ctx.provider_account_id = "acct-1".to_string();
    ctx.model = Some("claude-sonnet-4-5".to_string());
    let recorder = RequestRecorder::new(repository.clone(), ctx);

    // Streaming path: counters land when the upstream status is known,
    // token usage only at stream end.
    recorder.record_request(200, 80, 61_000);
    wait_for_totals(&repository, |totals| totals.request_count == Some(1)).await;

    recorder.on_token_usage(usage());
    let totals = wait_for_totals(&repository, |totals| totals.input_tokens == Some(10)).await;

    // The late notification adds tokens without growing request counters.
    assert_eq!(totals.request_count, Some(1));
    assert_eq!(totals.success_count, Some(1));
    assert_eq!(totals.output_tokens, Some(20));
}

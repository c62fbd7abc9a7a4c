//! Integration tests for cancelling a load part way through

use crate::support::{bars_in, orchestrator, range, test_config, ScriptedProvider, DAY, MONDAY};
use market_data_loader::cancel::CancelHandle;
use market_data_loader::downloader::{LoadMode, LoadRequest};
use market_data_loader::provider::ProviderError;
use market_data_loader::store::{LocalStore, MemoryStore};
use market_data_loader::Granularity;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const NOW: i64 = MONDAY + 400 * DAY;
const START: i64 = NOW - 150 * DAY;

/// Five 30-day segments of hourly BTCUSD
fn five_segment_request() -> LoadRequest {
    LoadRequest::new("BTCUSD", Granularity::OneHour, LoadMode::Full).with_range(range(START, NOW))
}

fn provider() -> ScriptedProvider {
    ScriptedProvider::new().with_series("BTCUSD", bars_in(range(START, NOW), Granularity::OneHour))
}

#[tokio::test(start_paused = true)]
async fn test_cancel_keeps_segments_already_merged() {
    let provider = provider().with_latency(Duration::from_secs(10));
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator(&test_config(), &provider, store.clone(), NOW);
    let cancel = CancelHandle::new();

    let (result, _) = tokio::join!(
        orchestrator.load_with_cancel(five_segment_request(), &cancel),
        async {
            // The first segment is still in flight.
            sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    );

    let outcome = result.unwrap();
    assert!(outcome.diagnostics.cancelled);
    assert_eq!(outcome.diagnostics.segments_planned, 5);
    assert_eq!(outcome.diagnostics.segments_fetched, 1);
    assert_eq!(outcome.rows.len(), 30 * 24);
    assert_eq!(provider.calls().len(), 1);

    let coverage = store.coverage("BTCUSD", Granularity::OneHour).await.unwrap();
    assert_eq!(coverage, vec![range(START, START + 30 * DAY)]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_backoff() {
    let provider = provider().fail_when(
        |_| true,
        ProviderError::coded(2105, "HMDS data farm connection is broken:ushmds"),
    );
    let orchestrator = orchestrator(
        &test_config(),
        &provider,
        Arc::new(MemoryStore::new()),
        NOW,
    );
    let cancel = CancelHandle::new();

    let started = Instant::now();
    let (result, _) = tokio::join!(
        orchestrator.load_with_cancel(five_segment_request(), &cancel),
        async {
            sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        }
    );

    let outcome = result.unwrap();
    assert!(outcome.diagnostics.cancelled);
    assert_eq!(outcome.diagnostics.segments_fetched, 0);
    assert_eq!(provider.calls().len(), 1);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn test_cancelled_before_start_issues_no_requests() {
    let provider = provider();
    let orchestrator = orchestrator(
        &test_config(),
        &provider,
        Arc::new(MemoryStore::new()),
        NOW,
    );
    let cancel = CancelHandle::new();
    cancel.cancel();

    let outcome = orchestrator
        .load_with_cancel(five_segment_request(), &cancel)
        .await
        .unwrap();

    assert!(outcome.diagnostics.cancelled);
    assert!(!outcome.diagnostics.is_complete());
    assert!(outcome.rows.is_empty());
    assert!(provider.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_connection_setup() {
    let provider = provider();
    let mut config = test_config();
    config.connection.health_check_delay_ms = 60_000;
    let orchestrator = orchestrator(&config, &provider, Arc::new(MemoryStore::new()), NOW);
    let cancel = CancelHandle::new();

    let started = Instant::now();
    let (result, _) = tokio::join!(
        orchestrator.load_with_cancel(five_segment_request(), &cancel),
        async {
            sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    );

    let outcome = result.unwrap();
    assert!(outcome.diagnostics.cancelled);
    assert!(provider.calls().is_empty());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(orchestrator.manager().pool_status().await.identities.is_empty());
}

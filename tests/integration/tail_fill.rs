//! Integration tests for tail and backfill loads over an existing cache

use crate::support::{bars_in, orchestrator, range, test_config, ScriptedProvider, DAY, HOUR, MONDAY};
use market_data_loader::downloader::{LoadMode, LoadRequest};
use market_data_loader::store::{LocalStore, MemoryStore};
use market_data_loader::Granularity;
use std::sync::Arc;

const NOW: i64 = MONDAY + 100 * DAY;

async fn seeded_store(covered: &[(i64, i64)]) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for &(start, end) in covered {
        store
            .merge(
                "BTCUSD",
                Granularity::OneHour,
                bars_in(range(start, end), Granularity::OneHour),
            )
            .await
            .unwrap();
    }
    store
}

#[tokio::test(start_paused = true)]
async fn test_tail_fills_newest_segment_first() {
    let store = seeded_store(&[(NOW - 100 * DAY, NOW - 70 * DAY)]).await;
    let provider = ScriptedProvider::new().with_series(
        "BTCUSD",
        bars_in(range(NOW - 100 * DAY, NOW), Granularity::OneHour),
    );
    let orchestrator = orchestrator(&test_config(), &provider, store.clone(), NOW);

    let outcome = orchestrator
        .load(LoadRequest::new("BTCUSD", Granularity::OneHour, LoadMode::Tail))
        .await
        .unwrap();

    assert_eq!(outcome.target, Some(range(NOW - 70 * DAY, NOW)));
    assert_eq!(outcome.rows.len(), 70 * 24);
    assert_eq!(outcome.diagnostics.segments_fetched, 3);
    assert_eq!(outcome.diagnostics.rows_merged, 70 * 24);

    let ranges: Vec<_> = provider.calls().iter().map(|c| c.range).collect();
    assert_eq!(
        ranges,
        vec![
            range(NOW - 30 * DAY, NOW),
            range(NOW - 60 * DAY, NOW - 30 * DAY),
            range(NOW - 70 * DAY, NOW - 60 * DAY),
        ]
    );

    let coverage = store.coverage("BTCUSD", Granularity::OneHour).await.unwrap();
    assert_eq!(coverage, vec![range(NOW - 100 * DAY, NOW)]);
}

#[tokio::test(start_paused = true)]
async fn test_backfill_reaches_one_segment_before_the_cache() {
    let store = seeded_store(&[(NOW - 10 * DAY, NOW)]).await;
    let provider = ScriptedProvider::new().with_series(
        "BTCUSD",
        bars_in(range(NOW - 100 * DAY, NOW), Granularity::OneHour),
    );
    let orchestrator = orchestrator(&test_config(), &provider, store.clone(), NOW);

    let outcome = orchestrator
        .load(LoadRequest::new("BTCUSD", Granularity::OneHour, LoadMode::Backfill))
        .await
        .unwrap();

    assert_eq!(outcome.target, Some(range(NOW - 40 * DAY, NOW - 10 * DAY)));
    assert_eq!(outcome.diagnostics.segments_fetched, 1);
    let bounds = store.bounds("BTCUSD", Granularity::OneHour).await.unwrap();
    assert_eq!(bounds, Some(range(NOW - 40 * DAY, NOW)));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_range_fetches_only_the_interior_hole() {
    let store = seeded_store(&[
        (NOW - 20 * DAY, NOW - 15 * DAY),
        (NOW - 10 * DAY, NOW - 5 * DAY),
    ])
    .await;
    let provider = ScriptedProvider::new().with_series(
        "BTCUSD",
        bars_in(range(NOW - 30 * DAY, NOW), Granularity::OneHour),
    );
    let orchestrator = orchestrator(&test_config(), &provider, store, NOW);

    let request = LoadRequest::new("BTCUSD", Granularity::OneHour, LoadMode::Tail)
        .with_range(range(NOW - 20 * DAY, NOW - 5 * DAY));
    let outcome = orchestrator.load(request).await.unwrap();

    let ranges: Vec<_> = provider.calls().iter().map(|c| c.range).collect();
    assert_eq!(ranges, vec![range(NOW - 15 * DAY, NOW - 10 * DAY)]);
    assert_eq!(outcome.rows.len(), 15 * 24);
    assert_eq!(outcome.diagnostics.gaps_analyzed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_short_interior_hole_is_left_alone() {
    // A three-hour hole is shorter than the one-day interior threshold.
    let store = seeded_store(&[
        (NOW - 5 * DAY, NOW - 3 * DAY),
        (NOW - 3 * DAY + 3 * 3_600_000, NOW - DAY),
    ])
    .await;
    let provider = ScriptedProvider::new();
    let orchestrator = orchestrator(&test_config(), &provider, store, NOW);

    let request = LoadRequest::new("BTCUSD", Granularity::OneHour, LoadMode::Tail)
        .with_range(range(NOW - 5 * DAY, NOW - DAY));
    let outcome = orchestrator.load(request).await.unwrap();

    assert_eq!(outcome.diagnostics.segments_planned, 0);
    assert!(provider.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_weekly_tail_fetches_the_latest_completed_week() {
    const WEEK: i64 = 7 * DAY;
    let history = bars_in(range(MONDAY - 10 * WEEK, MONDAY + WEEK), Granularity::OneWeek);
    let store = Arc::new(MemoryStore::new());
    store
        .merge(
            "AAPL",
            Granularity::OneWeek,
            bars_in(range(MONDAY - 10 * WEEK, MONDAY), Granularity::OneWeek),
        )
        .await
        .unwrap();
    let provider = ScriptedProvider::new().with_series("AAPL", history);

    // Midweek: the current week has not closed yet.
    let midweek = orchestrator(&test_config(), &provider, store.clone(), MONDAY + 4 * DAY);
    let outcome = midweek
        .load(LoadRequest::new("AAPL", Granularity::OneWeek, LoadMode::Tail))
        .await
        .unwrap();
    assert_eq!(outcome.diagnostics.segments_planned, 0);
    assert!(provider.calls().is_empty());

    // The following Monday the finished week is fetched.
    let monday = orchestrator(&test_config(), &provider, store.clone(), MONDAY + WEEK + HOUR);
    let outcome = monday
        .load(LoadRequest::new("AAPL", Granularity::OneWeek, LoadMode::Tail))
        .await
        .unwrap();
    assert_eq!(outcome.target, Some(range(MONDAY, MONDAY + WEEK + HOUR)));
    assert_eq!(outcome.diagnostics.segments_fetched, 1);
    assert_eq!(provider.calls().len(), 1);

    let bounds = store.bounds("AAPL", Granularity::OneWeek).await.unwrap();
    assert_eq!(bounds, Some(range(MONDAY - 10 * WEEK, MONDAY + WEEK)));
}

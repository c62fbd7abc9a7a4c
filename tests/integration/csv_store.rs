//! Integration tests for the CSV cache, alone and behind the orchestrator

use crate::support::{bars_in, bar, range, test_config, DAY, HOUR, MONDAY};
use market_data_loader::downloader::{FetchOrchestrator, LoadMode, LoadRequest};
use market_data_loader::provider::ReplayProvider;
use market_data_loader::store::{CsvStore, LocalStore};
use market_data_loader::Granularity;
use std::sync::Arc;
use tempfile::TempDir;

const NOW: i64 = MONDAY + 60 * DAY;

#[cfg(unix)]
fn inode(path: &std::path::Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).unwrap().ino()
}

#[cfg(unix)]
#[tokio::test]
async fn test_tail_merge_appends_in_place_and_backfill_rewrites() {
    let dir = TempDir::new().unwrap();
    let store = CsvStore::new(dir.path());
    let path = store.path_for("BTCUSD", Granularity::OneHour).unwrap();

    store
        .merge(
            "BTCUSD",
            Granularity::OneHour,
            bars_in(range(NOW - 2 * DAY, NOW - DAY), Granularity::OneHour),
        )
        .await
        .unwrap();
    let original = inode(&path);

    let tail = store
        .merge(
            "BTCUSD",
            Granularity::OneHour,
            bars_in(range(NOW - DAY, NOW), Granularity::OneHour),
        )
        .await
        .unwrap();
    assert!(tail.appended);
    assert_eq!(inode(&path), original, "tail merge appends to the same file");

    let backfill = store
        .merge(
            "BTCUSD",
            Granularity::OneHour,
            bars_in(range(NOW - 3 * DAY, NOW - 2 * DAY), Granularity::OneHour),
        )
        .await
        .unwrap();
    assert!(!backfill.appended);
    assert_ne!(inode(&path), original, "backfill replaces the file");

    let rows = store
        .read("BTCUSD", Granularity::OneHour, range(NOW - 3 * DAY, NOW))
        .await
        .unwrap();
    assert_eq!(rows.len(), 72);
    assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn test_two_stores_on_one_directory_never_lose_rows() {
    let dir = TempDir::new().unwrap();
    let first = CsvStore::new(dir.path());
    let second = CsvStore::new(dir.path());

    let evens: Vec<_> = (0..48).step_by(2).map(|h| bar(NOW - DAY + h * HOUR)).collect();
    let odds: Vec<_> = (1..48).step_by(2).map(|h| bar(NOW - DAY + h * HOUR)).collect();
    let (a, b) = tokio::join!(
        first.merge("ETHUSD", Granularity::OneHour, evens),
        second.merge("ETHUSD", Granularity::OneHour, odds),
    );
    a.unwrap();
    b.unwrap();

    let rows = first
        .read("ETHUSD", Granularity::OneHour, range(NOW - DAY, NOW + DAY))
        .await
        .unwrap();
    assert_eq!(rows.len(), 48);
    assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn test_replay_load_into_csv_cache_survives_restart() {
    let source = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    CsvStore::new(source.path())
        .merge(
            "BTCUSD",
            Granularity::OneHour,
            bars_in(range(NOW - 40 * DAY, NOW), Granularity::OneHour),
        )
        .await
        .unwrap();

    let mut config = test_config();
    config.pacing.historical_min_interval_ms = 0;
    config.store.root = cache.path().to_path_buf();

    let load = |mode: LoadMode| {
        let orchestrator = FetchOrchestrator::from_config(
            &config,
            Arc::new(ReplayProvider::new(source.path())),
            Arc::new(CsvStore::new(&config.store.root)),
        )
        .unwrap()
        .with_clock(Arc::new(market_data_loader::clock::ManualClock::new(NOW)));
        async move {
            let request = LoadRequest::new("BTCUSD", Granularity::OneHour, mode)
                .with_range(range(NOW - 40 * DAY, NOW));
            let outcome = orchestrator.load(request).await;
            orchestrator.manager().shutdown().await;
            outcome
        }
    };

    let first = load(LoadMode::Full).await.unwrap();
    assert_eq!(first.diagnostics.segments_fetched, 2);
    assert_eq!(first.rows.len(), 40 * 24);

    // A fresh orchestrator over the same cache finds nothing missing.
    let second = load(LoadMode::Full).await.unwrap();
    assert_eq!(second.diagnostics.segments_planned, 0);
    assert_eq!(second.diagnostics.provider_calls_made, 0);
    assert_eq!(second.rows, first.rows);
}

//! In-process store

use super::{coverage_runs, merge_rows, slice_range, LocalStore, MergeOutcome, SeriesKey, StoreResult};
use crate::{Bar, Granularity, TimeRange};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Store backed by a map of vectors; nothing survives the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<SeriesKey, Vec<Bar>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every row for a key
    pub async fn snapshot(&self, symbol: &str, granularity: Granularity) -> Vec<Bar> {
        self.series
            .read()
            .await
            .get(&SeriesKey::new(symbol, granularity))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn read(
        &self,
        symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> StoreResult<Vec<Bar>> {
        let series = self.series.read().await;
        Ok(series
            .get(&SeriesKey::new(symbol, granularity))
            .map(|bars| slice_range(bars, range).to_vec())
            .unwrap_or_default())
    }

    async fn merge(
        &self,
        symbol: &str,
        granularity: Granularity,
        rows: Vec<Bar>,
    ) -> StoreResult<MergeOutcome> {
        let mut series = self.series.write().await;
        let bars = series
            .entry(SeriesKey::new(symbol, granularity))
            .or_default();
        Ok(merge_rows(bars, rows))
    }

    async fn coverage(
        &self,
        symbol: &str,
        granularity: Granularity,
    ) -> StoreResult<Vec<TimeRange>> {
        let series = self.series.read().await;
        Ok(series
            .get(&SeriesKey::new(symbol, granularity))
            .map(|bars| coverage_runs(bars, granularity))
            .unwrap_or_default())
    }
}

//! Local time-series cache
//!
//! One sorted, deduplicated series of [`Bar`]s per `(symbol, granularity)`.
//! [`LocalStore::merge`] is the only mutator. Callers that merge the same key
//! from several tasks must serialize through [`KeyedLocks`]; the orchestrator
//! holds the key's lock for a whole load so segment merges land in plan order.

use crate::{Bar, Granularity, TimeRange};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

pub mod csv;
pub mod memory;

pub use self::csv::CsvStore;
pub use memory::MemoryStore;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// CSV read or write error
    #[error("CSV error: {0}")]
    CsvError(String),

    /// A persisted row could not be decoded
    #[error("corrupt row in {path} at line {line}: {message}")]
    CorruptRow {
        /// Cache file
        path: String,
        /// 1-based line number including the header
        line: u64,
        /// What was wrong
        message: String,
    },

    /// Cross-process file lock failure
    #[error("lock error: {0}")]
    LockError(String),

    /// Symbol cannot be mapped to a cache unit
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Blocking worker failed
    #[error("store task failed: {0}")]
    TaskError(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Identity of one cache unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// Instrument symbol
    pub symbol: String,
    /// Bar size
    pub granularity: Granularity,
}

impl SeriesKey {
    /// Build a key
    pub fn new(symbol: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            symbol: symbol.into(),
            granularity,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.symbol, self.granularity)
    }
}

/// What a merge changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Rows with timestamps that were not present before
    pub inserted: usize,
    /// Existing rows overwritten with different values
    pub replaced: usize,
    /// Every new row landed after the previous last row
    pub appended: bool,
}

impl MergeOutcome {
    /// Whether the series changed at all
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.replaced > 0
    }
}

/// Persistent per-key time-series cache
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Rows with `range.start() <= timestamp < range.end()`, oldest first
    async fn read(
        &self,
        symbol: &str,
        granularity: Granularity,
        range: TimeRange,
    ) -> StoreResult<Vec<Bar>>;

    /// Merge rows into the series; incoming rows win on timestamp conflicts
    async fn merge(
        &self,
        symbol: &str,
        granularity: Granularity,
        rows: Vec<Bar>,
    ) -> StoreResult<MergeOutcome>;

    /// Contiguous covered runs, oldest first
    async fn coverage(&self, symbol: &str, granularity: Granularity)
        -> StoreResult<Vec<TimeRange>>;

    /// Span from the first row's start to the last row's end, if any rows exist
    async fn bounds(
        &self,
        symbol: &str,
        granularity: Granularity,
    ) -> StoreResult<Option<TimeRange>> {
        let runs = self.coverage(symbol, granularity).await?;
        Ok(match (runs.first(), runs.last()) {
            (Some(first), Some(last)) => TimeRange::new(first.start(), last.end()).ok(),
            _ => None,
        })
    }
}

/// Merge `incoming` into the sorted, duplicate-free `existing` series.
///
/// Only the suffix starting at the first affected timestamp is rebuilt;
/// incoming rows that all follow the current last row are appended in place.
pub fn merge_rows(existing: &mut Vec<Bar>, mut incoming: Vec<Bar>) -> MergeOutcome {
    if incoming.is_empty() {
        return MergeOutcome::default();
    }

    // Stable sort keeps batch order among equal timestamps, so the last one wins.
    incoming.sort_by_key(|bar| bar.timestamp);
    let incoming = dedup_keep_last(incoming);

    let first_ts = incoming[0].timestamp;
    let split = existing.partition_point(|bar| bar.timestamp < first_ts);

    if split == existing.len() {
        let inserted = incoming.len();
        existing.extend(incoming);
        return MergeOutcome {
            inserted,
            replaced: 0,
            appended: true,
        };
    }

    let tail = existing.split_off(split);
    let mut merged = Vec::with_capacity(tail.len() + incoming.len());
    let mut old = tail.into_iter().peekable();
    let mut inserted = 0;
    let mut replaced = 0;

    for bar in incoming {
        while let Some(kept) = old.next_if(|o| o.timestamp < bar.timestamp) {
            merged.push(kept);
        }
        match old.next_if(|o| o.timestamp == bar.timestamp) {
            Some(previous) => {
                if previous != bar {
                    replaced += 1;
                }
            }
            None => inserted += 1,
        }
        merged.push(bar);
    }
    merged.extend(old);
    existing.extend(merged);

    MergeOutcome {
        inserted,
        replaced,
        appended: false,
    }
}

fn dedup_keep_last(sorted: Vec<Bar>) -> Vec<Bar> {
    let mut out: Vec<Bar> = Vec::with_capacity(sorted.len());
    for bar in sorted {
        match out.last_mut() {
            Some(last) if last.timestamp == bar.timestamp => *last = bar,
            _ => out.push(bar),
        }
    }
    out
}

/// Covered runs of a sorted series.
///
/// Each bar covers `[timestamp, timestamp + interval)`; a bar that starts at or
/// before the end of the previous run extends it.
pub fn coverage_runs(bars: &[Bar], granularity: Granularity) -> Vec<TimeRange> {
    let interval = granularity.to_milliseconds();
    let mut runs = Vec::new();
    let mut iter = bars.iter();
    let Some(first) = iter.next() else {
        return runs;
    };

    let mut start = first.timestamp;
    let mut end = first.timestamp + interval;
    for bar in iter {
        if bar.timestamp <= end {
            end = end.max(bar.timestamp + interval);
        } else {
            runs.extend(TimeRange::new(start, end).ok());
            start = bar.timestamp;
            end = bar.timestamp + interval;
        }
    }
    runs.extend(TimeRange::new(start, end).ok());
    runs
}

/// Rows of a sorted series inside `range`
pub fn slice_range(bars: &[Bar], range: TimeRange) -> &[Bar] {
    let from = bars.partition_point(|bar| bar.timestamp < range.start());
    let to = bars.partition_point(|bar| bar.timestamp < range.end());
    &bars[from..to]
}

/// One async mutex per series key
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<SeriesKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    /// Create an empty lock map
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &SeriesKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of keys that have ever been locked
    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Whether no key has been locked yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Fetch orchestration
//!
//! The [`FetchOrchestrator`] is the entry point of the loader. For each
//! [`LoadRequest`] it:
//!
//! 1. **Resolves the target range** from the mode (`tail`, `backfill`, `full`) or an explicit range
//! 2. **Analyzes gaps** against the cache with [`crate::planner::GapAnalyzer`]
//! 3. **Plans segments** that respect the provider's duration limits
//! 4. **Fetches** each segment through a pooled connection, paced and retried per [`RetryPolicy`]
//! 5. **Merges** every fetched segment immediately, so progress survives later failures
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use market_data_loader::config::LoaderConfig;
//! use market_data_loader::downloader::{FetchOrchestrator, LoadMode, LoadRequest};
//! use market_data_loader::provider::ReplayProvider;
//! use market_data_loader::store::MemoryStore;
//! use market_data_loader::Granularity;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = FetchOrchestrator::from_config(
//!     &LoaderConfig::default(),
//!     Arc::new(ReplayProvider::new("./replay")),
//!     Arc::new(MemoryStore::new()),
//! )?;
//!
//! match orchestrator
//!     .load(LoadRequest::new("MSFT", Granularity::OneHour, LoadMode::Tail))
//!     .await
//! {
//!     Ok(outcome) => println!("{} skipped", outcome.diagnostics.skipped_segments.len()),
//!     Err(failure) => eprintln!("failed during {}: {}", failure.error.phase(), failure),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Per-segment failures are contained and reported in [`LoadDiagnostics`].
//! A load only fails when:
//! - no connection can be obtained
//! - the provider returns a fatal error
//! - the only planned segment exhausts its retries
//! - the cache cannot be written
//!
//! In each case [`LoadFailure::partial`] carries whatever was already merged.

use crate::connection::ConnectionError;
use crate::store::StoreError;
use crate::{normalize_symbol, Bar, Granularity, TimeRange};
use serde::Serialize;
use std::str::FromStr;

pub mod config;
pub mod diagnostics;
pub mod orchestrator;
pub mod retry;

pub use diagnostics::{LoadDiagnostics, SkippedSegment};
pub use orchestrator::FetchOrchestrator;
pub use retry::{RetryDecision, RetryPolicy};

/// How the target range of a load is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// From the end of the cache up to now
    Tail,
    /// One segment's worth before the start of the cache
    Backfill,
    /// Everything the provider offers, bounded by the history depth
    Full,
}

impl LoadMode {
    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Tail => "tail",
            LoadMode::Backfill => "backfill",
            LoadMode::Full => "full",
        }
    }
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tail" => Ok(LoadMode::Tail),
            "backfill" => Ok(LoadMode::Backfill),
            "full" => Ok(LoadMode::Full),
            _ => Err(format!("Invalid load mode: {s} (expected tail, backfill or full)")),
        }
    }
}

/// One load to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// Instrument
    pub symbol: String,
    /// Bar size
    pub granularity: Granularity,
    /// Range derivation
    pub mode: LoadMode,
    /// Explicit range; overrides the mode's derivation
    pub range: Option<TimeRange>,
}

impl LoadRequest {
    /// Request with the range derived from `mode`; the symbol is normalized
    pub fn new(symbol: impl Into<String>, granularity: Granularity, mode: LoadMode) -> Self {
        Self {
            symbol: normalize_symbol(&symbol.into()),
            granularity,
            mode,
            range: None,
        }
    }

    /// Use an explicit range
    pub fn with_range(mut self, range: TimeRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Result of a load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    /// Cached rows inside the target range, oldest first
    pub rows: Vec<Bar>,
    /// What the load did
    pub diagnostics: LoadDiagnostics,
    /// Resolved target; `None` when the cache was already current
    pub target: Option<TimeRange>,
}

/// Where a load failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPhase {
    /// Obtaining a provider connection
    Connection,
    /// Waiting for pacing headroom
    Pacing,
    /// Fetching from the provider
    Fetch,
    /// Reading or writing the cache
    Merge,
    /// Invalid request or settings
    Configuration,
}

impl LoadPhase {
    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadPhase::Connection => "connection",
            LoadPhase::Pacing => "pacing",
            LoadPhase::Fetch => "fetch",
            LoadPhase::Merge => "merge",
            LoadPhase::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load errors
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The request cannot be served as given
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No usable provider connection
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The only segment kept hitting pacing limits
    #[error("pacing limit not cleared for {range} after {attempts} attempts: {reason}")]
    Pacing {
        /// Segment span
        range: TimeRange,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// The provider failed the fetch for good
    #[error("fetch of {range} failed after {attempts} attempts: {reason}")]
    Fetch {
        /// Segment span
        range: TimeRange,
        /// Attempts made
        attempts: u32,
        /// Last failure
        reason: String,
    },

    /// The cache could not be read or written
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LoadError {
    /// Phase the error belongs to
    pub fn phase(&self) -> LoadPhase {
        match self {
            LoadError::Configuration(_) => LoadPhase::Configuration,
            LoadError::Connection(_) => LoadPhase::Connection,
            LoadError::Pacing { .. } => LoadPhase::Pacing,
            LoadError::Fetch { .. } => LoadPhase::Fetch,
            LoadError::Store(_) => LoadPhase::Merge,
        }
    }
}

/// A failed load and whatever it merged before failing
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct LoadFailure {
    /// Why the load stopped
    pub error: LoadError,
    /// Rows and diagnostics up to the failure; `None` if it failed before planning
    pub partial: Option<LoadOutcome>,
}

impl From<LoadError> for LoadFailure {
    fn from(error: LoadError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

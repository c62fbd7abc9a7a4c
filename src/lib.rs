//! # Market Data Loader Library
//!
//! Incremental, gap-aware acquisition of historical OHLCV bars from a
//! rate-limited market data provider into a local time-series cache.
//!
//! ## Features
//!
//! - **Gap Analysis**: Only the sub-ranges missing from the local cache are fetched
//! - **Compliant Segments**: Missing ranges are split to respect per-granularity request limits
//! - **Pacing**: A single shared governor enforces the provider's global and per-category limits
//! - **Classified Retries**: Provider errors are mapped to fatal, retryable, pacing or no-data outcomes
//! - **Pooled Sessions**: Each provider session runs on its own task and retires itself when idle
//! - **Durable Cache**: Sorted, deduplicated CSV files per symbol and granularity
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use market_data_loader::config::LoaderConfig;
//! use market_data_loader::downloader::{FetchOrchestrator, LoadMode, LoadRequest};
//! use market_data_loader::provider::replay::ReplayProvider;
//! use market_data_loader::store::csv::CsvStore;
//! use market_data_loader::Granularity;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoaderConfig::default();
//! let provider = Arc::new(ReplayProvider::new("./replay"));
//! let store = Arc::new(CsvStore::new("./data"));
//!
//! let orchestrator = FetchOrchestrator::from_config(&config, provider, store)?;
//! let outcome = orchestrator
//!     .load(LoadRequest::new("AAPL", Granularity::OneDay, LoadMode::Tail))
//!     .await?;
//!
//! println!(
//!     "{} rows, {} segments fetched",
//!     outcome.rows.len(),
//!     outcome.diagnostics.segments_fetched
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Leaf modules first:
//!
//! - [`classifier`] - Provider error classification backed by a loadable table
//! - [`pacing`] - Provider-wide request pacing
//! - [`store`] - Local time-series cache with merge and coverage queries
//! - [`planner`] - Gap analysis and segment planning
//! - [`provider`] - The provider boundary and a file-backed replay provider
//! - [`connection`] - Provider sessions and the connection pool
//! - [`downloader`] - The fetch orchestrator tying everything together
//!
//! ## Data Types
//!
//! - [`Bar`] - OHLCV row keyed by its open timestamp
//! - [`Granularity`] - Bar size
//! - [`TimeRange`] - Half-open UTC interval in milliseconds

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Load cancellation
pub mod cancel;

/// Provider error classification
pub mod classifier;

/// CLI command implementations
pub mod cli;

/// Wall clock abstraction
pub mod clock;

/// Loader configuration
pub mod config;

/// Provider sessions and pooling
pub mod connection;

/// Fetch orchestration
pub mod downloader;

/// Metrics helpers
pub mod metrics;

/// Request pacing
pub mod pacing;

/// Gap analysis and segment planning
pub mod planner;

/// Provider boundary
pub mod provider;

/// Local time-series cache
pub mod store;

/// OHLCV bar keyed by its open time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bar {
    /// Open time (Unix timestamp in milliseconds, UTC)
    pub timestamp: i64,
    /// Open price
    pub open: Decimal,
    /// High price
    pub high: Decimal,
    /// Low price
    pub low: Decimal,
    /// Close price
    pub close: Decimal,
    /// Traded volume
    pub volume: Decimal,
}

impl Bar {
    /// Validate bar data integrity
    pub fn validate(&self) -> Result<(), String> {
        if self.high < self.open || self.high < self.close {
            return Err(format!(
                "High ({}) must be >= open ({}) and close ({})",
                self.high, self.open, self.close
            ));
        }

        if self.low > self.open || self.low > self.close {
            return Err(format!(
                "Low ({}) must be <= open ({}) and close ({})",
                self.low, self.open, self.close
            ));
        }

        if self.volume < Decimal::ZERO {
            return Err(format!("Volume must be non-negative, got {}", self.volume));
        }

        Ok(())
    }
}

/// Bar size of a time series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Granularity {
    /// 1 minute
    #[serde(rename = "1m")]
    OneMinute,
    /// 5 minutes
    #[serde(rename = "5m")]
    FiveMinutes,
    /// 15 minutes
    #[serde(rename = "15m")]
    FifteenMinutes,
    /// 30 minutes
    #[serde(rename = "30m")]
    ThirtyMinutes,
    /// 1 hour
    #[serde(rename = "1h")]
    OneHour,
    /// 4 hours
    #[serde(rename = "4h")]
    FourHours,
    /// 1 day
    #[serde(rename = "1d")]
    OneDay,
    /// 1 week
    #[serde(rename = "1w")]
    OneWeek,
}

impl Granularity {
    /// Every supported granularity, smallest first
    pub const ALL: [Granularity; 8] = [
        Granularity::OneMinute,
        Granularity::FiveMinutes,
        Granularity::FifteenMinutes,
        Granularity::ThirtyMinutes,
        Granularity::OneHour,
        Granularity::FourHours,
        Granularity::OneDay,
        Granularity::OneWeek,
    ];

    /// Bar length in milliseconds
    pub fn to_milliseconds(&self) -> i64 {
        match self {
            Granularity::OneMinute => 60_000,
            Granularity::FiveMinutes => 300_000,
            Granularity::FifteenMinutes => 900_000,
            Granularity::ThirtyMinutes => 1_800_000,
            Granularity::OneHour => 3_600_000,
            Granularity::FourHours => 14_400_000,
            Granularity::OneDay => 86_400_000,
            Granularity::OneWeek => 604_800_000,
        }
    }

    /// Whether bars are shorter than a trading day
    pub fn is_intraday(&self) -> bool {
        self.to_milliseconds() < Granularity::OneDay.to_milliseconds()
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::FifteenMinutes => "15m",
            Granularity::ThirtyMinutes => "30m",
            Granularity::OneHour => "1h",
            Granularity::FourHours => "4h",
            Granularity::OneDay => "1d",
            Granularity::OneWeek => "1w",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Granularity::OneMinute),
            "5m" => Ok(Granularity::FiveMinutes),
            "15m" => Ok(Granularity::FifteenMinutes),
            "30m" => Ok(Granularity::ThirtyMinutes),
            "1h" => Ok(Granularity::OneHour),
            "4h" => Ok(Granularity::FourHours),
            "1d" => Ok(Granularity::OneDay),
            "1w" => Ok(Granularity::OneWeek),
            _ => Err(format!("Invalid granularity: {s}")),
        }
    }
}

/// Rejected `[start, end)` pair
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time range: start {start} must be before end {end}")]
pub struct InvalidRange {
    /// Requested start (ms)
    pub start: i64,
    /// Requested end (ms)
    pub end: i64,
}

/// Half-open `[start, end)` interval in Unix milliseconds (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    start: i64,
    end: i64,
}

impl TimeRange {
    /// Create a range, enforcing `start < end`
    pub fn new(start: i64, end: i64) -> Result<Self, InvalidRange> {
        if start >= end {
            return Err(InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Inclusive start (ms)
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Exclusive end (ms)
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Span in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Whether `timestamp` falls inside the range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether the two ranges share at least one instant
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping part of two ranges, if any
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        TimeRange::new(self.start.max(other.start), self.end.min(other.end)).ok()
    }

    /// Whether `other` lies entirely inside this range
    pub fn covers(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

/// Render a millisecond timestamp as RFC 3339 UTC, falling back to the raw number
pub fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Canonical spelling of a symbol: surrounding whitespace removed, ASCII upper case
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

//! Gap analysis and segment planning
//!
//! [`GapAnalyzer`] turns a requested range and the cache's coverage into the
//! ranges worth fetching; [`SegmentPlanner`] cuts those into requests the
//! provider accepts.

use crate::Granularity;
use std::time::Duration;

pub mod calendar;
pub mod gap;
pub mod segment;

pub use calendar::TradingCalendar;
pub use gap::{missing_from_coverage, GapAnalyzer};
pub use segment::{DurationLimits, PlanDirection, Segment, SegmentPlanner};

const DAY_SECS: u64 = 86_400;

/// Planner configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlannerError {
    /// A granularity was given a zero request-duration limit
    #[error("duration limit for {0} must be greater than zero")]
    ZeroDurationLimit(Granularity),

    /// A granularity was given a zero minimum-gap threshold
    #[error("minimum gap for {0} must be greater than zero")]
    InvalidThreshold(Granularity),
}

/// Longest span a single historical request may cover
pub fn default_duration_limit(granularity: Granularity) -> Duration {
    let days = match granularity {
        Granularity::OneMinute => 1,
        Granularity::FiveMinutes => 7,
        Granularity::FifteenMinutes => 14,
        Granularity::ThirtyMinutes | Granularity::OneHour | Granularity::FourHours => 30,
        Granularity::OneDay => 365,
        Granularity::OneWeek => 730,
    };
    Duration::from_secs(days * DAY_SECS)
}

/// Shortest interior gap (in trading time) that is worth a fetch.
///
/// Intraday bars tolerate anything shorter than a trading day, which absorbs
/// overnight breaks. Daily bars tolerate one missing weekday, which absorbs
/// exchange holidays the weekday calendar does not know about; the cost is
/// that a genuinely missing single day between cached days is not refetched.
/// Override `planner.min_gap_secs` with `{"1d": 86400}` to fetch those too.
/// Weekly bars fetch any whole missing week (five trading days).
pub fn default_min_gap(granularity: Granularity) -> Duration {
    let days = match granularity {
        Granularity::OneDay => 2,
        Granularity::OneWeek => 5,
        _ => 1,
    };
    Duration::from_secs(days * DAY_SECS)
}

/// How far back a `full` load reaches
pub fn default_max_history(granularity: Granularity) -> Duration {
    let days = match granularity {
        Granularity::OneMinute
        | Granularity::FiveMinutes
        | Granularity::FifteenMinutes
        | Granularity::ThirtyMinutes => 180,
        Granularity::OneHour | Granularity::FourHours => 2 * 365,
        Granularity::OneDay | Granularity::OneWeek => 20 * 365,
    };
    Duration::from_secs(days * DAY_SECS)
}

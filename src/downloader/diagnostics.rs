//! Per-load diagnostics

use crate::classifier::ErrorKind;
use crate::TimeRange;
use serde::Serialize;

/// A segment that was not fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSegment {
    /// Segment span
    pub range: TimeRange,
    /// Classification of the last failure
    pub kind: ErrorKind,
    /// Last failure message
    pub reason: String,
    /// Attempts made
    pub attempts: u32,
}

/// What one load did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadDiagnostics {
    /// Missing ranges found after expected-gap filtering
    pub gaps_analyzed: usize,
    /// Segments planned across all gaps
    pub segments_planned: usize,
    /// Segments fetched and merged
    pub segments_fetched: usize,
    /// Provider calls issued, retries and head-timestamp lookups included
    pub provider_calls_made: usize,
    /// Rows inserted or replaced in the cache
    pub rows_merged: usize,
    /// Retries performed
    pub retries: usize,
    /// Segments given up on, in plan order
    pub skipped_segments: Vec<SkippedSegment>,
    /// The load stopped early on request
    pub cancelled: bool,
}

impl LoadDiagnostics {
    /// Whether every planned segment was fetched
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.segments_fetched == self.segments_planned
    }
}

//! Splitting missing ranges into provider-compliant requests

use super::{default_duration_limit, PlannerError};
use crate::{Granularity, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One provider request worth of a missing range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Span to request
    pub range: TimeRange,
    /// Bar size
    pub granularity: Granularity,
}

/// Order in which segments are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDirection {
    /// Backfill order
    OldestFirst,
    /// Tail order
    NewestFirst,
}

/// Maximum span of a single historical request per granularity
#[derive(Debug, Clone)]
pub struct DurationLimits {
    limits: HashMap<Granularity, i64>,
}

impl Default for DurationLimits {
    fn default() -> Self {
        Self {
            limits: Granularity::ALL
                .iter()
                .map(|&g| (g, default_duration_limit(g).as_millis() as i64))
                .collect(),
        }
    }
}

impl DurationLimits {
    /// Defaults with per-granularity overrides applied
    pub fn with_overrides(
        overrides: &HashMap<Granularity, Duration>,
    ) -> Result<Self, PlannerError> {
        let mut limits = Self::default();
        for (&granularity, &limit) in overrides {
            let millis = limit.as_millis() as i64;
            if millis == 0 {
                return Err(PlannerError::ZeroDurationLimit(granularity));
            }
            limits.limits.insert(granularity, millis);
        }
        Ok(limits)
    }

    /// Limit in milliseconds
    pub fn max_duration_ms(&self, granularity: Granularity) -> i64 {
        self.limits
            .get(&granularity)
            .copied()
            .unwrap_or_else(|| default_duration_limit(granularity).as_millis() as i64)
    }
}

/// Splits missing ranges into segments no longer than the duration limit
#[derive(Debug, Clone, Default)]
pub struct SegmentPlanner {
    limits: DurationLimits,
}

impl SegmentPlanner {
    /// Planner over a limits table
    pub fn new(limits: DurationLimits) -> Self {
        Self { limits }
    }

    /// The limits in use
    pub fn limits(&self) -> &DurationLimits {
        &self.limits
    }

    /// Consecutive segments covering `missing` exactly.
    ///
    /// Segments are cut from the end the direction starts at, so the partial
    /// segment (if any) is always the last one emitted.
    pub fn plan(
        &self,
        missing: TimeRange,
        granularity: Granularity,
        direction: PlanDirection,
    ) -> Vec<Segment> {
        let max = self.limits.max_duration_ms(granularity);
        let mut segments = Vec::with_capacity((missing.duration_ms() / max + 1) as usize);

        match direction {
            PlanDirection::OldestFirst => {
                let mut cursor = missing.start();
                while cursor < missing.end() {
                    let end = missing.end().min(cursor.saturating_add(max));
                    if let Ok(range) = TimeRange::new(cursor, end) {
                        segments.push(Segment { range, granularity });
                    }
                    cursor = end;
                }
            }
            PlanDirection::NewestFirst => {
                let mut cursor = missing.end();
                while cursor > missing.start() {
                    let start = missing.start().max(cursor.saturating_sub(max));
                    if let Ok(range) = TimeRange::new(start, cursor) {
                        segments.push(Segment { range, granularity });
                    }
                    cursor = start;
                }
            }
        }
        segments
    }

    /// Plan several missing ranges; the whole list follows `direction`
    pub fn plan_all(
        &self,
        missing: &[TimeRange],
        granularity: Granularity,
        direction: PlanDirection,
    ) -> Vec<Segment> {
        let mut ordered = missing.to_vec();
        ordered.sort();
        if direction == PlanDirection::NewestFirst {
            ordered.reverse();
        }
        ordered
            .into_iter()
            .flat_map(|range| self.plan(range, granularity, direction))
            .collect()
    }
}

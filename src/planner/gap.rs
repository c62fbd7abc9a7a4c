//! Missing-range analysis

use super::calendar::TradingCalendar;
use super::{default_min_gap, PlannerError};
use crate::store::{LocalStore, StoreResult};
use crate::{Granularity, TimeRange};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Computes which parts of a requested range still need fetching
#[derive(Debug, Clone)]
pub struct GapAnalyzer {
    min_gaps: HashMap<Granularity, Duration>,
    continuous_symbols: Vec<String>,
}

impl Default for GapAnalyzer {
    fn default() -> Self {
        Self {
            min_gaps: Granularity::ALL
                .iter()
                .map(|&g| (g, default_min_gap(g)))
                .collect(),
            continuous_symbols: Vec::new(),
        }
    }
}

impl GapAnalyzer {
    /// Analyzer with default thresholds and no always-open symbols
    pub fn new() -> Self {
        Self::default()
    }

    /// Override minimum interior-gap thresholds
    pub fn with_min_gaps(
        mut self,
        overrides: HashMap<Granularity, Duration>,
    ) -> Result<Self, PlannerError> {
        for (granularity, threshold) in overrides {
            if threshold.is_zero() {
                return Err(PlannerError::InvalidThreshold(granularity));
            }
            self.min_gaps.insert(granularity, threshold);
        }
        Ok(self)
    }

    /// Symbols that trade around the clock
    pub fn with_continuous_symbols(mut self, symbols: Vec<String>) -> Self {
        self.continuous_symbols = symbols;
        self
    }

    /// Interior-gap threshold for a granularity
    pub fn min_gap(&self, granularity: Granularity) -> Duration {
        self.min_gaps
            .get(&granularity)
            .copied()
            .unwrap_or_else(|| default_min_gap(granularity))
    }

    /// Calendar applied to a symbol
    pub fn calendar_for(&self, symbol: &str) -> TradingCalendar {
        TradingCalendar::for_symbol(symbol, &self.continuous_symbols)
    }

    /// Ordered missing ranges for `requested`, minus expected gaps
    pub async fn find_missing_ranges(
        &self,
        store: &dyn LocalStore,
        symbol: &str,
        granularity: Granularity,
        requested: TimeRange,
    ) -> StoreResult<Vec<TimeRange>> {
        let coverage = store.coverage(symbol, granularity).await?;
        Ok(self.analyze(symbol, granularity, &coverage, requested))
    }

    /// Pure form of [`Self::find_missing_ranges`] over known coverage
    pub fn analyze(
        &self,
        symbol: &str,
        granularity: Granularity,
        coverage: &[TimeRange],
        requested: TimeRange,
    ) -> Vec<TimeRange> {
        if coverage.is_empty() {
            debug!(%symbol, %granularity, "No cached coverage; whole range is missing");
            return vec![requested];
        }

        let raw = missing_from_coverage(coverage, requested);
        let calendar = self.calendar_for(symbol);
        let bar_ms = granularity.to_milliseconds();
        let min_gap_ms = self.min_gap(granularity).as_millis() as i64;

        // Both thresholds are trading time, the unit `trading_ms` measures in.
        let gaps: Vec<TimeRange> = raw
            .iter()
            .copied()
            .filter(|gap| {
                let trading = calendar.trading_ms(gap);
                let interior = gap.start() > requested.start() && gap.end() < requested.end();
                let threshold = if interior {
                    min_gap_ms
                } else {
                    calendar.bar_trading_ms(gap.start(), bar_ms)
                };
                let keep = trading >= threshold;
                if !keep {
                    debug!(
                        %symbol,
                        %granularity,
                        gap = %gap,
                        trading_ms = trading,
                        interior,
                        "Ignoring expected gap"
                    );
                }
                keep
            })
            .collect();

        debug!(
            %symbol,
            %granularity,
            raw = raw.len(),
            kept = gaps.len(),
            "Gap analysis complete"
        );
        gaps
    }
}

/// Set difference `requested - coverage`, oldest first
pub fn missing_from_coverage(coverage: &[TimeRange], requested: TimeRange) -> Vec<TimeRange> {
    let mut runs = coverage.to_vec();
    runs.sort();

    let mut gaps = Vec::new();
    let mut cursor = requested.start();
    for run in runs {
        if cursor >= requested.end() || run.start() >= requested.end() {
            break;
        }
        if run.end() <= cursor {
            continue;
        }
        if run.start() > cursor {
            gaps.extend(TimeRange::new(cursor, run.start()).ok());
        }
        cursor = cursor.max(run.end());
    }
    if cursor < requested.end() {
        gaps.extend(TimeRange::new(cursor, requested.end()).ok());
    }
    gaps
}

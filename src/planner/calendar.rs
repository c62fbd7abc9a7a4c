//! Trading calendars used to recognise expected gaps

use crate::TimeRange;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc, Weekday};

const DAY_MS: i64 = 86_400_000;

/// When an instrument is expected to produce bars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingCalendar {
    /// Closed from Saturday 00:00 UTC to Monday 00:00 UTC
    Weekdays,
    /// Never closed (crypto and other 24/7 markets)
    Continuous,
}

impl TradingCalendar {
    /// Calendar for a symbol given the configured always-open list
    pub fn for_symbol(symbol: &str, continuous_symbols: &[String]) -> Self {
        if continuous_symbols
            .iter()
            .any(|s| s.eq_ignore_ascii_case(symbol))
        {
            TradingCalendar::Continuous
        } else {
            TradingCalendar::Weekdays
        }
    }

    /// The closed window that starts at or after `from`, or contains it
    fn next_closed_window(&self, from: i64) -> Option<(i64, i64)> {
        match self {
            TradingCalendar::Continuous => None,
            TradingCalendar::Weekdays => {
                let dt = DateTime::<Utc>::from_timestamp_millis(from)?;
                let midnight = dt
                    .date_naive()
                    .and_hms_opt(0, 0, 0)?
                    .and_utc()
                    .timestamp_millis();
                let saturday = match dt.weekday() {
                    Weekday::Sat => midnight,
                    Weekday::Sun => midnight - DAY_MS,
                    other => {
                        let days_ahead = 5 - other.num_days_from_monday() as i64;
                        midnight + ChronoDuration::days(days_ahead).num_milliseconds()
                    }
                };
                Some((saturday, saturday + 2 * DAY_MS))
            }
        }
    }

    /// Milliseconds of `range` during which the market is open
    pub fn trading_ms(&self, range: &TimeRange) -> i64 {
        let mut closed = 0;
        let mut cursor = range.start();
        while let Some((start, end)) = self.next_closed_window(cursor) {
            if start >= range.end() {
                break;
            }
            closed += end.min(range.end()) - start.max(range.start());
            cursor = end;
        }
        range.duration_ms() - closed
    }

    /// First open instant at or after `at`
    pub fn next_open(&self, at: i64) -> i64 {
        match self.next_closed_window(at) {
            Some((start, end)) if start <= at => end,
            _ => at,
        }
    }

    /// Trading time in one bar that opens at the first open instant after `at`
    pub fn bar_trading_ms(&self, at: i64, bar_ms: i64) -> i64 {
        let open = self.next_open(at);
        TimeRange::new(open, open + bar_ms)
            .map(|bar| self.trading_ms(&bar))
            .unwrap_or(bar_ms)
    }

    /// Whether the whole range falls on closed time
    pub fn is_non_trading(&self, range: &TimeRange) -> bool {
        self.trading_ms(range) == 0
    }
}

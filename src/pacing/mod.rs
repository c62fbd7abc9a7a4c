//! Provider-wide request pacing
//!
//! The provider enforces two rules at once: a global ceiling on requests per
//! rolling window, and a minimum gap between consecutive calls of certain
//! categories (historical data in particular). Both are provider-wide, so a
//! single [`PacingGovernor`] is shared by every connection and orchestrator.
//!
//! The check and the reservation happen under one lock, so two callers can
//! never both observe free capacity and both take the last slot.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Default global ceiling per window
pub const DEFAULT_MAX_REQUESTS_PER_WINDOW: usize = 50;

/// Default rolling window length
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Default minimum gap between historical data calls
pub const DEFAULT_HISTORICAL_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// Pacing-relevant category of a provider request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCategory {
    /// Historical bar requests
    Historical,
    /// Earliest-available-timestamp lookups
    HeadTimestamp,
    /// Anything else
    General,
}

impl RequestCategory {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestCategory::Historical => "historical",
            RequestCategory::HeadTimestamp => "head_timestamp",
            RequestCategory::General => "general",
        }
    }
}

/// Limits enforced by a [`PacingGovernor`]
#[derive(Debug, Clone)]
pub struct PacingLimits {
    /// Maximum requests inside any rolling `window`
    pub max_requests_per_window: usize,
    /// Rolling window length
    pub window: Duration,
    /// Minimum spacing between calls of the same category
    pub min_intervals: HashMap<RequestCategory, Duration>,
}

impl Default for PacingLimits {
    fn default() -> Self {
        let mut min_intervals = HashMap::new();
        min_intervals.insert(RequestCategory::Historical, DEFAULT_HISTORICAL_MIN_INTERVAL);
        Self {
            max_requests_per_window: DEFAULT_MAX_REQUESTS_PER_WINDOW,
            window: DEFAULT_WINDOW,
            min_intervals,
        }
    }
}

/// Pacing errors
#[derive(Debug, thiserror::Error)]
pub enum PacingError {
    /// Limits that could never admit a request
    #[error("invalid pacing limits: {0}")]
    InvalidLimits(String),
}

#[derive(Debug, Default)]
struct PacingState {
    recent: VecDeque<Instant>,
    last_call: HashMap<RequestCategory, Instant>,
}

impl PacingState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent.front() {
            if now.duration_since(oldest) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn wait_for(&self, category: RequestCategory, now: Instant, limits: &PacingLimits) -> Duration {
        let global = if self.recent.len() >= limits.max_requests_per_window {
            self.recent
                .front()
                .map(|&oldest| (oldest + limits.window).saturating_duration_since(now))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };

        let category_wait = match (
            limits.min_intervals.get(&category),
            self.last_call.get(&category),
        ) {
            (Some(&interval), Some(&last)) => (last + interval).saturating_duration_since(now),
            _ => Duration::ZERO,
        };

        global.max(category_wait)
    }
}

/// Shared, internally synchronized pacing state
#[derive(Debug)]
pub struct PacingGovernor {
    limits: PacingLimits,
    state: Mutex<PacingState>,
}

impl PacingGovernor {
    /// Create a governor enforcing `limits`
    pub fn new(limits: PacingLimits) -> Result<Self, PacingError> {
        if limits.max_requests_per_window == 0 {
            return Err(PacingError::InvalidLimits(
                "max_requests_per_window must be at least 1".to_string(),
            ));
        }
        if limits.window.is_zero() {
            return Err(PacingError::InvalidLimits(
                "window must be longer than zero".to_string(),
            ));
        }
        Ok(Self {
            limits,
            state: Mutex::new(PacingState::default()),
        })
    }

    /// Limits in force
    pub fn limits(&self) -> &PacingLimits {
        &self.limits
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PacingState> {
        // Poisoning is ignored: every update completes under one lock.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep until a request of `category` is compliant, then reserve its slot.
    ///
    /// # Returns
    /// Total time spent waiting
    pub async fn wait_if_needed(&self, category: RequestCategory) -> Duration {
        let started = Instant::now();

        loop {
            let wait = {
                let mut state = self.lock();
                let now = Instant::now();
                state.prune(now, self.limits.window);
                let wait = state.wait_for(category, now, &self.limits);
                if wait.is_zero() {
                    state.recent.push_back(now);
                    state.last_call.insert(category, now);
                }
                wait
            };

            if wait.is_zero() {
                break;
            }

            debug!(
                category = category.as_str(),
                wait_ms = wait.as_millis() as u64,
                "Pacing wait before provider request"
            );
            sleep(wait).await;
        }

        let waited = started.elapsed();
        crate::metrics::record_pacing_wait(category, waited);
        waited
    }

    /// Non-blocking check. Does not reserve anything.
    ///
    /// # Returns
    /// `(true, 0)` when a request could go now, otherwise `(false, wait)`
    pub fn can_proceed(&self, category: RequestCategory) -> (bool, Duration) {
        let wait = self.headroom(category);
        (wait.is_zero(), wait)
    }

    /// Time until a request of `category` would be allowed
    pub fn headroom(&self, category: RequestCategory) -> Duration {
        let mut state = self.lock();
        let now = Instant::now();
        state.prune(now, self.limits.window);
        state.wait_for(category, now, &self.limits)
    }

    /// Requests counted in the current window
    pub fn in_flight_window(&self) -> usize {
        let mut state = self.lock();
        state.prune(Instant::now(), self.limits.window);
        state.recent.len()
    }
}

//! Retry policy shared by every segment fetch

use crate::classifier::{ErrorClassification, ErrorKind};
use crate::config::{ConfigError, ConfigResult};
use crate::downloader::config::{default_schedule, scheduled_backoff, MAX_ATTEMPTS};
use std::time::Duration;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then try again
    Retry(Duration),
    /// Attempts exhausted
    GiveUp,
    /// The provider has nothing for this request
    Skip,
    /// Stop the whole load
    Abort,
}

/// Attempt bound plus fixed backoff schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            schedule: default_schedule(),
        }
    }
}

impl RetryPolicy {
    /// Policy with a custom bound and schedule
    pub fn new(max_attempts: u32, schedule: Vec<Duration>) -> ConfigResult<Self> {
        if max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if schedule.is_empty() {
            return Err(ConfigError::Invalid(
                "retry schedule must not be empty".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            schedule,
        })
    }

    /// Attempts per segment, first try included
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry `retry` (1-based): the scheduled step, or the
    /// classification's suggested wait when that is longer
    pub fn delay_for(&self, retry: u32, classification: &ErrorClassification) -> Duration {
        scheduled_backoff(&self.schedule, retry).max(classification.suggested_wait)
    }

    /// Decide after attempt number `attempt` (1-based) failed
    pub fn decide(&self, attempt: u32, classification: &ErrorClassification) -> RetryDecision {
        match classification.kind {
            ErrorKind::Fatal => RetryDecision::Abort,
            ErrorKind::DataUnavailable => RetryDecision::Skip,
            ErrorKind::Retryable | ErrorKind::Pacing => {
                if attempt >= self.max_attempts {
                    RetryDecision::GiveUp
                } else {
                    RetryDecision::Retry(self.delay_for(attempt, classification))
                }
            }
        }
    }
}

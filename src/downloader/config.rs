//! Loader default constants

use std::time::Duration;

/// Maximum attempts per segment, first try included
pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff schedule in seconds. Retry `n` waits `RETRY_SCHEDULE_SECS[n - 1]`,
/// capped at the last entry.
pub const RETRY_SCHEDULE_SECS: [u64; 6] = [15, 30, 60, 120, 300, 600];

/// Provider endpoint used when none is configured
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:4002";

/// First client identity tried by the connection pool
pub const BASE_IDENTITY: i32 = 1;

/// Identities tried before giving up on establishing a connection
pub const MAX_IDENTITY_ATTEMPTS: u32 = 10;

/// Upper bound on pooled connections
pub const MAX_CONNECTIONS: usize = 3;

/// A connection with no requests for this long retires itself (180 seconds)
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Limit on queueing plus the provider round-trip for one request (120 seconds)
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Limit on the provider handshake (30 seconds)
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for a stopping connection before its task is aborted
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between creating a connection and health-checking it
pub const HEALTH_CHECK_DELAY: Duration = Duration::from_millis(250);

/// Delay before retry `retry` (1-based) from the fixed schedule
pub fn scheduled_backoff(schedule: &[Duration], retry: u32) -> Duration {
    if schedule.is_empty() {
        return Duration::ZERO;
    }
    let index = (retry.max(1) as usize - 1).min(schedule.len() - 1);
    schedule[index]
}

/// The default schedule as durations
pub fn default_schedule() -> Vec<Duration> {
    RETRY_SCHEDULE_SECS
        .iter()
        .map(|&secs| Duration::from_secs(secs))
        .collect()
}

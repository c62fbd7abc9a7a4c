//! Provider sessions and the connection pool
//!
//! A [`Connection`] owns one provider session on its own tokio task and
//! processes requests strictly one at a time. The [`ConnectionManager`]
//! keeps a bounded pool of them, rotating client identities when the
//! provider reports a conflict.

use crate::classifier::{ErrorClassification, ErrorKind};
use crate::downloader::config::{
    BASE_IDENTITY, DEFAULT_ENDPOINT, HANDSHAKE_TIMEOUT, HEALTH_CHECK_DELAY, IDLE_TIMEOUT,
    MAX_CONNECTIONS, MAX_IDENTITY_ATTEMPTS, REQUEST_TIMEOUT, STOP_TIMEOUT,
};
use crate::pacing::RequestCategory;
use crate::provider::ProviderError;
use crate::{Bar, Granularity, TimeRange};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

pub mod manager;
pub mod worker;

pub use manager::{ConnectionManager, PoolStatus};
pub use worker::Connection;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Accepting requests
    Healthy,
    /// Idle-expired, stopped or hit a fatal error; draining
    Stale,
    /// Session closed
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Healthy,
            2 => ConnectionState::Stale,
            _ => ConnectionState::Closed,
        }
    }

    /// Lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Healthy => "healthy",
            ConnectionState::Stale => "stale",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state shared between the handle and its task
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from -> to` only if currently `from`
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Snapshot of one pooled connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSlot {
    /// Client identity the session was opened with
    pub identity: i32,
    /// Provider endpoint
    pub endpoint: String,
    /// Current state
    pub state: ConnectionState,
    /// Time since the last request finished (or since the handshake)
    pub last_activity_age: Duration,
    /// Idle time after which the connection retires
    pub idle_timeout: Duration,
    /// Requests queued or in flight
    pub pending: usize,
}

/// Scheduling priority of a request on its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RequestPriority {
    /// Background work
    Low,
    /// Regular segment fetches
    #[default]
    Normal,
    /// Served before anything else queued
    High,
}

/// What a request asks the provider for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPayload {
    /// Historical bars for a range
    Historical {
        /// Instrument
        symbol: String,
        /// Bar size
        granularity: Granularity,
        /// Span
        range: TimeRange,
    },
    /// Earliest available timestamp
    HeadTimestamp {
        /// Instrument
        symbol: String,
    },
}

/// One unit of work for a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Pacing category
    pub category: RequestCategory,
    /// What to fetch
    pub payload: RequestPayload,
    /// Attempts left including this one
    pub attempts_remaining: u32,
    /// Queue priority
    pub priority: RequestPriority,
}

impl Request {
    /// Historical bars request
    pub fn historical(symbol: impl Into<String>, granularity: Granularity, range: TimeRange) -> Self {
        Self {
            category: RequestCategory::Historical,
            payload: RequestPayload::Historical {
                symbol: symbol.into(),
                granularity,
                range,
            },
            attempts_remaining: 1,
            priority: RequestPriority::Normal,
        }
    }

    /// Head timestamp request
    pub fn head_timestamp(symbol: impl Into<String>) -> Self {
        Self {
            category: RequestCategory::HeadTimestamp,
            payload: RequestPayload::HeadTimestamp {
                symbol: symbol.into(),
            },
            attempts_remaining: 1,
            priority: RequestPriority::High,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the remaining attempt count
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts_remaining = attempts;
        self
    }
}

/// Successful result of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Bars, oldest first
    Bars(Vec<Bar>),
    /// Earliest timestamp, if the provider knows it
    HeadTimestamp(Option<i64>),
}

/// Failure of a submitted request
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// The provider rejected the request
    #[error("{error}")]
    Provider {
        /// What the provider said
        error: ProviderError,
        /// How it was classified
        classification: ErrorClassification,
    },

    /// Queueing plus the round trip exceeded the request timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection went away before answering
    #[error("connection closed before the request completed")]
    ConnectionClosed,
}

impl RequestError {
    /// Classification that drives retry decisions.
    ///
    /// Timeouts and lost connections are retryable with no extra wait.
    pub fn classification(&self) -> ErrorClassification {
        match self {
            RequestError::Provider { classification, .. } => *classification,
            RequestError::Timeout(_) | RequestError::ConnectionClosed => {
                ErrorClassification::retryable(Duration::ZERO)
            }
        }
    }

    /// Error kind shortcut
    pub fn kind(&self) -> ErrorKind {
        self.classification().kind
    }
}

/// Failure to obtain a usable connection
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// The provider handshake failed
    #[error("handshake with identity {identity} failed: {error}")]
    Handshake {
        /// Identity that was tried
        identity: i32,
        /// Provider error
        error: ProviderError,
    },

    /// The connection was created but failed its health check
    #[error("connection with identity {identity} failed its health check")]
    Unhealthy {
        /// Identity of the discarded connection
        identity: i32,
    },

    /// Every identity tried was already in use
    #[error("no free client identity after {attempts} attempts (last tried {last_identity})")]
    IdentityExhausted {
        /// Attempts made
        attempts: u32,
        /// Last identity tried
        last_identity: i32,
    },

    /// The pool was shut down
    #[error("connection pool is shut down")]
    ShutDown,
}

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Provider endpoint
    pub endpoint: String,
    /// Idle time before self-retirement
    pub idle_timeout: Duration,
    /// Limit on queueing plus round trip
    pub request_timeout: Duration,
    /// Limit on the handshake
    pub handshake_timeout: Duration,
    /// Grace period when stopping
    pub stop_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            idle_timeout: IDLE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
        }
    }
}

/// Pool settings
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Settings applied to each connection
    pub connection: ConnectionSettings,
    /// First identity tried
    pub base_identity: i32,
    /// Handshakes attempted per establishment before giving up
    pub max_identity_attempts: u32,
    /// Pool bound
    pub max_connections: usize,
    /// Wait before health-checking a new connection
    pub health_check_delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            base_identity: BASE_IDENTITY,
            max_identity_attempts: MAX_IDENTITY_ATTEMPTS,
            max_connections: MAX_CONNECTIONS,
            health_check_delay: HEALTH_CHECK_DELAY,
        }
    }
}

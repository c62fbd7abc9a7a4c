//! Loader configuration
//!
//! A single JSON document with one section per subsystem. Every field has a
//! default, so an empty object (or no file at all) is a valid configuration.
//!
//! ```json
//! {
//!   "connection": { "endpoint": "127.0.0.1:4002", "max_connections": 2 },
//!   "pacing": { "historical_min_interval_ms": 10000 },
//!   "planner": { "duration_limits_secs": { "1m": 86400 } },
//!   "calendar": { "continuous_symbols": ["BTCUSD"] },
//!   "classifier": { "table_path": "/etc/loader/error_codes.json" }
//! }
//! ```

use crate::classifier::{ClassifierError, ErrorClassifier};
use crate::connection::{ConnectionSettings, PoolSettings};
use crate::downloader::config::{
    BASE_IDENTITY, DEFAULT_ENDPOINT, HANDSHAKE_TIMEOUT, HEALTH_CHECK_DELAY, IDLE_TIMEOUT,
    MAX_ATTEMPTS, MAX_CONNECTIONS, MAX_IDENTITY_ATTEMPTS, REQUEST_TIMEOUT, RETRY_SCHEDULE_SECS,
    STOP_TIMEOUT,
};
use crate::downloader::RetryPolicy;
use crate::pacing::{
    PacingLimits, RequestCategory, DEFAULT_HISTORICAL_MIN_INTERVAL,
    DEFAULT_MAX_REQUESTS_PER_WINDOW, DEFAULT_WINDOW,
};
use crate::planner::{default_max_history, DurationLimits, GapAnalyzer};
use crate::Granularity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {message}")]
    IoError {
        /// Path that was read
        path: String,
        /// Underlying error
        message: String,
    },

    /// Config JSON did not parse
    #[error("config parse error: {0}")]
    ParseError(String),

    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The error table could not be loaded
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Connection and pool section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Provider endpoint
    pub endpoint: String,
    /// First client identity
    pub base_identity: i32,
    /// Identities tried per establishment
    pub max_identity_attempts: u32,
    /// Pool bound
    pub max_connections: usize,
    /// Idle retirement
    pub idle_timeout_secs: u64,
    /// Queueing plus round trip
    pub request_timeout_secs: u64,
    /// Pause before health-checking a new connection
    pub health_check_delay_ms: u64,
    /// Grace period on stop
    pub stop_timeout_secs: u64,
    /// Handshake limit
    pub handshake_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            base_identity: BASE_IDENTITY,
            max_identity_attempts: MAX_IDENTITY_ATTEMPTS,
            max_connections: MAX_CONNECTIONS,
            idle_timeout_secs: IDLE_TIMEOUT.as_secs(),
            request_timeout_secs: REQUEST_TIMEOUT.as_secs(),
            health_check_delay_ms: HEALTH_CHECK_DELAY.as_millis() as u64,
            stop_timeout_secs: STOP_TIMEOUT.as_secs(),
            handshake_timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
        }
    }
}

/// Pacing section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Global ceiling per window
    pub max_requests_per_window: usize,
    /// Window length
    pub window_ms: u64,
    /// Minimum spacing of historical requests
    pub historical_min_interval_ms: u64,
    /// Minimum spacing of head-timestamp requests (0 disables)
    pub head_timestamp_min_interval_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: DEFAULT_MAX_REQUESTS_PER_WINDOW,
            window_ms: DEFAULT_WINDOW.as_millis() as u64,
            historical_min_interval_ms: DEFAULT_HISTORICAL_MIN_INTERVAL.as_millis() as u64,
            head_timestamp_min_interval_ms: 0,
        }
    }
}

/// Retry section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per segment, first try included
    pub max_attempts: u32,
    /// Backoff schedule
    pub schedule_secs: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            schedule_secs: RETRY_SCHEDULE_SECS.to_vec(),
        }
    }
}

/// Planner section; maps are keyed by granularity (`"1m"`, `"1d"`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Request-duration limit overrides
    pub duration_limits_secs: HashMap<Granularity, u64>,
    /// Interior minimum-gap overrides
    pub min_gap_secs: HashMap<Granularity, u64>,
    /// How far back `full` loads reach
    pub max_history_secs: HashMap<Granularity, u64>,
}

/// Calendar section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Symbols that trade around the clock
    pub continuous_symbols: Vec<String>,
}

/// Classifier section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Replacement error table; the embedded one is used when absent
    pub table_path: Option<PathBuf>,
}

/// Store section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Cache directory
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
        }
    }
}

/// Complete loader configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Connections and pool
    pub connection: ConnectionConfig,
    /// Pacing limits
    pub pacing: PacingConfig,
    /// Retry policy
    pub retry: RetryConfig,
    /// Planner tables
    pub planner: PlannerConfig,
    /// Trading calendar
    pub calendar: CalendarConfig,
    /// Error table
    pub classifier: ClassifierConfig,
    /// Cache location
    pub store: StoreConfig,
}

impl LoaderConfig {
    /// Read and validate a JSON config file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = Self::from_json(&json)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the loader cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        let c = &self.connection;
        if c.endpoint.trim().is_empty() {
            return Err(invalid("connection.endpoint must not be empty"));
        }
        if c.max_identity_attempts == 0 {
            return Err(invalid("connection.max_identity_attempts must be at least 1"));
        }
        if c.max_connections == 0 {
            return Err(invalid("connection.max_connections must be at least 1"));
        }
        if c.idle_timeout_secs == 0 || c.request_timeout_secs == 0 || c.handshake_timeout_secs == 0
        {
            return Err(invalid("connection timeouts must be greater than zero"));
        }
        if c.base_identity.checked_add(c.max_identity_attempts as i32).is_none() {
            return Err(invalid("connection.base_identity is too large"));
        }

        if self.pacing.max_requests_per_window == 0 {
            return Err(invalid("pacing.max_requests_per_window must be at least 1"));
        }
        if self.pacing.window_ms == 0 {
            return Err(invalid("pacing.window_ms must be greater than zero"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.schedule_secs.is_empty() {
            return Err(invalid("retry.schedule_secs must not be empty"));
        }

        for (section, map) in [
            ("planner.duration_limits_secs", &self.planner.duration_limits_secs),
            ("planner.min_gap_secs", &self.planner.min_gap_secs),
            ("planner.max_history_secs", &self.planner.max_history_secs),
        ] {
            if let Some((granularity, _)) = map.iter().find(|(_, secs)| **secs == 0) {
                return Err(invalid(&format!(
                    "{section} for {granularity} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Pool and per-connection settings
    pub fn pool_settings(&self) -> PoolSettings {
        let c = &self.connection;
        PoolSettings {
            connection: ConnectionSettings {
                endpoint: c.endpoint.clone(),
                idle_timeout: Duration::from_secs(c.idle_timeout_secs),
                request_timeout: self.request_timeout(),
                handshake_timeout: Duration::from_secs(c.handshake_timeout_secs),
                stop_timeout: Duration::from_secs(c.stop_timeout_secs),
            },
            base_identity: c.base_identity,
            max_identity_attempts: c.max_identity_attempts,
            max_connections: c.max_connections,
            health_check_delay: Duration::from_millis(c.health_check_delay_ms),
        }
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.request_timeout_secs)
    }

    /// Pacing limits
    pub fn pacing_limits(&self) -> PacingLimits {
        let mut min_intervals = HashMap::new();
        for (category, millis) in [
            (RequestCategory::Historical, self.pacing.historical_min_interval_ms),
            (RequestCategory::HeadTimestamp, self.pacing.head_timestamp_min_interval_ms),
        ] {
            if millis > 0 {
                min_intervals.insert(category, Duration::from_millis(millis));
            }
        }
        PacingLimits {
            max_requests_per_window: self.pacing.max_requests_per_window,
            window: Duration::from_millis(self.pacing.window_ms),
            min_intervals,
        }
    }

    /// Retry policy
    pub fn retry_policy(&self) -> ConfigResult<RetryPolicy> {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry
                .schedule_secs
                .iter()
                .map(|&secs| Duration::from_secs(secs))
                .collect(),
        )
    }

    /// Request-duration limits
    pub fn duration_limits(&self) -> ConfigResult<DurationLimits> {
        DurationLimits::with_overrides(&secs_map(&self.planner.duration_limits_secs))
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Gap analyzer with thresholds and calendar applied
    pub fn gap_analyzer(&self) -> ConfigResult<GapAnalyzer> {
        Ok(GapAnalyzer::new()
            .with_min_gaps(secs_map(&self.planner.min_gap_secs))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .with_continuous_symbols(self.calendar.continuous_symbols.clone()))
    }

    /// History depth for `full` loads, one entry per granularity
    pub fn max_history(&self) -> HashMap<Granularity, Duration> {
        Granularity::ALL
            .iter()
            .map(|&g| {
                let depth = self
                    .planner
                    .max_history_secs
                    .get(&g)
                    .map(|&secs| Duration::from_secs(secs))
                    .unwrap_or_else(|| default_max_history(g));
                (g, depth)
            })
            .collect()
    }

    /// The configured error table, or the embedded one
    pub fn load_classifier(&self) -> ConfigResult<ErrorClassifier> {
        let classifier = match &self.classifier.table_path {
            Some(path) => ErrorClassifier::from_file(path)?,
            None => ErrorClassifier::embedded()?,
        };
        Ok(classifier)
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

fn secs_map(map: &HashMap<Granularity, u64>) -> HashMap<Granularity, Duration> {
    map.iter()
        .map(|(&g, &secs)| (g, Duration::from_secs(secs)))
        .collect()
}

//! CLI error types and conversions

use crate::classifier::ClassifierError;
use crate::config::ConfigError;
use crate::downloader::LoadFailure;
use crate::store::StoreError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Error table error
    #[error("error table error: {0}")]
    ClassifierError(#[from] ClassifierError),

    /// Load error
    #[error("load error: {0}")]
    LoadError(#[from] LoadFailure),

    /// Store error
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    /// Metrics exporter could not start
    #[error("metrics error: {0}")]
    MetricsError(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type for CLI commands
pub type CliResult<T> = Result<T, CliError>;

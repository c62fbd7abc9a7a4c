//! Validation subcommand

use super::CliResult;
use crate::classifier::ErrorClassifier;
use crate::config::LoaderConfig;
use clap::Parser;
use std::path::{Path, PathBuf};

/// Validate command for configuration files and error tables
#[derive(Parser, Debug)]
pub struct ValidateCommand {
    /// What to validate
    #[command(subcommand)]
    pub target: ValidateTarget,
}

/// Target type for validation
#[derive(clap::Subcommand, Debug)]
pub enum ValidateTarget {
    /// Validate a loader configuration file
    Config {
        /// Configuration file (JSON)
        path: PathBuf,
    },
    /// Validate an error classification table
    ErrorTable {
        /// Error table file (JSON)
        path: PathBuf,
    },
}

impl ValidateCommand {
    /// Execute the validation command
    pub async fn execute(&self) -> CliResult<()> {
        match &self.target {
            ValidateTarget::Config { path } => validate_config(path),
            ValidateTarget::ErrorTable { path } => validate_error_table(path),
        }
    }
}

fn validate_config(path: &Path) -> CliResult<()> {
    let config = LoaderConfig::from_file(path)?;
    config.validate()?;
    let classifier = config.load_classifier()?;

    println!("Valid configuration: {}", path.display());
    println!("  Endpoint: {}", config.connection.endpoint);
    println!("  Max connections: {}", config.connection.max_connections);
    println!(
        "  Pacing: {} requests per {}ms",
        config.pacing.max_requests_per_window, config.pacing.window_ms
    );
    println!("  Retry attempts: {}", config.retry.max_attempts);
    println!("  Cache: {}", config.store.root.display());
    println!(
        "  Error table: {} (schema {})",
        config
            .classifier
            .table_path
            .as_ref()
            .map_or_else(|| "embedded".to_string(), |p| p.display().to_string()),
        classifier.schema_version()
    );
    Ok(())
}

fn validate_error_table(path: &Path) -> CliResult<()> {
    let classifier = ErrorClassifier::from_file(path)?;
    println!("Valid error table: {}", path.display());
    println!("  Schema version: {}", classifier.schema_version());
    println!("  Mapped codes: {}", classifier.code_count());
    Ok(())
}

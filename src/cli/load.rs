//! Load command and the top-level CLI definition

use crate::cancel::CancelHandle;
use crate::config::LoaderConfig;
use crate::downloader::{FetchOrchestrator, LoadFailure, LoadMode, LoadOutcome, LoadRequest};
use crate::provider::ReplayProvider;
use crate::store::CsvStore;
use crate::{format_timestamp, Granularity, TimeRange};
use chrono::{DateTime, Days, NaiveDate};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use super::{CliError, CliResult};

/// Market Data Loader CLI
#[derive(Parser, Debug)]
#[command(name = "market-data-loader")]
#[command(about = "Gap-aware historical market data loader", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Loader configuration file (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Cache directory, overriding `store.root` from the configuration
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Configuration from `--config` with `--cache-dir` applied
    pub fn load_config(&self) -> CliResult<LoaderConfig> {
        let mut config = match &self.config {
            Some(path) => LoaderConfig::from_file(path)?,
            None => LoaderConfig::default(),
        };
        if let Some(dir) = &self.cache_dir {
            config.store.root = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fill the cache from a replay source
    Load(LoadArgs),

    /// Show missing ranges and planned segments without fetching
    Gaps(super::GapsArgs),

    /// Validate a configuration file or error table
    Validate(super::ValidateCommand),
}

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Arguments for the load command
#[derive(Parser, Debug)]
pub struct LoadArgs {
    /// Instrument symbol (e.g., AAPL)
    #[arg(long)]
    pub symbol: String,

    /// Bar size (1m, 5m, 15m, 30m, 1h, 4h, 1d, 1w)
    #[arg(long)]
    pub granularity: Granularity,

    /// How the target range is derived: tail, backfill or full
    #[arg(long, default_value = "tail")]
    pub mode: LoadMode,

    /// Explicit range start (YYYY-MM-DD or RFC3339); overrides the mode
    #[arg(long, requires = "end")]
    pub start: Option<String>,

    /// Explicit range end (YYYY-MM-DD or RFC3339, exclusive)
    #[arg(long, requires = "start")]
    pub end: Option<String>,

    /// Directory of CSV series served by the replay provider
    #[arg(long)]
    pub source_dir: PathBuf,

    /// Client identity the replay source reports as already in use (repeatable)
    #[arg(long = "busy-identity")]
    pub busy_identities: Vec<i32>,
}

impl LoadArgs {
    /// Run the load and print its diagnostics
    pub async fn execute(&self, cli: &Cli, cancel: &CancelHandle) -> CliResult<()> {
        let config = cli.load_config()?;

        let mut request = LoadRequest::new(self.symbol.clone(), self.granularity, self.mode);
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            request = request.with_range(parse_range(start, end)?);
        }

        let provider = Arc::new(
            ReplayProvider::new(&self.source_dir)
                .with_busy_identities(self.busy_identities.iter().copied()),
        );
        let store = Arc::new(CsvStore::new(&config.store.root));
        let orchestrator = FetchOrchestrator::from_config(&config, provider, store)?;

        info!(
            symbol = %self.symbol,
            granularity = %self.granularity,
            mode = %self.mode,
            cache = %config.store.root.display(),
            "Starting load"
        );
        let result = orchestrator.load_with_cancel(request, cancel).await;
        orchestrator.manager().shutdown().await;

        match cli.output_format {
            OutputFormat::Json => output_json(self, &result),
            OutputFormat::Human => output_human(self, &result),
        }

        result.map(|_| ()).map_err(CliError::from)
    }
}

fn output_json(args: &LoadArgs, result: &Result<LoadOutcome, LoadFailure>) {
    let output = match result {
        Ok(outcome) => serde_json::json!({
            "success": true,
            "symbol": args.symbol,
            "granularity": args.granularity.to_string(),
            "mode": args.mode,
            "target": outcome.target,
            "rows": outcome.rows.len(),
            "diagnostics": outcome.diagnostics,
            "error": null,
        }),
        Err(failure) => serde_json::json!({
            "success": false,
            "symbol": args.symbol,
            "granularity": args.granularity.to_string(),
            "mode": args.mode,
            "phase": failure.error.phase(),
            "target": failure.partial.as_ref().and_then(|p| p.target),
            "rows": failure.partial.as_ref().map_or(0, |p| p.rows.len()),
            "diagnostics": failure.partial.as_ref().map(|p| &p.diagnostics),
            "error": failure.to_string(),
        }),
    };
    println!("{output}");
}

fn output_human(args: &LoadArgs, result: &Result<LoadOutcome, LoadFailure>) {
    let (outcome, failure) = match result {
        Ok(outcome) => (Some(outcome), None),
        Err(failure) => (failure.partial.as_ref(), Some(failure)),
    };

    match failure {
        None => println!("\nLoad completed: {} {} ({})", args.symbol, args.granularity, args.mode),
        Some(failure) => {
            eprintln!("\nLoad failed during {}: {}", failure.error.phase(), failure.error);
        }
    }

    let Some(outcome) = outcome else {
        return;
    };
    let diagnostics = &outcome.diagnostics;
    match outcome.target {
        Some(target) => println!("Target: {target}"),
        None => println!("Cache already current"),
    }
    println!("Rows in range: {}", outcome.rows.len());
    if let (Some(first), Some(last)) = (outcome.rows.first(), outcome.rows.last()) {
        println!(
            "Span: {} .. {}",
            format_timestamp(first.timestamp),
            format_timestamp(last.timestamp)
        );
    }
    println!(
        "Segments fetched: {}/{}",
        diagnostics.segments_fetched, diagnostics.segments_planned
    );
    println!("Provider calls: {}", diagnostics.provider_calls_made);
    if diagnostics.retries > 0 {
        println!("Retries: {}", diagnostics.retries);
    }
    for skipped in &diagnostics.skipped_segments {
        println!(
            "Skipped {} [{}] after {} attempt(s): {}",
            skipped.range, skipped.kind, skipped.attempts, skipped.reason
        );
    }
    if diagnostics.cancelled {
        println!("Cancelled: merged segments were kept");
    }
}

/// Try to parse an RFC3339 datetime; a missing offset means UTC
fn try_parse_datetime_rfc3339(input: &str) -> Option<i64> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.timestamp_millis());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&format!("{input}Z")) {
        return Some(dt.timestamp_millis());
    }

    None
}

fn parse_date(input: &str, label: &str) -> CliResult<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|e| CliError::InvalidArgument(format!("Invalid {label} time '{input}': {e}")))
}

fn midnight_millis(date: NaiveDate, label: &str) -> CliResult<i64> {
    let datetime = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| CliError::InvalidArgument(format!("Invalid {label} time")))?;
    Ok(datetime.and_utc().timestamp_millis())
}

/// Parse a start time; a bare date means 00:00 UTC of that day
pub fn parse_start_time(input: &str) -> CliResult<i64> {
    if let Some(ts) = try_parse_datetime_rfc3339(input) {
        return Ok(ts);
    }
    midnight_millis(parse_date(input, "start")?, "start")
}

/// Parse an exclusive end time; a bare date means the following midnight,
/// so the named day is fully included
pub fn parse_end_time(input: &str) -> CliResult<i64> {
    if let Some(ts) = try_parse_datetime_rfc3339(input) {
        return Ok(ts);
    }
    let next = parse_date(input, "end")?
        .checked_add_days(Days::new(1))
        .ok_or_else(|| CliError::InvalidArgument("Invalid end time".to_string()))?;
    midnight_millis(next, "end")
}

/// Parse a half-open range from CLI start and end arguments
pub fn parse_range(start: &str, end: &str) -> CliResult<TimeRange> {
    let start = parse_start_time(start)?;
    let end = parse_end_time(end)?;
    TimeRange::new(start, end).map_err(|e| CliError::InvalidArgument(e.to_string()))
}

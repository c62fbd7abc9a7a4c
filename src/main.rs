//! Main entry point for the market-data-loader CLI

use clap::Parser;
use market_data_loader::cancel::CancelHandle;
use market_data_loader::cli::{Cli, CliError, Commands};
use market_data_loader::metrics::init_metrics;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting.
/// Logs go to stderr; stdout carries command output only.
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("market_data_loader=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run(cli: &Cli, cancel: &CancelHandle) -> anyhow::Result<()> {
    if let Some(addr) = cli.metrics_addr {
        let bound = init_metrics(addr).map_err(CliError::MetricsError)?;
        info!(%bound, "Prometheus exporter listening");
    }

    match &cli.command {
        Commands::Load(args) => args.execute(cli, cancel).await?,
        Commands::Gaps(args) => args.execute(cli).await?,
        Commands::Validate(cmd) => cmd.execute().await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    let cancel = CancelHandle::new();
    cancel.cancel_on_ctrl_c();

    if let Err(e) = run(&cli, &cancel).await {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }
}

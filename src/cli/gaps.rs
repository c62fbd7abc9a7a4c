//! Gaps subcommand: a dry run of gap analysis and segment planning

use super::load::{parse_range, Cli, OutputFormat};
use super::CliResult;
use crate::planner::{PlanDirection, Segment, SegmentPlanner};
use crate::store::CsvStore;
use crate::{Granularity, TimeRange};
use clap::Parser;

/// Arguments for the gaps command
#[derive(Parser, Debug)]
pub struct GapsArgs {
    /// Instrument symbol
    #[arg(long)]
    pub symbol: String,

    /// Bar size
    #[arg(long)]
    pub granularity: Granularity,

    /// Range start (YYYY-MM-DD or RFC3339)
    #[arg(long)]
    pub start: String,

    /// Range end (YYYY-MM-DD or RFC3339, exclusive)
    #[arg(long)]
    pub end: String,
}

impl GapsArgs {
    /// Print the missing ranges and the segments a load would request
    pub async fn execute(&self, cli: &Cli) -> CliResult<()> {
        let config = cli.load_config()?;
        let requested = parse_range(&self.start, &self.end)?;

        let store = CsvStore::new(&config.store.root);
        let analyzer = config.gap_analyzer()?;
        let planner = SegmentPlanner::new(config.duration_limits()?);

        let missing = analyzer
            .find_missing_ranges(&store, &self.symbol, self.granularity, requested)
            .await?;
        let segments = planner.plan_all(&missing, self.granularity, PlanDirection::OldestFirst);

        match cli.output_format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "symbol": self.symbol,
                    "granularity": self.granularity.to_string(),
                    "requested": requested,
                    "missing": missing,
                    "segments": segments,
                });
                println!("{output}");
            }
            OutputFormat::Human => self.output_human(requested, &missing, &segments),
        }
        Ok(())
    }

    fn output_human(&self, requested: TimeRange, missing: &[TimeRange], segments: &[Segment]) {
        println!("{} {} over {}", self.symbol, self.granularity, requested);
        if missing.is_empty() {
            println!("Nothing missing");
            return;
        }
        println!("Missing ranges: {}", missing.len());
        for range in missing {
            println!("  {range}");
        }
        println!("Planned segments: {}", segments.len());
        for segment in segments {
            println!("  {}", segment.range);
        }
    }
}

//! Backfill command.
//!
//! Enqueues one range with operator priority and drives both backfill paths
//! until nothing claimable is left.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use marketfeed_collector::{stop_channel, Orchestrator};
use marketfeed_core::{AppConfig, Dataset, GapDescriptor, Interval};

/// Descriptors from this command outrank scanner and stream gaps.
const OPERATOR_PRIORITY: i32 = 100;

/// Arguments for the backfill command.
#[derive(Args, Debug, Clone)]
pub struct BackfillArgs {
    /// Symbol to backfill (e.g., "BTCUSDT")
    #[arg(long)]
    pub symbol: String,

    /// Bar interval (1m, 5m, 1h, ...)
    #[arg(long)]
    pub interval: String,

    /// First open time in ISO 8601 format (e.g., "2026-01-01T00:00:00Z")
    #[arg(long)]
    pub start: String,

    /// Last open time in ISO 8601 format (e.g., "2026-02-01T00:00:00Z")
    #[arg(long)]
    pub end: String,

    /// Dataset to backfill: candle or metric
    #[arg(long, default_value = "candle")]
    pub dataset: String,
}

impl BackfillArgs {
    /// Parses the arguments into a grid-aligned descriptor.
    fn descriptor(&self) -> Result<GapDescriptor> {
        let interval: Interval = self.interval.parse()?;
        let dataset: Dataset = self.dataset.parse()?;
        let start: DateTime<Utc> = self
            .start
            .parse()
            .context("Invalid start time. Use ISO 8601 format (e.g., 2026-01-01T00:00:00Z)")?;
        let end: DateTime<Utc> = self
            .end
            .parse()
            .context("Invalid end time. Use ISO 8601 format (e.g., 2026-02-01T00:00:00Z)")?;

        if start >= end {
            bail!("Start time must be before end time");
        }
        if !interval.is_fixed_step() {
            bail!("Interval {interval} has no fixed step and cannot be backfilled");
        }

        Ok(GapDescriptor::new(
            &self.symbol,
            interval,
            dataset,
            interval.align_down(start),
            interval.align_down(end),
        )
        .with_priority(OPERATOR_PRIORITY))
    }
}

/// Runs the backfill command.
///
/// # Errors
/// Returns an error for invalid arguments, an invalid configuration, or a
/// store failure.
pub async fn run_backfill(config: AppConfig, args: BackfillArgs) -> Result<()> {
    let gap = args.descriptor()?;
    tracing::info!(
        symbol = %gap.symbol,
        interval = %gap.interval,
        dataset = %gap.dataset,
        start = %gap.start_time,
        end = %gap.end_time,
        bars = gap.bars(),
        "Starting backfill"
    );

    let orchestrator = Orchestrator::connect(config).await?;
    let (stop_tx, stop) = stop_channel();
    super::stop_on_ctrl_c(stop_tx);

    let stats = orchestrator.backfill(gap, stop).await?;
    println!("{}", stats.summary());
    Ok(())
}

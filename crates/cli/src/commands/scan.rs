//! One-shot gap scan.

use anyhow::Result;
use clap::Args;
use marketfeed_collector::Orchestrator;
use marketfeed_core::AppConfig;

/// Arguments for the scan command.
#[derive(Args, Debug, Clone)]
pub struct ScanArgs {
    /// Window to scan, in minutes (defaults to the full backfill window)
    #[arg(long)]
    pub lookback_minutes: Option<i64>,
}

/// Runs the scan command.
///
/// # Errors
/// Returns an error for an invalid configuration or a store failure.
pub async fn run_scan(config: AppConfig, args: ScanArgs) -> Result<()> {
    let orchestrator = Orchestrator::connect(config).await?;
    let report = orchestrator.scan_once(args.lookback_minutes).await?;

    println!(
        "Scanned {} series: {} missing runs, {} enqueued, {} suppressed",
        report.series_scanned,
        report.runs_found,
        report.enqueued.len(),
        report.suppressed
    );
    for gap in &report.enqueued {
        println!(
            "  #{:<6} {:<12} {:<4} {:<7} {} .. {} ({} bars)",
            gap.id,
            gap.symbol,
            gap.interval,
            gap.dataset,
            gap.start_time.format("%Y-%m-%d %H:%M"),
            gap.end_time.format("%Y-%m-%d %H:%M"),
            gap.bars()
        );
    }
    Ok(())
}

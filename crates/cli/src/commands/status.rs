//! Status command.
//!
//! Prints the shared ban state, open gap descriptors, and the stored range of
//! every configured series.

use anyhow::Result;
use chrono::{DateTime, Utc};
use marketfeed_collector::Orchestrator;
use marketfeed_core::AppConfig;

fn format_date(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Runs the status command.
///
/// # Errors
/// Returns an error for an invalid configuration or a store failure.
pub async fn run_status(config: AppConfig) -> Result<()> {
    let orchestrator = Orchestrator::connect(config).await?;
    let status = orchestrator.status().await?;
    let now = Utc::now();

    println!("\n=== Ban state ({}) ===", orchestrator.guard().scope());
    match &status.ban {
        Some(ban) if ban.is_active(now) => println!(
            "BANNED until {} ({}s left, streak {}): {}",
            format_date(ban.banned_until),
            (ban.banned_until - now).num_seconds(),
            ban.ban_count,
            ban.reason
        ),
        Some(ban) => println!("Clear (last ban ended {})", format_date(ban.banned_until)),
        None => println!("Clear"),
    }

    println!("\n=== Open gaps ({}) ===", status.outstanding.len());
    for gap in &status.outstanding {
        let claim = gap.claimed_by.as_deref().unwrap_or("-");
        println!(
            "  #{:<6} {:<12} {:<4} {:<7} {} .. {} bars={} attempts={} route={} claim={}",
            gap.id,
            gap.symbol,
            gap.interval,
            gap.dataset,
            format_date(gap.start_time),
            format_date(gap.end_time),
            gap.bars(),
            gap.attempts,
            gap.route.as_str(),
            claim
        );
        if let Some(err) = &gap.last_error {
            println!("          last error: {err}");
        }
    }

    println!("\n=== Stored candles ===");
    for (symbol, interval, bounds) in &status.bounds {
        match bounds {
            Some((first, last)) => println!(
                "  {symbol:<12} {interval:<4} {} .. {} ({} bars span)",
                format_date(*first),
                format_date(*last),
                interval.bars_between(*first, *last)
            ),
            None => println!("  {symbol:<12} {interval:<4} no data"),
        }
    }
    println!();
    Ok(())
}

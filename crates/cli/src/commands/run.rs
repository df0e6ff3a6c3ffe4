//! Supervised pipeline run.
//!
//! The orchestrator is restarted with exponential backoff after a failure,
//! unless the failure is a configuration error or the restart budget is spent.

use anyhow::Result;
use marketfeed_collector::types::{stop_requested, wait_for_stop};
use marketfeed_collector::{stop_channel, Orchestrator};
use marketfeed_core::AppConfig;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

const INITIAL_RESTART_DELAY: Duration = Duration::from_secs(5);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);
const MAX_RESTARTS: u32 = 10;

/// A run lasting this long resets the restart delay.
const STABLE_RUN: Duration = Duration::from_secs(600);

/// Runs the pipeline until Ctrl-C.
///
/// # Errors
/// Returns a configuration error immediately, or the last failure once the
/// restart budget is exhausted.
pub async fn run_pipeline(config: AppConfig) -> Result<()> {
    let (stop_tx, mut stop) = stop_channel();
    super::stop_on_ctrl_c(stop_tx);

    let mut restarts = 0u32;
    let mut delay = INITIAL_RESTART_DELAY;

    loop {
        let started = Instant::now();
        let result = match Orchestrator::connect(config.clone()).await {
            Ok(orchestrator) => orchestrator.run(stop.clone()).await,
            Err(e) => Err(e),
        };

        let e = match result {
            Ok(()) => return Ok(()),
            Err(e) if stop_requested(&stop) => {
                warn!(error = format!("{e:#}"), "Pipeline failed during shutdown");
                return Ok(());
            }
            Err(e) if super::is_fatal(&e) => return Err(e),
            Err(e) => e,
        };

        if started.elapsed() >= STABLE_RUN {
            restarts = 0;
            delay = INITIAL_RESTART_DELAY;
        }
        restarts += 1;
        if restarts > MAX_RESTARTS {
            error!(restarts = MAX_RESTARTS, "Restart budget exhausted");
            return Err(e.context(format!("Pipeline failed after {MAX_RESTARTS} restarts")));
        }

        warn!(
            error = format!("{e:#}"),
            restart = restarts,
            delay_secs = delay.as_secs(),
            "Pipeline failed, restarting"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = wait_for_stop(&mut stop) => {
                info!("Shutdown requested while waiting to restart");
                return Ok(());
            }
        }
        delay = (delay * 2).min(MAX_RESTART_DELAY);
    }
}

//! CLI commands for the ingestion pipeline.

pub mod backfill;
pub mod migrate;
pub mod run;
pub mod scan;
pub mod status;

use marketfeed_core::IngestError;

pub use backfill::{run_backfill, BackfillArgs};
pub use migrate::run_migrate;
pub use run::run_pipeline;
pub use scan::{run_scan, ScanArgs};
pub use status::run_status;

/// Returns true if any error in the chain is a configuration error.
pub fn is_fatal(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| cause.downcast_ref::<IngestError>().map_or(false, IngestError::is_fatal))
}

/// Stops the given channel on the first Ctrl-C.
pub fn stop_on_ctrl_c(stop_tx: tokio::sync::watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down gracefully");
            let _ = stop_tx.send(true);
        }
    });
}

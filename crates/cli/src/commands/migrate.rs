use anyhow::{Context, Result};
use marketfeed_core::{AppConfig, IngestError};
use marketfeed_data::DatabaseClient;

/// Applies pending schema migrations.
///
/// # Errors
/// Returns `FatalConfig` for an empty database URL, or an error if the
/// database cannot be reached or migrated.
pub async fn run_migrate(config: AppConfig) -> Result<()> {
    if config.database.url.trim().is_empty() {
        return Err(IngestError::fatal_config("database.url is empty").into());
    }

    let db = DatabaseClient::new(&config.database.url, 1)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;

    tracing::info!("Schema is up to date");
    Ok(())
}

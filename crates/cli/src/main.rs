use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use marketfeed_core::{AppConfig, ConfigLoader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod commands;

use commands::{BackfillArgs, ScanArgs};

#[derive(Parser)]
#[command(name = "marketfeed")]
#[command(about = "Gap-free OHLCV and derived-metrics ingestion for Binance futures", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true, default_value = "config/Config.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Optional log file path (logs to file instead of stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline until Ctrl-C
    Run,
    /// Backfill one range through the archive and REST paths
    Backfill(BackfillArgs),
    /// Run one gap scan and print the descriptors it emitted
    Scan(ScanArgs),
    /// Show ban state, open gaps, and data bounds
    Status,
    /// Create or upgrade the database schema
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_format, cli.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::from(1);
    }

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Command failed");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run => commands::run_pipeline(config).await,
        Commands::Backfill(args) => commands::run_backfill(config, args).await,
        Commands::Scan(args) => commands::run_scan(config, args).await,
        Commands::Status => commands::run_status(config).await,
        Commands::Migrate => commands::run_migrate(config).await,
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = ConfigLoader::load_from(path)?;
    tracing::debug!(path = %path.display(), symbols = ?config.universe.symbols, "Configuration loaded");
    Ok(config)
}

fn init_logging(format: LogFormat, log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (format, log_file) {
        (LogFormat::Text, None) => builder.init(),
        (LogFormat::Json, None) => builder.json().init(),
        (format, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let builder = builder.with_ansi(false).with_writer(std::sync::Mutex::new(file));
            match format {
                LogFormat::Text => builder.init(),
                LogFormat::Json => builder.json().init(),
            }
        }
    }
    Ok(())
}

/// Configuration problems exit with 2, everything else with 1.
fn exit_code(e: &anyhow::Error) -> u8 {
    if commands::is_fatal(e) {
        2
    } else {
        1
    }
}

//! marketing-alerts - daily anomaly alerts for marketing metrics
//!
//! Runs once per day (typically from a scheduler), evaluates yesterday's
//! metrics for every entity in the warehouse export and posts one Teams
//! card per anomaly.

use std::path::PathBuf;

use alerts_job::{run_job, JobConfig, JobOptions};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const JOB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Daily anomaly alerts for marketing performance metrics
#[derive(Parser)]
#[command(name = "marketing-alerts")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "ALERTS_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Warehouse CSV export (overrides input_path)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Date to evaluate, YYYY-MM-DD (defaults to yesterday in the configured timezone)
    #[arg(long)]
    target_date: Option<NaiveDate>,

    /// Log alerts instead of posting them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = JobConfig::load(cli.config.as_deref()).context("Invalid configuration")?;
    if let Some(input) = cli.input {
        config.input_path = Some(input);
    }

    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(fmt::layer().json())
        .init();

    info!(version = JOB_VERSION, "Starting marketing-alerts");

    let options = JobOptions {
        target_date: cli.target_date,
        dry_run: cli.dry_run,
    };
    let report = run_job(&config, &options).await?;

    info!(
        target_date = %report.target_date,
        alerts = report.summary.alerts_total,
        delivered = report.delivery.delivered,
        failed = report.delivery.failed,
        "Job finished"
    );
    Ok(())
}

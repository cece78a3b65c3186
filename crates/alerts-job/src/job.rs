//! One end-to-end alert run

use std::sync::Arc;
use std::time::{Duration, Instant};

use alerts_lib::sink::is_placeholder_url;
use alerts_lib::{
    dispatch_alerts, target_date_in, AlertSink, CsvMetricSource, LogSink, RunMetrics,
    RunOrchestrator, RunReport, StructuredLogger, TeamsWebhookSink,
};
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::config::JobConfig;

pub const JOB_NAME: &str = "marketing-alerts";

/// Per-invocation switches that are not part of the configuration
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Evaluate this date instead of yesterday
    pub target_date: Option<NaiveDate>,
    /// Log alerts instead of posting them
    pub dry_run: bool,
}

/// Load the export, detect, deliver and persist the report and metrics
pub async fn run_job(config: &JobConfig, options: &JobOptions) -> Result<RunReport> {
    let started = Instant::now();
    let target = match options.target_date {
        Some(date) => date,
        None => target_date_in(config.timezone()?, Utc::now()),
    };

    let input = config
        .input_path
        .as_deref()
        .context("No metric export configured (set input_path or pass --input)")?;
    let source = CsvMetricSource::load(input, &config.metric_set)
        .with_context(|| format!("Failed to load metric export {}", input.display()))?;

    let logger = StructuredLogger::new(JOB_NAME);
    let metrics = RunMetrics::new().context("Failed to register run metrics")?;

    let outcome = RunOrchestrator::new(config.detection(), config.historical_window)
        .with_logger(logger.clone())
        .with_metrics(metrics.clone())
        .run(&source, target)
        .await?;

    let sink = build_sink(config, options.dry_run)?;
    let delivery = dispatch_alerts(
        Arc::clone(&sink),
        &outcome.alerts,
        config.delivery_concurrency,
        &logger,
    )
    .await;
    metrics.record_deliveries(&delivery);
    logger.log_run_completed(&outcome.summary, &delivery, started.elapsed().as_millis());

    let report = RunReport::new(outcome, delivery, Utc::now());
    if let Some(path) = &config.report_path {
        report.write_json(path)?;
        info!(path = %path.display(), "Run report written");
    }
    if let Some(path) = &config.metrics_path {
        metrics.export_textfile(path)?;
    }

    Ok(report)
}

/// Pick the alert sink for this run
///
/// Dry runs, a missing webhook and the sample placeholder URL all fall back
/// to logging.
pub fn build_sink(config: &JobConfig, dry_run: bool) -> Result<Arc<dyn AlertSink>> {
    if dry_run {
        info!("Dry run, alerts will only be logged");
        return Ok(Arc::new(LogSink));
    }

    match config.usable_webhook() {
        Some(url) => {
            let sink = TeamsWebhookSink::new(
                url,
                config.dashboard_url.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )
            .context("Invalid webhook configuration")?;
            Ok(Arc::new(sink))
        }
        None => {
            if config.webhook_url.as_deref().is_some_and(is_placeholder_url) {
                warn!("Webhook URL is still the sample placeholder, alerts will only be logged");
            } else {
                info!("No webhook configured, alerts will only be logged");
            }
            Ok(Arc::new(LogSink))
        }
    }
}

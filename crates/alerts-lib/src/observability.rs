//! Observability for alert runs
//!
//! Provides:
//! - Prometheus metrics on a per-run registry, exported in text format
//! - Structured JSON logging with tracing

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, Histogram, IntCounter, IntCounterVec, Registry,
    TextEncoder,
};
use tracing::{info, warn};

use crate::models::{AnomalyKind, AnomalyRecord, DetectionMethod, RunSummary};
use crate::sink::DeliveryReport;

/// Histogram buckets for per-entity evaluation latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Metrics for a single batch run
///
/// Each run owns its registry, so nothing leaks between runs (or tests)
/// sharing a process.
#[derive(Clone)]
pub struct RunMetrics {
    registry: Registry,
    entities_evaluated: IntCounter,
    entities_skipped: IntCounter,
    load_failures: IntCounter,
    alerts: IntCounterVec,
    detector_failures: IntCounterVec,
    deliveries: IntCounterVec,
    evaluation_latency_seconds: Histogram,
}

impl RunMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        Ok(Self {
            entities_evaluated: register_int_counter_with_registry!(
                "marketing_alerts_entities_evaluated_total",
                "Entities whose history went through the detectors",
                registry
            )?,
            entities_skipped: register_int_counter_with_registry!(
                "marketing_alerts_entities_skipped_total",
                "Entities skipped because their history was empty",
                registry
            )?,
            load_failures: register_int_counter_with_registry!(
                "marketing_alerts_load_failures_total",
                "Entities whose history could not be loaded",
                registry
            )?,
            alerts: register_int_counter_vec_with_registry!(
                "marketing_alerts_alerts_total",
                "Alerts raised, by detection method",
                &["method"],
                registry
            )?,
            detector_failures: register_int_counter_vec_with_registry!(
                "marketing_alerts_detector_failures_total",
                "Detector invocations that failed internally, by method",
                &["method"],
                registry
            )?,
            deliveries: register_int_counter_vec_with_registry!(
                "marketing_alerts_deliveries_total",
                "Alert deliveries, by outcome",
                &["outcome"],
                registry
            )?,
            evaluation_latency_seconds: register_histogram_with_registry!(
                "marketing_alerts_evaluation_latency_seconds",
                "Time spent evaluating one entity",
                LATENCY_BUCKETS.to_vec(),
                registry
            )?,
            registry,
        })
    }

    pub fn observe_evaluation_latency(&self, duration_secs: f64) {
        self.evaluation_latency_seconds.observe(duration_secs);
    }

    pub fn inc_entities_evaluated(&self) {
        self.entities_evaluated.inc();
    }

    pub fn inc_entities_skipped(&self) {
        self.entities_skipped.inc();
    }

    pub fn inc_load_failures(&self) {
        self.load_failures.inc();
    }

    pub fn inc_alerts(&self, method: DetectionMethod) {
        self.alerts.with_label_values(&[method.to_string().as_str()]).inc();
    }

    pub fn inc_detector_failures(&self, method: DetectionMethod) {
        self.detector_failures
            .with_label_values(&[method.to_string().as_str()])
            .inc();
    }

    /// Record the outcome counts of a dispatch
    pub fn record_deliveries(&self, report: &DeliveryReport) {
        self.deliveries
            .with_label_values(&["delivered"])
            .inc_by(report.delivered as u64);
        self.deliveries
            .with_label_values(&["failed"])
            .inc_by(report.failed as u64);
    }

    /// Current values in the Prometheus text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
    }

    /// Write the metrics to `path` for a node-exporter textfile collector
    ///
    /// The file is written next to the destination and renamed into place
    /// so a scraper never sees a partial file.
    pub fn export_textfile(&self, path: &Path) -> Result<()> {
        let rendered = self.render()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let staging = path.with_extension("prom.tmp");
        fs::write(&staging, rendered)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        fs::rename(&staging, path)
            .with_context(|| format!("Failed to move metrics into {}", path.display()))?;
        Ok(())
    }
}

/// Structured logger for run events
///
/// Every helper emits an `event` field so log pipelines can filter on the
/// event type without parsing messages.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    job_name: String,
}

impl StructuredLogger {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Log the start of a run
    pub fn log_run_started(&self, target_date: NaiveDate, entities: usize, historical_window: u32) {
        info!(
            event = "run_started",
            job = %self.job_name,
            target_date = %target_date,
            entities = entities,
            historical_window = historical_window,
            "Alert run started"
        );
    }

    /// Log a raised alert; drops are logged at warn level
    pub fn log_anomaly(&self, record: &AnomalyRecord) {
        match record.kind {
            AnomalyKind::Drop => {
                warn!(
                    event = "anomaly_detected",
                    job = %self.job_name,
                    entity = %record.entity,
                    metric = %record.metric,
                    kind = %record.kind,
                    method = %record.method,
                    value = %record.display_value(),
                    score = record.score,
                    date = %record.date,
                    "Metric drop detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    job = %self.job_name,
                    entity = %record.entity,
                    metric = %record.metric,
                    kind = %record.kind,
                    method = %record.method,
                    value = %record.display_value(),
                    score = record.score,
                    date = %record.date,
                    "Anomaly detected"
                );
            }
        }
    }

    /// Log a detector that failed internally for one entity
    pub fn log_detector_failed(&self, entity: &str, metric: &str, method: DetectionMethod, error: &str) {
        warn!(
            event = "detector_failed",
            job = %self.job_name,
            entity = %entity,
            metric = %metric,
            method = %method,
            error = %error,
            "Detector failed, treating as no anomaly"
        );
    }

    /// Log an alert that could not be delivered
    pub fn log_delivery_failed(&self, sink: &str, record: &AnomalyRecord, error: &str) {
        warn!(
            event = "delivery_failed",
            job = %self.job_name,
            sink = %sink,
            entity = %record.entity,
            metric = %record.metric,
            kind = %record.kind,
            error = %error,
            "Alert delivery failed"
        );
    }

    /// Log the end of a run
    pub fn log_run_completed(&self, summary: &RunSummary, delivery: &DeliveryReport, elapsed_ms: u128) {
        info!(
            event = "run_completed",
            job = %self.job_name,
            entities_evaluated = summary.entities_evaluated,
            entities_skipped = summary.entities_skipped,
            load_failures = summary.load_failures,
            detector_failures = summary.detector_failures,
            alerts = summary.alerts_total,
            seasonal_alerts = summary.seasonal_alerts,
            multivariate_alerts = summary.multivariate_alerts,
            delivered = delivery.delivered,
            delivery_attempted = delivery.attempted,
            delivery_failed = delivery.failed,
            elapsed_ms = elapsed_ms as u64,
            "Alert run completed"
        );
    }
}

//! Marketing performance anomaly alerts
//!
//! This crate provides the core functionality for:
//! - Seasonal-residual and multivariate anomaly detection on daily metrics
//! - Per-entity evaluation and parallel batch runs
//! - Metric sources (in-memory, warehouse CSV exports)
//! - Alert delivery to Teams webhooks or logs
//! - Run reports and observability

pub mod anomaly;
pub mod evaluator;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod report;
pub mod sink;
pub mod source;

pub use anomaly::{Detection, DetectorError, SkipReason};
pub use evaluator::{DetectionConfig, EntityEvaluation, EntityEvaluator, DEFAULT_METRICS};
pub use models::*;
pub use observability::{RunMetrics, StructuredLogger};
pub use orchestrator::{
    target_date_in, RunOrchestrator, RunOutcome, DEFAULT_HISTORICAL_WINDOW, DEFAULT_TIMEZONE,
};
pub use report::RunReport;
pub use sink::{
    dispatch_alerts, AlertSink, DeliveryError, DeliveryReport, LogSink, TeamsWebhookSink,
    DEFAULT_DELIVERY_CONCURRENCY,
};
pub use source::{CsvMetricSource, DateWindow, InMemoryMetricSource, MetricSource, SourceError};

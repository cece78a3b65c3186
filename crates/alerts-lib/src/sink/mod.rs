//! Alert delivery
//!
//! Sinks receive one record at a time. [`dispatch_alerts`] fans records out
//! to a sink with bounded concurrency once detection has finished; a failed
//! delivery only affects its own record and is never retried within a run.

mod teams;

pub use teams::{
    is_placeholder_url, AdaptiveCard, Attachment, CardAction, CardElement, CardSummary, Fact,
    TeamsMessage, TeamsWebhookSink, ADAPTIVE_CARD_CONTENT_TYPE, PLACEHOLDER_MARKER,
};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::models::AnomalyRecord;
use crate::observability::StructuredLogger;

/// Default number of deliveries in flight
pub const DEFAULT_DELIVERY_CONCURRENCY: usize = 4;

/// Failure delivering a single alert
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid webhook endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook responded with status {status}")]
    Status { status: u16 },
}

/// Trait for alert destinations
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Deliver one record
    async fn deliver(&self, record: &AnomalyRecord) -> Result<(), DeliveryError>;
}

/// Delivery counts for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Sink that only logs alerts, used for dry runs and when no webhook is set
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, record: &AnomalyRecord) -> Result<(), DeliveryError> {
        info!(
            entity = %record.entity,
            metric = %record.metric,
            kind = %record.kind,
            value = %record.display_value(),
            score = record.score,
            method = %record.method,
            date = %record.date,
            "Alert (not sent)"
        );
        Ok(())
    }
}

/// Deliver `alerts` through `sink` with at most `concurrency` requests in
/// flight
pub async fn dispatch_alerts(
    sink: Arc<dyn AlertSink>,
    alerts: &[AnomalyRecord],
    concurrency: usize,
    logger: &StructuredLogger,
) -> DeliveryReport {
    let mut report = DeliveryReport {
        attempted: alerts.len(),
        ..Default::default()
    };
    if alerts.is_empty() {
        return report;
    }

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (idx, record) in alerts.iter().cloned().enumerate() {
        let sink = Arc::clone(&sink);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            // The semaphore is never closed, so acquiring cannot fail
            let _permit = permits.acquire_owned().await.ok();
            let outcome = sink.deliver(&record).await;
            (idx, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (idx, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                // Task identity is lost with a panic; count it against the run
                report.failed += 1;
                warn!(sink = sink.name(), error = %e, "Delivery task aborted");
                continue;
            }
        };

        match outcome {
            Ok(()) => {
                report.delivered += 1;
                debug!(sink = sink.name(), entity = %alerts[idx].entity, "Alert delivered");
            }
            Err(e) => {
                report.failed += 1;
                logger.log_delivery_failed(sink.name(), &alerts[idx], &e.to_string());
            }
        }
    }

    report
}

//! Run orchestration
//!
//! Loads every entity's history from a metric source, evaluates the
//! entities in parallel on the rayon pool and gathers the alerts and run
//! counters. Delivery happens afterwards, see [`crate::sink`].

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::evaluator::{DetectionConfig, EntityEvaluator};
use crate::models::{AnomalyRecord, DetectionMethod, EntityHistory, RunSummary};
use crate::observability::{RunMetrics, StructuredLogger};
use crate::source::{DateWindow, MetricSource};

/// Days of history loaded before the target date
pub const DEFAULT_HISTORICAL_WINDOW: u32 = 65;

/// Zone in which "yesterday" is computed
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Bogota;

/// The day before `now`'s calendar date in `tz`
pub fn target_date_in(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    let today = now.with_timezone(&tz).date_naive();
    today.pred_opt().unwrap_or(today)
}

/// Alerts and counters produced by one run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub target_date: NaiveDate,
    pub summary: RunSummary,
    /// Sorted by entity, then metric
    pub alerts: Vec<AnomalyRecord>,
}

/// Drives one batch evaluation over all entities of a source
pub struct RunOrchestrator {
    detection: DetectionConfig,
    historical_window: u32,
    logger: StructuredLogger,
    metrics: Option<RunMetrics>,
}

impl RunOrchestrator {
    pub fn new(detection: DetectionConfig, historical_window: u32) -> Self {
        Self {
            detection,
            historical_window,
            logger: StructuredLogger::new("marketing-alerts"),
            metrics: None,
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Record run counters into `metrics`
    pub fn with_metrics(mut self, metrics: RunMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Evaluate every entity of `source` for `target`
    ///
    /// Fails only when the source cannot list its entities; per-entity load
    /// errors and detector failures are counted in the summary.
    pub async fn run(&self, source: &dyn MetricSource, target: NaiveDate) -> Result<RunOutcome> {
        let started = Instant::now();
        let entities = source
            .entities()
            .await
            .context("Failed to list entities from metric source")?;
        self.logger
            .log_run_started(target, entities.len(), self.historical_window);

        let window = DateWindow::ending_on(target, self.historical_window);
        let mut summary = RunSummary::default();
        let histories = self.load_histories(source, &entities, window, &mut summary).await;

        let evaluator = EntityEvaluator::new(&self.detection);
        let evaluations = tokio::task::spawn_blocking(move || {
            histories
                .par_iter()
                .map(|history| {
                    let start = Instant::now();
                    let evaluation = evaluator.evaluate(history, target);
                    (evaluation, start.elapsed())
                })
                .collect::<Vec<_>>()
        })
        .await
        .context("Evaluation worker panicked")?;

        let mut alerts = Vec::new();
        for (evaluation, elapsed) in evaluations {
            summary.entities_evaluated += 1;
            if let Some(metrics) = &self.metrics {
                metrics.inc_entities_evaluated();
                metrics.observe_evaluation_latency(elapsed.as_secs_f64());
            }

            for failure in &evaluation.failures {
                summary.detector_failures += 1;
                self.logger.log_detector_failed(
                    &evaluation.entity,
                    &failure.metric,
                    failure.method,
                    &failure.error.to_string(),
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_detector_failures(failure.method);
                }
            }

            alerts.extend(evaluation.records);
        }

        alerts.sort_by(|a, b| a.entity.cmp(&b.entity).then_with(|| a.metric.cmp(&b.metric)));

        for alert in &alerts {
            summary.alerts_total += 1;
            match alert.method {
                DetectionMethod::SeasonalMad => summary.seasonal_alerts += 1,
                DetectionMethod::IsolationEnsemble => summary.multivariate_alerts += 1,
            }
            self.logger.log_anomaly(alert);
            if let Some(metrics) = &self.metrics {
                metrics.inc_alerts(alert.method);
            }
        }

        debug!(
            target_date = %target,
            elapsed_ms = started.elapsed().as_millis() as u64,
            alerts = alerts.len(),
            "Detection finished"
        );

        Ok(RunOutcome {
            target_date: target,
            summary,
            alerts,
        })
    }

    async fn load_histories(
        &self,
        source: &dyn MetricSource,
        entities: &[String],
        window: DateWindow,
        summary: &mut RunSummary,
    ) -> Vec<EntityHistory> {
        let mut histories = Vec::with_capacity(entities.len());

        for entity in entities {
            match source.history(entity, window).await {
                Ok(history) if history.is_empty() => {
                    debug!(entity = %entity, "No rows in window, skipping entity");
                    summary.entities_skipped += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_entities_skipped();
                    }
                }
                Ok(history) => histories.push(history),
                Err(e) => {
                    warn!(entity = %entity, error = %format!("{:#}", e), "Failed to load history");
                    summary.load_failures += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_load_failures();
                    }
                }
            }
        }

        histories
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricSeries;
    use crate::source::InMemoryMetricSource;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap() + Duration::days(offset)
    }

    fn history(entity: &str, spend: &[f64]) -> EntityHistory {
        let series = |metric: &str, values: Vec<f64>| {
            let points = values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (day(i as i64), v))
                .collect();
            MetricSeries::new(entity, metric, points).unwrap()
        };
        let len = spend.len();
        EntityHistory::new(entity)
            .with_series(series("spend", spend.to_vec()))
            .unwrap()
            .with_series(series(
                "leads",
                (0..len).map(|i| 40.0 + (i as f64 * 0.8).sin() * 2.0).collect(),
            ))
            .unwrap()
            .with_series(series(
                "sessions",
                (0..len).map(|i| 1000.0 + (i as f64 * 2.1).sin() * 30.0).collect(),
            ))
            .unwrap()
    }

    fn spend(len: usize) -> Vec<f64> {
        (0..len).map(|i| 800.0 + (i as f64 * 1.3).sin() * 20.0).collect()
    }

    /// Source whose history call fails for one entity
    struct BrokenSource {
        inner: InMemoryMetricSource,
        broken: String,
    }

    #[async_trait]
    impl MetricSource for BrokenSource {
        async fn entities(&self) -> Result<Vec<String>> {
            let mut entities = self.inner.entities().await?;
            entities.push(self.broken.clone());
            Ok(entities)
        }

        async fn history(&self, entity: &str, window: DateWindow) -> Result<EntityHistory> {
            if entity == self.broken {
                anyhow::bail!("warehouse timeout");
            }
            self.inner.history(entity, window).await
        }
    }

    #[test]
    fn test_target_date_is_yesterday_in_zone() {
        // 03:00 UTC is still the previous evening in Bogotá (UTC−5)
        let early = Utc.with_ymd_and_hms(2024, 3, 10, 3, 0, 0).unwrap();
        assert_eq!(
            target_date_in(DEFAULT_TIMEZONE, early),
            NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()
        );

        let noon = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            target_date_in(DEFAULT_TIMEZONE, noon),
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
        );
    }

    #[tokio::test]
    async fn test_run_counts_and_alerts() {
        let mut spiky = spend(40);
        spiky[39] = 5000.0;

        let source = InMemoryMetricSource::new()
            .with_history(history("b-quiet.com", &spend(40)))
            .with_history(history("a-spiky.com", &spiky))
            .with_history(EntityHistory::new("empty.com"));

        let metrics = RunMetrics::new().unwrap();
        let orchestrator = RunOrchestrator::new(DetectionConfig::default(), DEFAULT_HISTORICAL_WINDOW)
            .with_metrics(metrics.clone());
        let outcome = orchestrator.run(&source, day(39)).await.unwrap();

        assert_eq!(outcome.target_date, day(39));
        assert_eq!(outcome.summary.entities_evaluated, 2);
        assert_eq!(outcome.summary.entities_skipped, 1);
        assert_eq!(outcome.summary.load_failures, 0);
        assert_eq!(outcome.summary.alerts_total, outcome.alerts.len());
        assert_eq!(
            outcome.summary.seasonal_alerts + outcome.summary.multivariate_alerts,
            outcome.summary.alerts_total
        );
        assert!(outcome.alerts.iter().any(|a| a.entity == "a-spiky.com"
            && a.metric == "spend"
            && a.method == DetectionMethod::SeasonalMad));

        let entities: Vec<&str> = outcome.alerts.iter().map(|a| a.entity.as_str()).collect();
        let mut sorted = entities.clone();
        sorted.sort();
        assert_eq!(entities, sorted);

        let text = metrics.render().unwrap();
        assert!(text.contains("marketing_alerts_entities_evaluated_total 2"));
        assert!(text.contains("marketing_alerts_entities_skipped_total 1"));
    }

    #[tokio::test]
    async fn test_load_failure_is_not_fatal() {
        let source = BrokenSource {
            inner: InMemoryMetricSource::new().with_history(history("ok.com", &spend(30))),
            broken: "broken.com".to_string(),
        };

        let outcome = RunOrchestrator::new(DetectionConfig::default(), DEFAULT_HISTORICAL_WINDOW)
            .run(&source, day(29))
            .await
            .unwrap();

        assert_eq!(outcome.summary.load_failures, 1);
        assert_eq!(outcome.summary.entities_evaluated, 1);
    }

    #[tokio::test]
    async fn test_window_excludes_old_rows() {
        // 40 days of data but a 10-day window leaves fewer than two cycles
        let source = InMemoryMetricSource::new().with_history(history("acme.com", &spend(40)));
        let outcome = RunOrchestrator::new(DetectionConfig::default(), 10)
            .run(&source, day(39))
            .await
            .unwrap();

        assert_eq!(outcome.summary.entities_evaluated, 1);
        assert!(outcome.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_detector_failures_are_counted() {
        let source = InMemoryMetricSource::new().with_history(history("acme.com", &spend(30)));
        let config = DetectionConfig {
            contamination: 0.75,
            ..DetectionConfig::default()
        };

        let outcome = RunOrchestrator::new(config, DEFAULT_HISTORICAL_WINDOW)
            .run(&source, day(29))
            .await
            .unwrap();

        assert_eq!(outcome.summary.detector_failures, 1);
        assert_eq!(outcome.summary.multivariate_alerts, 0);
    }

    #[tokio::test]
    async fn test_extreme_values_do_not_abort_run() {
        let huge: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 1.5e308 } else { -1.5e308 })
            .collect();
        let source = InMemoryMetricSource::new()
            .with_history(history("good.com", &spend(30)))
            .with_history(history("huge.com", &huge));

        let outcome = RunOrchestrator::new(DetectionConfig::default(), DEFAULT_HISTORICAL_WINDOW)
            .run(&source, day(29))
            .await
            .unwrap();

        assert_eq!(outcome.summary.entities_evaluated, 2);
        assert_eq!(outcome.summary.load_failures, 0);
        assert!(outcome.alerts.iter().all(|a| a.entity == "good.com" || a.entity == "huge.com"));
    }
}

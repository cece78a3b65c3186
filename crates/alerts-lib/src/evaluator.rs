//! Per-entity evaluation
//!
//! Runs the seasonal detector on every configured metric and the
//! multivariate detector once over the metric set. All records are kept:
//! no suppression across metrics or detectors.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use chrono::NaiveDate;
use tracing::debug;

use crate::anomaly::{
    Detection, DetectorError, IsolationForestParams, MultivariateDetector, SeasonalMadDetector,
    DEFAULT_CONTAMINATION, DEFAULT_MAD_THRESHOLD,
};
use crate::models::{AnomalyRecord, DetectionMethod, EntityHistory, MULTIVARIATE_METRIC};

/// Metrics evaluated when nothing else is configured
pub const DEFAULT_METRICS: [&str; 3] = ["spend", "leads", "sessions"];

/// Detector parameters shared by every entity in a run
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionConfig {
    /// k in `median ± k · MAD`
    pub mad_threshold: f64,
    /// Expected anomaly share for the isolation ensemble
    pub contamination: f64,
    /// Ordered metrics; every one gets a seasonal pass and together they
    /// form the multivariate feature vector
    pub metric_set: Vec<String>,
    pub forest: IsolationForestParams,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mad_threshold: DEFAULT_MAD_THRESHOLD,
            contamination: DEFAULT_CONTAMINATION,
            metric_set: DEFAULT_METRICS.iter().map(|m| m.to_string()).collect(),
            forest: IsolationForestParams::default(),
        }
    }
}

/// A detector that failed internally for one metric (or the metric set)
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorFailure {
    pub method: DetectionMethod,
    pub metric: String,
    pub error: DetectorError,
}

/// Everything produced for one entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityEvaluation {
    pub entity: String,
    pub records: Vec<AnomalyRecord>,
    pub failures: Vec<DetectorFailure>,
    /// Detector invocations that declined to run
    pub skipped: usize,
}

/// Runs both detectors for one entity's history
#[derive(Debug, Clone)]
pub struct EntityEvaluator {
    seasonal: SeasonalMadDetector,
    multivariate: MultivariateDetector,
    metrics: Vec<String>,
}

impl EntityEvaluator {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            seasonal: SeasonalMadDetector::new(config.mad_threshold),
            multivariate: MultivariateDetector::new(config.metric_set.clone(), config.contamination)
                .with_forest_params(config.forest.clone()),
            metrics: config.metric_set.clone(),
        }
    }

    /// Evaluate `history` for `target`
    ///
    /// Never fails: detector errors are returned as [`DetectorFailure`]s
    /// next to whatever the other detectors produced.
    pub fn evaluate(&self, history: &EntityHistory, target: NaiveDate) -> EntityEvaluation {
        let mut evaluation = EntityEvaluation {
            entity: history.entity().to_string(),
            ..Default::default()
        };

        for metric in &self.metrics {
            let Some(series) = history.get(metric) else {
                debug!(entity = %history.entity(), metric = %metric, "Metric missing from history");
                evaluation.skipped += 1;
                continue;
            };

            let outcome = contain_panic(|| self.seasonal.detect(series, target));
            evaluation.absorb(DetectionMethod::SeasonalMad, metric, outcome);
        }

        let outcome = contain_panic(|| self.multivariate.detect(history, target));
        evaluation.absorb(DetectionMethod::IsolationEnsemble, MULTIVARIATE_METRIC, outcome);

        evaluation
    }
}

/// Runs one detector, turning a panic into a [`DetectorError::Panicked`]
fn contain_panic<F>(detect: F) -> Result<Detection, DetectorError>
where
    F: FnOnce() -> Result<Detection, DetectorError>,
{
    panic::catch_unwind(AssertUnwindSafe(detect)).unwrap_or_else(|payload| {
        Err(DetectorError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl EntityEvaluation {
    fn absorb(&mut self, method: DetectionMethod, metric: &str, outcome: Result<Detection, DetectorError>) {
        match outcome {
            Ok(Detection::Anomaly(record)) => self.records.push(record),
            Ok(Detection::Normal) => {}
            Ok(Detection::Skipped(reason)) => {
                debug!(
                    entity = %self.entity,
                    metric = %metric,
                    method = %method,
                    reason = %reason,
                    "Detector skipped"
                );
                self.skipped += 1;
            }
            Err(error) => {
                debug!(
                    entity = %self.entity,
                    metric = %metric,
                    method = %method,
                    error = %error,
                    "Detector failed"
                );
                self.failures.push(DetectorFailure {
                    method,
                    metric: metric.to_string(),
                    error,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricSeries;
    use chrono::Duration;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 1).unwrap() + Duration::days(offset)
    }

    fn series(entity: &str, metric: &str, values: &[f64]) -> MetricSeries {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| (day(i as i64), *v))
            .collect();
        MetricSeries::new(entity, metric, points).unwrap()
    }

    fn history(spend: &[f64], leads: &[f64], sessions: &[f64]) -> EntityHistory {
        EntityHistory::new("shop.io")
            .with_series(series("shop.io", "spend", spend))
            .unwrap()
            .with_series(series("shop.io", "leads", leads))
            .unwrap()
            .with_series(series("shop.io", "sessions", sessions))
            .unwrap()
    }

    fn wavy(len: usize, base: f64, amplitude: f64, step: f64) -> Vec<f64> {
        (0..len).map(|i| base + (i as f64 * step).sin() * amplitude).collect()
    }

    #[test]
    fn test_quiet_entity_has_no_seasonal_records() {
        let h = history(&wavy(30, 800.0, 20.0, 1.3), &wavy(30, 40.0, 2.0, 0.8), &wavy(30, 1000.0, 30.0, 2.1));
        let evaluation = EntityEvaluator::new(&DetectionConfig::default()).evaluate(&h, day(29));

        assert!(evaluation.failures.is_empty());
        assert_eq!(evaluation.skipped, 0);
        assert!(evaluation
            .records
            .iter()
            .all(|r| r.method == DetectionMethod::IsolationEnsemble));
    }

    #[test]
    fn test_records_are_stamped_and_not_suppressed() {
        let mut spend = wavy(40, 800.0, 20.0, 1.3);
        let mut sessions = wavy(40, 1000.0, 30.0, 2.1);
        spend[39] = 5000.0;
        sessions[39] = 6000.0;
        let h = history(&spend, &wavy(40, 40.0, 2.0, 0.8), &sessions);

        let config = DetectionConfig {
            contamination: 0.05,
            ..DetectionConfig::default()
        };
        let evaluation = EntityEvaluator::new(&config).evaluate(&h, day(39));

        let metrics: Vec<&str> = evaluation.records.iter().map(|r| r.metric.as_str()).collect();
        assert!(metrics.contains(&"spend"));
        assert!(metrics.contains(&"sessions"));
        assert!(metrics.contains(&MULTIVARIATE_METRIC));
        assert!(evaluation.records.iter().all(|r| r.entity == "shop.io"));
        assert!(evaluation.records.iter().all(|r| r.date == day(39)));
    }

    #[test]
    fn test_missing_metric_is_skipped() {
        let h = EntityHistory::new("shop.io")
            .with_series(series("shop.io", "spend", &wavy(30, 800.0, 20.0, 1.3)))
            .unwrap();
        let evaluation = EntityEvaluator::new(&DetectionConfig::default()).evaluate(&h, day(29));

        // leads and sessions are missing; spend and the ensemble still run
        assert_eq!(evaluation.skipped, 2);
        assert!(evaluation.failures.is_empty());
    }

    #[test]
    fn test_detector_failure_is_contained() {
        let h = history(&wavy(30, 800.0, 20.0, 1.3), &wavy(30, 40.0, 2.0, 0.8), &wavy(30, 1000.0, 30.0, 2.1));
        let config = DetectionConfig {
            contamination: 0.9,
            ..DetectionConfig::default()
        };
        let evaluation = EntityEvaluator::new(&config).evaluate(&h, day(29));

        assert_eq!(evaluation.failures.len(), 1);
        assert_eq!(evaluation.failures[0].method, DetectionMethod::IsolationEnsemble);
    }

    #[test]
    fn test_panicking_detector_becomes_failure() {
        let outcome = contain_panic(|| panic!("range overflow"));
        assert_eq!(
            outcome,
            Err(DetectorError::Panicked {
                message: "range overflow".to_string()
            })
        );

        let owned = contain_panic(|| panic!("{} overflow", "range"));
        assert!(matches!(owned, Err(DetectorError::Panicked { message }) if message == "range overflow"));

        assert_eq!(contain_panic(|| Ok(Detection::Normal)), Ok(Detection::Normal));
    }
}

//! Joint-pattern detection across several metrics
//!
//! Aligns an entity's metrics by date (missing values count as zero
//! activity), fits an isolation ensemble on the whole history and flags the
//! target date when it ranks among the top `contamination` share of scores.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use super::isolation_forest::{outlier_threshold, IsolationForest, IsolationForestParams};
use super::stats::round_to;
use super::{Detection, DetectorError, SkipReason};
use crate::models::{AnomalyKind, AnomalyRecord, DetectionMethod, EntityHistory, MULTIVARIATE_METRIC};

/// Default expected share of anomalous days
pub const DEFAULT_CONTAMINATION: f64 = 0.01;

/// Aligned observations needed before fitting the ensemble
pub const MIN_ALIGNED_ROWS: usize = 20;

/// Metric values aligned on the union of their dates
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedMatrix {
    pub metrics: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub rows: Vec<Vec<f64>>,
}

impl AlignedMatrix {
    /// Align `metrics` of `history` for dates up to and including `until`
    ///
    /// A metric absent on a date, or absent from the history altogether,
    /// contributes `0.0`.
    pub fn from_history(history: &EntityHistory, metrics: &[String], until: NaiveDate) -> Self {
        let dates: BTreeSet<NaiveDate> = metrics
            .iter()
            .filter_map(|metric| history.get(metric))
            .flat_map(|series| series.dates().iter().copied())
            .filter(|date| *date <= until)
            .collect();

        let rows = dates
            .iter()
            .map(|date| {
                metrics
                    .iter()
                    .map(|metric| {
                        history
                            .get(metric)
                            .and_then(|series| series.value_on(*date))
                            .unwrap_or(0.0)
                    })
                    .collect()
            })
            .collect();

        Self {
            metrics: metrics.to_vec(),
            dates: dates.into_iter().collect(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }
}

/// Flags the target date of an entity as a multivariate outlier
#[derive(Debug, Clone)]
pub struct MultivariateDetector {
    /// Ordered metric names forming the feature vector
    pub metric_set: Vec<String>,
    /// Expected anomaly share in `(0, 0.5]`
    pub contamination: f64,
    pub forest: IsolationForestParams,
    pub min_rows: usize,
}

impl MultivariateDetector {
    pub fn new(metric_set: Vec<String>, contamination: f64) -> Self {
        Self {
            metric_set,
            contamination,
            forest: IsolationForestParams::default(),
            min_rows: MIN_ALIGNED_ROWS,
        }
    }

    /// Override ensemble parameters (tree count, subsample size, seed)
    pub fn with_forest_params(mut self, forest: IsolationForestParams) -> Self {
        self.forest = forest;
        self
    }

    pub fn detect(&self, history: &EntityHistory, target: NaiveDate) -> Result<Detection, DetectorError> {
        if self.metric_set.is_empty() {
            return Err(DetectorError::InvalidParameter {
                name: "metric_set",
                reason: "at least one metric is required".to_string(),
            });
        }

        let matrix = AlignedMatrix::from_history(history, &self.metric_set, target);

        if matrix.last_date() != Some(target) {
            return Ok(Detection::Skipped(SkipReason::StaleData {
                last: matrix.last_date(),
                target,
            }));
        }
        if matrix.len() < self.min_rows {
            return Ok(Detection::Skipped(SkipReason::InsufficientHistory {
                required: self.min_rows,
                available: matrix.len(),
            }));
        }

        let forest = IsolationForest::fit(&matrix.rows, &self.forest)?;
        let scores = forest.score_samples(&matrix.rows)?;
        let threshold = outlier_threshold(&scores, self.contamination)?;

        let last = matrix.len() - 1;
        let target_score = scores[last];
        if target_score <= threshold {
            return Ok(Detection::Normal);
        }

        let context: BTreeMap<String, f64> = matrix
            .metrics
            .iter()
            .cloned()
            .zip(matrix.rows[last].iter().copied())
            .collect();

        Ok(Detection::Anomaly(AnomalyRecord {
            entity: history.entity().to_string(),
            metric: MULTIVARIATE_METRIC.to_string(),
            date: target,
            kind: AnomalyKind::MultivariatePattern,
            value: None,
            method: DetectionMethod::IsolationEnsemble,
            score: round_to(target_score, 4),
            params: format!("contamination={}", self.contamination),
            context,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricSeries;
    use chrono::Duration;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap() + Duration::days(offset)
    }

    fn history_with(spend: Vec<(NaiveDate, f64)>, leads: Vec<(NaiveDate, f64)>) -> EntityHistory {
        EntityHistory::new("acme.com")
            .with_series(MetricSeries::new("acme.com", "spend", spend).unwrap())
            .unwrap()
            .with_series(MetricSeries::new("acme.com", "leads", leads).unwrap())
            .unwrap()
    }

    fn metrics() -> Vec<String> {
        vec!["spend".to_string(), "leads".to_string()]
    }

    #[test]
    fn test_alignment_imputes_zero() {
        let history = history_with(
            vec![(day(0), 10.0), (day(2), 30.0)],
            vec![(day(1), 2.0), (day(2), 3.0), (day(3), 4.0)],
        );
        let matrix = AlignedMatrix::from_history(&history, &metrics(), day(2));

        assert_eq!(matrix.dates, vec![day(0), day(1), day(2)]);
        assert_eq!(matrix.rows[0], vec![10.0, 0.0]);
        assert_eq!(matrix.rows[1], vec![0.0, 2.0]);
        assert_eq!(matrix.rows[2], vec![30.0, 3.0]);
    }

    #[test]
    fn test_alignment_with_missing_metric() {
        let history = history_with(vec![(day(0), 10.0)], vec![(day(0), 1.0)]);
        let wanted = vec!["spend".to_string(), "sessions".to_string()];
        let matrix = AlignedMatrix::from_history(&history, &wanted, day(0));
        assert_eq!(matrix.rows, vec![vec![10.0, 0.0]]);
    }

    #[test]
    fn test_rows_after_target_are_ignored() {
        let points: Vec<(NaiveDate, f64)> = (0..30).map(|i| (day(i), 100.0 + i as f64)).collect();
        let history = history_with(points.clone(), points);
        let detector = MultivariateDetector::new(metrics(), 0.01);

        // Target in the middle of the history: later rows are dropped and the
        // target becomes the newest aligned row
        let result = detector.detect(&history, day(25)).unwrap();
        assert!(!matches!(result, Detection::Skipped(_)));
    }

    #[test]
    fn test_short_history_is_skipped() {
        let points: Vec<(NaiveDate, f64)> = (0..10).map(|i| (day(i), 1.0)).collect();
        let history = history_with(points.clone(), points);
        let detector = MultivariateDetector::new(metrics(), 0.01);

        let result = detector.detect(&history, day(9)).unwrap();
        assert_eq!(
            result,
            Detection::Skipped(SkipReason::InsufficientHistory {
                required: MIN_ALIGNED_ROWS,
                available: 10
            })
        );
    }

    #[test]
    fn test_empty_metric_set_is_an_error() {
        let history = EntityHistory::new("acme.com");
        let detector = MultivariateDetector::new(Vec::new(), 0.01);
        assert!(detector.detect(&history, day(0)).is_err());
    }

    #[test]
    fn test_disproportionate_spend_is_flagged() {
        let mut spend: Vec<(NaiveDate, f64)> = (0..60)
            .map(|i| (day(i), 800.0 + (i as f64 * 0.9).sin() * 40.0))
            .collect();
        let leads: Vec<(NaiveDate, f64)> = (0..60)
            .map(|i| (day(i), 50.0 + (i as f64 * 1.3).cos() * 4.0))
            .collect();
        spend[59].1 = 3000.0;

        let history = history_with(spend, leads);
        let detector = MultivariateDetector::new(metrics(), 0.02);
        let record = detector.detect(&history, day(59)).unwrap().into_record().unwrap();

        assert_eq!(record.kind, AnomalyKind::MultivariatePattern);
        assert_eq!(record.metric, MULTIVARIATE_METRIC);
        assert_eq!(record.value, None);
        assert_eq!(record.context.get("spend"), Some(&3000.0));
        assert_eq!(record.params, "contamination=0.02");
        assert!(record.score > 0.5);
    }
}

//! Behavioural tests for both detectors
//!
//! These build synthetic daily series with a weekly pattern and check the
//! detection contract end to end: flat input, injected spikes and drops,
//! threshold monotonicity, stale data and ensemble determinism.

#[cfg(test)]
mod detector_tests {
    use crate::anomaly::{
        Detection, IsolationForest, IsolationForestParams, MultivariateDetector,
        SeasonalMadDetector, SkipReason,
    };
    use crate::models::{AnomalyKind, EntityHistory, MetricSeries};
    use chrono::{Duration, NaiveDate};

    const WEEKLY_SHAPE: [f64; 7] = [1.0, 0.8, 0.9, 1.1, 1.3, 0.5, 0.4];

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 5).unwrap()
    }

    fn noise(len: usize, amplitude: f64) -> Vec<f64> {
        (0..len).map(|i| (i as f64 * 1.7).sin() * amplitude).collect()
    }

    fn std_dev(values: &[f64]) -> f64 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
    }

    fn weekly_values(len: usize, noise_amplitude: f64) -> (Vec<f64>, f64) {
        let noise = noise(len, noise_amplitude);
        let values = (0..len)
            .map(|i| 200.0 + WEEKLY_SHAPE[i % 7] * 40.0 + noise[i])
            .collect();
        (values, std_dev(&noise))
    }

    fn to_series(metric: &str, values: &[f64]) -> MetricSeries {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| (start() + Duration::days(i as i64), *v))
            .collect();
        MetricSeries::new("acme.com", metric, points).unwrap()
    }

    fn last_day(len: usize) -> NaiveDate {
        start() + Duration::days(len as i64 - 1)
    }

    #[test]
    fn test_flat_series_never_alerts() {
        let detector = SeasonalMadDetector::new(3.5);
        for len in [14, 21, 60] {
            let series = to_series("spend", &vec![250.0; len]);
            let result = detector.detect(&series, last_day(len)).unwrap();
            assert_eq!(result, Detection::Normal, "length {}", len);
        }
    }

    #[test]
    fn test_injected_spike_on_target_date() {
        let (mut values, sigma) = weekly_values(28, 2.0);
        values[27] += 10.0 * sigma;
        let series = to_series("sessions", &values);

        let detector = SeasonalMadDetector::new(3.5);
        let result = detector.detect(&series, last_day(28)).unwrap();

        let Detection::Anomaly(record) = result else {
            panic!("expected an anomaly, got {:?}", result);
        };
        assert_eq!(record.kind, AnomalyKind::Spike);
        assert!(record.score > 3.5, "score {}", record.score);
        assert_eq!(record.date, last_day(28));
    }

    #[test]
    fn test_injected_drop_on_target_date() {
        let (mut values, sigma) = weekly_values(28, 2.0);
        values[27] -= 10.0 * sigma;
        let series = to_series("leads", &values);

        let detector = SeasonalMadDetector::new(3.5);
        let record = detector
            .detect(&series, last_day(28))
            .unwrap()
            .into_record()
            .expect("drop should be flagged");

        assert_eq!(record.kind, AnomalyKind::Drop);
        assert!(record.score > 3.5);
    }

    #[test]
    fn test_lower_threshold_never_flags_fewer_points() {
        let (mut values, sigma) = weekly_values(60, 3.0);
        for (i, factor) in [(20, 4.0), (33, -3.0), (41, 2.5), (52, -6.0), (59, 1.8)] {
            values[i] += factor * sigma;
        }

        let count_flags = |k: f64| -> usize {
            let detector = SeasonalMadDetector::new(k);
            (14..=values.len())
                .filter(|&len| {
                    let series = to_series("spend", &values[..len]);
                    detector.detect(&series, last_day(len)).unwrap().is_anomaly()
                })
                .count()
        };

        let strict = count_flags(3.5);
        let sensitive = count_flags(1.5);
        assert!(sensitive >= strict, "k=1.5 flagged {}, k=3.5 flagged {}", sensitive, strict);

        let strict_all = SeasonalMadDetector::new(3.5).analyze(&values).unwrap().flagged();
        let sensitive_all = SeasonalMadDetector::new(1.5).analyze(&values).unwrap().flagged();
        assert!(strict_all.iter().all(|i| sensitive_all.contains(i)));
    }

    fn joint_history(len: usize) -> EntityHistory {
        let (spend, _) = weekly_values(len, 5.0);
        let leads: Vec<f64> = (0..len).map(|i| 40.0 + (i as f64 * 0.6).cos() * 3.0).collect();
        let sessions: Vec<f64> = (0..len).map(|i| 900.0 + WEEKLY_SHAPE[i % 7] * 100.0).collect();

        EntityHistory::new("acme.com")
            .with_series(to_series("spend", &spend))
            .unwrap()
            .with_series(to_series("leads", &leads))
            .unwrap()
            .with_series(to_series("sessions", &sessions))
            .unwrap()
    }

    fn metric_set() -> Vec<String> {
        vec!["spend".to_string(), "leads".to_string(), "sessions".to_string()]
    }

    #[test]
    fn test_stale_data_skips_both_detectors() {
        let mut values = weekly_values(40, 2.0).0;
        values[39] *= 5.0;
        let series = to_series("spend", &values);
        let target = last_day(40) + Duration::days(1);

        let seasonal = SeasonalMadDetector::default().detect(&series, target).unwrap();
        assert_eq!(
            seasonal,
            Detection::Skipped(SkipReason::StaleData {
                last: Some(last_day(40)),
                target
            })
        );

        let history = joint_history(40);
        let multivariate = MultivariateDetector::new(metric_set(), 0.05)
            .detect(&history, target)
            .unwrap();
        assert!(matches!(
            multivariate,
            Detection::Skipped(SkipReason::StaleData { .. })
        ));
    }

    #[test]
    fn test_multivariate_detector_is_deterministic() {
        let history = joint_history(60);
        let detector = MultivariateDetector::new(metric_set(), 0.05);

        let first = detector.detect(&history, last_day(60)).unwrap();
        let second = detector.detect(&history, last_day(60)).unwrap();
        assert_eq!(first, second);

        let rows: Vec<Vec<f64>> = (0..60)
            .map(|i| vec![(i as f64 * 0.3).sin(), (i as f64 * 0.7).cos(), i as f64])
            .collect();
        let params = IsolationForestParams::default();
        let a = IsolationForest::fit(&rows, &params).unwrap().score_samples(&rows).unwrap();
        let b = IsolationForest::fit(&rows, &params).unwrap().score_samples(&rows).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seed_changes_scores() {
        let rows: Vec<Vec<f64>> = (0..50)
            .map(|i| vec![(i as f64 * 0.3).sin(), (i as f64 * 0.7).cos()])
            .collect();
        let a = IsolationForest::fit(&rows, &IsolationForestParams::default())
            .unwrap()
            .score_samples(&rows)
            .unwrap();
        let other = IsolationForestParams {
            seed: 7,
            ..IsolationForestParams::default()
        };
        let b = IsolationForest::fit(&rows, &other).unwrap().score_samples(&rows).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_contamination_caps_in_sample_outliers() {
        let mut rows: Vec<Vec<f64>> = (0..95)
            .map(|i| {
                let t = i as f64;
                vec![100.0 + (t * 0.37).sin() * 8.0, 20.0 + (t * 0.91).cos() * 2.0, 5.0 + (t % 7.0)]
            })
            .collect();
        for i in 0..5 {
            rows.push(vec![300.0 + i as f64 * 50.0, 1.0, 40.0]);
        }
        assert_eq!(rows.len(), 100);

        let forest = IsolationForest::fit(&rows, &IsolationForestParams::default()).unwrap();
        let (flags, _) = forest.outliers(&rows, 0.05).unwrap();
        let flagged = flags.iter().filter(|f| **f).count();
        assert!(flagged <= 5, "flagged {}", flagged);
    }
}

//! Seasonal residual detection
//!
//! Decomposes a daily series with a weekly cycle and flags the most recent
//! point when its residual falls outside `median ± k · MAD` of all residuals.

use chrono::NaiveDate;

use super::decomposition::{decompose_additive, DecompositionResult, WEEKLY_PERIOD};
use super::stats::{median, round_to, scaled_mad};
use super::{Detection, DetectorError, SkipReason};
use crate::models::{AnomalyKind, AnomalyRecord, DetectionMethod, MetricSeries};

/// Default sensitivity (number of scaled MADs)
pub const DEFAULT_MAD_THRESHOLD: f64 = 3.5;

/// Lower bound on the scaled MAD
pub const MAD_FLOOR: f64 = 1e-6;

/// Full cycles required before decomposing
const MIN_CYCLES: usize = 2;

/// Flags the target date of a single metric series
#[derive(Debug, Clone)]
pub struct SeasonalMadDetector {
    /// Number of scaled MADs a residual must exceed
    pub mad_threshold: f64,
    /// Seasonal cycle length in days
    pub period: usize,
}

impl SeasonalMadDetector {
    pub fn new(mad_threshold: f64) -> Self {
        Self {
            mad_threshold,
            period: WEEKLY_PERIOD,
        }
    }

    /// Set a custom cycle length
    pub fn with_period(mut self, period: usize) -> Self {
        self.period = period;
        self
    }

    /// Minimum number of observations needed for a decomposition
    pub fn min_points(&self) -> usize {
        self.period * MIN_CYCLES
    }

    /// Evaluate `series` on `target`
    ///
    /// Returns `Skipped` when the series does not end on `target` or holds
    /// fewer than two cycles, `Anomaly` when the target residual crosses a
    /// threshold, `Normal` otherwise.
    pub fn detect(&self, series: &MetricSeries, target: NaiveDate) -> Result<Detection, DetectorError> {
        if series.last_date() != Some(target) {
            return Ok(Detection::Skipped(SkipReason::StaleData {
                last: series.last_date(),
                target,
            }));
        }

        if series.len() < self.min_points() {
            return Ok(Detection::Skipped(SkipReason::InsufficientHistory {
                required: self.min_points(),
                available: series.len(),
            }));
        }

        let analysis = self.analyze(series.values())?;
        let last = series.len() - 1;

        let Some((kind, residual)) = analysis.classify(last) else {
            return Ok(Detection::Normal);
        };

        Ok(Detection::Anomaly(AnomalyRecord {
            entity: series.entity().to_string(),
            metric: series.metric().to_string(),
            date: target,
            kind,
            value: Some(series.values()[last]),
            method: DetectionMethod::SeasonalMad,
            score: round_to(analysis.score(residual), 2),
            params: format!("mad_threshold={}", self.mad_threshold),
            context: Default::default(),
        }))
    }

    /// Decompose `values` and derive the residual thresholds
    pub fn analyze(&self, values: &[f64]) -> Result<ResidualAnalysis, DetectorError> {
        if !self.mad_threshold.is_finite() || self.mad_threshold <= 0.0 {
            return Err(DetectorError::InvalidParameter {
                name: "mad_threshold",
                reason: format!("must be a positive number, got {}", self.mad_threshold),
            });
        }

        let decomposition = decompose_additive(values, self.period)?;
        let residuals = &decomposition.residual;

        let center = median(residuals).ok_or(DetectorError::TooShort {
            needed: self.min_points(),
            got: 0,
        })?;
        // Flat series leave only rounding noise in the residuals
        let spread = scaled_mad(residuals, center)
            .unwrap_or(0.0)
            .max(MAD_FLOOR);

        Ok(ResidualAnalysis {
            upper: center + self.mad_threshold * spread,
            lower: center - self.mad_threshold * spread,
            center,
            scaled_mad: spread,
            decomposition,
        })
    }
}

impl Default for SeasonalMadDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAD_THRESHOLD)
    }
}

/// Decomposition of one series with its robust residual band
#[derive(Debug, Clone)]
pub struct ResidualAnalysis {
    pub decomposition: DecompositionResult,
    /// Median residual
    pub center: f64,
    /// MAD × 1.4826, floored at [`MAD_FLOOR`]
    pub scaled_mad: f64,
    pub upper: f64,
    pub lower: f64,
}

impl ResidualAnalysis {
    /// Kind and residual of the point at `index` if it lies outside the band
    pub fn classify(&self, index: usize) -> Option<(AnomalyKind, f64)> {
        let residual = *self.decomposition.residual.get(index)?;
        if residual > self.upper {
            Some((AnomalyKind::Spike, residual))
        } else if residual < self.lower {
            Some((AnomalyKind::Drop, residual))
        } else {
            None
        }
    }

    /// Robust z-score of a residual
    pub fn score(&self, residual: f64) -> f64 {
        residual.abs() / self.scaled_mad
    }

    /// Indices of every point outside the band
    pub fn flagged(&self) -> Vec<usize> {
        (0..self.decomposition.len())
            .filter(|&i| self.classify(i).is_some())
            .collect()
    }
}

//! Additive seasonal decomposition
//!
//! Splits a series into trend, seasonal and residual components using a
//! centred moving average for the trend and per-position means of the
//! detrended values for the seasonal pattern. Trend values at both edges are
//! filled by extrapolating a least-squares line fitted to the nearest
//! interior trend values, so residuals exist for every input point,
//! including the most recent one.

use super::stats::least_squares_line;
use super::DetectorError;

/// Weekly cycle for daily data
pub const WEEKLY_PERIOD: usize = 7;

/// Trend, seasonal and residual components aligned with the input
#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionResult {
    pub trend: Vec<f64>,
    pub seasonal: Vec<f64>,
    pub residual: Vec<f64>,
}

impl DecompositionResult {
    pub fn len(&self) -> usize {
        self.residual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residual.is_empty()
    }
}

/// Decompose `values` additively with the given seasonal `period`
///
/// Requires at least two full cycles.
pub fn decompose_additive(values: &[f64], period: usize) -> Result<DecompositionResult, DetectorError> {
    if period < 2 {
        return Err(DetectorError::InvalidParameter {
            name: "period",
            reason: format!("must be at least 2, got {}", period),
        });
    }
    if values.len() < 2 * period {
        return Err(DetectorError::TooShort {
            needed: 2 * period,
            got: values.len(),
        });
    }
    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(DetectorError::NonFinite {
            stage: "input",
            index,
        });
    }

    let trend = extrapolated_trend(values, period)?;

    let detrended: Vec<f64> = values.iter().zip(&trend).map(|(v, t)| v - t).collect();
    let pattern = seasonal_pattern(&detrended, period);
    let seasonal: Vec<f64> = (0..values.len()).map(|i| pattern[i % period]).collect();

    let residual: Vec<f64> = values
        .iter()
        .zip(&trend)
        .zip(&seasonal)
        .map(|((v, t), s)| v - t - s)
        .collect();

    if let Some(index) = residual.iter().position(|r| !r.is_finite()) {
        return Err(DetectorError::NonFinite {
            stage: "residual",
            index,
        });
    }

    Ok(DecompositionResult {
        trend,
        seasonal,
        residual,
    })
}

/// Moving-average weights: a plain window for odd periods, a 2×period
/// window with half weights at both ends for even periods
fn trend_filter(period: usize) -> Vec<f64> {
    let p = period as f64;
    if period % 2 == 1 {
        vec![1.0 / p; period]
    } else {
        let mut weights = vec![1.0 / p; period + 1];
        weights[0] = 0.5 / p;
        weights[period] = 0.5 / p;
        weights
    }
}

/// Centred moving average with linearly extrapolated edges
fn extrapolated_trend(values: &[f64], period: usize) -> Result<Vec<f64>, DetectorError> {
    let n = values.len();
    let weights = trend_filter(period);
    let half = weights.len() / 2;

    let mut trend = vec![0.0; n];
    for i in half..n - half {
        trend[i] = weights
            .iter()
            .zip(&values[i - half..=i + half])
            .map(|(w, v)| w * v)
            .sum();
    }

    // First and last indices holding a moving-average value
    let front = half;
    let back = n - 1 - half;
    let npoints = period;

    let front_last = (front + npoints).min(back);
    let front_fit = fit_range(&trend, front, front_last)?;
    for (i, slot) in trend.iter_mut().enumerate().take(front) {
        *slot = front_fit.0 * i as f64 + front_fit.1;
    }

    let back_first = front.max(back.saturating_sub(npoints));
    let back_fit = fit_range(&trend, back_first, back)?;
    for (i, slot) in trend.iter_mut().enumerate().skip(back + 1) {
        *slot = back_fit.0 * i as f64 + back_fit.1;
    }

    Ok(trend)
}

fn fit_range(trend: &[f64], start: usize, end: usize) -> Result<(f64, f64), DetectorError> {
    let points: Vec<(f64, f64)> = (start..end).map(|i| (i as f64, trend[i])).collect();
    least_squares_line(&points).ok_or(DetectorError::Extrapolation {
        available: points.len(),
    })
}

/// Mean detrended value per cycle position, re-centred to sum to zero
fn seasonal_pattern(detrended: &[f64], period: usize) -> Vec<f64> {
    let mut pattern: Vec<f64> = (0..period)
        .map(|pos| {
            let cycle: Vec<f64> = detrended.iter().skip(pos).step_by(period).copied().collect();
            cycle.iter().sum::<f64>() / cycle.len() as f64
        })
        .collect();

    let offset = pattern.iter().sum::<f64>() / period as f64;
    for value in pattern.iter_mut() {
        *value -= offset;
    }
    pattern
}

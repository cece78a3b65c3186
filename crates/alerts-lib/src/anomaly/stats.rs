//! Small numeric helpers shared by the detectors

/// Scale factor that makes MAD a consistent estimator of the standard deviation
pub const MAD_SCALE: f64 = 1.4826;

/// Median of `values`, `None` when empty
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median absolute deviation around `center`, scaled by [`MAD_SCALE`]
pub fn scaled_mad(values: &[f64], center: f64) -> Option<f64> {
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations).map(|mad| mad * MAD_SCALE)
}

/// Quantile `q` in `[0, 1]` with linear interpolation between order statistics
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Least-squares line through `(x, y)` points as `(slope, intercept)`
pub fn least_squares_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (x, y) in points {
        sxy += (x - mean_x) * (y - mean_y);
        sxx += (x - mean_x).powi(2);
    }

    if sxx.abs() < f64::EPSILON {
        return None;
    }

    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

/// Round to a fixed number of decimals
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_scaled_mad() {
        // deviations from 3: 2, 1, 0, 1, 2 -> median 1
        let mad = scaled_mad(&[1.0, 2.0, 3.0, 4.0, 5.0], 3.0).unwrap();
        assert!((mad - MAD_SCALE).abs() < 1e-12);
    }

    #[test]
    fn test_quantile_interpolates() {
        let values: Vec<f64> = (0..=10).map(|v| v as f64).collect();
        assert_eq!(quantile(&values, 0.5), Some(5.0));
        assert!((quantile(&values, 0.95).unwrap() - 9.5).abs() < 1e-12);
        assert_eq!(quantile(&values, 1.0), Some(10.0));
        assert_eq!(quantile(&values, 1.5), None);
    }

    #[test]
    fn test_least_squares_line() {
        let points: Vec<(f64, f64)> = (0..5).map(|x| (x as f64, 2.0 * x as f64 + 1.0)).collect();
        let (slope, intercept) = least_squares_line(&points).unwrap();
        assert!((slope - 2.0).abs() < 1e-12);
        assert!((intercept - 1.0).abs() < 1e-12);

        assert!(least_squares_line(&[(1.0, 1.0)]).is_none());
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(3.14159, 2), 3.14);
        assert_eq!(round_to(0.71236, 4), 0.7124);
    }
}

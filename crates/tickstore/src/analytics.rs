//! Numerical kernels over tick values.
//!
//! Pure functions over slices of doubles, typically fed with the values of a
//! [`read_range`](crate::StorageEngine::read_range) result. Degenerate
//! parameters (zero window, window longer than the input, alpha outside
//! `[0, 1]`) yield an empty vector rather than an error.

/// Simple moving average with the given window.
///
/// Returns one value per full window, i.e. `values.len() - window + 1`
/// entries; empty when `window == 0` or the input is shorter than `window`.
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || values.len() < window {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - window + 1);
    let mut sum: f64 = values[..window].iter().sum();
    out.push(sum / window as f64);

    for i in window..values.len() {
        sum += values[i] - values[i - window];
        out.push(sum / window as f64);
    }
    out
}

/// Exponential moving average with smoothing factor `alpha`.
///
/// Seeded with the first value, then `ema = alpha * x + (1 - alpha) * ema`.
/// Returns one entry per input value; empty for an empty input or an alpha
/// outside `[0, 1]`.
pub fn exponential_moving_average(values: &[f64], alpha: f64) -> Vec<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&alpha) {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len());
    let mut ema = values[0];
    out.push(ema);

    for &value in &values[1..] {
        ema = alpha * value + (1.0 - alpha) * ema;
        out.push(ema);
    }
    out
}

/// Rolling population standard deviation with the given window.
///
/// Same length convention as [`moving_average`].
pub fn rolling_std_dev(values: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || values.len() < window {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - window + 1);
    for chunk in values.windows(window) {
        let mean = chunk.iter().sum::<f64>() / window as f64;
        let variance = chunk.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / window as f64;
        out.push(variance.sqrt());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "expected {e}, got {a}");
        }
    }

    #[test]
    fn test_moving_average_basic() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_close(&moving_average(&values, 2), &[1.5, 2.5, 3.5, 4.5]);
        assert_close(&moving_average(&values, 5), &[3.0]);
    }

    #[test]
    fn test_moving_average_degenerate() {
        assert!(moving_average(&[1.0, 2.0], 0).is_empty());
        assert!(moving_average(&[1.0, 2.0], 3).is_empty());
        assert!(moving_average(&[], 1).is_empty());
    }

    #[test]
    fn test_ema_constant_series_is_constant() {
        let values = [5.0; 10];
        assert_close(&exponential_moving_average(&values, 0.3), &values);
    }

    #[test]
    fn test_ema_basic() {
        let values = [1.0, 2.0, 3.0];
        // 1.0, then 0.5*2 + 0.5*1 = 1.5, then 0.5*3 + 0.5*1.5 = 2.25
        assert_close(&exponential_moving_average(&values, 0.5), &[1.0, 1.5, 2.25]);
    }

    #[test]
    fn test_ema_invalid_alpha() {
        assert!(exponential_moving_average(&[1.0], -0.1).is_empty());
        assert!(exponential_moving_average(&[1.0], 1.1).is_empty());
    }

    #[test]
    fn test_rolling_std_dev_constant_is_zero() {
        let values = [7.0; 6];
        assert_close(&rolling_std_dev(&values, 3), &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rolling_std_dev_basic() {
        // Window [2, 4, 4, 4, 5, 5, 7, 9] has mean 5 and population std dev 2.
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_close(&rolling_std_dev(&values, 8), &[2.0]);
    }

    #[test]
    fn test_rolling_std_dev_degenerate() {
        assert!(rolling_std_dev(&[1.0], 0).is_empty());
        assert!(rolling_std_dev(&[1.0], 2).is_empty());
    }
}

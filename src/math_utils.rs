//! Mathematical utility functions for the estimators.
//!
//! Floating-point helpers used *after* the fixed-point stages: the log-log
//! and divergence regressions, robust aggregation of per-pair slopes, the
//! normal CDF used by the risk forecast, and DFA box-size generation.

use crate::errors::{NldError, NldResult};

/// Numerical constants shared by the helpers.
pub mod constants {
    /// Default tolerance for approximate comparisons
    pub const DEFAULT_EPSILON: f64 = 1e-12;
    /// Smallest argument accepted by `safe_ln`
    pub const MIN_LOG_VALUE: f64 = 1e-300;
    /// Smallest predictor spread accepted by the regression
    pub const MIN_VARIANCE: f64 = 1e-14;
    /// Tukey fence multiplier for IQR trimming
    pub const IQR_FENCE: f64 = 1.5;
}

/// Safe floating point comparison functions
pub mod float_ops {
    use super::constants::{DEFAULT_EPSILON, MIN_LOG_VALUE};

    /// Check if a floating point number is approximately zero
    #[inline]
    pub fn approx_zero(x: f64) -> bool {
        x.abs() < DEFAULT_EPSILON
    }

    /// Check if a floating point number is approximately zero with custom epsilon
    #[inline]
    pub fn approx_zero_eps(x: f64, epsilon: f64) -> bool {
        x.abs() < epsilon
    }

    /// Division that refuses near-zero denominators and non-finite inputs
    pub fn safe_div(numerator: f64, denominator: f64) -> Option<f64> {
        if approx_zero(denominator) || !numerator.is_finite() || !denominator.is_finite() {
            None
        } else {
            Some(numerator / denominator)
        }
    }

    /// Logarithm that refuses non-positive and non-finite arguments
    pub fn safe_ln(x: f64) -> Option<f64> {
        if x > MIN_LOG_VALUE && x.is_finite() {
            Some(x.ln())
        } else {
            None
        }
    }

    /// Replace NaN and infinities with zero
    #[inline]
    pub fn finite_or_zero(x: f64) -> f64 {
        if x.is_finite() {
            x
        } else {
            0.0
        }
    }
}

/// Total order on floats with NaN sorted last
pub fn float_total_cmp(a: &f64, b: &f64) -> std::cmp::Ordering {
    a.partial_cmp(b).unwrap_or_else(|| match (a.is_nan(), b.is_nan()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        _ => std::cmp::Ordering::Less,
    })
}

/// Arithmetic mean; zero for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Median (averages the middle pair for even lengths); NaN when empty.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(float_total_cmp);
    percentile(&sorted, 0.5)
}

/// Percentile of sorted data with linear interpolation, `p` in `[0, 1]`.
pub fn percentile(sorted_data: &[f64], p: f64) -> f64 {
    if sorted_data.is_empty() {
        return f64::NAN;
    }
    if p <= 0.0 {
        return sorted_data[0];
    }
    if p >= 1.0 {
        return sorted_data[sorted_data.len() - 1];
    }

    let index = p * (sorted_data.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;
    if lower == upper {
        sorted_data[lower]
    } else {
        let weight = index - lower as f64;
        sorted_data[lower] * (1.0 - weight) + sorted_data[upper] * weight
    }
}

/// Drop values outside the Tukey fences `[Q1 - 1.5·IQR, Q3 + 1.5·IQR]`.
///
/// Non-finite values are always dropped. With fewer than four finite values
/// the quartiles are meaningless and the finite values are returned as-is.
pub fn iqr_filter(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.len() < 4 {
        return sorted;
    }
    sorted.sort_by(float_total_cmp);

    let q1 = percentile(&sorted, 0.25);
    let q3 = percentile(&sorted, 0.75);
    let spread = q3 - q1;
    let low = q1 - constants::IQR_FENCE * spread;
    let high = q3 + constants::IQR_FENCE * spread;
    sorted.retain(|&v| v >= low && v <= high);
    sorted
}

/// Result of a simple linear regression `y = intercept + slope·x`.
#[derive(Debug, Clone, PartialEq)]
pub struct OlsFit {
    /// Estimated slope
    pub slope: f64,
    /// Estimated intercept
    pub intercept: f64,
    /// Standard error of the slope (zero when there are no residual degrees of freedom)
    pub std_error: f64,
    /// Coefficient of determination
    pub r_squared: f64,
    /// Residuals `y - ŷ`
    pub residuals: Vec<f64>,
}

/// Ordinary least squares on centred data.
///
/// Centring before forming the cross products avoids the cancellation of the
/// textbook `n∑xy − ∑x∑y` form when `x` is large with small spread (log box
/// sizes, step indices offset from zero).
///
/// # Errors
/// - [`NldError::InsufficientData`] for mismatched lengths or fewer than 2 points
/// - [`NldError::NumericalError`] for non-finite data or a constant predictor
///
/// # Example
/// ```rust
/// use nld_q15::math_utils::ols_regression;
///
/// let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
/// let y = vec![2.0, 4.0, 6.0, 8.0, 10.0];
/// let fit = ols_regression(&x, &y).unwrap();
/// assert!((fit.slope - 2.0).abs() < 1e-10);
/// ```
pub fn ols_regression(x: &[f64], y: &[f64]) -> NldResult<OlsFit> {
    if x.len() != y.len() || x.len() < 2 {
        return Err(NldError::InsufficientData {
            required: 2,
            actual: x.len().min(y.len()),
        });
    }
    if !x.iter().chain(y).all(|v| v.is_finite()) {
        return Err(NldError::NumericalError {
            reason: "Non-finite values in regression data".to_string(),
            operation: Some("ols_regression".to_string()),
        });
    }

    let n = x.len() as f64;
    let mean_x = mean(x);
    let mean_y = mean(y);

    let (sxy, sxx, syy) = x.iter().zip(y).fold((0.0, 0.0, 0.0), |(sxy, sxx, syy), (xi, yi)| {
        let dx = xi - mean_x;
        let dy = yi - mean_y;
        (sxy + dx * dy, sxx + dx * dx, syy + dy * dy)
    });

    if float_ops::approx_zero_eps(sxx, constants::MIN_VARIANCE) {
        return Err(NldError::NumericalError {
            reason: "Predictor variable has zero variance (constant values)".to_string(),
            operation: Some("ols_regression".to_string()),
        });
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let residuals: Vec<f64> = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| yi - (intercept + slope * xi))
        .collect();
    let rss: f64 = residuals.iter().map(|r| r * r).sum();

    let std_error = if x.len() > 2 {
        (rss / (n - 2.0) / sxx).sqrt()
    } else {
        0.0
    };
    let r_squared = if float_ops::approx_zero(syy) {
        1.0
    } else {
        (1.0 - rss / syy).clamp(0.0, 1.0)
    };

    Ok(OlsFit {
        slope,
        intercept,
        std_error,
        r_squared,
        residuals,
    })
}

/// Standard normal cumulative distribution function, Φ(x) = ½(1 + erf(x/√2)).
///
/// Maximum absolute error about 1.5e-7; saturates to exactly 0 and 1 beyond ±8.
pub fn standard_normal_cdf(x: f64) -> f64 {
    if x.is_nan() {
        return 0.5;
    }
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }
    (0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))).clamp(0.0, 1.0)
}

/// Error function, Abramowitz & Stegun formula 7.1.26.
pub fn erf(x: f64) -> f64 {
    if x == 0.0 {
        return 0.0;
    }
    if x.abs() > 6.0 {
        return x.signum();
    }

    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

/// Logarithmically spaced DFA box sizes.
///
/// The effective maximum is `min(max_box, ⌊max_fraction · n⌋)`. Sizes are
/// rounded to integers and deduplicated, so fewer than `count` sizes may be
/// returned. Empty when the effective maximum is below `min_box`.
pub fn generate_box_sizes(
    n: usize,
    min_box: usize,
    max_box: usize,
    max_fraction: f64,
    count: usize,
) -> Vec<usize> {
    let effective_max = max_box.min((max_fraction * n as f64).floor() as usize);
    if min_box == 0 || effective_max < min_box {
        return Vec::new();
    }
    if count < 2 || effective_max == min_box {
        return vec![min_box];
    }

    let log_min = (min_box as f64).ln();
    let step = ((effective_max as f64).ln() - log_min) / (count - 1) as f64;
    let mut sizes: Vec<usize> = Vec::with_capacity(count);
    for i in 0..count {
        let size = ((log_min + step * i as f64).exp().round() as usize).clamp(min_box, effective_max);
        if sizes.last().map_or(true, |&last| size > last) {
            sizes.push(size);
        }
    }
    sizes
}

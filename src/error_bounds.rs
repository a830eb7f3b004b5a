//! Analytical Q15 error bounds and empirical comparison.
//!
//! With ε = 2⁻¹⁵ the quantization step:
//!
//! - distance error: δd = √m · 2ε
//! - log-distance error: δ(ln d) = δd / d_min
//! - LyE slope error (3σ over N samples): δλ = 3 · δ(ln d) / √N
//! - cumulative-sum error: δY = k · ε
//! - DFA α error: δα = 2 · δY / (N · √scales)
//!
//! These are first-order bounds on the arithmetic only; estimator variance
//! from the data itself is not included. [`QuantizationErrorReport`] puts a
//! Q15 estimate next to its `f64` reference so the bound can be checked on
//! real signals.

use crate::config::{Algorithm, AnalysisConfig};
use crate::engine::{NonlinearDynamicsEngine, StreamContext};
use crate::errors::{validate_parameter, validate_range, NldError, NldResult};
use crate::fixed_point::Q15_EPSILON;
use crate::math_utils::generate_box_sizes;
use crate::reference::{dfa_reference, lyapunov_reference};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Euclidean distance error of an `m`-dimensional Q15 vector pair.
pub fn distance_error_bound(embedding_dimension: usize) -> f64 {
    (embedding_dimension as f64).sqrt() * 2.0 * Q15_EPSILON
}

/// Error of `ln d` for distances no smaller than `min_distance`.
pub fn log_distance_error_bound(embedding_dimension: usize, min_distance: f64) -> f64 {
    distance_error_bound(embedding_dimension) / min_distance
}

/// Three-sigma bound on the LyE slope over `window_len` samples.
pub fn lyapunov_error_bound(embedding_dimension: usize, min_distance: f64, window_len: usize) -> f64 {
    3.0 * log_distance_error_bound(embedding_dimension, min_distance) / (window_len as f64).sqrt()
}

/// Accumulated quantization error after `k` cumulative-sum steps.
pub fn cumulative_sum_error_bound(k: usize) -> f64 {
    k as f64 * Q15_EPSILON
}

/// Bound on the DFA exponent over `window_len` samples and `scales` box sizes.
pub fn dfa_error_bound(window_len: usize, scales: usize) -> f64 {
    2.0 * cumulative_sum_error_bound(window_len) / (window_len as f64 * (scales as f64).sqrt())
}

/// All bounds for one window length.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ErrorBounds {
    /// δd
    pub distance: f64,
    /// δ(ln d)
    pub log_distance: f64,
    /// δλ per sample step
    pub lyapunov: f64,
    /// δY at the end of the window
    pub cumulative_sum: f64,
    /// δα
    pub dfa_alpha: f64,
}

impl ErrorBounds {
    /// Bounds for a configuration and window length.
    ///
    /// `min_distance` is the smallest distance expected to enter the
    /// divergence fit; it defaults to the configured floor when `None`.
    pub fn for_window(
        config: &AnalysisConfig,
        window_len: usize,
        min_distance: Option<f64>,
    ) -> NldResult<Self> {
        validate_range(window_len, 2, usize::MAX, "window_len")?;
        let d_min = min_distance.unwrap_or(config.min_distance);
        validate_parameter(d_min, f64::MIN_POSITIVE, 1.0, "min_distance")?;

        let m = config.embedding_dimension;
        let scales = generate_box_sizes(
            window_len,
            config.min_box_size,
            config.max_box_size,
            config.max_box_fraction,
            config.box_size_count,
        )
        .len()
        .max(1);

        Ok(Self {
            distance: distance_error_bound(m),
            log_distance: log_distance_error_bound(m, d_min),
            lyapunov: lyapunov_error_bound(m, d_min, window_len),
            cumulative_sum: cumulative_sum_error_bound(window_len),
            dfa_alpha: dfa_error_bound(window_len, scales),
        })
    }

    /// Bound that applies to an estimator's output.
    pub fn for_algorithm(&self, algorithm: Algorithm) -> f64 {
        match algorithm {
            Algorithm::Lyapunov => self.lyapunov,
            Algorithm::Dfa => self.dfa_alpha,
        }
    }
}

/// Q15 estimate against its `f64` reference.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QuantizationErrorReport {
    /// Estimator compared
    pub algorithm: Algorithm,
    /// Fixed-point estimate
    pub q15_value: f64,
    /// Double-precision estimate
    pub reference_value: f64,
    /// |q15 − reference|
    pub absolute_error: f64,
    /// Analytical bound for the estimator
    pub bound: f64,
    /// `absolute_error <= bound`
    pub within_bound: bool,
    /// Saturation events during the Q15 run
    pub saturation_events: u64,
}

impl QuantizationErrorReport {
    /// Run both estimators on `signal` (real values in [-1, 1)) and compare.
    ///
    /// Fails when either side cannot produce an estimate.
    pub fn compare(
        engine: &NonlinearDynamicsEngine,
        algorithm: Algorithm,
        signal: &[f64],
        stream: &mut StreamContext,
    ) -> NldResult<Self> {
        let config = engine.config();
        let reference_value = match algorithm {
            Algorithm::Lyapunov => lyapunov_reference(signal, config)?,
            Algorithm::Dfa => dfa_reference(signal, config)?,
        };
        let result = engine.analyze_real(algorithm, signal, stream);
        if result.is_neutral() {
            return Err(NldError::NumericalError {
                reason: format!(
                    "fixed-point {:?} produced a neutral result ({:?})",
                    algorithm, result.metrics.flags
                ),
                operation: Some("QuantizationErrorReport::compare".to_string()),
            });
        }

        let bound = ErrorBounds::for_window(config, signal.len(), None)?.for_algorithm(algorithm);
        let absolute_error = (result.value - reference_value).abs();
        Ok(Self {
            algorithm,
            q15_value: result.value,
            reference_value,
            absolute_error,
            bound,
            within_bound: absolute_error <= bound,
            saturation_events: result.metrics.saturation_events,
        })
    }
}

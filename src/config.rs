//! # Analysis Configuration
//!
//! Configuration for a LyE / DFA analysis: the signal family, the
//! quality-versus-speed trade-off, and the numeric parameters of both
//! estimators. A configuration is validated once, before any computation;
//! invalid parameters are the only hard failure of the analysis API.

use crate::errors::{validate_parameter, validate_range, NldError, NldResult};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Signal family. Selects default embedding parameters and monitor thresholds;
/// it never changes algorithm semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SignalType {
    /// Gait / body-worn accelerometer magnitude (50 Hz)
    Accelerometer,
    /// Electrocardiogram
    Ecg,
    /// Electroencephalogram
    Eeg,
    /// Anything else
    #[default]
    General,
}

impl SignalType {
    /// Default `(embedding_dimension, time_delay)` for this signal family.
    pub fn default_embedding(self) -> (usize, usize) {
        match self {
            SignalType::Accelerometer => (5, 4),
            SignalType::Ecg => (4, 6),
            SignalType::Eeg => (7, 2),
            SignalType::General => (5, 4),
        }
    }
}

/// Quality-versus-speed trade-off applied to the pipeline bottleneck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QualityMode {
    /// Reduce work aggressively on the bottleneck stage
    HighSpeed,
    /// Moderate reduction on the bottleneck stage (default)
    #[default]
    Balanced,
    /// Never reduce work
    HighAccuracy,
}

impl QualityMode {
    /// Accuracy target handed to every stage.
    pub fn quality_target(self) -> f64 {
        match self {
            QualityMode::HighSpeed => 0.80,
            QualityMode::Balanced => 0.90,
            QualityMode::HighAccuracy => 0.97,
        }
    }

    /// Work-reduction factor applied to a stage running in aggressive mode.
    pub fn reduction_factor(self) -> usize {
        match self {
            QualityMode::HighSpeed => 4,
            QualityMode::Balanced => 2,
            QualityMode::HighAccuracy => 1,
        }
    }

    /// Whether the bottleneck stage may switch to aggressive mode.
    pub fn allows_aggressive(self) -> bool {
        !matches!(self, QualityMode::HighAccuracy)
    }
}

/// Which estimator a pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Algorithm {
    /// Largest Lyapunov exponent (Rosenstein)
    Lyapunov,
    /// Detrended fluctuation analysis exponent (Peng)
    Dfa,
}

// ============================================================================
// CONSTANTS
// ============================================================================

/// Smallest meaningful embedding dimension.
pub const MIN_EMBEDDING_DIMENSION: usize = 2;
/// Largest supported embedding dimension.
pub const MAX_EMBEDDING_DIMENSION: usize = 32;
/// Default minimum number of embedding vectors for LyE.
pub const DEFAULT_MIN_EMBEDDING_VECTORS: usize = 30;
/// Default Theiler window in samples.
pub const DEFAULT_THEILER_WINDOW: usize = 30;
/// Default number of divergence steps tracked per pair.
pub const DEFAULT_DIVERGENCE_STEPS: usize = 15;
/// Minimum valid log-distance samples for a pair to count.
pub const DEFAULT_MIN_DIVERGENCE_POINTS: usize = 5;
/// Default distance floor in real units (about 8 quantization steps).
pub const DEFAULT_MIN_DISTANCE: f64 = 1.0 / 4096.0;
/// Default headroom: scaled peaks land at 70 % of full scale.
pub const DEFAULT_HEADROOM: f64 = 0.70;

/// Complete parameter set for one analysis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnalysisConfig {
    /// Signal family (defaults and monitor thresholds)
    pub signal_type: SignalType,
    /// Quality-versus-speed trade-off
    pub quality_mode: QualityMode,
    /// Embedding dimension m
    pub embedding_dimension: usize,
    /// Embedding delay τ in samples
    pub time_delay: usize,
    /// Minimum temporal separation between neighbours, in samples
    pub theiler_window: usize,
    /// Divergence steps tracked per pair
    pub max_divergence_steps: usize,
    /// Minimum valid log-distances for a pair to be kept
    pub min_divergence_points: usize,
    /// Minimum embedding vectors before LyE is attempted
    pub min_embedding_vectors: usize,
    /// Distance floor in real units; distances at or below are ignored
    pub min_distance: f64,
    /// Smallest DFA box
    pub min_box_size: usize,
    /// Largest DFA box
    pub max_box_size: usize,
    /// Largest DFA box as a fraction of the window length
    pub max_box_fraction: f64,
    /// Number of log-spaced box sizes before deduplication
    pub box_size_count: usize,
    /// Sampling rate, used only for per-second LyE
    pub sampling_rate_hz: f64,
    /// Fraction of full scale targeted by the scaling engine
    pub headroom: f64,
    /// Pipeline runs considered when choosing the bottleneck stage
    pub bottleneck_window: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self::for_signal(SignalType::General)
    }
}

impl AnalysisConfig {
    /// Defaults for a signal family.
    pub fn for_signal(signal_type: SignalType) -> Self {
        let (embedding_dimension, time_delay) = signal_type.default_embedding();
        Self {
            signal_type,
            quality_mode: QualityMode::Balanced,
            embedding_dimension,
            time_delay,
            theiler_window: DEFAULT_THEILER_WINDOW,
            max_divergence_steps: DEFAULT_DIVERGENCE_STEPS,
            min_divergence_points: DEFAULT_MIN_DIVERGENCE_POINTS,
            min_embedding_vectors: DEFAULT_MIN_EMBEDDING_VECTORS,
            min_distance: DEFAULT_MIN_DISTANCE,
            min_box_size: 4,
            max_box_size: 64,
            max_box_fraction: 0.25,
            box_size_count: 10,
            sampling_rate_hz: 50.0,
            headroom: DEFAULT_HEADROOM,
            bottleneck_window: 8,
        }
    }

    /// Accelerometer preset (m = 5, τ = 4, 50 Hz).
    pub fn accelerometer() -> Self {
        Self::for_signal(SignalType::Accelerometer)
    }

    /// Set the quality mode.
    pub fn with_quality_mode(mut self, quality_mode: QualityMode) -> Self {
        self.quality_mode = quality_mode;
        self
    }

    /// Set embedding dimension and delay.
    pub fn with_embedding(mut self, embedding_dimension: usize, time_delay: usize) -> Self {
        self.embedding_dimension = embedding_dimension;
        self.time_delay = time_delay;
        self
    }

    /// Set the Theiler window.
    pub fn with_theiler_window(mut self, theiler_window: usize) -> Self {
        self.theiler_window = theiler_window;
        self
    }

    /// Set the number of divergence steps.
    pub fn with_divergence_steps(mut self, steps: usize) -> Self {
        self.max_divergence_steps = steps;
        self
    }

    /// Set the DFA box bounds.
    pub fn with_box_sizes(mut self, min_box_size: usize, max_box_size: usize) -> Self {
        self.min_box_size = min_box_size;
        self.max_box_size = max_box_size;
        self
    }

    /// Set the scaling headroom.
    pub fn with_headroom(mut self, headroom: f64) -> Self {
        self.headroom = headroom;
        self
    }

    /// Set the sampling rate.
    pub fn with_sampling_rate(mut self, sampling_rate_hz: f64) -> Self {
        self.sampling_rate_hz = sampling_rate_hz;
        self
    }

    /// Span of one embedding vector in samples, `(m - 1)·τ + 1`.
    pub fn embedding_span(&self) -> usize {
        (self.embedding_dimension - 1) * self.time_delay + 1
    }

    /// Embedding vectors a LyE window needs.
    ///
    /// At least `min_embedding_vectors`, and enough that one reference has a
    /// candidate beyond the Theiler window that can still be tracked for
    /// `min_divergence_points` steps.
    pub fn min_embedding_count(&self) -> usize {
        self.min_embedding_vectors
            .max(self.theiler_window + self.min_divergence_points + 1)
    }

    /// Shortest window for which the algorithm produces an unflagged attempt.
    pub fn min_signal_length(&self, algorithm: Algorithm) -> usize {
        match algorithm {
            Algorithm::Lyapunov => self.min_embedding_count() + self.embedding_span() - 1,
            // Two valid scales need the effective maximum box to exceed the minimum.
            Algorithm::Dfa => {
                ((self.min_box_size + 1) as f64 / self.max_box_fraction).ceil() as usize
            }
        }
    }

    /// Check every parameter, failing fast on the first violation.
    pub fn validate(&self) -> NldResult<()> {
        validate_range(
            self.embedding_dimension,
            MIN_EMBEDDING_DIMENSION,
            MAX_EMBEDDING_DIMENSION,
            "embedding_dimension",
        )?;
        validate_range(self.time_delay, 1, 256, "time_delay")?;
        validate_range(self.theiler_window, 0, 4096, "theiler_window")?;
        validate_range(self.max_divergence_steps, 2, 256, "max_divergence_steps")?;
        validate_range(self.min_divergence_points, 2, 256, "min_divergence_points")?;
        validate_range(self.min_embedding_vectors, 2, 1 << 20, "min_embedding_vectors")?;
        validate_parameter(self.min_distance, f64::MIN_POSITIVE, 0.5, "min_distance")?;
        validate_range(self.min_box_size, 3, 1 << 16, "min_box_size")?;
        validate_range(self.max_box_size, 3, 1 << 20, "max_box_size")?;
        validate_parameter(self.max_box_fraction, 0.01, 0.5, "max_box_fraction")?;
        validate_range(self.box_size_count, 2, 64, "box_size_count")?;
        validate_parameter(self.sampling_rate_hz, 1e-3, 1e6, "sampling_rate_hz")?;
        validate_parameter(self.headroom, 0.1, 0.95, "headroom")?;
        validate_range(self.bottleneck_window, 1, 1024, "bottleneck_window")?;

        if self.max_box_size < self.min_box_size {
            return Err(NldError::InvalidConfiguration {
                reason: format!(
                    "max_box_size ({}) must not be smaller than min_box_size ({})",
                    self.max_box_size, self.min_box_size
                ),
            });
        }
        if self.min_divergence_points > self.max_divergence_steps {
            return Err(NldError::InvalidConfiguration {
                reason: format!(
                    "min_divergence_points ({}) exceeds max_divergence_steps ({})",
                    self.min_divergence_points, self.max_divergence_steps
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        for signal in [
            SignalType::Accelerometer,
            SignalType::Ecg,
            SignalType::Eeg,
            SignalType::General,
        ] {
            assert!(AnalysisConfig::for_signal(signal).validate().is_ok());
        }
        let config = AnalysisConfig::accelerometer();
        assert_eq!(config.embedding_dimension, 5);
        assert_eq!(config.time_delay, 4);
        assert_eq!(config.headroom, DEFAULT_HEADROOM);
    }

    #[test]
    fn test_box_size_inversion_rejected() {
        let config = AnalysisConfig::default().with_box_sizes(16, 8);
        match config.validate() {
            Err(NldError::InvalidConfiguration { reason }) => {
                assert!(reason.contains("max_box_size"));
            }
            other => panic!("Expected InvalidConfiguration, got {:?}", other),
        }
    }

    #[test]
    fn test_embedding_dimension_lower_bound() {
        let config = AnalysisConfig::default().with_embedding(1, 4);
        match config.validate() {
            Err(NldError::InvalidParameter { parameter, .. }) => {
                assert_eq!(parameter, "embedding_dimension");
            }
            other => panic!("Expected InvalidParameter, got {:?}", other),
        }
        assert!(AnalysisConfig::default().with_embedding(5, 0).validate().is_err());
        assert!(AnalysisConfig::default().with_headroom(1.2).validate().is_err());
    }

    #[test]
    fn test_min_signal_length() {
        let config = AnalysisConfig::accelerometer();
        assert_eq!(config.embedding_span(), 17);
        // 30 + 5 + 1 vectors: one reference must see a candidate past the
        // Theiler window with room for 5 tracked steps.
        assert_eq!(config.min_embedding_count(), 36);
        assert_eq!(config.min_signal_length(Algorithm::Lyapunov), 52);
        assert_eq!(config.min_signal_length(Algorithm::Dfa), 20);

        // A narrow Theiler window leaves the configured vector minimum in charge.
        let narrow = config.with_theiler_window(10);
        assert_eq!(narrow.min_embedding_count(), 30);
        assert_eq!(narrow.min_signal_length(Algorithm::Lyapunov), 46);
    }

    #[test]
    fn test_quality_mode_mapping() {
        assert!(QualityMode::HighSpeed.quality_target() < QualityMode::Balanced.quality_target());
        assert!(QualityMode::Balanced.quality_target() < QualityMode::HighAccuracy.quality_target());
        assert!(!QualityMode::HighAccuracy.allows_aggressive());
        assert_eq!(QualityMode::HighAccuracy.reduction_factor(), 1);
        assert!(QualityMode::HighSpeed.reduction_factor() > QualityMode::Balanced.reduction_factor());
    }
}

//! Analysis entry points.
//!
//! [`NonlinearDynamicsEngine`] is immutable after construction and can be
//! shared freely between threads. Everything that remembers history (range
//! monitor, per-stage scale factors, bottleneck timings) lives in a
//! [`StreamContext`], one per signal stream, passed by `&mut` to each call.
//!
//! A call returns either a configuration error at construction time or, for
//! any data, a well-formed [`CalculationResult`]. Short and degenerate
//! windows yield the neutral value 0 with [`QualityFlag`]s.

use crate::config::{Algorithm, AnalysisConfig};
use crate::coordinator::{
    CrossStageCoordinator, PipelineStage, QualityFlag, StageKernel, StagePayload, StageResult,
};
use crate::dfa::DfaKernel;
use crate::errors::NldResult;
use crate::fixed_point::{SaturationCounter, Q15};
use crate::lyapunov::LyapunovKernel;
use crate::math_utils::float_ops::finite_or_zero;
use crate::range_monitor::DynamicRangeMonitor;
use crate::scaling::{AdaptiveScalingEngine, ScalingConfig};
use log::{debug, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Saturation rate above which a result is flagged.
pub const MAX_SATURATION_RATE: f64 = 0.05;

/// Per-call diagnostics.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalculationMetrics {
    /// Wall time of the whole call
    pub processing_time: Duration,
    /// Product of the scale-in factors applied along the pipeline
    pub cumulative_scale: f64,
    /// Mean stage quality, 0 for a neutral result
    pub quality_score: f64,
    /// Executed stages
    pub stage_breakdown: Vec<StageResult>,
    /// Quality conditions
    pub flags: Vec<QualityFlag>,
    /// Saturating operations
    pub saturation_events: u64,
    /// Saturating operations as a fraction of counted operations
    pub saturation_rate: f64,
}

/// Result of one analysis call.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalculationResult {
    /// Estimator that produced the value
    pub algorithm: Algorithm,
    /// λ per sample step (LyE) or α (DFA); 0 when neutral
    pub value: f64,
    /// Diagnostics
    pub metrics: CalculationMetrics,
}

impl CalculationResult {
    /// Whether a flag is present.
    pub fn has_flag(&self, flag: QualityFlag) -> bool {
        self.metrics.flags.contains(&flag)
    }

    /// Whether the value is the neutral substitute.
    pub fn is_neutral(&self) -> bool {
        self.has_flag(QualityFlag::InsufficientData) || self.has_flag(QualityFlag::DegenerateSignal)
    }

    /// Value normalised to time: λ per second for LyE, α unchanged for DFA.
    pub fn per_second(&self, sampling_rate_hz: f64) -> f64 {
        match self.algorithm {
            Algorithm::Lyapunov => self.value * sampling_rate_hz,
            Algorithm::Dfa => self.value,
        }
    }
}

/// Mutable state of one signal stream.
#[derive(Debug, Clone)]
pub struct StreamContext {
    /// Sliding-window amplitude monitor
    pub monitor: DynamicRangeMonitor,
    /// Per-stage scale history
    pub scaling: AdaptiveScalingEngine,
    /// Bottleneck feedback across runs
    pub coordinator: CrossStageCoordinator,
}

impl StreamContext {
    /// Fresh context for a configuration.
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            monitor: DynamicRangeMonitor::for_signal(config.signal_type),
            scaling: AdaptiveScalingEngine::new(ScalingConfig::from_analysis(config)),
            coordinator: CrossStageCoordinator::new(config.quality_mode, config.bottleneck_window),
        }
    }
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new(&AnalysisConfig::default())
    }
}

/// LyE and DFA over Q15 windows.
#[derive(Debug, Clone)]
pub struct NonlinearDynamicsEngine {
    config: AnalysisConfig,
    lyapunov: LyapunovKernel,
    dfa: DfaKernel,
}

impl NonlinearDynamicsEngine {
    /// Validate the configuration and build the engine.
    pub fn new(config: AnalysisConfig) -> NldResult<Self> {
        config.validate()?;
        Ok(Self {
            lyapunov: LyapunovKernel::from_config(&config),
            dfa: DfaKernel::from_config(&config),
            config,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Fresh stream context matching this engine's configuration.
    pub fn new_stream(&self) -> StreamContext {
        StreamContext::new(&self.config)
    }

    /// Largest Lyapunov exponent (per sample step).
    pub fn lyapunov(&self, signal: &[Q15], stream: &mut StreamContext) -> CalculationResult {
        self.analyze(Algorithm::Lyapunov, signal, stream)
    }

    /// DFA scaling exponent α.
    pub fn dfa(&self, signal: &[Q15], stream: &mut StreamContext) -> CalculationResult {
        self.analyze(Algorithm::Dfa, signal, stream)
    }

    /// Run either estimator on a Q15 window.
    pub fn analyze(
        &self,
        algorithm: Algorithm,
        signal: &[Q15],
        stream: &mut StreamContext,
    ) -> CalculationResult {
        self.run(algorithm, signal, stream, SaturationCounter::new())
    }

    /// Quantize a real-valued window, then analyze it. Clamped input samples
    /// count as saturation events.
    pub fn analyze_real(
        &self,
        algorithm: Algorithm,
        values: &[f64],
        stream: &mut StreamContext,
    ) -> CalculationResult {
        let mut counter = SaturationCounter::new();
        let signal: Vec<Q15> = values.iter().map(|&v| counter.quantize(v)).collect();
        self.run(algorithm, &signal, stream, counter)
    }

    fn run(
        &self,
        algorithm: Algorithm,
        signal: &[Q15],
        stream: &mut StreamContext,
        mut saturation: SaturationCounter,
    ) -> CalculationResult {
        let start = Instant::now();
        let kernel: &dyn StageKernel = match algorithm {
            Algorithm::Lyapunov => &self.lyapunov,
            Algorithm::Dfa => &self.dfa,
        };
        let pipeline = stream.coordinator.process(
            signal,
            &PipelineStage::ALL,
            kernel,
            &mut stream.scaling,
            &mut stream.monitor,
        );
        saturation.merge(&pipeline.saturation);

        let mut flags = Vec::new();
        let value = match pipeline.final_output {
            StagePayload::Value(v) => Some(finite_or_zero(v)),
            StagePayload::Neutral(flag) => {
                flags.push(flag);
                None
            }
            _ => {
                warn!(
                    "{:?} pipeline ended after {} stages without a value",
                    algorithm, pipeline.stages_executed
                );
                flags.push(QualityFlag::DegenerateSignal);
                None
            }
        };

        let quality_score = match value {
            Some(_) if !pipeline.per_stage_results.is_empty() => {
                pipeline.per_stage_results.iter().map(|s| s.quality).sum::<f64>()
                    / pipeline.per_stage_results.len() as f64
            }
            _ => 0.0,
        };

        let saturation_rate = saturation.rate();
        if saturation_rate > MAX_SATURATION_RATE {
            warn!(
                "{:?}: {:.1}% of operations saturated",
                algorithm,
                saturation_rate * 100.0
            );
            flags.push(QualityFlag::HighSaturation);
        }
        if quality_score < self.config.quality_mode.quality_target() {
            flags.push(QualityFlag::LowQuality);
        }

        match value {
            Some(v) => debug!(
                "{:?}: value {:.5}, quality {:.3}, {} stages",
                algorithm, v, quality_score, pipeline.stages_executed
            ),
            None => warn!(
                "{:?}: neutral result for {}-sample window ({:?})",
                algorithm,
                signal.len(),
                flags
            ),
        }

        CalculationResult {
            algorithm,
            value: value.unwrap_or(0.0),
            metrics: CalculationMetrics {
                processing_time: start.elapsed(),
                cumulative_scale: pipeline.cumulative_scale,
                quality_score,
                stage_breakdown: pipeline.per_stage_results,
                flags,
                saturation_events: saturation.events(),
                saturation_rate,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalType;
    use crate::errors::NldError;
    use crate::fixed_point::to_q15;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_engine_is_shareable() {
        assert_send_sync::<NonlinearDynamicsEngine>();
    }

    #[test]
    fn test_invalid_configuration_rejected_up_front() {
        let config = AnalysisConfig::default().with_box_sizes(32, 8);
        assert!(matches!(
            NonlinearDynamicsEngine::new(config),
            Err(NldError::InvalidConfiguration { .. })
        ));
        let config = AnalysisConfig::default().with_embedding(1, 4);
        let err = NonlinearDynamicsEngine::new(config).unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_constant_window_is_neutral_and_flagged() {
        let engine = NonlinearDynamicsEngine::new(AnalysisConfig::accelerometer()).unwrap();
        let mut stream = engine.new_stream();
        let flat = vec![to_q15(0.25); 200];
        for algorithm in [Algorithm::Lyapunov, Algorithm::Dfa] {
            let result = engine.analyze(algorithm, &flat, &mut stream);
            assert_eq!(result.value, 0.0);
            assert!(result.has_flag(QualityFlag::DegenerateSignal));
            assert!(result.has_flag(QualityFlag::LowQuality));
            assert!(result.is_neutral());
        }
    }

    #[test]
    fn test_short_window_is_insufficient() {
        let engine = NonlinearDynamicsEngine::new(AnalysisConfig::for_signal(SignalType::Accelerometer))
            .unwrap();
        let mut stream = engine.new_stream();
        let short: Vec<Q15> = (0..10).map(|i| to_q15((i as f64 * 0.7).sin() * 0.5)).collect();
        let lye = engine.lyapunov(&short, &mut stream);
        assert!(lye.has_flag(QualityFlag::InsufficientData));
        assert_eq!(lye.metrics.stage_breakdown.len(), 1);
        let dfa = engine.dfa(&short, &mut stream);
        assert!(dfa.has_flag(QualityFlag::InsufficientData));
    }

    #[test]
    fn test_real_input_saturation_is_counted() {
        let engine = NonlinearDynamicsEngine::new(AnalysisConfig::default()).unwrap();
        let mut stream = engine.new_stream();
        let values: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 3.0 } else { -3.0 }).collect();
        let result = engine.analyze_real(Algorithm::Dfa, &values, &mut stream);
        assert!(result.metrics.saturation_events >= 200);
        assert!(result.has_flag(QualityFlag::HighSaturation));
    }

    #[test]
    fn test_per_second_scaling() {
        let result = CalculationResult {
            algorithm: Algorithm::Lyapunov,
            value: 0.02,
            metrics: CalculationMetrics {
                processing_time: Duration::ZERO,
                cumulative_scale: 1.0,
                quality_score: 1.0,
                stage_breakdown: Vec::new(),
                flags: Vec::new(),
                saturation_events: 0,
                saturation_rate: 0.0,
            },
        };
        assert!((result.per_second(50.0) - 1.0).abs() < 1e-12);
        let dfa = CalculationResult {
            algorithm: Algorithm::Dfa,
            ..result
        };
        assert_eq!(dfa.per_second(50.0), 0.02);
    }
}

//! Adaptive scaling into and out of Q15.
//!
//! [`AdaptiveScalingEngine`] picks a multiplicative factor per stage so the
//! scaled signal's peak lands at a configurable headroom below full scale,
//! remembers the factor per stage to bound how fast it may change, and
//! reverses the scaling with an optional statistical correction.
//!
//! Each scale-in produces a [`ScalingRecord`]. Records are move-only and are
//! consumed by value by the reverse operations, so a record cannot be applied
//! twice.

use crate::config::{AnalysisConfig, QualityMode};
use crate::errors::{validate_parameter, NldResult};
use crate::fixed_point::{peak_abs, to_q15_flagged, to_real, Q15, Q15_EPSILON, Q15_SCALE};
use crate::range_monitor::RangeStatus;
use log::{debug, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Largest representable Q15 magnitude in real units.
const FULL_SCALE: f64 = i16::MAX as f64 / Q15_SCALE;

/// Tuning of the scaling engine.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScalingConfig {
    /// Fraction of full scale the scaled peak should reach
    pub headroom: f64,
    /// Largest factor change per invocation for one stage (ratio)
    pub max_step_ratio: f64,
    /// Relative change below which the previous factor is kept
    pub deadband: f64,
    /// RMS round-trip error (real units) above which reversal compensates
    pub compensation_threshold: f64,
    /// Largest factor ever applied
    pub max_gain: f64,
    /// Smallest factor ever applied
    pub min_gain: f64,
    /// Accuracy target propagated to stage plans
    pub quality_target: f64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            headroom: crate::config::DEFAULT_HEADROOM,
            max_step_ratio: 2.0,
            deadband: 0.10,
            compensation_threshold: 0.25 * Q15_EPSILON,
            max_gain: 4096.0,
            min_gain: 1e-9,
            quality_target: QualityMode::Balanced.quality_target(),
        }
    }
}

impl ScalingConfig {
    /// Settings derived from an analysis configuration.
    pub fn from_analysis(config: &AnalysisConfig) -> Self {
        Self {
            headroom: config.headroom,
            quality_target: config.quality_mode.quality_target(),
            ..Self::default()
        }
    }

    /// Validate ranges.
    pub fn validate(&self) -> NldResult<()> {
        validate_parameter(self.headroom, 0.1, 0.95, "headroom")?;
        validate_parameter(self.max_step_ratio, 1.0, 1e6, "max_step_ratio")?;
        validate_parameter(self.deadband, 0.0, 0.5, "deadband")?;
        validate_parameter(self.compensation_threshold, 0.0, 1.0, "compensation_threshold")?;
        validate_parameter(self.min_gain, f64::MIN_POSITIVE, self.max_gain, "min_gain")?;
        validate_parameter(self.quality_target, 0.0, 1.0, "quality_target")
    }
}

/// Proof of one scale-in, needed to undo it.
///
/// Errors are in the real units of the *input* to the scale-in.
#[derive(Debug, PartialEq)]
pub struct ScalingRecord {
    /// Applied multiplicative factor
    pub scale_factor: f64,
    /// Stage that applied it
    pub stage_id: String,
    /// RMS error of the quantized round trip
    pub error_estimate: f64,
    /// Mean signed error of the quantized round trip
    pub bias: f64,
    /// Samples clamped during scale-in
    pub saturated: usize,
}

impl ScalingRecord {
    /// Record for a stage that did not rescale.
    pub fn identity(stage_id: &str) -> Self {
        Self {
            scale_factor: 1.0,
            stage_id: stage_id.to_string(),
            error_estimate: 0.0,
            bias: 0.0,
            saturated: 0,
        }
    }
}

/// Scale plan for one stage.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StageScalePlan {
    /// Stage identifier
    pub stage_id: String,
    /// Scale the stage should expect its input in (predecessor's output)
    pub expected_input_scale: f64,
    /// Scale the stage declares for its output
    pub declared_output_scale: f64,
    /// Accuracy target for the stage
    pub quality_target: f64,
}

/// Coordinated scale plan across an ordered list of stages.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScalingStrategy {
    /// Plans in pipeline order
    pub stages: Vec<StageScalePlan>,
}

impl ScalingStrategy {
    /// Plan for a stage, if present.
    pub fn plan_for(&self, stage_id: &str) -> Option<&StageScalePlan> {
        self.stages.iter().find(|p| p.stage_id == stage_id)
    }
}

/// Per-stream scaling engine.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveScalingEngine {
    config: ScalingConfig,
    history: HashMap<String, f64>,
}

impl AdaptiveScalingEngine {
    /// Engine with the given settings.
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            history: HashMap::new(),
        }
    }

    /// Active settings.
    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    /// Last factor applied by a stage.
    pub fn last_factor(&self, stage_id: &str) -> Option<f64> {
        self.history.get(stage_id).copied()
    }

    /// Forget all per-stage history.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Scale a Q15 signal so its peak sits at the headroom level.
    pub fn scale_signal(&mut self, signal: &[Q15], stage_id: &str) -> (Vec<Q15>, ScalingRecord) {
        self.scale_signal_inner(signal, stage_id, None)
    }

    /// As [`scale_signal`](Self::scale_signal), never exceeding the factor an
    /// `OverflowRisk` classification suggests.
    pub fn scale_signal_with_status(
        &mut self,
        signal: &[Q15],
        stage_id: &str,
        status: RangeStatus,
    ) -> (Vec<Q15>, ScalingRecord) {
        let ceiling = match status {
            RangeStatus::OverflowRisk(suggested) => Some(suggested),
            _ => None,
        };
        self.scale_signal_inner(signal, stage_id, ceiling)
    }

    fn scale_signal_inner(
        &mut self,
        signal: &[Q15],
        stage_id: &str,
        ceiling: Option<f64>,
    ) -> (Vec<Q15>, ScalingRecord) {
        let peak = peak_abs(signal) as f64 / Q15_SCALE;
        let factor = self.choose_factor(self.last_factor(stage_id), peak, ceiling);
        self.history.insert(stage_id.to_string(), factor);
        let inputs = signal.iter().map(|&s| to_real(s));
        let (scaled, record) = apply_factor(inputs, signal.len(), factor, stage_id);
        debug!(
            "stage {}: scale factor {:.5} for peak {:.5}",
            stage_id, factor, peak
        );
        (scaled, record)
    }

    /// Scale wide accumulator outputs (raw Q15 units held in `i64`) into Q15.
    ///
    /// Used for quantities such as the DFA profile whose magnitude exceeds
    /// the Q15 range; the factor is typically well below one.
    pub fn scale_wide(&mut self, values: &[i64], stage_id: &str) -> (Vec<Q15>, ScalingRecord) {
        let peak = values.iter().map(|v| v.unsigned_abs()).max().unwrap_or(0) as f64 / Q15_SCALE;
        let factor = self.choose_factor(self.last_factor(stage_id), peak, None);
        self.history.insert(stage_id.to_string(), factor);
        let inputs = values.iter().map(|&v| v as f64 / Q15_SCALE);
        let (scaled, record) = apply_factor(inputs, values.len(), factor, stage_id);
        debug!(
            "stage {}: wide scale factor {:.6e} for peak {:.3}",
            stage_id, factor, peak
        );
        (scaled, record)
    }

    /// Scale several independent signals for the same stage.
    ///
    /// Every item is scaled against the stage history as it stood before the
    /// batch; the history then records the last item's factor.
    pub fn scale_batch(
        &mut self,
        signals: &[Vec<Q15>],
        stage_id: &str,
    ) -> Vec<(Vec<Q15>, ScalingRecord)> {
        let previous = self.last_factor(stage_id);
        let mut last = previous;
        let results = signals
            .iter()
            .map(|signal| {
                let peak = peak_abs(signal) as f64 / Q15_SCALE;
                let factor = self.choose_factor(previous, peak, None);
                last = Some(factor);
                let inputs = signal.iter().map(|&s| to_real(s));
                apply_factor(inputs, signal.len(), factor, stage_id)
            })
            .collect();
        if let Some(factor) = last {
            self.history.insert(stage_id.to_string(), factor);
        }
        results
    }

    /// Pick a factor for a signal of the given peak (real units).
    ///
    /// Order: headroom target, monitor ceiling, rate limit against the
    /// previous factor, and finally the saturation-safe ceiling, which wins
    /// over the rate limit.
    fn choose_factor(&self, previous: Option<f64>, peak: f64, ceiling: Option<f64>) -> f64 {
        let cfg = &self.config;
        let mut desired = if peak > 0.0 {
            cfg.headroom / peak
        } else {
            previous.unwrap_or(1.0)
        };
        if let Some(limit) = ceiling.filter(|c| c.is_finite() && *c > 0.0) {
            desired = desired.min(limit);
        }
        desired = desired.clamp(cfg.min_gain, cfg.max_gain);

        let mut factor = match previous {
            Some(prev) if prev > 0.0 => {
                let ratio = desired / prev;
                if (ratio - 1.0).abs() <= cfg.deadband {
                    prev
                } else {
                    prev * ratio.clamp(1.0 / cfg.max_step_ratio, cfg.max_step_ratio)
                }
            }
            _ => desired,
        };

        if peak > 0.0 {
            factor = factor.min(FULL_SCALE / peak);
        }
        factor.clamp(cfg.min_gain, cfg.max_gain)
    }

    fn compensation_active(&self, record: &ScalingRecord) -> bool {
        record.error_estimate > self.config.compensation_threshold
    }

    /// Undo a scale-in, consuming its record.
    ///
    /// When the recorded round-trip error exceeds the compensation threshold
    /// the recorded bias is subtracted from every value.
    pub fn reverse_scale(&self, signal: &[Q15], record: ScalingRecord) -> Vec<f64> {
        let factor = record.scale_factor;
        let bias = if self.compensation_active(&record) {
            record.bias
        } else {
            0.0
        };
        signal.iter().map(|&s| to_real(s) / factor - bias).collect()
    }

    /// Undo a scale-in for magnitudes (RMS values, distances).
    ///
    /// Quantization noise adds variance rather than bias to a magnitude, so
    /// the correction is `√max(v² − g·σ², 0)` where σ is the recorded RMS
    /// error and `g` the noise gain of the stage that produced the values.
    pub fn reverse_magnitudes(
        &self,
        values: &[f64],
        record: ScalingRecord,
        noise_gain: f64,
    ) -> Vec<f64> {
        let factor = record.scale_factor;
        let noise_var = if self.compensation_active(&record) {
            noise_gain.max(0.0) * record.error_estimate * record.error_estimate
        } else {
            0.0
        };
        values
            .iter()
            .map(|&v| {
                let physical = v / factor;
                (physical * physical - noise_var).max(0.0).sqrt()
            })
            .collect()
    }

    /// Undo a scale-in for natural logs of magnitudes.
    ///
    /// Equivalent to [`reverse_magnitudes`](Self::reverse_magnitudes) in the
    /// log domain; a magnitude compensated to zero becomes negative infinity.
    pub fn reverse_log_magnitudes(
        &self,
        log_values: &[f64],
        record: ScalingRecord,
        noise_gain: f64,
    ) -> Vec<f64> {
        let offset = record.scale_factor.ln();
        if !self.compensation_active(&record) {
            return log_values.iter().map(|&l| l - offset).collect();
        }
        let noise_var = noise_gain.max(0.0) * record.error_estimate * record.error_estimate;
        log_values
            .iter()
            .map(|&l| {
                let physical = (l - offset).exp();
                0.5 * (physical * physical - noise_var).max(0.0).ln()
            })
            .collect()
    }

    /// Precompute a plan across stages, seeding each stage's expected input
    /// scale from its predecessor's declared output scale.
    pub fn scaling_strategy(&self, stage_ids: &[&str]) -> ScalingStrategy {
        let mut inherited = 1.0;
        let stages = stage_ids
            .iter()
            .map(|&stage_id| {
                let expected_input_scale = inherited;
                let declared_output_scale =
                    self.last_factor(stage_id).unwrap_or(expected_input_scale);
                inherited = declared_output_scale;
                StageScalePlan {
                    stage_id: stage_id.to_string(),
                    expected_input_scale,
                    declared_output_scale,
                    quality_target: self.config.quality_target,
                }
            })
            .collect();
        ScalingStrategy { stages }
    }
}

/// Quantize `inputs · factor` and measure the round-trip error.
fn apply_factor(
    inputs: impl Iterator<Item = f64>,
    len: usize,
    factor: f64,
    stage_id: &str,
) -> (Vec<Q15>, ScalingRecord) {
    let mut scaled = Vec::with_capacity(len);
    let mut saturated = 0usize;
    let mut error_sum = 0.0;
    let mut error_sq_sum = 0.0;

    for x in inputs {
        let (q, clipped) = to_q15_flagged(x * factor);
        saturated += clipped as usize;
        let error = to_real(q) / factor - x;
        error_sum += error;
        error_sq_sum += error * error;
        scaled.push(q);
    }

    let n = scaled.len().max(1) as f64;
    if saturated > 0 {
        warn!(
            "stage {}: {} of {} samples saturated during scale-in",
            stage_id,
            saturated,
            scaled.len()
        );
    }

    let record = ScalingRecord {
        scale_factor: factor,
        stage_id: stage_id.to_string(),
        error_estimate: (error_sq_sum / n).sqrt(),
        bias: error_sum / n,
        saturated,
    };
    (scaled, record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_point::to_q15;
    use assert_approx_eq::assert_approx_eq;

    fn tone(amplitude: f64, len: usize) -> Vec<Q15> {
        (0..len)
            .map(|i| to_q15(amplitude * (i as f64 * 0.37).sin()))
            .collect()
    }

    #[test]
    fn test_peak_lands_at_headroom() {
        let mut engine = AdaptiveScalingEngine::default();
        let signal = tone(0.2, 200);
        let (scaled, record) = engine.scale_signal(&signal, "embed");
        let peak = peak_abs(&scaled) as f64 / Q15_SCALE;
        assert_approx_eq!(peak, 0.70, 1e-3);
        assert_eq!(record.saturated, 0);
        assert_eq!(record.stage_id, "embed");
        assert_eq!(engine.last_factor("embed"), Some(record.scale_factor));
    }

    #[test]
    fn test_round_trip_within_four_steps() {
        let mut engine = AdaptiveScalingEngine::default();
        let signal = tone(0.6, 150);
        let (scaled, record) = engine.scale_signal(&signal, "s");
        let recovered = engine.reverse_scale(&scaled, record);
        for (orig, back) in signal.iter().zip(&recovered) {
            assert!((to_real(*orig) - back).abs() <= 4.0 * Q15_EPSILON);
        }
    }

    #[test]
    fn test_deadband_keeps_previous_factor() {
        let mut engine = AdaptiveScalingEngine::default();
        let (_, first) = engine.scale_signal(&tone(0.30, 100), "s");
        let (_, second) = engine.scale_signal(&tone(0.31, 100), "s");
        assert_eq!(first.scale_factor, second.scale_factor);
    }

    #[test]
    fn test_rate_limit_and_saturation_ceiling() {
        let mut engine = AdaptiveScalingEngine::default();
        let (_, quiet) = engine.scale_signal(&tone(0.1, 100), "s");
        assert_approx_eq!(quiet.scale_factor, 7.0, 0.05);

        // Quieter still: growth limited to 2x per call.
        let (_, quieter) = engine.scale_signal(&tone(0.01, 100), "s");
        assert_approx_eq!(quieter.scale_factor / quiet.scale_factor, 2.0, 1e-9);

        // Suddenly loud: the ceiling overrides the rate limit.
        let loud_signal = tone(0.9, 100);
        let loud_peak = peak_abs(&loud_signal) as f64 / Q15_SCALE;
        let (scaled, loud) = engine.scale_signal(&loud_signal, "s");
        assert!(loud.scale_factor * loud_peak <= 1.0);
        assert!(loud.scale_factor < quieter.scale_factor / 2.0);
        assert_eq!(loud.saturated, 0);
        assert!(peak_abs(&scaled) <= i16::MAX as i32);
    }

    #[test]
    fn test_overflow_status_caps_factor() {
        let mut engine = AdaptiveScalingEngine::default();
        let (_, record) =
            engine.scale_signal_with_status(&tone(0.2, 64), "s", RangeStatus::OverflowRisk(0.5));
        assert_approx_eq!(record.scale_factor, 0.5, 1e-12);
    }

    #[test]
    fn test_scale_batch_has_no_cross_item_coupling() {
        let mut engine = AdaptiveScalingEngine::default();
        let signals = vec![tone(0.05, 50), tone(0.5, 50)];
        let batch = engine.scale_batch(&signals, "b");
        let mut fresh = AdaptiveScalingEngine::default();
        let (_, alone) = fresh.scale_signal(&signals[1], "b");
        assert_eq!(batch[1].1.scale_factor, alone.scale_factor);
        assert_eq!(engine.last_factor("b"), Some(batch[1].1.scale_factor));
    }

    #[test]
    fn test_scale_wide_profile() {
        let mut engine = AdaptiveScalingEngine::default();
        let profile: Vec<i64> = (0..500).map(|i| (i as i64 - 250) * 4000).collect();
        let (scaled, record) = engine.scale_wide(&profile, "profile");
        assert!(record.scale_factor < 1.0);
        assert_eq!(record.saturated, 0);
        assert_approx_eq!(peak_abs(&scaled) as f64 / Q15_SCALE, 0.70, 1e-3);
    }

    #[test]
    fn test_reverse_magnitudes_compensation() {
        let engine = AdaptiveScalingEngine::default();
        let quiet = ScalingRecord {
            scale_factor: 2.0,
            stage_id: "m".to_string(),
            error_estimate: 0.0,
            bias: 0.0,
            saturated: 0,
        };
        assert_eq!(engine.reverse_magnitudes(&[1.0], quiet, 1.0), vec![0.5]);

        let noisy = ScalingRecord {
            scale_factor: 1.0,
            stage_id: "m".to_string(),
            error_estimate: 0.3,
            bias: 0.0,
            saturated: 0,
        };
        let out = engine.reverse_magnitudes(&[0.5, 0.1], noisy, 1.0);
        assert_approx_eq!(out[0], 0.4, 1e-12);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn test_strategy_seeds_from_predecessor() {
        let mut engine = AdaptiveScalingEngine::default();
        let (_, record) = engine.scale_signal(&tone(0.35, 64), "first");
        let strategy = engine.scaling_strategy(&["first", "second", "third"]);
        assert_eq!(strategy.stages[0].expected_input_scale, 1.0);
        assert_eq!(strategy.stages[0].declared_output_scale, record.scale_factor);
        assert_eq!(strategy.stages[1].expected_input_scale, record.scale_factor);
        assert_eq!(strategy.stages[2].expected_input_scale, record.scale_factor);
        assert!(strategy.plan_for("second").is_some());
    }
}

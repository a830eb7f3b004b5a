//! Incremental dynamic-range monitoring.
//!
//! [`DynamicRangeMonitor`] keeps a sliding window of recent Q15 samples with
//! exact running sums, tracks the peak magnitude per block, and turns both
//! into a [`RangeStatus`] classification and a [`RiskPrediction`]. Because
//! Q15 saturates silently, the forecast matters as much as the present value:
//! by the time a sample is clipped, upstream sums are already corrupted.
//!
//! The monitor never fails. Until `min_history` samples have been seen it
//! reports [`RangeStatus::Optimal`] (conservative start).

use crate::config::SignalType;
use crate::fixed_point::{Q15, Q15_SCALE};
use crate::math_utils::standard_normal_cdf;
use log::debug;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Largest gain suggested for an underflowing signal.
pub const MAX_SUGGESTED_GAIN: f64 = 256.0;

/// Range classification after an observation.
///
/// `Optimal` and `NearLimit` carry the current peak as a fraction of full
/// scale; the risk variants carry the multiplicative scale that would bring
/// the peak back to the target level.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RangeStatus {
    /// Peak comfortably inside the usable range
    Optimal(f64),
    /// Peak approaching full scale
    NearLimit(f64),
    /// Peak at or forecast above the overflow threshold; suggested scale < 1
    OverflowRisk(f64),
    /// Peak so small that quantization dominates; suggested scale > 1
    UnderflowRisk(f64),
}

impl RangeStatus {
    /// Scale suggested by a risk classification, if any.
    pub fn suggested_scale(&self) -> Option<f64> {
        match *self {
            RangeStatus::OverflowRisk(s) | RangeStatus::UnderflowRisk(s) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            RangeStatus::Optimal(_) => 0,
            RangeStatus::NearLimit(_) => 1,
            RangeStatus::OverflowRisk(_) => 2,
            RangeStatus::UnderflowRisk(_) => 3,
        }
    }
}

/// Snapshot of the window aggregates, in real units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RangeStatistics {
    /// Window mean
    pub mean: f64,
    /// Window (population) variance
    pub variance: f64,
    /// Largest absolute sample in the window
    pub peak: f64,
    /// Crest factor `20·log10(peak / rms)` in dB (0 for a silent window)
    pub dynamic_range: f64,
}

/// Overflow forecast.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RiskPrediction {
    /// Probability in `[0, 1]` that the peak crosses the overflow threshold
    pub probability: f64,
    /// Samples until the trend reaches the threshold (`Some(0)` if already over,
    /// `None` when the trend is flat or falling)
    pub time_to_risk: Option<usize>,
    /// Extrapolated peak (real units)
    pub predicted_peak: f64,
}

/// Classification thresholds, as fractions of Q15 full scale.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MonitorThresholds {
    /// Peak at or above this is an overflow risk
    pub overflow: f64,
    /// Peak at or above this is near the limit
    pub near_limit: f64,
    /// Peak below this is an underflow risk
    pub underflow: f64,
    /// Level suggested scales aim for
    pub target_level: f64,
    /// Width σ of the normal CDF mapping forecast excess to probability
    pub risk_softness: f64,
}

impl MonitorThresholds {
    /// Thresholds for a signal family.
    pub fn for_signal(signal_type: SignalType) -> Self {
        let (overflow, near_limit, underflow) = match signal_type {
            SignalType::Accelerometer => (0.90, 0.75, 0.02),
            SignalType::Ecg => (0.85, 0.70, 0.05),
            SignalType::Eeg => (0.90, 0.75, 0.01),
            SignalType::General => (0.90, 0.75, 0.03),
        };
        Self {
            overflow,
            near_limit,
            underflow,
            target_level: 0.70,
            risk_softness: 0.05,
        }
    }
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self::for_signal(SignalType::General)
    }
}

/// Window and history sizes.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MonitorConfig {
    /// Sliding window length
    pub window_size: usize,
    /// Samples per local-peak block
    pub peak_block: usize,
    /// Block peaks retained for the forecast
    pub peak_history: usize,
    /// Samples before classification starts
    pub min_history: usize,
    /// Classification thresholds
    pub thresholds: MonitorThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 128,
            peak_block: 16,
            peak_history: 8,
            min_history: 16,
            thresholds: MonitorThresholds::default(),
        }
    }
}

/// Sliding-window amplitude monitor for one signal stream.
#[derive(Debug, Clone)]
pub struct DynamicRangeMonitor {
    config: MonitorConfig,
    window: VecDeque<Q15>,
    sum: i64,
    sum_squares: i64,
    peak: i32,
    peak_stale: bool,
    block_peak: i32,
    block_fill: usize,
    block_peaks: VecDeque<i32>,
    observed: u64,
    last_kind: Option<u8>,
}

impl Default for DynamicRangeMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl DynamicRangeMonitor {
    /// Monitor with the given configuration (zero sizes are raised to 1).
    pub fn new(mut config: MonitorConfig) -> Self {
        config.window_size = config.window_size.max(1);
        config.peak_block = config.peak_block.max(1);
        config.peak_history = config.peak_history.max(3);
        Self {
            window: VecDeque::with_capacity(config.window_size),
            block_peaks: VecDeque::with_capacity(config.peak_history),
            config,
            sum: 0,
            sum_squares: 0,
            peak: 0,
            peak_stale: false,
            block_peak: 0,
            block_fill: 0,
            observed: 0,
            last_kind: None,
        }
    }

    /// Default window sizes with thresholds for a signal family.
    pub fn for_signal(signal_type: SignalType) -> Self {
        Self::new(MonitorConfig {
            thresholds: MonitorThresholds::for_signal(signal_type),
            ..MonitorConfig::default()
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Samples observed since construction or the last reset.
    pub fn samples_observed(&self) -> u64 {
        self.observed
    }

    /// Forget all history.
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    /// Add one sample and classify the window.
    pub fn observe(&mut self, sample: Q15) -> RangeStatus {
        self.push(sample);
        self.refresh_peak();
        self.classify()
    }

    /// Add many samples; identical outcome to repeated [`observe`](Self::observe)
    /// with at most one peak rescan.
    pub fn observe_batch(&mut self, samples: &[Q15]) -> RangeStatus {
        for &sample in samples {
            self.push(sample);
        }
        self.refresh_peak();
        self.classify()
    }

    fn push(&mut self, sample: Q15) {
        let raw = sample.raw() as i64;
        let magnitude = (raw as i32).abs();

        if self.window.len() == self.config.window_size {
            if let Some(evicted) = self.window.pop_front() {
                let old = evicted.raw() as i64;
                self.sum -= old;
                self.sum_squares -= old * old;
                if (old as i32).abs() == self.peak {
                    self.peak_stale = true;
                }
            }
        }

        self.window.push_back(sample);
        self.sum += raw;
        self.sum_squares += raw * raw;
        if magnitude >= self.peak {
            self.peak = magnitude;
            self.peak_stale = false;
        }

        self.block_peak = self.block_peak.max(magnitude);
        self.block_fill += 1;
        if self.block_fill == self.config.peak_block {
            if self.block_peaks.len() == self.config.peak_history {
                self.block_peaks.pop_front();
            }
            self.block_peaks.push_back(self.block_peak);
            self.block_peak = 0;
            self.block_fill = 0;
        }

        self.observed += 1;
    }

    fn refresh_peak(&mut self) {
        if self.peak_stale {
            self.peak = self
                .window
                .iter()
                .map(|s| (s.raw() as i32).abs())
                .max()
                .unwrap_or(0);
            self.peak_stale = false;
        }
    }

    fn peak_fraction(&self) -> f64 {
        self.peak as f64 / Q15_SCALE
    }

    fn suggested_scale(&self, level: f64) -> f64 {
        let target = self.config.thresholds.target_level;
        (target / level.max(1.0 / Q15_SCALE)).min(MAX_SUGGESTED_GAIN)
    }

    fn classify(&mut self) -> RangeStatus {
        let thresholds = self.config.thresholds;
        let peak = self.peak_fraction();

        let status = if self.observed < self.config.min_history as u64 {
            RangeStatus::Optimal(peak)
        } else if peak >= thresholds.overflow {
            RangeStatus::OverflowRisk(self.suggested_scale(peak))
        } else {
            let forecast = self.predict_risk(self.config.peak_block);
            if forecast.probability >= 0.5 {
                RangeStatus::OverflowRisk(self.suggested_scale(forecast.predicted_peak))
            } else if peak >= thresholds.near_limit {
                RangeStatus::NearLimit(peak)
            } else if peak < thresholds.underflow {
                RangeStatus::UnderflowRisk(self.suggested_scale(peak))
            } else {
                RangeStatus::Optimal(peak)
            }
        };

        let kind = status.kind();
        if self.last_kind != Some(kind) {
            debug!("range status -> {:?} after {} samples", status, self.observed);
            self.last_kind = Some(kind);
        }
        status
    }

    /// Read-only snapshot of the window aggregates.
    pub fn statistics(&self) -> RangeStatistics {
        let n = self.window.len() as i128;
        if n == 0 {
            return RangeStatistics::default();
        }
        let sum = self.sum as i128;
        let mean = sum as f64 / n as f64 / Q15_SCALE;
        let spread = (n * self.sum_squares as i128 - sum * sum).max(0);
        let variance = spread as f64 / (n * n) as f64 / (Q15_SCALE * Q15_SCALE);

        let peak = self
            .window
            .iter()
            .map(|s| (s.raw() as i32).abs())
            .max()
            .unwrap_or(0) as f64
            / Q15_SCALE;
        let rms = (self.sum_squares as f64 / n as f64).sqrt() / Q15_SCALE;
        let dynamic_range = if rms > 0.0 && peak > 0.0 {
            20.0 * (peak / rms).log10()
        } else {
            0.0
        };

        RangeStatistics {
            mean,
            variance,
            peak,
            dynamic_range,
        }
    }

    /// Forecast the peak `horizon` samples ahead from the block-peak trend.
    ///
    /// The per-block slope is the mean first difference of the retained block
    /// peaks; with fewer than three peaks the slope is taken as zero and the
    /// forecast reduces to a present-value check. The excess over the
    /// overflow threshold maps to a probability through Φ(excess / σ), which
    /// is monotone in the prediction: on a rising trend the probability never
    /// decreases with the horizon.
    pub fn predict_risk(&self, horizon: usize) -> RiskPrediction {
        let thresholds = self.config.thresholds;
        let peaks = &self.block_peaks;

        let (base, slope_per_sample) = match (peaks.front(), peaks.back()) {
            (Some(&first), Some(&last)) if peaks.len() >= 3 => {
                let per_block = (last - first) as f64 / (peaks.len() - 1) as f64 / Q15_SCALE;
                (last as f64 / Q15_SCALE, per_block / self.config.peak_block as f64)
            }
            (_, Some(&last)) => (last as f64 / Q15_SCALE, 0.0),
            _ => (self.peak_fraction(), 0.0),
        };

        let predicted_peak = (base + slope_per_sample * horizon as f64).max(0.0);
        let excess = predicted_peak - thresholds.overflow;
        let probability = standard_normal_cdf(excess / thresholds.risk_softness);

        let time_to_risk = if base >= thresholds.overflow {
            Some(0)
        } else if slope_per_sample > 0.0 {
            Some(((thresholds.overflow - base) / slope_per_sample).ceil() as usize)
        } else {
            None
        };

        RiskPrediction {
            probability,
            time_to_risk,
            predicted_peak,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_point::to_q15;
    use assert_approx_eq::assert_approx_eq;

    fn tone(amplitude: f64, len: usize) -> Vec<Q15> {
        (0..len)
            .map(|i| to_q15(amplitude * (i as f64 * 0.3).sin()))
            .collect()
    }

    #[test]
    fn test_conservative_start() {
        let mut monitor = DynamicRangeMonitor::default();
        for sample in tone(0.99, 10) {
            assert!(matches!(monitor.observe(sample), RangeStatus::Optimal(_)));
        }
    }

    #[test]
    fn test_overflow_and_underflow_classification() {
        let mut loud = DynamicRangeMonitor::default();
        match loud.observe_batch(&tone(0.98, 64)) {
            RangeStatus::OverflowRisk(scale) => assert!(scale < 1.0),
            other => panic!("Expected OverflowRisk, got {:?}", other),
        }

        let mut quiet = DynamicRangeMonitor::default();
        match quiet.observe_batch(&tone(0.005, 64)) {
            RangeStatus::UnderflowRisk(scale) => assert!(scale > 1.0),
            other => panic!("Expected UnderflowRisk, got {:?}", other),
        }

        let mut fine = DynamicRangeMonitor::default();
        assert!(matches!(fine.observe_batch(&tone(0.4, 64)), RangeStatus::Optimal(_)));
    }

    #[test]
    fn test_batch_matches_single_observations() {
        let samples: Vec<Q15> = (0..300)
            .map(|i| to_q15(0.8 * ((i as f64) * 0.05).sin() * (1.0 - i as f64 / 400.0)))
            .collect();
        let mut single = DynamicRangeMonitor::default();
        let mut last = RangeStatus::Optimal(0.0);
        for &s in &samples {
            last = single.observe(s);
        }
        let mut batched = DynamicRangeMonitor::default();
        let batch_status = batched.observe_batch(&samples);
        assert_eq!(last, batch_status);
        assert_eq!(single.statistics(), batched.statistics());
    }

    #[test]
    fn test_peak_recomputed_after_eviction() {
        let mut monitor = DynamicRangeMonitor::default();
        monitor.observe(to_q15(0.9));
        for _ in 0..128 {
            monitor.observe(to_q15(0.3));
        }
        assert_approx_eq!(monitor.statistics().peak, 0.3, 1e-4);
        assert!(matches!(monitor.observe(to_q15(0.3)), RangeStatus::Optimal(_)));
    }

    #[test]
    fn test_statistics_exact() {
        let mut monitor = DynamicRangeMonitor::default();
        monitor.observe_batch(&[to_q15(0.5), to_q15(-0.5), to_q15(0.5), to_q15(-0.5)]);
        let stats = monitor.statistics();
        assert_approx_eq!(stats.mean, 0.0, 1e-12);
        assert_approx_eq!(stats.variance, 0.25, 1e-9);
        assert_approx_eq!(stats.peak, 0.5, 1e-9);
        assert_approx_eq!(stats.dynamic_range, 0.0, 1e-9);
    }

    #[test]
    fn test_rising_trend_risk_is_monotone() {
        let mut monitor = DynamicRangeMonitor::default();
        let ramp: Vec<Q15> = (0..128).map(|i| to_q15(0.2 + 0.004 * i as f64)).collect();
        monitor.observe_batch(&ramp);
        let mut previous = 0.0;
        for horizon in [0, 8, 16, 32, 64, 128, 256] {
            let risk = monitor.predict_risk(horizon);
            assert!(risk.probability >= previous);
            assert!((0.0..=1.0).contains(&risk.probability));
            previous = risk.probability;
        }
        assert!(monitor.predict_risk(512).probability > 0.99);
        assert!(monitor.predict_risk(0).time_to_risk.is_some());
    }

    #[test]
    fn test_falling_trend_has_no_time_to_risk() {
        let mut monitor = DynamicRangeMonitor::default();
        let ramp: Vec<Q15> = (0..128).map(|i| to_q15(0.7 - 0.004 * i as f64)).collect();
        monitor.observe_batch(&ramp);
        let risk = monitor.predict_risk(64);
        assert_eq!(risk.time_to_risk, None);
        assert!(risk.probability < 0.01);
    }
}

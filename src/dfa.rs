//! Detrended fluctuation analysis (Peng method) in integer arithmetic.
//!
//! Pipeline mapping:
//!
//! | Stage | Work |
//! |---|---|
//! | PhaseSpaceReconstruction | mean removal and cumulative sum in `i64`, wide scale-in |
//! | DistanceCalculation | per box size: integer least-squares detrend, residual RMS, mean over boxes |
//! | IndexCalculation | table log of F and n, scale-out |
//! | Aggregation | OLS slope α of ln F against ln n |
//!
//! Residuals are carried with [`RESIDUAL_FRAC_BITS`] extra fractional bits so
//! the RMS of small fluctuations is not swamped by integer rounding; their
//! squares are summed in `i64`.

use crate::config::{AnalysisConfig, Algorithm};
use crate::coordinator::{
    PipelineStage, QualityFlag, StageConfig, StageContext, StageKernel, StageOutcome,
    StagePayload,
};
use crate::fixed_point::{isqrt_wide, log_wide, Q15};
use crate::math_utils::{generate_box_sizes, ols_regression};
use log::{debug, warn};

/// Extra fractional bits carried by detrended residuals and fluctuations.
pub const RESIDUAL_FRAC_BITS: u32 = 4;

/// Minimum boxes for a scale to count.
const MIN_BOXES: usize = 2;

/// Minimum scales kept when thinning the final fit.
const MIN_THINNED_SCALES: usize = 4;

/// Peng DFA parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DfaParams {
    /// Smallest box
    pub min_box_size: usize,
    /// Largest box
    pub max_box_size: usize,
    /// Largest box as a fraction of the window
    pub max_box_fraction: f64,
    /// Log-spaced sizes before deduplication
    pub box_size_count: usize,
}

impl DfaParams {
    /// Parameters from an analysis configuration.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            min_box_size: config.min_box_size,
            max_box_size: config.max_box_size,
            max_box_fraction: config.max_box_fraction,
            box_size_count: config.box_size_count,
        }
    }

    /// Box sizes with at least two boxes for an `n`-sample window.
    pub fn box_sizes(&self, n: usize) -> Vec<usize> {
        generate_box_sizes(
            n,
            self.min_box_size,
            self.max_box_size,
            self.max_box_fraction,
            self.box_size_count,
        )
        .into_iter()
        .filter(|&s| s >= 3 && n / s >= MIN_BOXES)
        .collect()
    }
}

/// Mean-removed cumulative sum in raw Q15 units.
///
/// The mean is rounded to the nearest raw unit; the residual linear drift
/// this leaves in the profile is removed by the per-box detrending.
pub fn integrate_profile(signal: &[Q15]) -> Vec<i64> {
    let n = signal.len() as i64;
    if n == 0 {
        return Vec::new();
    }
    let sum: i64 = signal.iter().map(|s| s.raw() as i64).sum();
    let mean = (2 * sum + n).div_euclid(2 * n);
    signal
        .iter()
        .scan(0i64, |acc, s| {
            *acc += s.raw() as i64 - mean;
            Some(*acc)
        })
        .collect()
}

fn div_round(numerator: i128, denominator: i128) -> i128 {
    if numerator >= 0 {
        (numerator + denominator / 2) / denominator
    } else {
        -((-numerator + denominator / 2) / denominator)
    }
}

/// RMS of the residuals of a least-squares line through one box.
///
/// Fits `y = a + b·x` for `x = 0..s` exactly in `i128`; the result is in
/// raw units with [`RESIDUAL_FRAC_BITS`] fractional bits.
pub fn box_rms(segment: &[Q15]) -> u64 {
    let s = segment.len() as i128;
    if s < 3 {
        return 0;
    }
    let sx = s * (s - 1) / 2;
    let sxx = (s - 1) * s * (2 * s - 1) / 6;
    let denom = s * sxx - sx * sx;

    let (sy, sxy) = segment
        .iter()
        .enumerate()
        .fold((0i128, 0i128), |(sy, sxy), (x, y)| {
            let y = y.raw() as i128;
            (sy + y, sxy + x as i128 * y)
        });
    let num = s * sxy - sx * sy;
    let scale = s * denom;
    let base = sy * denom - num * sx;

    let sum_squares: i64 = segment
        .iter()
        .enumerate()
        .map(|(x, y)| {
            let fit = base + num * s * x as i128;
            let residual = div_round(
                (y.raw() as i128 * scale - fit) << RESIDUAL_FRAC_BITS,
                scale,
            ) as i64;
            residual * residual
        })
        .sum();

    isqrt_wide(sum_squares as u64 / segment.len() as u64)
}

/// Mean box RMS for one box size, visiting every `box_step`-th box.
///
/// `None` when fewer than two boxes fit.
pub fn fluctuation(profile: &[Q15], box_size: usize, box_step: usize) -> Option<u64> {
    let boxes = profile.len() / box_size.max(1);
    if box_size < 3 || boxes < MIN_BOXES {
        return None;
    }
    let step = box_step.clamp(1, (boxes / MIN_BOXES).max(1));
    let rms: Vec<u64> = profile
        .chunks_exact(box_size)
        .step_by(step)
        .map(box_rms)
        .collect();
    let total: u128 = rms.iter().map(|&r| r as u128).sum();
    let count = rms.len() as u128;
    Some(((total + count / 2) / count) as u64)
}

/// Natural log of a fluctuation produced by [`fluctuation`] (scaled domain, real units).
pub fn log_fluctuation(value: u64) -> f64 {
    log_wide(value) - RESIDUAL_FRAC_BITS as f64 * std::f64::consts::LN_2
}

/// Natural log of a box size via the same table.
pub fn log_box_size(box_size: usize) -> f64 {
    log_wide((box_size as u64) << 15)
}

/// [`StageKernel`] running Peng DFA.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DfaKernel {
    params: DfaParams,
}

impl DfaKernel {
    /// Kernel for the given parameters.
    pub fn new(params: DfaParams) -> Self {
        Self { params }
    }

    /// Kernel configured from an analysis configuration.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(DfaParams::from_config(config))
    }

    /// Active parameters.
    pub fn params(&self) -> &DfaParams {
        &self.params
    }

    fn integrate(
        &self,
        signal: Vec<Q15>,
        stage: PipelineStage,
        ctx: &mut StageContext<'_>,
    ) -> StageOutcome {
        let sizes = self.params.box_sizes(signal.len());
        if sizes.len() < 2 {
            debug!(
                "dfa: {} samples allow {} usable box sizes",
                signal.len(),
                sizes.len()
            );
            return StageOutcome::neutral(QualityFlag::InsufficientData);
        }

        ctx.monitor.observe_batch(&signal);
        let profile = integrate_profile(&signal);
        if profile.iter().all(|&v| v == 0) {
            debug!("dfa: constant window, profile is flat");
            return StageOutcome::neutral(QualityFlag::DegenerateSignal);
        }

        let (scaled, record) = ctx.scaling.scale_wide(&profile, stage.id());
        ctx.saturation
            .record_batch(scaled.len() as u64, record.saturated as u64);
        let quality = 1.0 - record.saturated as f64 / scaled.len().max(1) as f64;
        let applied_scale = record.scale_factor;
        StageOutcome::scaled_in(
            StagePayload::Profile {
                profile: scaled,
                record,
            },
            quality,
            applied_scale,
        )
    }

    fn fluctuations(&self, input: StagePayload, config: &StageConfig) -> StageOutcome {
        let (profile, record) = match input {
            StagePayload::Profile { profile, record } => (profile, record),
            other => return StageOutcome::unexpected(config.stage, &other),
        };
        let box_step = if config.aggressive {
            config.reduction_factor
        } else {
            1
        };
        let sizes = self.params.box_sizes(profile.len());
        let points: Vec<(usize, u64)> = sizes
            .iter()
            .filter_map(|&s| fluctuation(&profile, s, box_step).map(|f| (s, f)))
            .filter(|&(_, f)| f > 0)
            .collect();

        if points.len() < 2 {
            let flag = if points.is_empty() {
                QualityFlag::DegenerateSignal
            } else {
                QualityFlag::InsufficientData
            };
            debug!("dfa: {} valid scales of {}", points.len(), sizes.len());
            return StageOutcome::neutral(flag);
        }
        let quality = points.len() as f64 / sizes.len().max(1) as f64;
        StageOutcome::new(StagePayload::Fluctuations { points, record }, quality)
    }

    fn log_log(
        &self,
        input: StagePayload,
        config: &StageConfig,
        ctx: &mut StageContext<'_>,
    ) -> StageOutcome {
        let (points, record) = match input {
            StagePayload::Fluctuations { points, record } => (points, record),
            other => return StageOutcome::unexpected(config.stage, &other),
        };
        if !config.expects_scale(record.scale_factor) {
            warn!(
                "dfa: record factor {} does not match the incoming scale {}",
                record.scale_factor, config.input_scale
            );
            return StageOutcome::neutral(QualityFlag::DegenerateSignal);
        }
        let scaled_logs: Vec<f64> = points.iter().map(|&(_, f)| log_fluctuation(f)).collect();
        let physical = ctx.scaling.reverse_log_magnitudes(&scaled_logs, record, 1.0);

        let (log_n, log_f): (Vec<f64>, Vec<f64>) = points
            .iter()
            .zip(physical)
            .filter(|(_, l)| l.is_finite())
            .map(|(&(s, _), l)| (log_box_size(s), l))
            .unzip();
        if log_n.len() < 2 {
            return StageOutcome::neutral(QualityFlag::InsufficientData);
        }
        let quality = log_n.len() as f64 / points.len() as f64;
        StageOutcome::new(StagePayload::LogLog { log_n, log_f }, quality).with_output_scale(1.0)
    }

    fn slope(&self, input: StagePayload, config: &StageConfig) -> StageOutcome {
        let (log_n, log_f) = match input {
            StagePayload::LogLog { log_n, log_f } => (log_n, log_f),
            other => return StageOutcome::unexpected(config.stage, &other),
        };
        if log_n.len() < 2 {
            return StageOutcome::neutral(QualityFlag::InsufficientData);
        }
        if config.aggressive && log_n.len() > MIN_THINNED_SCALES {
            let r = config.reduction_factor.max(1);
            let last = log_n.len() - 1;
            let keep: Vec<usize> = (0..=last).filter(|&i| i % r == 0 || i == last).collect();
            let thin_n: Vec<f64> = keep.iter().map(|&i| log_n[i]).collect();
            let thin_f: Vec<f64> = keep.iter().map(|&i| log_f[i]).collect();
            match ols_regression(&thin_n, &thin_f) {
                Ok(fit) if fit.r_squared >= config.quality_target => {
                    debug!(
                        "dfa: alpha {:.4} over {} of {} scales (r2 {:.3})",
                        fit.slope,
                        thin_n.len(),
                        log_n.len(),
                        fit.r_squared
                    );
                    return StageOutcome::new(StagePayload::Value(fit.slope), fit.r_squared);
                }
                _ => debug!(
                    "dfa: thinned fit misses quality target {:.2}, using all {} scales",
                    config.quality_target,
                    log_n.len()
                ),
            }
        }
        match ols_regression(&log_n, &log_f) {
            Ok(fit) => {
                debug!(
                    "dfa: alpha {:.4} over {} scales (r2 {:.3})",
                    fit.slope,
                    log_n.len(),
                    fit.r_squared
                );
                StageOutcome::new(StagePayload::Value(fit.slope), fit.r_squared)
            }
            Err(e) => {
                debug!("dfa: final fit failed: {}", e);
                StageOutcome::neutral(QualityFlag::DegenerateSignal)
            }
        }
    }
}

impl StageKernel for DfaKernel {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Dfa
    }

    fn execute(
        &self,
        stage: PipelineStage,
        input: StagePayload,
        config: &StageConfig,
        ctx: &mut StageContext<'_>,
    ) -> StageOutcome {
        match stage {
            PipelineStage::PhaseSpaceReconstruction => match input {
                StagePayload::Samples(signal) => self.integrate(signal, stage, ctx),
                other => StageOutcome::unexpected(stage, &other),
            },
            PipelineStage::DistanceCalculation => self.fluctuations(input, config),
            PipelineStage::IndexCalculation => self.log_log(input, config, ctx),
            PipelineStage::Aggregation => self.slope(input, config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_point::to_q15;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_integrate_profile_removes_mean() {
        let signal: Vec<Q15> = [3i16, 5, 7].iter().map(|&r| Q15::from_raw(r)).collect();
        assert_eq!(integrate_profile(&signal), vec![-2, -2, 0]);
        assert!(integrate_profile(&[]).is_empty());
        let flat = vec![to_q15(0.4); 50];
        assert!(integrate_profile(&flat).iter().all(|&v| v == 0));
    }

    #[test]
    fn test_box_rms_of_line_is_zero() {
        let line: Vec<Q15> = (0..16).map(|x| Q15::from_raw(100 + 37 * x)).collect();
        assert_eq!(box_rms(&line), 0);
    }

    #[test]
    fn test_box_rms_matches_float_detrend() {
        let values = [0i16, 400, -300, 250, 900, -100, 50, 600];
        let segment: Vec<Q15> = values.iter().map(|&r| Q15::from_raw(r)).collect();

        let x: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
        let y: Vec<f64> = values.iter().map(|&v| v as f64).collect();
        let fit = ols_regression(&x, &y).unwrap();
        let expected = (fit.residuals.iter().map(|r| r * r).sum::<f64>() / y.len() as f64).sqrt();

        let got = box_rms(&segment) as f64 / (1 << RESIDUAL_FRAC_BITS) as f64;
        assert_approx_eq!(got, expected, 0.1);
    }

    #[test]
    fn test_fluctuation_requires_two_boxes() {
        let profile: Vec<Q15> = (0..30).map(|i| Q15::from_raw((i * i % 97) as i16)).collect();
        assert!(fluctuation(&profile, 16, 1).is_none());
        assert!(fluctuation(&profile, 15, 1).is_some());
        assert!(fluctuation(&profile, 2, 1).is_none());
    }

    #[test]
    fn test_thinned_fit_must_meet_quality_target() {
        let kernel = DfaKernel::from_config(&AnalysisConfig::default());
        let log_n: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let mut log_f: Vec<f64> = log_n.iter().map(|x| 0.5 * x).collect();
        log_f[2] += 0.3;
        log_f[5] -= 0.2;

        let thin_n: Vec<f64> = [0, 2, 4, 6, 8].iter().map(|&i| log_n[i]).collect();
        let thin_f: Vec<f64> = [0, 2, 4, 6, 8].iter().map(|&i| log_f[i]).collect();
        let thin = ols_regression(&thin_n, &thin_f).unwrap();
        let full = ols_regression(&log_n, &log_f).unwrap();
        assert!(thin.r_squared < 1.0);

        let alpha = |quality_target: f64| {
            let config = StageConfig {
                stage: PipelineStage::Aggregation,
                input_scale: 1.0,
                quality_target,
                aggressive: true,
                reduction_factor: 2,
            };
            let payload = StagePayload::LogLog {
                log_n: log_n.clone(),
                log_f: log_f.clone(),
            };
            match kernel.slope(payload, &config).payload {
                StagePayload::Value(v) => v,
                other => panic!("expected a value, got {:?}", other),
            }
        };
        assert_approx_eq!(alpha(0.0), thin.slope, 1e-12);
        assert_approx_eq!(alpha(1.0), full.slope, 1e-12);
    }

    #[test]
    fn test_log_helpers_use_table() {
        assert_approx_eq!(log_box_size(16), 16f64.ln(), 1e-5);
        let one_lsb = 1u64 << RESIDUAL_FRAC_BITS;
        assert_approx_eq!(log_fluctuation(one_lsb), (1.0f64 / 32768.0).ln(), 1e-5);
    }

    #[test]
    fn test_box_sizes_need_two_boxes() {
        let params = DfaParams {
            min_box_size: 4,
            max_box_size: 64,
            max_box_fraction: 0.25,
            box_size_count: 10,
        };
        let sizes = params.box_sizes(1000);
        assert_eq!(sizes.first(), Some(&4));
        assert_eq!(sizes.last(), Some(&64));
        assert_eq!(params.box_sizes(19), vec![4]);
    }
}

//! Largest Lyapunov exponent by the Rosenstein method.
//!
//! Pipeline mapping:
//!
//! | Stage | Work |
//! |---|---|
//! | PhaseSpaceReconstruction | monitor, scale-in, delay embedding |
//! | DistanceCalculation | nearest neighbour outside the Theiler window |
//! | IndexCalculation | divergence tracking, table log, scale-out |
//! | Aggregation | per-pair slopes, IQR trimming, mean |
//!
//! All distances come from the `i64` squared-distance accumulator and the
//! wide integer square root; their logs come from the mantissa table. The
//! exponent is reported per sample step.

use crate::config::{AnalysisConfig, Algorithm};
use crate::coordinator::{
    NeighborPair, PhaseSpace, PipelineStage, QualityFlag, StageConfig, StageContext, StageKernel,
    StageOutcome, StagePayload,
};
use crate::fixed_point::{distance_wide, log_wide, squared_distance, Q15, Q15_SCALE};
use crate::math_utils::{iqr_filter, mean, ols_regression};
use log::{debug, warn};

/// Smallest number of divergence steps kept when the stage runs aggressively.
const MIN_AGGRESSIVE_STEPS: usize = 8;

/// Rosenstein parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LyapunovParams {
    /// Embedding dimension m
    pub embedding_dimension: usize,
    /// Delay τ in samples
    pub time_delay: usize,
    /// Neighbours must satisfy `|i - j| > theiler_window`
    pub theiler_window: usize,
    /// Steps tracked per pair
    pub max_divergence_steps: usize,
    /// Valid log-distances needed to keep a pair
    pub min_divergence_points: usize,
    /// Embedding vectors needed to attempt the estimate
    pub min_embedding_vectors: usize,
    /// Distance floor in raw Q15 units of the scaled signal
    pub floor_raw: u64,
}

impl LyapunovParams {
    /// Parameters from an analysis configuration.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            embedding_dimension: config.embedding_dimension,
            time_delay: config.time_delay,
            theiler_window: config.theiler_window,
            max_divergence_steps: config.max_divergence_steps,
            min_divergence_points: config.min_divergence_points,
            min_embedding_vectors: config.min_embedding_count(),
            floor_raw: (config.min_distance * Q15_SCALE).round().max(1.0) as u64,
        }
    }

    fn span(&self) -> usize {
        (self.embedding_dimension - 1) * self.time_delay
    }
}

/// Number of delay vectors an `n`-sample window yields.
pub fn embedding_count(n: usize, embedding_dimension: usize, time_delay: usize) -> usize {
    let span = embedding_dimension.saturating_sub(1) * time_delay;
    n.saturating_sub(span)
}

/// Delay embedding: vector `i` is `[x(i), x(i+τ), …, x(i+(m-1)τ)]`.
pub fn embed(signal: &[Q15], embedding_dimension: usize, time_delay: usize) -> PhaseSpace {
    let count = embedding_count(signal.len(), embedding_dimension, time_delay);
    let mut data = Vec::with_capacity(count * embedding_dimension);
    for i in 0..count {
        for j in 0..embedding_dimension {
            data.push(signal[i + j * time_delay]);
        }
    }
    PhaseSpace::new(data, embedding_dimension)
}

/// Number of `stride`-th reference vectors that have at least one candidate
/// beyond the Theiler window among the trackable vectors.
///
/// Zero means the window is too short for any neighbour pair, whatever the
/// signal.
pub fn admissible_references(
    space_len: usize,
    theiler_window: usize,
    min_points: usize,
    stride: usize,
) -> usize {
    let min_points = min_points.max(1);
    if space_len < min_points {
        return 0;
    }
    let last = space_len - min_points;
    (0..=last)
        .step_by(stride.max(1))
        .filter(|&r| r > theiler_window || last - r > theiler_window)
        .count()
}

/// Nearest neighbour of every `stride`-th reference vector.
///
/// Candidates must be separated by more than `theiler_window` samples and
/// leave room for `min_points` tracked steps. Candidates whose squared
/// distance is at or below `floor_sq` (Q30 units) are ignored, so exact
/// repeats never become neighbours.
pub fn nearest_neighbors(
    space: &PhaseSpace,
    theiler_window: usize,
    floor_sq: i64,
    min_points: usize,
    stride: usize,
) -> Vec<NeighborPair> {
    let n = space.len();
    if n < min_points.max(1) {
        return Vec::new();
    }
    let last = n - min_points.max(1);
    let stride = stride.max(1);

    let mut pairs = Vec::new();
    for reference in (0..=last).step_by(stride) {
        let origin = space.vector(reference);
        let mut best: Option<(i64, usize)> = None;
        for candidate in 0..=last {
            if reference.abs_diff(candidate) <= theiler_window {
                continue;
            }
            let d2 = squared_distance(origin, space.vector(candidate));
            if d2 <= floor_sq {
                continue;
            }
            if best.map_or(true, |(b, _)| d2 < b) {
                best = Some((d2, candidate));
            }
        }
        if let Some((_, neighbor)) = best {
            pairs.push(NeighborPair {
                reference,
                neighbor,
            });
        }
    }
    pairs
}

/// Track each pair for up to `steps` steps and return `(step, ln d)` curves
/// in the scaled domain.
///
/// Only distances above `floor_raw` contribute; pairs with fewer than
/// `min_points` valid samples are dropped.
pub fn divergence_curves(
    space: &PhaseSpace,
    pairs: &[NeighborPair],
    steps: usize,
    floor_raw: u64,
    min_points: usize,
) -> Vec<Vec<(f64, f64)>> {
    let n = space.len();
    pairs
        .iter()
        .filter_map(|pair| {
            let curve: Vec<(f64, f64)> = (0..steps)
                .take_while(|k| pair.reference + k < n && pair.neighbor + k < n)
                .filter_map(|k| {
                    let d = distance_wide(
                        space.vector(pair.reference + k),
                        space.vector(pair.neighbor + k),
                    );
                    (d > floor_raw).then(|| (k as f64, log_wide(d)))
                })
                .collect();
            (curve.len() >= min_points).then_some(curve)
        })
        .collect()
}

/// Per-pair OLS slopes, IQR-trimmed and averaged.
///
/// Returns `(λ per step, pairs used, pairs fitted)`, or `None` when no
/// pair produces a slope.
pub fn aggregate_slopes(curves: &[Vec<(f64, f64)>], min_points: usize) -> Option<(f64, usize, usize)> {
    let slopes: Vec<f64> = curves
        .iter()
        .filter(|c| c.len() >= min_points)
        .filter_map(|curve| {
            let (steps, logs): (Vec<f64>, Vec<f64>) = curve.iter().copied().unzip();
            ols_regression(&steps, &logs).ok().map(|fit| fit.slope)
        })
        .collect();
    if slopes.is_empty() {
        return None;
    }
    let kept = iqr_filter(&slopes);
    if kept.is_empty() {
        return None;
    }
    Some((mean(&kept), kept.len(), slopes.len()))
}

/// [`StageKernel`] running the Rosenstein estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LyapunovKernel {
    params: LyapunovParams,
}

impl LyapunovKernel {
    /// Kernel for the given parameters.
    pub fn new(params: LyapunovParams) -> Self {
        Self { params }
    }

    /// Kernel configured from an analysis configuration.
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(LyapunovParams::from_config(config))
    }

    /// Active parameters.
    pub fn params(&self) -> &LyapunovParams {
        &self.params
    }

    fn reconstruct(
        &self,
        signal: Vec<Q15>,
        stage: PipelineStage,
        ctx: &mut StageContext<'_>,
    ) -> StageOutcome {
        let p = &self.params;
        let count = embedding_count(signal.len(), p.embedding_dimension, p.time_delay);
        if count < p.min_embedding_vectors {
            debug!(
                "lyapunov: {} samples give {} vectors, need {}",
                signal.len(),
                count,
                p.min_embedding_vectors
            );
            return StageOutcome::neutral(QualityFlag::InsufficientData);
        }

        let status = ctx.monitor.observe_batch(&signal);
        let (scaled, record) = ctx
            .scaling
            .scale_signal_with_status(&signal, stage.id(), status);
        ctx.saturation
            .record_batch(scaled.len() as u64, record.saturated as u64);

        let quality = 1.0 - record.saturated as f64 / scaled.len().max(1) as f64;
        let applied_scale = record.scale_factor;
        let space = embed(&scaled, p.embedding_dimension, p.time_delay);
        debug!(
            "lyapunov: embedded {} vectors (m={}, tau={}, span={})",
            space.len(),
            p.embedding_dimension,
            p.time_delay,
            p.span()
        );
        StageOutcome::scaled_in(StagePayload::Embedded { space, record }, quality, applied_scale)
    }

    fn search(&self, input: StagePayload, config: &StageConfig) -> StageOutcome {
        let (space, record) = match input {
            StagePayload::Embedded { space, record } => (space, record),
            other => return StageOutcome::unexpected(config.stage, &other),
        };
        let p = &self.params;
        let stride = if config.aggressive {
            config.reduction_factor
        } else {
            1
        };
        let admissible =
            admissible_references(space.len(), p.theiler_window, p.min_divergence_points, stride);
        if admissible == 0 {
            debug!(
                "lyapunov: {} vectors leave no reference outside the Theiler window ({})",
                space.len(),
                p.theiler_window
            );
            return StageOutcome::neutral(QualityFlag::InsufficientData);
        }

        let floor_sq = (p.floor_raw * p.floor_raw) as i64;
        let pairs = nearest_neighbors(
            &space,
            p.theiler_window,
            floor_sq,
            p.min_divergence_points,
            stride,
        );
        if pairs.is_empty() {
            debug!("lyapunov: no admissible neighbours, signal is degenerate");
            return StageOutcome::neutral(QualityFlag::DegenerateSignal);
        }

        let quality = pairs.len() as f64 / admissible as f64;
        StageOutcome::new(
            StagePayload::Neighbors {
                space,
                pairs,
                record,
            },
            quality,
        )
    }

    fn track(
        &self,
        input: StagePayload,
        config: &StageConfig,
        ctx: &mut StageContext<'_>,
    ) -> StageOutcome {
        let (space, pairs, record) = match input {
            StagePayload::Neighbors {
                space,
                pairs,
                record,
            } => (space, pairs, record),
            other => return StageOutcome::unexpected(config.stage, &other),
        };
        if !config.expects_scale(record.scale_factor) {
            warn!(
                "lyapunov: record factor {} does not match the incoming scale {}",
                record.scale_factor, config.input_scale
            );
            return StageOutcome::neutral(QualityFlag::DegenerateSignal);
        }
        let p = &self.params;
        let steps = if config.aggressive {
            (p.max_divergence_steps / config.reduction_factor.max(1))
                .max(MIN_AGGRESSIVE_STEPS.max(p.min_divergence_points))
                .min(p.max_divergence_steps)
        } else {
            p.max_divergence_steps
        };

        let mut scaled_curves = divergence_curves(
            &space,
            &pairs,
            steps,
            p.floor_raw,
            p.min_divergence_points,
        );
        let kept = scaled_curves.len() as f64 / pairs.len().max(1) as f64;
        if steps < p.max_divergence_steps && kept < config.quality_target {
            debug!(
                "lyapunov: {} steps keep {:.2} of pairs, below {:.2}; tracking {} steps",
                steps, kept, config.quality_target, p.max_divergence_steps
            );
            scaled_curves = divergence_curves(
                &space,
                &pairs,
                p.max_divergence_steps,
                p.floor_raw,
                p.min_divergence_points,
            );
        }

        // One reversal for all logs: the record is consumed exactly once.
        let lengths: Vec<usize> = scaled_curves.iter().map(Vec::len).collect();
        let flat_logs: Vec<f64> = scaled_curves.iter().flatten().map(|&(_, l)| l).collect();
        let noise_gain = 2.0 * space.dimension() as f64;
        let physical = ctx
            .scaling
            .reverse_log_magnitudes(&flat_logs, record, noise_gain);

        let mut offset = 0;
        let curves: Vec<Vec<(f64, f64)>> = scaled_curves
            .iter()
            .zip(&lengths)
            .filter_map(|(curve, &len)| {
                let logs = &physical[offset..offset + len];
                offset += len;
                let restored: Vec<(f64, f64)> = curve
                    .iter()
                    .zip(logs)
                    .filter(|(_, l)| l.is_finite())
                    .map(|(&(k, _), &l)| (k, l))
                    .collect();
                (restored.len() >= p.min_divergence_points).then_some(restored)
            })
            .collect();

        if curves.is_empty() {
            debug!("lyapunov: no pair kept {} valid points", p.min_divergence_points);
            return StageOutcome::neutral(QualityFlag::DegenerateSignal);
        }
        let quality = curves.len() as f64 / pairs.len() as f64;
        StageOutcome::new(StagePayload::Divergence { curves }, quality).with_output_scale(1.0)
    }

    fn aggregate(&self, input: StagePayload, config: &StageConfig) -> StageOutcome {
        let curves = match input {
            StagePayload::Divergence { curves } => curves,
            other => return StageOutcome::unexpected(config.stage, &other),
        };
        match aggregate_slopes(&curves, self.params.min_divergence_points) {
            Some((lambda, kept, fitted)) => {
                debug!(
                    "lyapunov: lambda {:.5}/step from {} of {} pairs",
                    lambda, kept, fitted
                );
                StageOutcome::new(StagePayload::Value(lambda), kept as f64 / curves.len() as f64)
            }
            None => StageOutcome::neutral(QualityFlag::DegenerateSignal),
        }
    }
}

impl StageKernel for LyapunovKernel {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Lyapunov
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
                StagePayload::Samples(signal) => self.reconstruct(signal, stage, ctx),
                other => StageOutcome::unexpected(stage, &other),
            },
            PipelineStage::DistanceCalculation => self.search(input, config),
            PipelineStage::IndexCalculation => self.track(input, config, ctx),
            PipelineStage::Aggregation => self.aggregate(input, config),
        }
    }
}

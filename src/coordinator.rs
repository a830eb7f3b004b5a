//! Cross-stage pipeline coordination.
//!
//! A pipeline is an ordered list of [`PipelineStage`]s executed by a
//! [`StageKernel`]. Stages exchange data only through [`StagePayload`]
//! values and receive their settings through [`StageConfig`]; the scaling
//! engine, range monitor and saturation counter reach them through an
//! explicit [`StageContext`]. A single pass is strictly forward.
//!
//! Feedback across runs goes through the coordinator: it times each stage,
//! identifies the stage with the largest share of recent processing time,
//! and marks that stage `aggressive` in the configuration of the *next* run.

use crate::config::{Algorithm, QualityMode};
use crate::fixed_point::{SaturationCounter, Q15};
use crate::math_utils::float_ops::finite_or_zero;
use crate::range_monitor::DynamicRangeMonitor;
use crate::scaling::{AdaptiveScalingEngine, ScalingRecord};
use log::{debug, warn};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Named pipeline stages, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PipelineStage {
    /// Embedding (LyE) or integrated profile (DFA); scale-in happens here
    PhaseSpaceReconstruction,
    /// Nearest neighbours (LyE) or box fluctuations (DFA)
    DistanceCalculation,
    /// Divergence curves (LyE) or log-log points (DFA)
    IndexCalculation,
    /// Final slope
    Aggregation,
}

impl PipelineStage {
    /// All stages in execution order.
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::PhaseSpaceReconstruction,
        PipelineStage::DistanceCalculation,
        PipelineStage::IndexCalculation,
        PipelineStage::Aggregation,
    ];

    /// Stable identifier, also used as the scaling-history key.
    pub fn id(self) -> &'static str {
        match self {
            PipelineStage::PhaseSpaceReconstruction => "phase_space_reconstruction",
            PipelineStage::DistanceCalculation => "distance_calculation",
            PipelineStage::IndexCalculation => "index_calculation",
            PipelineStage::Aggregation => "aggregation",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Data-quality conditions reported on a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QualityFlag {
    /// Window too short for the requested parameters
    InsufficientData,
    /// Constant or near-constant input; no usable distances or fluctuations
    DegenerateSignal,
    /// More than 5 % of counted operations saturated
    HighSaturation,
    /// Result produced but below the quality target
    LowQuality,
}

/// Delay-embedded vectors stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpace {
    data: Vec<Q15>,
    dimension: usize,
}

impl PhaseSpace {
    /// Wrap row-major vectors of `dimension` components (a trailing partial
    /// row is dropped).
    pub fn new(mut data: Vec<Q15>, dimension: usize) -> Self {
        let dimension = dimension.max(1);
        data.truncate(data.len() / dimension * dimension);
        Self { data, dimension }
    }

    /// Number of vectors.
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    /// True when there are no vectors.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Components per vector.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Vector `i`.
    pub fn vector(&self, i: usize) -> &[Q15] {
        &self.data[i * self.dimension..(i + 1) * self.dimension]
    }
}

/// Reference vector and its nearest admissible neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborPair {
    /// Index of the reference vector
    pub reference: usize,
    /// Index of its nearest neighbour
    pub neighbor: usize,
}

/// Data handed from one stage to the next.
#[derive(Debug)]
pub enum StagePayload {
    /// Raw Q15 window (pipeline input)
    Samples(Vec<Q15>),
    /// Scaled phase space with its scale-in record
    Embedded {
        /// Embedded vectors
        space: PhaseSpace,
        /// Scale-in record
        record: ScalingRecord,
    },
    /// Phase space plus nearest-neighbour pairs
    Neighbors {
        /// Embedded vectors
        space: PhaseSpace,
        /// Reference/neighbour pairs
        pairs: Vec<NeighborPair>,
        /// Scale-in record
        record: ScalingRecord,
    },
    /// Per-pair `(step, ln distance)` curves in physical units
    Divergence {
        /// One curve per retained pair
        curves: Vec<Vec<(f64, f64)>>,
    },
    /// Scaled integrated profile with its scale-in record
    Profile {
        /// Profile samples
        profile: Vec<Q15>,
        /// Scale-in record
        record: ScalingRecord,
    },
    /// `(box size, F)` points in the scaled domain with the profile's record
    Fluctuations {
        /// Valid scales only; F in raw units with extra fractional bits
        points: Vec<(usize, u64)>,
        /// Scale-in record of the profile
        record: ScalingRecord,
    },
    /// Points for the final regression
    LogLog {
        /// ln(box size)
        log_n: Vec<f64>,
        /// ln F(box size)
        log_f: Vec<f64>,
    },
    /// Final estimate
    Value(f64),
    /// Early exit with the neutral (zero) result
    Neutral(QualityFlag),
}

impl StagePayload {
    /// Whether this payload ends the pipeline early.
    pub fn is_neutral(&self) -> bool {
        matches!(self, StagePayload::Neutral(_))
    }

    /// Replace non-finite reals with zero; a non-finite final value becomes
    /// a degenerate-signal neutral.
    fn sanitize(self) -> (Self, usize) {
        let mut replaced = 0usize;
        let payload = match self {
            StagePayload::Value(v) if !v.is_finite() => {
                replaced += 1;
                StagePayload::Neutral(QualityFlag::DegenerateSignal)
            }
            StagePayload::Divergence { mut curves } => {
                for (step, log_d) in curves.iter_mut().flatten() {
                    zero_non_finite(step, &mut replaced);
                    zero_non_finite(log_d, &mut replaced);
                }
                StagePayload::Divergence { curves }
            }
            StagePayload::LogLog {
                mut log_n,
                mut log_f,
            } => {
                for v in log_n.iter_mut().chain(log_f.iter_mut()) {
                    zero_non_finite(v, &mut replaced);
                }
                StagePayload::LogLog { log_n, log_f }
            }
            other => other,
        };
        (payload, replaced)
    }
}

fn zero_non_finite(value: &mut f64, replaced: &mut usize) {
    if !value.is_finite() {
        *value = 0.0;
        *replaced += 1;
    }
}

/// Settings issued to a stage for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StageConfig {
    /// Stage being configured
    pub stage: PipelineStage,
    /// Scale of the incoming payload, as recorded by the predecessor in this pass
    pub input_scale: f64,
    /// Accuracy target from the scaling plan
    pub quality_target: f64,
    /// Stage was the bottleneck of recent runs and may reduce its work
    pub aggressive: bool,
    /// Work-reduction factor to use when aggressive (1 = none)
    pub reduction_factor: usize,
}

impl StageConfig {
    /// Whether a scale-in factor matches the incoming scale.
    pub fn expects_scale(&self, factor: f64) -> bool {
        (self.input_scale - factor).abs() <= 1e-9 * factor.abs().max(1.0)
    }
}

/// Mutable per-stream services available to a stage.
#[derive(Debug)]
pub struct StageContext<'a> {
    /// Scaling engine of the stream
    pub scaling: &'a mut AdaptiveScalingEngine,
    /// Range monitor of the stream
    pub monitor: &'a mut DynamicRangeMonitor,
    /// Saturation counter of this call
    pub saturation: SaturationCounter,
}

/// What a stage hands back.
#[derive(Debug)]
pub struct StageOutcome {
    /// Data for the next stage
    pub payload: StagePayload,
    /// Stage quality metric in `[0, 1]`
    pub quality: f64,
    /// Factor applied at scale-in by this stage (1.0 if none)
    pub applied_scale: f64,
    /// Scale of the payload handed on, when the stage scaled out. `None`
    /// means the input scale times `applied_scale`.
    pub output_scale: Option<f64>,
}

impl StageOutcome {
    /// Outcome without rescaling.
    pub fn new(payload: StagePayload, quality: f64) -> Self {
        Self::scaled_in(payload, quality, 1.0)
    }

    /// Outcome of a stage that multiplied its data by `applied_scale`.
    pub fn scaled_in(payload: StagePayload, quality: f64, applied_scale: f64) -> Self {
        Self {
            payload,
            quality,
            applied_scale,
            output_scale: None,
        }
    }

    /// Declare the scale of the payload handed on.
    pub fn with_output_scale(mut self, scale: f64) -> Self {
        self.output_scale = Some(scale);
        self
    }

    /// Early-exit outcome.
    pub fn neutral(flag: QualityFlag) -> Self {
        Self::new(StagePayload::Neutral(flag), 0.0)
    }

    /// Outcome for a payload the stage cannot consume.
    pub fn unexpected(stage: PipelineStage, payload: &StagePayload) -> Self {
        warn!(
            "stage {} received an unexpected payload: {:?}",
            stage.id(),
            std::mem::discriminant(payload)
        );
        Self::neutral(QualityFlag::DegenerateSignal)
    }
}

/// Numeric work behind the stages.
pub trait StageKernel {
    /// Estimator implemented by this kernel.
    fn algorithm(&self) -> Algorithm;

    /// Execute one stage.
    fn execute(
        &self,
        stage: PipelineStage,
        input: StagePayload,
        config: &StageConfig,
        ctx: &mut StageContext<'_>,
    ) -> StageOutcome;
}

/// Record of one executed stage.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StageResult {
    /// Stage
    pub stage: PipelineStage,
    /// Quality metric (non-finite replaced by 0)
    pub quality: f64,
    /// Factor applied at scale-in
    pub applied_scale: f64,
    /// Wall time
    pub elapsed: Duration,
    /// Whether the stage ran in aggressive mode
    pub aggressive: bool,
    /// Flag if the stage ended the pipeline early
    pub neutral: Option<QualityFlag>,
}

/// Outcome of one pipeline pass.
#[derive(Debug)]
pub struct PipelineResult {
    /// Payload of the last executed stage
    pub final_output: StagePayload,
    /// Executed stages in order
    pub per_stage_results: Vec<StageResult>,
    /// Product of all scale-in factors
    pub cumulative_scale: f64,
    /// Number of stages executed
    pub stages_executed: usize,
    /// Saturation accounting for the pass
    pub saturation: SaturationCounter,
}

/// Reduction allowance for one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StageOptimization {
    /// Stage
    pub stage: PipelineStage,
    /// Largest reduction factor the stage tolerates (1 = none)
    pub max_reduction: usize,
}

/// Algorithm-specific reduction allowances.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OptimizationPlan {
    /// Algorithm the plan is for
    pub algorithm: Algorithm,
    /// One entry per stage, canonical order
    pub stages: Vec<StageOptimization>,
}

impl OptimizationPlan {
    /// Allowed reduction for a stage.
    pub fn max_reduction(&self, stage: PipelineStage) -> usize {
        self.stages
            .iter()
            .find(|s| s.stage == stage)
            .map_or(1, |s| s.max_reduction)
    }
}

/// Timing and quality summary of one stage.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StageMetrics {
    /// Stage
    pub stage: PipelineStage,
    /// Mean wall time over the retained runs
    pub mean_time: Duration,
    /// Share of total retained time
    pub time_share: f64,
    /// Quality of the most recent execution
    pub last_quality: f64,
}

/// Snapshot returned by [`CrossStageCoordinator::status`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CoordinatorStatus {
    /// Metrics per stage, canonical order
    pub per_stage_metrics: Vec<StageMetrics>,
    /// Stage with the largest time share, once any run was timed
    pub current_bottleneck: Option<PipelineStage>,
}

/// Drives pipelines and carries feedback between runs of one stream.
#[derive(Debug, Clone)]
pub struct CrossStageCoordinator {
    quality_mode: QualityMode,
    window: usize,
    runs: VecDeque<[Duration; 4]>,
    last_quality: [f64; 4],
    bottleneck: Option<PipelineStage>,
}

impl Default for CrossStageCoordinator {
    fn default() -> Self {
        Self::new(QualityMode::Balanced, 8)
    }
}

impl CrossStageCoordinator {
    /// Coordinator averaging the bottleneck over `window` runs.
    pub fn new(quality_mode: QualityMode, window: usize) -> Self {
        Self {
            quality_mode,
            window: window.max(1),
            runs: VecDeque::new(),
            last_quality: [0.0; 4],
            bottleneck: None,
        }
    }

    /// Quality mode in effect.
    pub fn quality_mode(&self) -> QualityMode {
        self.quality_mode
    }

    /// Algorithm-specific reduction allowances.
    ///
    /// DFA averages many box fluctuations and tolerates thinning of the
    /// scales entering its final fit. The LyE slope is sensitive to every
    /// retained pair, so its aggregation is never reduced.
    pub fn optimize_for(&self, algorithm: Algorithm) -> OptimizationPlan {
        let allowances: [usize; 4] = match algorithm {
            Algorithm::Lyapunov => [1, 4, 2, 1],
            Algorithm::Dfa => [1, 4, 1, 2],
        };
        OptimizationPlan {
            algorithm,
            stages: PipelineStage::ALL
                .iter()
                .zip(allowances)
                .map(|(&stage, max_reduction)| StageOptimization {
                    stage,
                    max_reduction,
                })
                .collect(),
        }
    }

    /// Run `stages` in order over `signal`.
    ///
    /// Stops after the first stage that returns a neutral payload. Non-finite
    /// values in stage metrics and payloads are replaced by zero.
    pub fn process<K: StageKernel + ?Sized>(
        &mut self,
        signal: &[Q15],
        stages: &[PipelineStage],
        kernel: &K,
        scaling: &mut AdaptiveScalingEngine,
        monitor: &mut DynamicRangeMonitor,
    ) -> PipelineResult {
        let ids: Vec<&str> = stages.iter().map(|s| s.id()).collect();
        let strategy = scaling.scaling_strategy(&ids);
        let plan = self.optimize_for(kernel.algorithm());

        let mut ctx = StageContext {
            scaling,
            monitor,
            saturation: SaturationCounter::new(),
        };
        let mut payload = StagePayload::Samples(signal.to_vec());
        let mut per_stage_results = Vec::with_capacity(stages.len());
        let mut cumulative_scale = 1.0;
        // Raw samples enter at unit scale.
        let mut input_scale = 1.0;
        let mut timings = [Duration::ZERO; 4];

        for &stage in stages {
            let reduction_factor = self
                .quality_mode
                .reduction_factor()
                .min(plan.max_reduction(stage))
                .max(1);
            let aggressive = self.bottleneck == Some(stage)
                && self.quality_mode.allows_aggressive()
                && reduction_factor > 1;
            let quality_target = strategy
                .plan_for(stage.id())
                .map_or(self.quality_mode.quality_target(), |p| p.quality_target);
            let config = StageConfig {
                stage,
                input_scale,
                quality_target,
                aggressive,
                reduction_factor: if aggressive { reduction_factor } else { 1 },
            };

            let start = Instant::now();
            let outcome = kernel.execute(stage, payload, &config, &mut ctx);
            let elapsed = start.elapsed();
            timings[stage.index()] += elapsed;

            let (next, replaced) = outcome.payload.sanitize();
            if replaced > 0 {
                warn!(
                    "stage {}: replaced {} non-finite values with neutral zero",
                    stage.id(),
                    replaced
                );
            }
            let quality = finite_or_zero(outcome.quality).clamp(0.0, 1.0);
            let applied_scale = if outcome.applied_scale.is_finite() && outcome.applied_scale > 0.0
            {
                outcome.applied_scale
            } else {
                1.0
            };
            cumulative_scale *= applied_scale;
            input_scale = outcome
                .output_scale
                .filter(|s| s.is_finite() && *s > 0.0)
                .unwrap_or(input_scale * applied_scale);
            self.last_quality[stage.index()] = quality;

            let neutral = match next {
                StagePayload::Neutral(flag) => Some(flag),
                _ => None,
            };
            per_stage_results.push(StageResult {
                stage,
                quality,
                applied_scale,
                elapsed,
                aggressive,
                neutral,
            });
            payload = next;

            if let Some(flag) = neutral {
                debug!("pipeline stopped at {} with {:?}", stage.id(), flag);
                break;
            }
        }

        self.record_run(timings);

        PipelineResult {
            final_output: payload,
            stages_executed: per_stage_results.len(),
            per_stage_results,
            cumulative_scale,
            saturation: ctx.saturation,
        }
    }

    fn record_run(&mut self, timings: [Duration; 4]) {
        if self.runs.len() == self.window {
            self.runs.pop_front();
        }
        self.runs.push_back(timings);

        let totals = self.stage_totals();
        let bottleneck = PipelineStage::ALL
            .iter()
            .copied()
            .filter(|s| totals[s.index()] > Duration::ZERO)
            .max_by_key(|s| totals[s.index()]);
        if bottleneck != self.bottleneck {
            debug!("bottleneck stage {:?} -> {:?}", self.bottleneck, bottleneck);
            self.bottleneck = bottleneck;
        }
    }

    fn stage_totals(&self) -> [Duration; 4] {
        let mut totals = [Duration::ZERO; 4];
        for run in &self.runs {
            for (total, t) in totals.iter_mut().zip(run) {
                *total += *t;
            }
        }
        totals
    }

    /// Per-stage metrics and the current bottleneck.
    pub fn status(&self) -> CoordinatorStatus {
        let totals = self.stage_totals();
        let grand_total: f64 = totals.iter().map(|d| d.as_secs_f64()).sum();
        let runs = self.runs.len().max(1) as u32;
        let per_stage_metrics = PipelineStage::ALL
            .iter()
            .map(|&stage| {
                let total = totals[stage.index()];
                StageMetrics {
                    stage,
                    mean_time: total / runs,
                    time_share: if grand_total > 0.0 {
                        total.as_secs_f64() / grand_total
                    } else {
                        0.0
                    },
                    last_quality: self.last_quality[stage.index()],
                }
            })
            .collect();
        CoordinatorStatus {
            per_stage_metrics,
            current_bottleneck: self.bottleneck,
        }
    }

    /// Forget timing history and the bottleneck.
    pub fn reset(&mut self) {
        self.runs.clear();
        self.last_quality = [0.0; 4];
        self.bottleneck = None;
    }
}

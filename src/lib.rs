//! # Q15 Nonlinear Dynamics
//!
//! Fixed-point estimation of the largest Lyapunov exponent (Rosenstein) and
//! the DFA scaling exponent (Peng) on short windows of sensor data, with
//! adaptive scaling that keeps signed 16-bit Q15 arithmetic accurate.
//!
//! ## Key Features
//!
//! - **Q15 Arithmetic**: saturating primitives, table logarithm, `i64` distance accumulators
//! - **Dynamic Range Monitoring**: sliding-window peak tracking with overflow risk forecasting
//! - **Adaptive Scaling**: per-stage scale-in and scale-out with variance compensation
//! - **Cross-Stage Coordination**: bottleneck detection and quality-mode-aware shortcuts
//! - **Neutral Results**: short or degenerate windows never fail, they return 0 with flags
//!
//! ## Quick Start
//!
//! ```rust
//! use nld_q15::{AnalysisConfig, NonlinearDynamicsEngine, quantize};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = NonlinearDynamicsEngine::new(AnalysisConfig::accelerometer())?;
//!     let mut stream = engine.new_stream();
//!
//!     // Three seconds of 50 Hz gait-like acceleration
//!     let samples: Vec<f64> = (0..150)
//!         .map(|i| 0.4 * (i as f64 * 0.25).sin() + 0.1 * (i as f64 * 0.9).cos())
//!         .collect();
//!     let window = quantize(&samples);
//!
//!     let lye = engine.lyapunov(&window, &mut stream);
//!     let dfa = engine.dfa(&window, &mut stream);
//!     println!(
//!         "λ = {:.4}/s, α = {:.3}, flags = {:?}",
//!         lye.per_second(50.0),
//!         dfa.value,
//!         dfa.metrics.flags
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! [`NonlinearDynamicsEngine`] holds the validated configuration and is
//! shared between threads. Per-stream state ([`DynamicRangeMonitor`],
//! [`AdaptiveScalingEngine`], [`CrossStageCoordinator`]) lives in a
//! [`StreamContext`]. Both estimators run through the same four pipeline
//! stages, implemented by [`LyapunovKernel`] and [`DfaKernel`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod fixed_point;
pub mod math_utils;

// Scaling and coordination
pub mod coordinator;
pub mod range_monitor;
pub mod scaling;

// Estimators
pub mod dfa;
pub mod engine;
pub mod lyapunov;

// Validation tooling
pub mod batch;
pub mod error_bounds;
pub mod generators;
pub mod reference;

// Re-exports for convenience - main public API
pub use config::{Algorithm, AnalysisConfig, QualityMode, SignalType};
pub use engine::{
    CalculationMetrics, CalculationResult, NonlinearDynamicsEngine, StreamContext,
    MAX_SATURATION_RATE,
};
pub use errors::{NldError, NldResult};

// Fixed-point exports
pub use fixed_point::{
    dequantize, euclidean_distance, quantize, squared_distance, to_q15, to_real,
    SaturationCounter, Q15, Q15_EPSILON,
};

// Pipeline exports
pub use coordinator::{
    CoordinatorStatus, CrossStageCoordinator, PipelineResult, PipelineStage, QualityFlag,
    StageKernel, StageMetrics, StagePayload, StageResult,
};
pub use dfa::DfaKernel;
pub use lyapunov::LyapunovKernel;
pub use range_monitor::{DynamicRangeMonitor, RangeStatus, RiskPrediction};
pub use scaling::{AdaptiveScalingEngine, ScalingConfig, ScalingRecord, ScalingStrategy};

// Validation exports
pub use error_bounds::{ErrorBounds, QuantizationErrorReport};
pub use generators::{generate_signal, to_q15_signal, GeneratorConfig, RosslerConfig, SyntheticSignal};
pub use reference::{dfa_reference, lyapunov_reference};

// Mathematical utilities exports
pub use math_utils::{
    erf,
    // Safe arithmetic operations
    float_ops::{approx_zero, safe_div, safe_ln},
    generate_box_sizes,
    iqr_filter,
    ols_regression,
    standard_normal_cdf,
};

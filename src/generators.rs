//! Seeded synthetic signals for validation and benchmarking.
//!
//! - **White noise**: i.i.d. standard normal samples (DFA α ≈ 0.5)
//! - **Random walk**: cumulative sum of white noise (DFA α ≈ 1.5)
//! - **Noisy sine**: periodic signal with additive Gaussian noise (LyE ≈ 0)
//! - **Rössler attractor**: chaotic flow integrated with RK4 (LyE > 0)
//!
//! All generators draw from a `ChaCha20Rng`, seeded when
//! [`GeneratorConfig::seed`] is set, so results are reproducible across
//! platforms. [`to_q15_signal`] brings any real signal into Q15 range.

use crate::errors::{validate_parameter, validate_range, NldError, NldResult};
use crate::fixed_point::{to_q15, Q15};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Largest signal length accepted by the generators.
pub const MAX_GENERATED_LENGTH: usize = 10_000_000;

/// RK4 sub-steps per output sample of the Rössler flow.
const RK4_SUBSTEPS: usize = 10;

/// Common generation parameters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GeneratorConfig {
    /// Number of samples produced
    pub length: usize,
    /// Seed for reproducible generation; entropy-seeded when `None`
    pub seed: Option<u64>,
    /// Sampling rate in Hz
    pub sampling_rate_hz: f64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            length: 1000,
            seed: None,
            sampling_rate_hz: 50.0,
        }
    }
}

impl GeneratorConfig {
    /// Seeded configuration of a given length.
    pub fn seeded(length: usize, seed: u64) -> Self {
        Self {
            length,
            seed: Some(seed),
            ..Self::default()
        }
    }

    fn validate(&self) -> NldResult<()> {
        validate_range(self.length, 1, MAX_GENERATED_LENGTH, "length")?;
        validate_parameter(self.sampling_rate_hz, f64::MIN_POSITIVE, 1e9, "sampling_rate_hz")
    }

    fn rng(&self) -> ChaCha20Rng {
        match self.seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        }
    }
}

/// Rössler system parameters.
///
/// dx/dt = −y − z, dy/dt = x + a·y, dz/dt = b + z·(x − c)
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RosslerConfig {
    /// Linear feedback of y
    pub a: f64,
    /// Constant drive of z
    pub b: f64,
    /// Threshold of the z nonlinearity
    pub c: f64,
    /// Integration time between output samples
    pub dt: f64,
    /// State at t = 0
    pub initial_state: [f64; 3],
    /// Leading fraction of the trajectory discarded as transient
    pub transient_fraction: f64,
}

impl Default for RosslerConfig {
    fn default() -> Self {
        Self {
            a: 0.2,
            b: 0.2,
            c: 5.7,
            dt: 0.1,
            initial_state: [1.0, 1.0, 1.0],
            transient_fraction: 0.2,
        }
    }
}

/// Synthetic signal families.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SyntheticSignal {
    /// Standard normal samples
    WhiteNoise,
    /// Cumulative sum of standard normal samples
    RandomWalk,
    /// `amplitude · sin(2π f t)` plus Gaussian noise of `noise_std`
    NoisySine {
        /// Sine frequency in Hz
        frequency_hz: f64,
        /// Peak amplitude of the sine
        amplitude: f64,
        /// Standard deviation of the noise
        noise_std: f64,
    },
    /// x coordinate of the Rössler attractor
    Rossler(RosslerConfig),
}

/// Generate a real-valued signal of the requested family.
pub fn generate_signal(kind: &SyntheticSignal, config: &GeneratorConfig) -> NldResult<Vec<f64>> {
    match kind {
        SyntheticSignal::WhiteNoise => generate_white_noise(config),
        SyntheticSignal::RandomWalk => generate_random_walk(config),
        SyntheticSignal::NoisySine {
            frequency_hz,
            amplitude,
            noise_std,
        } => generate_noisy_sine(config, *frequency_hz, *amplitude, *noise_std),
        SyntheticSignal::Rossler(rossler) => Ok(generate_rossler(config, rossler)?
            .into_iter()
            .map(|[x, _, _]| x)
            .collect()),
    }
}

/// Standard normal white noise.
pub fn generate_white_noise(config: &GeneratorConfig) -> NldResult<Vec<f64>> {
    config.validate()?;
    let mut rng = config.rng();
    Ok((0..config.length)
        .map(|_| rng.sample::<f64, _>(StandardNormal))
        .collect())
}

/// Discrete Brownian motion starting at zero.
pub fn generate_random_walk(config: &GeneratorConfig) -> NldResult<Vec<f64>> {
    let mut position = 0.0;
    Ok(generate_white_noise(config)?
        .into_iter()
        .map(|step| {
            position += step;
            position
        })
        .collect())
}

/// Sine wave sampled at `config.sampling_rate_hz` with additive noise.
pub fn generate_noisy_sine(
    config: &GeneratorConfig,
    frequency_hz: f64,
    amplitude: f64,
    noise_std: f64,
) -> NldResult<Vec<f64>> {
    config.validate()?;
    validate_parameter(frequency_hz, 0.0, config.sampling_rate_hz / 2.0, "frequency_hz")?;
    validate_parameter(amplitude, 0.0, f64::MAX, "amplitude")?;
    validate_parameter(noise_std, 0.0, f64::MAX, "noise_std")?;

    let mut rng = config.rng();
    let omega = 2.0 * PI * frequency_hz / config.sampling_rate_hz;
    Ok((0..config.length)
        .map(|i| {
            let noise = if noise_std > 0.0 {
                noise_std * rng.sample::<f64, _>(StandardNormal)
            } else {
                0.0
            };
            amplitude * (omega * i as f64).sin() + noise
        })
        .collect())
}

/// Rössler trajectory after the transient, `config.length` states long.
///
/// The flow is integrated with classical RK4 at `dt / 10` and sampled every
/// `dt`. The seed is not used; the trajectory is fully determined by the
/// initial state.
pub fn generate_rossler(
    config: &GeneratorConfig,
    rossler: &RosslerConfig,
) -> NldResult<Vec<[f64; 3]>> {
    config.validate()?;
    validate_parameter(rossler.dt, 1e-6, 1.0, "dt")?;
    validate_parameter(rossler.transient_fraction, 0.0, 0.9, "transient_fraction")?;

    let total = (config.length as f64 / (1.0 - rossler.transient_fraction)).ceil() as usize;
    let skip = total.saturating_sub(config.length);
    let h = rossler.dt / RK4_SUBSTEPS as f64;

    let mut state = rossler.initial_state;
    let mut trajectory = Vec::with_capacity(config.length);
    for i in 0..skip + config.length {
        if i >= skip {
            trajectory.push(state);
        }
        for _ in 0..RK4_SUBSTEPS {
            state = rk4_step(state, h, rossler);
        }
        if state.iter().any(|v| !v.is_finite()) {
            return Err(NldError::NumericalError {
                reason: format!("Rössler integration diverged at sample {}", i),
                operation: Some("rk4_step".to_string()),
            });
        }
    }
    Ok(trajectory)
}

fn rossler_derivative([x, y, z]: [f64; 3], p: &RosslerConfig) -> [f64; 3] {
    [-y - z, x + p.a * y, p.b + z * (x - p.c)]
}

fn rk4_step(state: [f64; 3], h: f64, p: &RosslerConfig) -> [f64; 3] {
    let offset = |s: [f64; 3], k: [f64; 3], f: f64| {
        [s[0] + f * k[0], s[1] + f * k[1], s[2] + f * k[2]]
    };
    let k1 = rossler_derivative(state, p);
    let k2 = rossler_derivative(offset(state, k1, h / 2.0), p);
    let k3 = rossler_derivative(offset(state, k2, h / 2.0), p);
    let k4 = rossler_derivative(offset(state, k3, h), p);
    let mut next = state;
    for d in 0..3 {
        next[d] += h / 6.0 * (k1[d] + 2.0 * k2[d] + 2.0 * k3[d] + k4[d]);
    }
    next
}

/// Rescale so the largest magnitude equals `target_peak`.
///
/// Returns the rescaled values and the factor applied. An all-zero signal is
/// returned unchanged with factor 1.
pub fn normalize_peak(values: &[f64], target_peak: f64) -> (Vec<f64>, f64) {
    let peak = values
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if peak == 0.0 {
        return (values.to_vec(), 1.0);
    }
    let factor = target_peak / peak;
    (values.iter().map(|v| v * factor).collect(), factor)
}

/// Peak-normalise to `peak` (in (0, 1]) and quantize to Q15.
pub fn to_q15_signal(values: &[f64], peak: f64) -> Vec<Q15> {
    let (normalized, _) = normalize_peak(values, peak.clamp(f64::EPSILON, 1.0));
    normalized.into_iter().map(to_q15).collect()
}

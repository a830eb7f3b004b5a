//! Double-precision reference estimators.
//!
//! Same algorithms and parameters as the Q15 kernels, computed in `f64`
//! without scaling, so the quantization error of the fixed-point path can be
//! measured directly. These are validation tools, not part of the analysis
//! pipeline, and report problems as errors instead of neutral values.

use crate::config::{Algorithm, AnalysisConfig};
use crate::errors::{validate_all_finite, validate_data_length, NldError, NldResult};
use crate::math_utils::{generate_box_sizes, iqr_filter, mean, ols_regression};

/// Largest Lyapunov exponent per sample step (Rosenstein) in `f64`.
pub fn lyapunov_reference(signal: &[f64], config: &AnalysisConfig) -> NldResult<f64> {
    config.validate()?;
    validate_all_finite(signal, "signal")?;
    let m = config.embedding_dimension;
    let tau = config.time_delay;
    validate_data_length(signal, config.min_signal_length(Algorithm::Lyapunov))?;

    let count = signal.len() - (m - 1) * tau;
    let vectors: Vec<Vec<f64>> = (0..count)
        .map(|i| (0..m).map(|j| signal[i + j * tau]).collect())
        .collect();
    let distance = |a: usize, b: usize| -> f64 {
        vectors[a]
            .iter()
            .zip(&vectors[b])
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f64>()
            .sqrt()
    };

    let min_points = config.min_divergence_points;
    if count < min_points {
        return Err(NldError::InsufficientData {
            required: min_points,
            actual: count,
        });
    }
    let last = count - min_points;
    let floor = config.min_distance;

    let mut slopes = Vec::new();
    for reference in 0..=last {
        let neighbor = (0..=last)
            .filter(|&c| reference.abs_diff(c) > config.theiler_window)
            .map(|c| (distance(reference, c), c))
            .filter(|&(d, _)| d > floor)
            .min_by(|a, b| a.0.total_cmp(&b.0));
        let Some((_, neighbor)) = neighbor else {
            continue;
        };

        let (steps, logs): (Vec<f64>, Vec<f64>) = (0..config.max_divergence_steps)
            .take_while(|k| reference + k < count && neighbor + k < count)
            .filter_map(|k| {
                let d = distance(reference + k, neighbor + k);
                (d > floor).then(|| (k as f64, d.ln()))
            })
            .unzip();
        if steps.len() < min_points {
            continue;
        }
        if let Ok(fit) = ols_regression(&steps, &logs) {
            slopes.push(fit.slope);
        }
    }

    let kept = iqr_filter(&slopes);
    if kept.is_empty() {
        return Err(NldError::NumericalError {
            reason: "no neighbour pair produced a divergence slope".to_string(),
            operation: Some("lyapunov_reference".to_string()),
        });
    }
    Ok(mean(&kept))
}

/// DFA fluctuation function `F(n)` for every usable box size.
///
/// Each box is detrended by a least-squares line; `F(n)` is the mean of the
/// per-box residual RMS values.
pub fn dfa_fluctuations(signal: &[f64], config: &AnalysisConfig) -> NldResult<Vec<(usize, f64)>> {
    config.validate()?;
    validate_all_finite(signal, "signal")?;

    let mu = mean(signal);
    let mut running = 0.0;
    let profile: Vec<f64> = signal
        .iter()
        .map(|x| {
            running += x - mu;
            running
        })
        .collect();

    let sizes = generate_box_sizes(
        signal.len(),
        config.min_box_size,
        config.max_box_size,
        config.max_box_fraction,
        config.box_size_count,
    );

    Ok(sizes
        .into_iter()
        .filter(|&n| n >= 3 && signal.len() / n >= 2)
        .map(|n| {
            let boxes = profile.len() / n;
            let total: f64 = (0..boxes)
                .map(|b| detrended_rms(&profile[b * n..(b + 1) * n]))
                .sum();
            (n, total / boxes as f64)
        })
        .collect())
}

/// DFA scaling exponent α in `f64`.
pub fn dfa_reference(signal: &[f64], config: &AnalysisConfig) -> NldResult<f64> {
    let points: Vec<(f64, f64)> = dfa_fluctuations(signal, config)?
        .into_iter()
        .filter(|&(_, f)| f > 0.0)
        .map(|(n, f)| ((n as f64).ln(), f.ln()))
        .collect();
    if points.len() < 2 {
        return Err(NldError::InsufficientData {
            required: 2,
            actual: points.len(),
        });
    }
    let (log_n, log_f): (Vec<f64>, Vec<f64>) = points.into_iter().unzip();
    Ok(ols_regression(&log_n, &log_f)?.slope)
}

fn detrended_rms(segment: &[f64]) -> f64 {
    let n = segment.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = segment.iter().sum::<f64>() / n;
    let (sxy, sxx) = segment
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(sxy, sxx), (i, y)| {
            let dx = i as f64 - x_mean;
            (sxy + dx * (y - y_mean), sxx + dx * dx)
        });
    let slope = sxy / sxx;
    let sse: f64 = segment
        .iter()
        .enumerate()
        .map(|(i, y)| {
            let r = y - (y_mean + slope * (i as f64 - x_mean));
            r * r
        })
        .sum();
    (sse / n).sqrt()
}

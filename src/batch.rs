//! Multi-window analysis.
//!
//! [`analyze_windows`] treats every window as an independent stream with its
//! own [`StreamContext`](crate::engine::StreamContext); with the `parallel` feature the windows are spread
//! over the rayon pool. [`analyze_stream`] walks one long recording with
//! overlapping windows and a single shared context, so scaling history and
//! bottleneck feedback carry over from window to window.

use crate::config::Algorithm;
use crate::engine::{CalculationResult, NonlinearDynamicsEngine};
use crate::errors::{validate_range, NldResult};
use crate::fixed_point::Q15;
use log::debug;

/// Analyse independent windows, each with a fresh stream context.
///
/// Results are returned in input order.
pub fn analyze_windows<W>(
    engine: &NonlinearDynamicsEngine,
    algorithm: Algorithm,
    windows: &[W],
) -> Vec<CalculationResult>
where
    W: AsRef<[Q15]> + Sync,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        windows
            .par_iter()
            .map(|window| {
                let mut stream = engine.new_stream();
                engine.analyze(algorithm, window.as_ref(), &mut stream)
            })
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        windows
            .iter()
            .map(|window| {
                let mut stream = engine.new_stream();
                engine.analyze(algorithm, window.as_ref(), &mut stream)
            })
            .collect()
    }
}

/// Sliding-window analysis of one recording.
///
/// Windows of `window_len` samples start every `hop` samples; a trailing
/// partial window is not analysed.
pub fn analyze_stream(
    engine: &NonlinearDynamicsEngine,
    algorithm: Algorithm,
    signal: &[Q15],
    window_len: usize,
    hop: usize,
) -> NldResult<Vec<CalculationResult>> {
    validate_range(window_len, 1, usize::MAX, "window_len")?;
    validate_range(hop, 1, usize::MAX, "hop")?;

    let mut stream = engine.new_stream();
    let results: Vec<CalculationResult> = (0..)
        .map(|w| w * hop)
        .take_while(|start| start + window_len <= signal.len())
        .map(|start| engine.analyze(algorithm, &signal[start..start + window_len], &mut stream))
        .collect();
    debug!(
        "{:?}: analysed {} windows of {} samples",
        algorithm,
        results.len(),
        window_len
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::coordinator::QualityFlag;
    use crate::fixed_point::to_q15;

    fn sine(len: usize, amplitude: f64) -> Vec<Q15> {
        (0..len)
            .map(|i| to_q15(amplitude * (i as f64 * 0.37).sin()))
            .collect()
    }

    #[test]
    fn test_windows_keep_order() {
        let engine = NonlinearDynamicsEngine::new(AnalysisConfig::accelerometer()).unwrap();
        let windows = vec![sine(150, 0.5), vec![to_q15(0.1); 10], sine(150, 0.05)];
        let results = analyze_windows(&engine, Algorithm::Dfa, &windows);
        assert_eq!(results.len(), 3);
        assert!(!results[0].is_neutral());
        assert!(results[1].has_flag(QualityFlag::InsufficientData));
        assert!(!results[2].is_neutral());
    }

    #[test]
    fn test_independent_windows_match_fresh_runs() {
        let engine = NonlinearDynamicsEngine::new(AnalysisConfig::accelerometer()).unwrap();
        let windows = vec![sine(150, 0.4), sine(150, 0.4)];
        let results = analyze_windows(&engine, Algorithm::Lyapunov, &windows);
        assert_eq!(results[0].value, results[1].value);
    }

    #[test]
    fn test_stream_window_count() {
        let engine = NonlinearDynamicsEngine::new(AnalysisConfig::accelerometer()).unwrap();
        let signal = sine(500, 0.5);
        let results = analyze_stream(&engine, Algorithm::Dfa, &signal, 150, 50).unwrap();
        // Starts at 0, 50, ..., 350
        assert_eq!(results.len(), 8);
        assert!(analyze_stream(&engine, Algorithm::Dfa, &signal, 150, 0).is_err());
        assert!(analyze_stream(&engine, Algorithm::Dfa, &signal, 600, 50)
            .unwrap()
            .is_empty());
    }
}

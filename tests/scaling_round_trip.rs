//! Integration tests for scale-in/scale-out and overflow forecasting

use nld_q15::range_monitor::MonitorConfig;
use nld_q15::{
    to_q15, to_real, AdaptiveScalingEngine, DynamicRangeMonitor, RangeStatus, ScalingConfig,
    SignalType, Q15, Q15_EPSILON,
};

fn tone(amplitude: f64, len: usize) -> Vec<Q15> {
    (0..len)
        .map(|i| to_q15(amplitude * (i as f64 * 0.21).sin() + 0.1 * amplitude * (i as f64 * 1.3).cos()))
        .collect()
}

fn max_round_trip_error(original: &[Q15], recovered: &[f64]) -> f64 {
    original
        .iter()
        .zip(recovered)
        .map(|(&o, &r)| (to_real(o) - r).abs())
        .fold(0.0, f64::max)
}

/// Test scenario: near-zero, mid-range and near-saturation amplitudes
///
/// Each regime recovers within 4 quantization steps per sample. Only the
/// near-saturation regime, where the factor drops below one, accumulates
/// enough round-trip error to switch compensation on.
#[test]
fn test_three_amplitude_regimes() {
    let threshold = ScalingConfig::default().compensation_threshold;
    let regimes = [(0.002, false), (0.35, false), (0.97, true)];

    for (amplitude, expect_compensation) in regimes {
        let mut engine = AdaptiveScalingEngine::new(ScalingConfig::default());
        let signal = tone(amplitude / 1.1, 300);
        let (scaled, record) = engine.scale_signal(&signal, "regime");

        let compensating = record.error_estimate > threshold;
        assert_eq!(
            compensating, expect_compensation,
            "amplitude {}: factor {}, error {}",
            amplitude, record.scale_factor, record.error_estimate
        );
        assert_eq!(record.saturated, 0);

        let recovered = engine.reverse_scale(&scaled, record);
        let worst = max_round_trip_error(&signal, &recovered);
        assert!(
            worst <= 4.0 * Q15_EPSILON,
            "amplitude {}: worst error {} LSB",
            amplitude,
            worst / Q15_EPSILON
        );
    }
}

/// Test scenario: repeated windows of changing amplitude on one stage
///
/// Rate limiting may leave the factor away from the headroom target, but the
/// round trip never saturates and stays within the bound.
#[test]
fn test_round_trip_across_amplitude_steps() {
    let mut engine = AdaptiveScalingEngine::new(ScalingConfig::default());
    for amplitude in [0.05, 0.9, 0.01, 0.6, 0.98, 0.2] {
        let signal = tone(amplitude / 1.1, 150);
        let (scaled, record) = engine.scale_signal(&signal, "stream");
        assert_eq!(record.saturated, 0, "amplitude {}", amplitude);
        let recovered = engine.reverse_scale(&scaled, record);
        assert!(max_round_trip_error(&signal, &recovered) <= 4.0 * Q15_EPSILON);
    }
}

/// Test scenario: a rising peak trend never reports lower risk further out
#[test]
fn test_rising_trend_risk_is_monotone_in_horizon() {
    let mut monitor = DynamicRangeMonitor::new(MonitorConfig::default());
    let block = monitor.config().peak_block;
    let len = block * 12;
    for i in 0..len {
        let envelope = 0.1 + 0.6 * i as f64 / len as f64;
        let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
        monitor.observe(to_q15(sign * envelope));
    }

    let mut previous = 0.0;
    for horizon in (0..2000).step_by(25) {
        let risk = monitor.predict_risk(horizon);
        assert!((0.0..=1.0).contains(&risk.probability));
        assert!(
            risk.probability >= previous,
            "horizon {}: {} < {}",
            horizon,
            risk.probability,
            previous
        );
        previous = risk.probability;
    }
    assert!(previous > 0.99);
    assert!(monitor.predict_risk(0).time_to_risk.is_some());
}

/// Test scenario: monitor classification feeds the scaling ceiling
#[test]
fn test_overflow_risk_caps_scale_factor() {
    let mut monitor = DynamicRangeMonitor::for_signal(SignalType::Accelerometer);
    let loud: Vec<Q15> = (0..200)
        .map(|i| to_q15(if i % 2 == 0 { 0.97 } else { -0.97 }))
        .collect();
    let status = monitor.observe_batch(&loud);
    let suggested = match status {
        RangeStatus::OverflowRisk(s) => s,
        other => panic!("expected OverflowRisk, got {:?}", other),
    };
    assert!(suggested < 1.0);

    let mut engine = AdaptiveScalingEngine::new(ScalingConfig::default());
    let (_, record) = engine.scale_signal_with_status(&loud, "psr", status);
    assert!(record.scale_factor <= suggested + 1e-12);
    assert_eq!(record.saturated, 0);
}

//! Integration tests for Q15 arithmetic properties
//!
//! Saturation at the representable extremes, and the wide distance
//! accumulator across dimension counts on both sides of the unroll width.

use assert_approx_eq::assert_approx_eq;
use nld_q15::fixed_point::{add, distance_wide, div, mul, sqrt, sub, ACCUMULATOR_LANES};
use nld_q15::{euclidean_distance, squared_distance, to_q15, to_real, SaturationCounter, Q15};

/// Test scenario: every primitive saturates instead of wrapping
#[test]
fn test_primitives_saturate_at_extremes() {
    assert_eq!(add(Q15::MAX, Q15::MAX), Q15::MAX);
    assert_eq!(add(Q15::MIN, Q15::MIN), Q15::MIN);
    assert_eq!(sub(Q15::MIN, Q15::MAX), Q15::MIN);
    assert_eq!(sub(Q15::MAX, Q15::MIN), Q15::MAX);
    assert_eq!(mul(Q15::MIN, Q15::MIN), Q15::MAX);
    assert_eq!(div(Q15::HALF, Q15::ZERO), Q15::MAX);
    assert_eq!(div(to_q15(-0.5), Q15::ZERO), Q15::MIN);
    assert_eq!(sqrt(to_q15(-0.25)), Q15::ZERO);

    // Mixed-sign arithmetic away from the rails stays exact
    assert_eq!(add(to_q15(0.25), to_q15(-0.5)), to_q15(-0.25));
    assert_approx_eq!(to_real(mul(to_q15(0.5), to_q15(-0.5))), -0.25, 1e-4);
}

/// Test scenario: the counter sees every clamp
#[test]
fn test_saturation_counter_tracks_clamps() {
    let mut counter = SaturationCounter::new();
    let mut acc = Q15::ZERO;
    for _ in 0..10 {
        acc = counter.add(acc, to_q15(0.3));
    }
    assert_eq!(acc, Q15::MAX);
    assert_eq!(counter.operations(), 10);
    // 0.3, 0.6, 0.9 fit; the remaining seven clamp
    assert_eq!(counter.events(), 7);
    assert_approx_eq!(counter.rate(), 0.7);
}

/// Test scenario: ±0.5 in every dimension is √dim apart
///
/// Covers dimension counts below, at, between and above multiples of the
/// accumulator unroll width.
#[test]
fn test_opposite_half_scale_vectors_distance_is_sqrt_dim() {
    assert_eq!(ACCUMULATOR_LANES, 8);
    for dim in [1usize, 2, 5, 7, 8, 9, 10, 15, 16, 17, 20] {
        let a = vec![to_q15(0.5); dim];
        let b = vec![to_q15(-0.5); dim];
        let distance = euclidean_distance(&a, &b);
        assert!(
            (distance - (dim as f64).sqrt()).abs() < 1e-3,
            "dim {}: distance {} instead of √{}",
            dim,
            distance,
            dim
        );
    }

    let a = vec![to_q15(0.5); 10];
    let b = vec![to_q15(-0.5); 10];
    assert_approx_eq!(euclidean_distance(&a, &b), 10f64.sqrt(), 1e-4);
}

/// Test scenario: full-scale extremes up to 20 dimensions
#[test]
fn test_accumulator_does_not_overflow_at_full_scale() {
    for dim in [5usize, 8, 10, 16, 20] {
        let a = vec![Q15::MAX; dim];
        let b = vec![Q15::MIN; dim];
        let span = i16::MAX as i64 - i16::MIN as i64;
        assert_eq!(squared_distance(&a, &b), span * span * dim as i64);

        let expected = span as f64 * (dim as f64).sqrt();
        let wide = distance_wide(&a, &b) as f64;
        assert!(wide <= expected && expected - wide < 1.0, "dim {}", dim);
    }
}

/// Test scenario: distance is symmetric and zero on identical vectors
#[test]
fn test_distance_symmetry() {
    let a: Vec<Q15> = (0..13).map(|i| to_q15(0.07 * i as f64 - 0.4)).collect();
    let b: Vec<Q15> = (0..13).map(|i| to_q15(0.3 - 0.05 * i as f64)).collect();
    assert_eq!(squared_distance(&a, &b), squared_distance(&b, &a));
    assert_eq!(squared_distance(&a, &a), 0);
    assert_eq!(euclidean_distance(&b, &b), 0.0);
}

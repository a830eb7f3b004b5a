//! Q15 fixed-point arithmetic for the nonlinear dynamics pipeline.
//!
//! A [`Q15`] is a 16-bit signed value representing the real range
//! `[-1.0, 1.0 - 2⁻¹⁵]` with a resolution of `2⁻¹⁵`. Every operation in this
//! module saturates: a result that does not fit is clamped to the nearest
//! representable boundary, it never wraps.
//!
//! ## Widening rules
//!
//! - `add`/`sub` are computed in `i32` and narrowed with saturation.
//! - `mul` widens both operands to `i32` before the product and shifts back
//!   by 15 bits. There is no narrower multiply path.
//! - `div` pre-shifts the dividend left by 15 bits in `i64`.
//! - Sums of squared differences (Euclidean distances, variances) are
//!   accumulated in `i64`. A single squared difference of two Q15 extremes is
//!   `65535² ≈ 2³²`, which already overflows `i32`.
//!
//! ## Transcendentals
//!
//! - [`Q15::sqrt`] uses integer Newton–Raphson capped at 8 iterations.
//! - [`Q15::ln`] and [`log_wide`] use a 257-entry mantissa table with linear
//!   interpolation (maximum absolute error below 2·10⁻⁶).

use once_cell::sync::Lazy;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Number of fractional bits.
pub const FRAC_BITS: u32 = 15;

/// Real value of one raw unit (2¹⁵).
pub const Q15_SCALE: f64 = 32768.0;

/// Quantization step (one least significant bit) in real units.
pub const Q15_EPSILON: f64 = 1.0 / Q15_SCALE;

/// Lanes per unrolled block in the distance accumulators.
pub const ACCUMULATOR_LANES: usize = 8;

const RAW_MAX: i64 = i16::MAX as i64;
const RAW_MIN: i64 = i16::MIN as i64;

/// Table resolution for the logarithm (entries cover `ln(1 + k/256)`).
const LN_TABLE_STEPS: usize = 256;

static LN_MANTISSA_TABLE: Lazy<[f64; LN_TABLE_STEPS + 1]> = Lazy::new(|| {
    let mut table = [0.0; LN_TABLE_STEPS + 1];
    for (k, entry) in table.iter_mut().enumerate() {
        *entry = (1.0 + k as f64 / LN_TABLE_STEPS as f64).ln();
    }
    table
});

/// 16-bit signed fixed-point number with 15 fractional bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Q15(i16);

impl Q15 {
    /// Zero.
    pub const ZERO: Self = Self(0);
    /// Largest value, `1 - 2⁻¹⁵`.
    pub const MAX: Self = Self(i16::MAX);
    /// Smallest value, `-1.0`.
    pub const MIN: Self = Self(i16::MIN);
    /// One half.
    pub const HALF: Self = Self(1 << 14);

    /// Create from a raw 16-bit value.
    pub const fn from_raw(raw: i16) -> Self {
        Self(raw)
    }

    /// Raw 16-bit value.
    pub const fn raw(self) -> i16 {
        self.0
    }

    /// Quantize a real value (see [`to_q15`]).
    pub fn from_f64(value: f64) -> Self {
        to_q15(value)
    }

    /// Real value (see [`to_real`]).
    pub fn to_f64(self) -> f64 {
        to_real(self)
    }

    /// Narrow a wide intermediate to Q15, clamping out-of-range values.
    #[inline]
    pub fn saturate(wide: i64) -> Self {
        Self::saturate_flagged(wide).0
    }

    /// Narrow a wide intermediate, also reporting whether clamping occurred.
    #[inline]
    pub fn saturate_flagged(wide: i64) -> (Self, bool) {
        if wide > RAW_MAX {
            (Self::MAX, true)
        } else if wide < RAW_MIN {
            (Self::MIN, true)
        } else {
            (Self(wide as i16), false)
        }
    }

    /// Saturating addition computed in a 32-bit intermediate.
    #[inline]
    pub fn saturating_add(self, other: Self) -> Self {
        Self::saturate(self.0 as i32 as i64 + other.0 as i32 as i64)
    }

    /// Saturating subtraction computed in a 32-bit intermediate.
    #[inline]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self::saturate(self.0 as i32 as i64 - other.0 as i32 as i64)
    }

    /// Saturating multiplication: widen to 32 bits, multiply, round, shift by 15.
    ///
    /// The only product that saturates is `-1.0 × -1.0`.
    #[inline]
    pub fn saturating_mul(self, other: Self) -> Self {
        Self::saturate(Self::mul_wide(self, other))
    }

    #[inline]
    fn mul_wide(a: Self, b: Self) -> i64 {
        let product = a.0 as i32 as i64 * b.0 as i32 as i64;
        (product + (1 << (FRAC_BITS - 1))) >> FRAC_BITS
    }

    /// Saturating division with the dividend pre-shifted by 15 bits.
    ///
    /// Division by zero returns the maximum magnitude carrying the sign of
    /// the dividend instead of signalling an error.
    #[inline]
    pub fn saturating_div(self, other: Self) -> Self {
        Self::div_flagged(self, other).0
    }

    fn div_flagged(a: Self, b: Self) -> (Self, bool) {
        if b.0 == 0 {
            return if a.0 >= 0 {
                (Self::MAX, true)
            } else {
                (Self::MIN, true)
            };
        }
        Self::saturate_flagged(((a.0 as i64) << FRAC_BITS) / b.0 as i64)
    }

    /// Saturating negation (`-(-1.0)` becomes `MAX`).
    #[inline]
    pub fn saturating_neg(self) -> Self {
        Self::saturate(-(self.0 as i64))
    }

    /// Saturating absolute value.
    #[inline]
    pub fn saturating_abs(self) -> Self {
        Self::saturate((self.0 as i64).abs())
    }

    /// Square root via integer Newton–Raphson (at most 8 iterations).
    ///
    /// Amplitudes are never negative, so a negative input returns zero.
    pub fn sqrt(self) -> Self {
        if self.0 <= 0 {
            return Self::ZERO;
        }
        // sqrt(a / 2^15) * 2^15 == sqrt(a * 2^15)
        let v = (self.0 as u64) << FRAC_BITS;
        let bits = 64 - v.leading_zeros();
        let mut x = 1u64 << ((bits + 1) / 2);
        for _ in 0..8 {
            let next = (x + v / x) >> 1;
            if next >= x {
                break;
            }
            x = next;
        }
        Self::saturate(x as i64)
    }

    /// Natural logarithm by table lookup.
    ///
    /// Returns `f64::NEG_INFINITY` for inputs `<= 0`; callers are expected to
    /// reject degenerate (zero) magnitudes before taking the log.
    pub fn ln(self) -> f64 {
        if self.0 <= 0 {
            return f64::NEG_INFINITY;
        }
        log_wide(self.0 as u64)
    }
}

impl fmt::Display for Q15 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.to_f64())
    }
}

impl Add for Q15 {
    type Output = Q15;
    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl Sub for Q15 {
    type Output = Q15;
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl Mul for Q15 {
    type Output = Q15;
    fn mul(self, rhs: Self) -> Self {
        self.saturating_mul(rhs)
    }
}

impl Div for Q15 {
    type Output = Q15;
    fn div(self, rhs: Self) -> Self {
        self.saturating_div(rhs)
    }
}

impl Neg for Q15 {
    type Output = Q15;
    fn neg(self) -> Self {
        self.saturating_neg()
    }
}

/// Quantize a real value: scale by 2¹⁵, round to nearest, clamp.
///
/// Saturation is silent. NaN maps to zero.
pub fn to_q15(value: f64) -> Q15 {
    to_q15_flagged(value).0
}

/// Quantize, also reporting whether the value was clamped.
pub fn to_q15_flagged(value: f64) -> (Q15, bool) {
    if value.is_nan() {
        return (Q15::ZERO, false);
    }
    let scaled = (value * Q15_SCALE).round();
    if scaled > RAW_MAX as f64 {
        (Q15::MAX, true)
    } else if scaled < RAW_MIN as f64 {
        (Q15::MIN, true)
    } else {
        (Q15(scaled as i16), false)
    }
}

/// Exact inverse scaling (divide by 2¹⁵).
#[inline]
pub fn to_real(value: Q15) -> f64 {
    value.0 as f64 / Q15_SCALE
}

/// Saturating addition.
#[inline]
pub fn add(a: Q15, b: Q15) -> Q15 {
    a.saturating_add(b)
}

/// Saturating subtraction.
#[inline]
pub fn sub(a: Q15, b: Q15) -> Q15 {
    a.saturating_sub(b)
}

/// Saturating multiplication.
#[inline]
pub fn mul(a: Q15, b: Q15) -> Q15 {
    a.saturating_mul(b)
}

/// Saturating division; division by zero yields the signed maximum magnitude.
#[inline]
pub fn div(a: Q15, b: Q15) -> Q15 {
    a.saturating_div(b)
}

/// Square root (negative input returns zero).
#[inline]
pub fn sqrt(a: Q15) -> Q15 {
    a.sqrt()
}

/// Natural logarithm (input `<= 0` returns negative infinity).
#[inline]
pub fn log(a: Q15) -> f64 {
    a.ln()
}

/// Quantize a slice of real values.
pub fn quantize(values: &[f64]) -> Vec<Q15> {
    values.iter().map(|&v| to_q15(v)).collect()
}

/// Convert a slice of Q15 values back to real values.
pub fn dequantize(values: &[Q15]) -> Vec<f64> {
    values.iter().map(|&v| to_real(v)).collect()
}

/// Largest absolute raw value in a slice (as `i32`, so `|-32768|` fits).
pub fn peak_abs(values: &[Q15]) -> i32 {
    values
        .iter()
        .map(|v| (v.0 as i32).abs())
        .max()
        .unwrap_or(0)
}

/// Natural logarithm of a wide magnitude expressed in Q15 units
/// (i.e. `ln(v / 2¹⁵)`).
///
/// The magnitude is normalised to a mantissa in `[1, 2)` and an exponent;
/// the mantissa log comes from the table with linear interpolation.
/// Returns `f64::NEG_INFINITY` for zero.
pub fn log_wide(v: u64) -> f64 {
    if v == 0 {
        return f64::NEG_INFINITY;
    }
    let exponent = 63 - v.leading_zeros();
    let base = 1u64 << exponent;
    let fraction = (v - base) as f64 / base as f64;
    let position = fraction * LN_TABLE_STEPS as f64;
    let index = (position as usize).min(LN_TABLE_STEPS - 1);
    let weight = position - index as f64;
    let table = &*LN_MANTISSA_TABLE;
    let mantissa_ln = table[index] + weight * (table[index + 1] - table[index]);
    (exponent as f64 - FRAC_BITS as f64) * std::f64::consts::LN_2 + mantissa_ln
}

/// Integer square root of a wide value (floor), by Newton–Raphson from above.
///
/// Applied to a sum of squares in Q30 units it yields a magnitude in Q15
/// units, which is how distances and RMS fluctuations leave the accumulator.
pub fn isqrt_wide(v: u64) -> u64 {
    if v < 2 {
        return v;
    }
    let bits = 64 - v.leading_zeros();
    let mut x = 1u64 << ((bits + 1) / 2);
    loop {
        let next = (x + v / x) >> 1;
        if next >= x {
            return x;
        }
        x = next;
    }
}

/// Sum of squared differences between two Q15 vectors in Q30 units.
///
/// Differences are formed in `i32` (they span 17 bits), squares and the
/// running sum in `i64`. The loop is unrolled into blocks of
/// [`ACCUMULATOR_LANES`] with a scalar tail, matching the lane width of a
/// 128-bit SIMD register of `i16`. Vectors of unequal length are compared
/// over the shorter length.
pub fn squared_distance(a: &[Q15], b: &[Q15]) -> i64 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    let mut lanes = [0i64; ACCUMULATOR_LANES];
    let mut a_blocks = a.chunks_exact(ACCUMULATOR_LANES);
    let mut b_blocks = b.chunks_exact(ACCUMULATOR_LANES);
    for (block_a, block_b) in (&mut a_blocks).zip(&mut b_blocks) {
        for lane in 0..ACCUMULATOR_LANES {
            let d = block_a[lane].0 as i32 - block_b[lane].0 as i32;
            lanes[lane] += d as i64 * d as i64;
        }
    }

    let mut sum: i64 = lanes.iter().sum();
    for (x, y) in a_blocks.remainder().iter().zip(b_blocks.remainder()) {
        let d = x.0 as i32 - y.0 as i32;
        sum += d as i64 * d as i64;
    }
    sum
}

/// Euclidean distance in Q15 units (may exceed the Q15 range).
#[inline]
pub fn distance_wide(a: &[Q15], b: &[Q15]) -> u64 {
    isqrt_wide(squared_distance(a, b) as u64)
}

/// Euclidean distance in real units.
pub fn euclidean_distance(a: &[Q15], b: &[Q15]) -> f64 {
    distance_wide(a, b) as f64 / Q15_SCALE
}

/// Counts arithmetic operations and saturation events for one analysis call.
///
/// Saturation is part of the arithmetic contract, not an error, but a high
/// saturation rate means the scaling stage is undersized for the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SaturationCounter {
    operations: u64,
    events: u64,
}

impl SaturationCounter {
    /// Fresh counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one operation and whether it saturated.
    #[inline]
    pub fn record(&mut self, saturated: bool) {
        self.operations += 1;
        self.events += saturated as u64;
    }

    /// Record a batch of operations.
    pub fn record_batch(&mut self, operations: u64, events: u64) {
        self.operations += operations;
        self.events += events.min(operations);
    }

    /// Counted saturating addition.
    pub fn add(&mut self, a: Q15, b: Q15) -> Q15 {
        let (value, saturated) = Q15::saturate_flagged(a.0 as i64 + b.0 as i64);
        self.record(saturated);
        value
    }

    /// Counted saturating subtraction.
    pub fn sub(&mut self, a: Q15, b: Q15) -> Q15 {
        let (value, saturated) = Q15::saturate_flagged(a.0 as i64 - b.0 as i64);
        self.record(saturated);
        value
    }

    /// Counted saturating multiplication.
    pub fn mul(&mut self, a: Q15, b: Q15) -> Q15 {
        let (value, saturated) = Q15::saturate_flagged(Q15::mul_wide(a, b));
        self.record(saturated);
        value
    }

    /// Counted saturating division.
    pub fn div(&mut self, a: Q15, b: Q15) -> Q15 {
        let (value, saturated) = Q15::div_flagged(a, b);
        self.record(saturated);
        value
    }

    /// Counted narrowing of a wide intermediate.
    pub fn narrow(&mut self, wide: i64) -> Q15 {
        let (value, saturated) = Q15::saturate_flagged(wide);
        self.record(saturated);
        value
    }

    /// Counted quantization of a real value.
    pub fn quantize(&mut self, value: f64) -> Q15 {
        let (q, saturated) = to_q15_flagged(value);
        self.record(saturated);
        q
    }

    /// Add another counter's totals into this one.
    pub fn merge(&mut self, other: &SaturationCounter) {
        self.operations += other.operations;
        self.events += other.events;
    }

    /// Operations counted.
    pub fn operations(&self) -> u64 {
        self.operations
    }

    /// Saturation events counted.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Fraction of counted operations that saturated (0 when nothing counted).
    pub fn rate(&self) -> f64 {
        if self.operations == 0 {
            0.0
        } else {
            self.events as f64 / self.operations as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_conversion_round_trip() {
        assert_eq!(to_q15(0.5).raw(), 16384);
        assert_eq!(to_q15(-1.0), Q15::MIN);
        assert_eq!(to_q15(1.0), Q15::MAX);
        assert_eq!(to_q15(f64::NAN), Q15::ZERO);
        assert_eq!(to_q15(f64::INFINITY), Q15::MAX);
        assert_eq!(to_q15(-7.5), Q15::MIN);
        for raw in [-32768i16, -1, 0, 1, 12345, 32767] {
            let q = Q15::from_raw(raw);
            assert_eq!(to_q15(to_real(q)), q);
        }
    }

    #[test]
    fn test_add_sub_saturate_instead_of_wrapping() {
        assert_eq!(add(Q15::MAX, Q15::MAX), Q15::MAX);
        assert_eq!(add(Q15::MIN, Q15::MIN), Q15::MIN);
        assert_eq!(sub(Q15::MIN, Q15::MAX), Q15::MIN);
        assert_eq!(sub(Q15::MAX, Q15::MIN), Q15::MAX);
        assert_eq!(add(to_q15(0.25), to_q15(0.25)), to_q15(0.5));
        assert_eq!(Q15::MAX + Q15::from_raw(1), Q15::MAX);
    }

    #[test]
    fn test_mul_widens_before_shift() {
        assert_eq!(mul(Q15::HALF, Q15::HALF), to_q15(0.25));
        assert_eq!(mul(Q15::MIN, Q15::MIN), Q15::MAX);
        assert_eq!(mul(Q15::MIN, Q15::MAX).raw(), -32767);
        assert_eq!(mul(to_q15(-0.5), Q15::HALF), to_q15(-0.25));
    }

    #[test]
    fn test_div_pre_shift_and_zero_sentinel() {
        assert_eq!(div(to_q15(0.25), Q15::HALF), Q15::HALF);
        assert_eq!(div(Q15::HALF, to_q15(0.25)), Q15::MAX);
        assert_eq!(div(Q15::HALF, Q15::ZERO), Q15::MAX);
        assert_eq!(div(to_q15(-0.5), Q15::ZERO), Q15::MIN);
        assert_eq!(div(Q15::ZERO, Q15::ZERO), Q15::MAX);
    }

    #[test]
    fn test_sqrt_newton_converges() {
        assert_eq!(sqrt(to_q15(0.25)), Q15::HALF);
        assert_eq!(sqrt(to_q15(-0.25)), Q15::ZERO);
        assert_eq!(sqrt(Q15::ZERO), Q15::ZERO);
        for raw in (1..=i16::MAX).step_by(97) {
            let q = Q15::from_raw(raw);
            let exact = to_real(q).sqrt();
            assert!(
                (to_real(q.sqrt()) - exact).abs() <= Q15_EPSILON,
                "sqrt mismatch at raw {}",
                raw
            );
        }
    }

    #[test]
    fn test_log_table_accuracy() {
        assert_eq!(log(Q15::ZERO), f64::NEG_INFINITY);
        assert_eq!(log(to_q15(-0.3)), f64::NEG_INFINITY);
        for raw in [1i16, 2, 3, 100, 1000, 16384, 20000, 32767] {
            let q = Q15::from_raw(raw);
            assert_approx_eq!(log(q), to_real(q).ln(), 1e-5);
        }
        assert_approx_eq!(log_wide(3 * 32768), 3.0f64.ln(), 1e-5);
    }

    #[test]
    fn test_isqrt_wide_exact_floor() {
        for v in [0u64, 1, 2, 3, 4, 15, 16, 17, 1 << 30, (1 << 40) + 12345, u32::MAX as u64] {
            let r = isqrt_wide(v);
            assert!(r * r <= v);
            assert!((r + 1) * (r + 1) > v);
        }
    }

    #[test]
    fn test_squared_distance_extremes_do_not_overflow() {
        let a = vec![Q15::MAX; 20];
        let b = vec![Q15::MIN; 20];
        let expected = 20i64 * 65535 * 65535;
        assert_eq!(squared_distance(&a, &b), expected);
        assert!(expected > i32::MAX as i64);
    }

    #[test]
    fn test_saturation_counter() {
        let mut counter = SaturationCounter::new();
        counter.add(Q15::MAX, Q15::MAX);
        counter.add(Q15::HALF, Q15::ZERO);
        counter.mul(Q15::MIN, Q15::MIN);
        counter.div(Q15::HALF, Q15::ZERO);
        assert_eq!(counter.operations(), 4);
        assert_eq!(counter.events(), 3);
        assert_approx_eq!(counter.rate(), 0.75, 1e-12);
    }
}

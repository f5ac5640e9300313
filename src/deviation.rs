//! Deviation check between the last on-chain answer and a fresh price
//!
//! All comparison happens in arbitrary-precision integers so a price that was
//! scaled into on-chain units never re-enters floating point.

use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, Zero};

/// Relative change that justifies an off-cycle submission: 0.5%.
const THRESHOLD_NUMERATOR: u32 = 5;
const THRESHOLD_DENOMINATOR: u32 = 1000;

/// True when `next` deviates from `current` by at least the threshold.
///
/// Returns false for a zero `current`, which also keeps the first-ever round
/// (no answer recorded yet) from tripping the check.
pub fn exceeds_threshold(current: &BigInt, next: &BigInt) -> bool {
    if current.is_zero() {
        return false;
    }
    let diff = (next - current).abs();
    diff * THRESHOLD_DENOMINATOR >= current.abs() * THRESHOLD_NUMERATOR
}

/// Scale a floating price into on-chain integer units using the feed's
/// declared decimals, rounding half away from zero.
///
/// Returns `None` for NaN or infinite input.
pub fn scale_price(value: f64, decimals: u8) -> Option<BigInt> {
    if !value.is_finite() {
        return None;
    }
    let scaled = value * 10f64.powi(decimals as i32);
    if !scaled.is_finite() {
        return None;
    }
    BigInt::from_f64(scaled.round())
}

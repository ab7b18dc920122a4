//! Numeric helpers: clamping, overflow-aware arithmetic, and the statistical
//! approximations used for noise calibration.

use crate::error::{DpAggError, Result};
use crate::value::Aggregand;

/// The default privacy parameter used when a builder leaves epsilon unset.
pub fn default_epsilon() -> f64 {
    3f64.ln()
}

/// Smallest power of two greater than or equal to `n`.
pub fn next_power_of_two(n: f64) -> f64 {
    2f64.powf(n.log2().ceil())
}

/// Clamp `value` into `[lower, upper]`.
pub fn clamp<T: PartialOrd>(lower: T, upper: T, value: T) -> T {
    if value > upper {
        upper
    } else if value < lower {
        lower
    } else {
        value
    }
}

/// Result of an overflow-aware arithmetic operation.
///
/// On overflow `value` holds the saturated result and `overflow` is set;
/// callers decide whether saturation is acceptable.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SafeOpResult<T> {
    /// The (possibly saturated) result.
    pub value: T,
    /// Whether the exact result overflowed the type.
    pub overflow: bool,
}

/// Addition that saturates on integer overflow.
pub fn safe_add<T: Aggregand>(a: T, b: T) -> SafeOpResult<T> {
    match a.checked_add_value(b) {
        Some(value) => SafeOpResult {
            value,
            overflow: false,
        },
        None => SafeOpResult {
            value: if b > T::zero() {
                T::max_value()
            } else {
                T::min_value()
            },
            overflow: true,
        },
    }
}

/// Subtraction that saturates on integer overflow.
pub fn safe_subtract<T: Aggregand>(a: T, b: T) -> SafeOpResult<T> {
    match a.checked_sub_value(b) {
        Some(value) => SafeOpResult {
            value,
            overflow: false,
        },
        None => SafeOpResult {
            value: if b > T::zero() {
                T::min_value()
            } else {
                T::max_value()
            },
            overflow: true,
        },
    }
}

/// Squaring that saturates on integer overflow.
pub fn safe_square<T: Aggregand>(a: T) -> SafeOpResult<T> {
    match a.checked_mul_value(a) {
        Some(value) => SafeOpResult {
            value,
            overflow: false,
        },
        None => SafeOpResult {
            value: T::max_value(),
            overflow: true,
        },
    }
}

/// Cast a double to `T`, saturating integer types and flagging range loss.
pub fn safe_cast_from_double<T: Aggregand>(value: f64) -> SafeOpResult<T> {
    let cast = T::from_f64_saturating(value);
    let overflow = if T::INTEGRAL {
        value.is_nan()
            || value.round() > T::max_value().to_f64()
            || value.round() < T::min_value().to_f64()
    } else {
        false
    };
    SafeOpResult {
        value: cast,
        overflow,
    }
}

const ERFINV_LESS_THAN_FIVE: [f64; 9] = [
    0.0000000281022636,
    0.000000343273939,
    -0.0000035233877,
    -0.00000439150654,
    0.00021858087,
    -0.00125372503,
    -0.00417768164,
    0.246640727,
    1.50140941,
];

const ERFINV_GREATER_THAN_FIVE: [f64; 9] = [
    -0.000200214257,
    0.000100950558,
    0.00134934322,
    -0.00367342844,
    0.00573950773,
    -0.0076224613,
    0.00943887047,
    1.00167406,
    2.83297682,
];

/// Inverse error function on (-1, 1).
///
/// Piecewise polynomial approximation: two 9-term Horner series switched at
/// `w = -ln((1-x)(1+x)) = 5`.
pub fn inverse_error_function(x: f64) -> f64 {
    if x.abs() == 1.0 {
        return x * f64::INFINITY;
    }

    let mut w = -((1.0 - x) * (1.0 + x)).ln();
    let coefficients = if w < 5.0 {
        w -= 2.5;
        &ERFINV_LESS_THAN_FIVE
    } else {
        w = w.sqrt() - 3.0;
        &ERFINV_GREATER_THAN_FIVE
    };

    let mut ans = 0.0;
    for coefficient in coefficients {
        ans = coefficient + ans * w;
    }
    ans * x
}

/// Quantile function of the normal distribution `N(mu, sigma)`.
///
/// Beasley-Springer-Moro rational approximation; accurate to roughly 4.5e-4
/// in the standardized quantile.
pub fn qnorm(p: f64, mu: f64, sigma: f64) -> Result<f64> {
    if p <= 0.0 || p >= 1.0 {
        return Err(DpAggError::invalid_argument(
            "Probability must be between 0 and 1, exclusive.",
        ));
    }
    let t = (-2.0 * p.min(1.0 - p).ln()).sqrt();
    let c = [2.515517, 0.802853, 0.010328];
    let d = [1.432788, 0.189269, 0.001308];
    let mut normalized =
        t - ((c[2] * t + c[1]) * t + c[0]) / (((d[2] * t + d[1]) * t + d[0]) * t + 1.0);
    if p < 0.5 {
        normalized = -normalized;
    }
    Ok(normalized * sigma + mu)
}

/// Round `n` to the nearest multiple of `base`, halves toward the next
/// multiple above.
pub fn round_to_nearest_double_multiple(n: f64, base: f64) -> f64 {
    if base == 0.0 {
        return n;
    }
    let remainder = n % base;
    if remainder.abs() > base / 2.0 {
        return n - remainder + remainder.signum() * base;
    }
    if remainder.abs() == base / 2.0 {
        return n + base / 2.0;
    }
    n - remainder
}

/// Integer counterpart of [`round_to_nearest_double_multiple`].
pub fn round_to_nearest_int64_multiple(n: i64, base: i64) -> i64 {
    if base == 0 {
        return n;
    }
    let remainder = n % base;
    if remainder.abs() as f64 > base as f64 / 2.0 {
        return n - remainder + remainder.signum() * base;
    }
    if remainder.abs() * 2 == base {
        return n + base / 2;
    }
    n - remainder
}

#[cfg(test)]
mod tests {
    use super::*;
    use statrs::function::erf::erf;

    #[test]
    fn default_epsilon_is_ln_three() {
        assert!((default_epsilon() - 1.0986122886681098).abs() < 1e-15);
    }

    #[test]
    fn clamp_orders_correctly() {
        assert_eq!(clamp(-10, 10, 3), 3);
        assert_eq!(clamp(-10, 10, 100), 10);
        assert_eq!(clamp(-10, 10, -100), -10);
    }

    #[test]
    fn safe_add_saturates_integers() {
        let result = safe_add(i64::MAX, 1i64);
        assert!(result.overflow);
        assert_eq!(result.value, i64::MAX);

        let result = safe_add(i64::MIN, -1i64);
        assert!(result.overflow);
        assert_eq!(result.value, i64::MIN);

        let result = safe_add(1i64, 2i64);
        assert!(!result.overflow);
        assert_eq!(result.value, 3);
    }

    #[test]
    fn safe_square_flags_overflow() {
        assert!(safe_square(i32::MAX).overflow);
        let result = safe_square(10i32);
        assert!(!result.overflow);
        assert_eq!(result.value, 100);
    }

    #[test]
    fn safe_cast_from_double_rounds_and_saturates() {
        let result = safe_cast_from_double::<i64>(4.6);
        assert!(!result.overflow);
        assert_eq!(result.value, 5);

        let result = safe_cast_from_double::<i32>(1e12);
        assert!(result.overflow);
        assert_eq!(result.value, i32::MAX);
    }

    #[test]
    fn inverse_error_function_round_trips_through_erf() {
        for x in [-0.9, -0.5, -0.1, 0.0, 0.1, 0.5, 0.9, 0.999] {
            let round_trip = erf(inverse_error_function(x));
            assert!(
                (round_trip - x).abs() < 1e-6,
                "erf(erfinv({x})) = {round_trip}"
            );
        }
    }

    #[test]
    fn inverse_error_function_diverges_at_one() {
        assert_eq!(inverse_error_function(1.0), f64::INFINITY);
        assert_eq!(inverse_error_function(-1.0), f64::NEG_INFINITY);
    }

    #[test]
    fn qnorm_matches_known_quantiles() {
        let q975 = qnorm(0.975, 0.0, 1.0).unwrap();
        assert!((q975 - 1.959964).abs() < 1e-3, "q975 = {q975}");
        let q5 = qnorm(0.5, 0.0, 1.0).unwrap();
        assert!(q5.abs() < 1e-3);
        let q025 = qnorm(0.025, 0.0, 1.0).unwrap();
        assert!((q025 + q975).abs() < 1e-9, "quantiles should be symmetric");
    }

    #[test]
    fn qnorm_rejects_degenerate_probabilities() {
        assert!(qnorm(0.0, 0.0, 1.0).is_err());
        assert!(qnorm(1.0, 0.0, 1.0).is_err());
        assert!(qnorm(-0.5, 0.0, 1.0).is_err());
    }

    #[test]
    fn qnorm_applies_location_and_scale() {
        let standard = qnorm(0.8, 0.0, 1.0).unwrap();
        let scaled = qnorm(0.8, 3.0, 2.0).unwrap();
        assert!((scaled - (standard * 2.0 + 3.0)).abs() < 1e-12);
    }

    #[test]
    fn rounding_matches_reference_behavior() {
        assert_eq!(round_to_nearest_double_multiple(5.3, 2.0), 6.0);
        assert_eq!(round_to_nearest_double_multiple(4.9, 2.0), 4.0);
        assert_eq!(round_to_nearest_double_multiple(5.0, 2.0), 6.0);
        assert_eq!(round_to_nearest_double_multiple(-6.0, 4.0), -4.0);
        assert_eq!(round_to_nearest_double_multiple(7.5, 0.0), 7.5);

        assert_eq!(round_to_nearest_int64_multiple(5, 2), 6);
        assert_eq!(round_to_nearest_int64_multiple(-6, 4), -4);
        assert_eq!(round_to_nearest_int64_multiple(9, 4), 8);
        assert_eq!(round_to_nearest_int64_multiple(11, 0), 11);
    }

    #[test]
    fn next_power_of_two_rounds_up() {
        assert_eq!(next_power_of_two(3.0), 4.0);
        assert_eq!(next_power_of_two(4.0), 4.0);
        assert_eq!(next_power_of_two(0.3), 0.5);
    }
}

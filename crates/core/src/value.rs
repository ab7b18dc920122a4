//! Numeric capability trait for aggregatable input types.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::output::OutputValue;

/// Capability set required of an aggregation input type.
///
/// Implemented for `i32`, `i64`, `f32`, and `f64`. The trait exists so that
/// the aggregators stay generic without reaching for arithmetic the types do
/// not share; saturating conversions keep accumulators total even at the
/// numeric limits.
pub trait Aggregand:
    Copy + PartialOrd + PartialEq + Default + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Whether the type is an integer type.
    const INTEGRAL: bool;

    /// Smallest representable value.
    fn min_value() -> Self;

    /// Largest representable value.
    fn max_value() -> Self;

    /// The additive identity.
    fn zero() -> Self {
        Self::default()
    }

    /// Whether the value is NaN. Always false for integer types.
    fn is_nan_value(self) -> bool;

    /// Lossy conversion to a double.
    fn to_f64(self) -> f64;

    /// Saturating conversion from a double.
    ///
    /// Integer types round half away from zero and clamp to their range; NaN
    /// maps to zero. Floating-point types clamp infinities to the finite
    /// range.
    fn from_f64_saturating(value: f64) -> Self;

    /// Checked addition; `None` on integer overflow or a non-finite float
    /// result from finite inputs.
    fn checked_add_value(self, other: Self) -> Option<Self>;

    /// Checked subtraction with the same overflow convention.
    fn checked_sub_value(self, other: Self) -> Option<Self>;

    /// Checked multiplication with the same overflow convention.
    fn checked_mul_value(self, other: Self) -> Option<Self>;

    /// Saturating addition.
    fn saturating_add_value(self, other: Self) -> Self;

    /// Saturating multiplication by an entry count.
    fn saturating_mul_count(self, count: i64) -> Self;

    /// Saturating negation (`-min` saturates to `max` for integers).
    fn saturating_neg_value(self) -> Self;

    /// Convert to a typed output value.
    fn to_output_value(self) -> OutputValue;
}

macro_rules! impl_aggregand_int {
    ($t:ty) => {
        impl Aggregand for $t {
            const INTEGRAL: bool = true;

            fn min_value() -> Self {
                <$t>::MIN
            }

            fn max_value() -> Self {
                <$t>::MAX
            }

            fn is_nan_value(self) -> bool {
                false
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64_saturating(value: f64) -> Self {
                // `as` casts from float saturate and map NaN to zero.
                value.round() as $t
            }

            fn checked_add_value(self, other: Self) -> Option<Self> {
                self.checked_add(other)
            }

            fn checked_sub_value(self, other: Self) -> Option<Self> {
                self.checked_sub(other)
            }

            fn checked_mul_value(self, other: Self) -> Option<Self> {
                self.checked_mul(other)
            }

            fn saturating_add_value(self, other: Self) -> Self {
                self.saturating_add(other)
            }

            fn saturating_mul_count(self, count: i64) -> Self {
                let wide = (self as i128).saturating_mul(count as i128);
                if wide > <$t>::MAX as i128 {
                    <$t>::MAX
                } else if wide < <$t>::MIN as i128 {
                    <$t>::MIN
                } else {
                    wide as $t
                }
            }

            fn saturating_neg_value(self) -> Self {
                self.checked_neg().unwrap_or(<$t>::MAX)
            }

            fn to_output_value(self) -> OutputValue {
                OutputValue::Int(self as i64)
            }
        }
    };
}

macro_rules! impl_aggregand_float {
    ($t:ty) => {
        impl Aggregand for $t {
            const INTEGRAL: bool = false;

            fn min_value() -> Self {
                <$t>::MIN
            }

            fn max_value() -> Self {
                <$t>::MAX
            }

            fn is_nan_value(self) -> bool {
                self.is_nan()
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64_saturating(value: f64) -> Self {
                if value.is_nan() {
                    return 0.0;
                }
                if value > <$t>::MAX as f64 {
                    return <$t>::MAX;
                }
                if value < <$t>::MIN as f64 {
                    return <$t>::MIN;
                }
                value as $t
            }

            fn checked_add_value(self, other: Self) -> Option<Self> {
                let result = self + other;
                if result.is_finite() || !self.is_finite() || !other.is_finite() {
                    Some(result)
                } else {
                    None
                }
            }

            fn checked_sub_value(self, other: Self) -> Option<Self> {
                let result = self - other;
                if result.is_finite() || !self.is_finite() || !other.is_finite() {
                    Some(result)
                } else {
                    None
                }
            }

            fn checked_mul_value(self, other: Self) -> Option<Self> {
                let result = self * other;
                if result.is_finite() || !self.is_finite() || !other.is_finite() {
                    Some(result)
                } else {
                    None
                }
            }

            fn saturating_add_value(self, other: Self) -> Self {
                self + other
            }

            fn saturating_mul_count(self, count: i64) -> Self {
                self * count as $t
            }

            fn saturating_neg_value(self) -> Self {
                -self
            }

            fn to_output_value(self) -> OutputValue {
                OutputValue::Float(self as f64)
            }
        }
    };
}

impl_aggregand_int!(i32);
impl_aggregand_int!(i64);
impl_aggregand_float!(f32);
impl_aggregand_float!(f64);

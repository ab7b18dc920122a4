//! Parameter validators shared by every builder.
//!
//! Each validator accepts an optional value so that "unset" and "invalid" get
//! distinct messages, and returns the validated value on success. Message
//! prefixes are part of the public contract and are matched by tests.

use crate::error::{DpAggError, Result};

/// Validate that a value is set and is not NaN.
pub fn validate_is_set(value: Option<f64>, name: &str) -> Result<f64> {
    let Some(d) = value else {
        return Err(DpAggError::invalid_argument(format!("{name} must be set.")));
    };
    if d.is_nan() {
        return Err(DpAggError::invalid_argument(format!(
            "{name} must be a valid numeric value, but is {d}."
        )));
    }
    Ok(d)
}

/// Validate that a value is set and strictly positive.
pub fn validate_is_positive(value: Option<f64>, name: &str) -> Result<f64> {
    let d = validate_is_set(value, name)?;
    if d <= 0.0 {
        return Err(DpAggError::invalid_argument(format!(
            "{name} must be positive, but is {d}."
        )));
    }
    Ok(d)
}

/// Validate that a value is set and non-negative.
pub fn validate_is_non_negative(value: Option<f64>, name: &str) -> Result<f64> {
    let d = validate_is_set(value, name)?;
    if d < 0.0 {
        return Err(DpAggError::invalid_argument(format!(
            "{name} must be non-negative, but is {d}."
        )));
    }
    Ok(d)
}

/// Validate that a value is set and finite.
pub fn validate_is_finite(value: Option<f64>, name: &str) -> Result<f64> {
    let d = validate_is_set(value, name)?;
    if !d.is_finite() {
        return Err(DpAggError::invalid_argument(format!(
            "{name} must be finite, but is {d}."
        )));
    }
    Ok(d)
}

/// Validate that a value is set, finite, and strictly positive.
pub fn validate_is_finite_and_positive(value: Option<f64>, name: &str) -> Result<f64> {
    let d = validate_is_set(value, name)?;
    if d <= 0.0 || !d.is_finite() {
        return Err(DpAggError::invalid_argument(format!(
            "{name} must be finite and positive, but is {d}."
        )));
    }
    Ok(d)
}

/// Validate that a value is set, finite, and non-negative.
pub fn validate_is_finite_and_non_negative(value: Option<f64>, name: &str) -> Result<f64> {
    let d = validate_is_set(value, name)?;
    if d < 0.0 || !d.is_finite() {
        return Err(DpAggError::invalid_argument(format!(
            "{name} must be finite and non-negative, but is {d}."
        )));
    }
    Ok(d)
}

/// Validate membership in an interval with configurable endpoint inclusion.
pub fn validate_is_in_interval(
    value: Option<f64>,
    lower_bound: f64,
    upper_bound: f64,
    include_lower: bool,
    include_upper: bool,
    name: &str,
) -> Result<f64> {
    let d = validate_is_set(value, name)?;

    if lower_bound == upper_bound && upper_bound == d && (include_lower || include_upper) {
        return Ok(d);
    }
    let outside_lower = if include_lower {
        d < lower_bound
    } else {
        d <= lower_bound
    };
    let outside_upper = if include_upper {
        d > upper_bound
    } else {
        d >= upper_bound
    };
    if outside_lower || outside_upper {
        let left_bracket = if include_lower { "[" } else { "(" };
        let right_bracket = if include_upper { "]" } else { ")" };
        let inclusivity = match (include_lower, include_upper) {
            (true, true) => " inclusive ",
            (false, false) => " exclusive ",
            _ => " ",
        };
        return Err(DpAggError::invalid_argument(format!(
            "{name} must be in the{inclusivity}interval \
             {left_bracket}{lower_bound},{upper_bound}{right_bracket}, but is {d}."
        )));
    }
    Ok(d)
}

/// Validate membership in the inclusive interval `[lower_bound, upper_bound]`.
pub fn validate_is_in_inclusive_interval(
    value: Option<f64>,
    lower_bound: f64,
    upper_bound: f64,
    name: &str,
) -> Result<f64> {
    validate_is_in_interval(value, lower_bound, upper_bound, true, true, name)
}

/// Validate membership in the exclusive interval `(lower_bound, upper_bound)`.
pub fn validate_is_in_exclusive_interval(
    value: Option<f64>,
    lower_bound: f64,
    upper_bound: f64,
    name: &str,
) -> Result<f64> {
    validate_is_in_interval(value, lower_bound, upper_bound, false, false, name)
}

/// Validate a privacy parameter epsilon: finite and strictly positive.
pub fn validate_epsilon(epsilon: Option<f64>) -> Result<f64> {
    validate_is_finite_and_positive(epsilon, "Epsilon")
}

/// Validate a privacy parameter delta: in the inclusive interval [0, 1].
pub fn validate_delta(delta: Option<f64>) -> Result<f64> {
    validate_is_in_inclusive_interval(delta, 0.0, 1.0, "Delta")
}

/// Validate the L0 sensitivity (maximum partitions contributed).
pub fn validate_max_partitions_contributed(max_partitions_contributed: Option<i64>) -> Result<i64> {
    validate_is_positive(
        max_partitions_contributed.map(|v| v as f64),
        "Maximum number of partitions that can be contributed to (i.e., L0 sensitivity)",
    )?;
    Ok(max_partitions_contributed.unwrap_or_default())
}

/// Validate the per-partition contribution cap.
pub fn validate_max_contributions_per_partition(
    max_contributions_per_partition: Option<i64>,
) -> Result<i64> {
    validate_is_positive(
        max_contributions_per_partition.map(|v| v as f64),
        "Maximum number of contributions per partition",
    )?;
    Ok(max_contributions_per_partition.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_value_names_the_parameter() {
        let err = validate_is_set(None, "Epsilon").unwrap_err();
        assert!(err.message().starts_with("Epsilon must be set"));
    }

    #[test]
    fn nan_value_is_rejected() {
        let err = validate_is_set(Some(f64::NAN), "Delta").unwrap_err();
        assert!(err
            .message()
            .starts_with("Delta must be a valid numeric value"));
    }

    #[test]
    fn epsilon_rejects_zero_negative_and_infinite() {
        for bad in [0.0, -1.0, f64::INFINITY, f64::NEG_INFINITY] {
            let err = validate_epsilon(Some(bad)).unwrap_err();
            assert!(
                err.message().starts_with("Epsilon must be finite and positive"),
                "unexpected message: {}",
                err.message()
            );
        }
        assert_eq!(validate_epsilon(Some(1.5)).unwrap(), 1.5);
    }

    #[test]
    fn delta_uses_inclusive_interval_phrasing() {
        let err = validate_delta(Some(1.5)).unwrap_err();
        assert!(err
            .message()
            .starts_with("Delta must be in the inclusive interval [0,1]"));
        assert_eq!(validate_delta(Some(0.0)).unwrap(), 0.0);
        assert_eq!(validate_delta(Some(1.0)).unwrap(), 1.0);
    }

    #[test]
    fn exclusive_interval_rejects_endpoints() {
        assert!(validate_is_in_exclusive_interval(Some(0.0), 0.0, 1.0, "Confidence level").is_err());
        assert!(validate_is_in_exclusive_interval(Some(1.0), 0.0, 1.0, "Confidence level").is_err());
        assert!(validate_is_in_exclusive_interval(Some(0.5), 0.0, 1.0, "Confidence level").is_ok());
    }

    #[test]
    fn max_partitions_contributed_must_be_positive() {
        for bad in [Some(0), Some(-3), None] {
            let err = validate_max_partitions_contributed(bad).unwrap_err();
            assert!(err
                .message()
                .starts_with("Maximum number of partitions that can be contributed to"));
        }
        assert_eq!(validate_max_partitions_contributed(Some(2)).unwrap(), 2);
    }

    #[test]
    fn max_contributions_per_partition_must_be_positive() {
        let err = validate_max_contributions_per_partition(Some(0)).unwrap_err();
        assert!(err
            .message()
            .starts_with("Maximum number of contributions per partition must be positive"));
    }
}

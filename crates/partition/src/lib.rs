//! Differentially private partition selection.
//!
//! A partition (group) may only be released when enough distinct users
//! contributed to it; these strategies make that decision under an
//! (epsilon, delta) guarantee, given the number of contributing users.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod gaussian;
mod laplace;
mod near_geometric;

pub use gaussian::{GaussianPartitionSelection, GaussianPartitionSelectionBuilder};
pub use laplace::{LaplacePartitionSelection, LaplacePartitionSelectionBuilder};
pub use near_geometric::{
    NearTruncatedGeometricPartitionSelection, NearTruncatedGeometricPartitionSelectionBuilder,
};

use dpagg_core::validate::validate_delta;
use dpagg_core::Result;

/// Decision interface shared by all partition-selection strategies.
pub trait PartitionSelectionStrategy {
    /// Whether a partition with `num_users` contributing users may be kept.
    fn should_keep(&mut self, num_users: i64) -> bool;

    /// The per-user epsilon this strategy guarantees.
    fn epsilon(&self) -> f64;

    /// The per-user delta this strategy guarantees.
    fn delta(&self) -> f64;

    /// The maximum number of partitions one user may contribute to.
    fn max_partitions_contributed(&self) -> i64;
}

/// Convert a per-user delta into the per-partition delta implied by a user
/// contributing to up to `max_partitions_contributed` partitions.
///
/// Numerically stable form of `1 - (1 - delta)^(1 / max_partitions)`.
pub fn calculate_adjusted_delta(delta: f64, max_partitions_contributed: i64) -> Result<f64> {
    validate_delta(Some(delta))?;
    dpagg_core::validate::validate_is_positive(
        Some(max_partitions_contributed as f64),
        "Max number of partitions a user can contribute to",
    )?;
    Ok(-f64::exp_m1(f64::ln_1p(-delta) / max_partitions_contributed as f64))
}

/// Inverse of [`calculate_adjusted_delta`]: the per-user delta implied by a
/// per-partition delta.
///
/// Numerically stable form of `1 - (1 - adjusted_delta)^max_partitions`.
pub fn calculate_unadjusted_delta(adjusted_delta: f64, max_partitions_contributed: i64) -> Result<f64> {
    validate_delta(Some(adjusted_delta))?;
    dpagg_core::validate::validate_is_positive(
        Some(max_partitions_contributed as f64),
        "Max number of partitions a user can contribute to",
    )?;
    Ok(-f64::exp_m1(
        max_partitions_contributed as f64 * f64::ln_1p(-adjusted_delta),
    ))
}

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        GaussianPartitionSelection, LaplacePartitionSelection,
        NearTruncatedGeometricPartitionSelection, PartitionSelectionStrategy,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjusted_delta_is_identity_for_one_partition() {
        let adjusted = calculate_adjusted_delta(0.02, 1).unwrap();
        assert!((adjusted - 0.02).abs() < 1e-15);
    }

    #[test]
    fn adjusted_and_unadjusted_deltas_are_inverse() {
        for delta in [1e-10, 1e-5, 0.02, 0.3, 0.9] {
            for max_partitions in [1, 2, 5, 100] {
                let adjusted = calculate_adjusted_delta(delta, max_partitions).unwrap();
                let round_trip = calculate_unadjusted_delta(adjusted, max_partitions).unwrap();
                assert!(
                    (round_trip - delta).abs() < 1e-12,
                    "delta {delta} partitions {max_partitions} round trip {round_trip}"
                );
            }
        }
    }

    #[test]
    fn adjusted_delta_handles_endpoints() {
        assert_eq!(calculate_adjusted_delta(0.0, 3).unwrap(), 0.0);
        assert_eq!(calculate_adjusted_delta(1.0, 3).unwrap(), 1.0);
    }

    #[test]
    fn adjusted_delta_validates_inputs() {
        assert!(calculate_adjusted_delta(-0.1, 1).is_err());
        assert!(calculate_adjusted_delta(1.1, 1).is_err());
        assert!(calculate_adjusted_delta(0.5, 0).is_err());
        assert!(calculate_adjusted_delta(0.5, -2).is_err());
    }
}

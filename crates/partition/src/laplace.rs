//! Laplace-threshold partition selection.
//!
//! The user count is noised with Laplace noise of scale `L0 / epsilon` and
//! the partition is kept when the noised count clears a threshold derived
//! analytically from delta. The threshold and delta mappings are exact
//! inverses of each other up to floating-point precision.

use dpagg_core::validate::{
    validate_is_finite_and_positive, validate_is_in_inclusive_interval, validate_is_positive,
};
use dpagg_core::{DpAggError, LaplaceMechanism, Mechanism, MechanismBuilder, Result};

use crate::{calculate_adjusted_delta, calculate_unadjusted_delta, PartitionSelectionStrategy};

/// Partition selection by thresholding a Laplace-noised user count.
#[derive(Clone, Debug)]
pub struct LaplacePartitionSelection {
    epsilon: f64,
    delta: f64,
    max_partitions_contributed: i64,
    threshold: f64,
    mechanism: LaplaceMechanism,
}

impl LaplacePartitionSelection {
    /// Builder for this strategy.
    pub fn builder() -> LaplacePartitionSelectionBuilder {
        LaplacePartitionSelectionBuilder::default()
    }

    /// The keep/drop threshold on the noised user count.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// The Laplace scale used for a count query with the given L0
    /// sensitivity.
    pub fn calculate_diversity(epsilon: f64, max_partitions_contributed: i64) -> f64 {
        max_partitions_contributed as f64 / epsilon
    }

    /// The smallest threshold giving (epsilon, delta)-DP partition selection.
    ///
    /// Delta of 0 maps to positive infinity, delta of 1 to negative infinity.
    pub fn calculate_threshold(
        epsilon: f64,
        delta: f64,
        max_partitions_contributed: i64,
    ) -> Result<f64> {
        validate_is_finite_and_positive(Some(epsilon), "Epsilon")?;
        validate_is_in_inclusive_interval(Some(delta), 0.0, 1.0, "Delta")?;
        validate_is_positive(
            Some(max_partitions_contributed as f64),
            "Max number of partitions a user can contribute to",
        )?;

        let adjusted_delta = calculate_adjusted_delta(delta, max_partitions_contributed)?;
        let diversity = Self::calculate_diversity(epsilon, max_partitions_contributed);
        if adjusted_delta > 0.5 {
            Ok(1.0 + diversity * (2.0 * (1.0 - adjusted_delta)).ln())
        } else {
            Ok(1.0 - diversity * (2.0 * adjusted_delta).ln())
        }
    }

    /// The delta guaranteed by thresholding at `threshold`; the inverse of
    /// [`LaplacePartitionSelection::calculate_threshold`].
    pub fn calculate_delta(
        epsilon: f64,
        threshold: f64,
        max_partitions_contributed: i64,
    ) -> Result<f64> {
        validate_is_finite_and_positive(Some(epsilon), "Epsilon")?;
        if threshold.is_nan() {
            return Err(DpAggError::invalid_argument(
                "Threshold must be a valid numeric value, but is NaN.",
            ));
        }
        validate_is_positive(
            Some(max_partitions_contributed as f64),
            "Max number of partitions a user can contribute to",
        )?;

        let diversity = Self::calculate_diversity(epsilon, max_partitions_contributed);
        let adjusted_delta = if threshold < 1.0 {
            1.0 - ((threshold - 1.0) / diversity).exp() / 2.0
        } else {
            ((1.0 - threshold) / diversity).exp() / 2.0
        };
        calculate_unadjusted_delta(adjusted_delta, max_partitions_contributed)
    }
}

impl PartitionSelectionStrategy for LaplacePartitionSelection {
    fn should_keep(&mut self, num_users: i64) -> bool {
        let noised = self.mechanism.add_noise(num_users as f64);
        noised >= self.threshold
    }

    fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn delta(&self) -> f64 {
        self.delta
    }

    fn max_partitions_contributed(&self) -> i64 {
        self.max_partitions_contributed
    }
}

/// Fluent configuration for [`LaplacePartitionSelection`].
#[derive(Clone, Debug)]
pub struct LaplacePartitionSelectionBuilder {
    epsilon: Option<f64>,
    delta: Option<f64>,
    max_partitions_contributed: Option<i64>,
    mechanism_builder: MechanismBuilder,
}

impl Default for LaplacePartitionSelectionBuilder {
    fn default() -> Self {
        Self {
            epsilon: None,
            delta: None,
            max_partitions_contributed: None,
            mechanism_builder: MechanismBuilder::laplace(),
        }
    }
}

impl LaplacePartitionSelectionBuilder {
    /// Set the per-user epsilon.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Set the per-user delta.
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Set the maximum number of partitions one user contributes to.
    pub fn with_max_partitions_contributed(mut self, max_partitions_contributed: i64) -> Self {
        self.max_partitions_contributed = Some(max_partitions_contributed);
        self
    }

    /// Replace the Laplace mechanism template.
    pub fn with_mechanism_builder(mut self, mechanism_builder: MechanismBuilder) -> Self {
        self.mechanism_builder = mechanism_builder;
        self
    }

    /// Seed the noise stream; intended for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.mechanism_builder = self.mechanism_builder.with_seed(seed);
        self
    }

    /// Validate the configuration and construct the strategy.
    pub fn build(&self) -> Result<LaplacePartitionSelection> {
        let epsilon = validate_is_finite_and_positive(self.epsilon, "Epsilon")?;
        let delta = validate_is_in_inclusive_interval(self.delta, 0.0, 1.0, "Delta")?;
        validate_is_positive(
            self.max_partitions_contributed.map(|v| v as f64),
            "Max number of partitions a user can contribute to",
        )?;
        let max_partitions_contributed = self.max_partitions_contributed.unwrap_or_default();

        let threshold =
            LaplacePartitionSelection::calculate_threshold(epsilon, delta, max_partitions_contributed)?;
        let mechanism = self
            .mechanism_builder
            .clone()
            .with_epsilon(epsilon)
            .with_l0_sensitivity(max_partitions_contributed as f64)
            .with_linf_sensitivity(1.0)
            .build()?;
        let Mechanism::Laplace(mechanism) = mechanism else {
            return Err(DpAggError::invalid_argument(
                "Laplace partition selection requires a Laplace mechanism.",
            ));
        };

        Ok(LaplacePartitionSelection {
            epsilon,
            delta,
            max_partitions_contributed,
            threshold,
            mechanism,
        })
    }
}

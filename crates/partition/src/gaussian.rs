//! Gaussian-threshold partition selection.
//!
//! Delta is split across two sub-budgets: `noise_delta` calibrates the
//! Gaussian noise through the analytic mechanism, and `threshold_delta`
//! positions the keep threshold. Because the two add, the valid range for
//! the combined delta is [0, 2].

use statrs::distribution::{ContinuousCDF, Normal};

use dpagg_core::validate::{
    validate_is_finite_and_positive, validate_is_in_exclusive_interval,
    validate_is_in_inclusive_interval, validate_is_positive,
};
use dpagg_core::{DpAggError, GaussianMechanism, Mechanism, MechanismBuilder, Result};

use crate::{calculate_adjusted_delta, calculate_unadjusted_delta, PartitionSelectionStrategy};

/// Partition selection by thresholding a Gaussian-noised user count.
#[derive(Clone, Debug)]
pub struct GaussianPartitionSelection {
    epsilon: f64,
    noise_delta: f64,
    threshold_delta: f64,
    max_partitions_contributed: i64,
    threshold: f64,
    mechanism: GaussianMechanism,
}

impl GaussianPartitionSelection {
    /// Builder for this strategy.
    pub fn builder() -> GaussianPartitionSelectionBuilder {
        GaussianPartitionSelectionBuilder::default()
    }

    /// The keep/drop threshold on the noised user count.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// The delta sub-budget consumed by the noise.
    pub fn noise_delta(&self) -> f64 {
        self.noise_delta
    }

    /// The delta sub-budget consumed by the threshold.
    pub fn threshold_delta(&self) -> f64 {
        self.threshold_delta
    }

    fn stddev_for(epsilon: f64, noise_delta: f64, max_partitions_contributed: i64) -> Result<f64> {
        validate_is_finite_and_positive(Some(epsilon), "Epsilon")?;
        validate_is_in_exclusive_interval(Some(noise_delta), 0.0, 1.0, "Noise delta")?;
        validate_is_positive(
            Some(max_partitions_contributed as f64),
            "Max number of partitions a user can contribute to",
        )?;
        // A count query has LInf sensitivity 1, so L2 = sqrt(L0).
        Ok(GaussianMechanism::calculate_stddev(
            epsilon,
            noise_delta,
            (max_partitions_contributed as f64).sqrt(),
        ))
    }

    /// The smallest threshold giving (epsilon, noise_delta + threshold_delta)
    /// DP partition selection.
    pub fn calculate_threshold(
        epsilon: f64,
        noise_delta: f64,
        threshold_delta: f64,
        max_partitions_contributed: i64,
    ) -> Result<f64> {
        validate_is_in_inclusive_interval(Some(threshold_delta), 0.0, 1.0, "Threshold delta")?;
        let sigma = Self::stddev_for(epsilon, noise_delta, max_partitions_contributed)?;
        let adjusted_threshold_delta =
            calculate_adjusted_delta(threshold_delta, max_partitions_contributed)?;
        if adjusted_threshold_delta <= 0.0 {
            return Ok(f64::INFINITY);
        }
        if adjusted_threshold_delta >= 1.0 {
            return Ok(f64::NEG_INFINITY);
        }
        // The symmetric branch keeps precision when the adjusted delta is far
        // below the 1e-16 resolution of `1 - delta`.
        let normal = Normal::new(0.0, 1.0).expect("standard normal distribution");
        let quantile = if adjusted_threshold_delta < 0.5 {
            -normal.inverse_cdf(adjusted_threshold_delta)
        } else {
            normal.inverse_cdf(1.0 - adjusted_threshold_delta)
        };
        Ok(1.0 + sigma * quantile)
    }

    /// The threshold delta guaranteed by thresholding at `threshold`; the
    /// inverse of [`GaussianPartitionSelection::calculate_threshold`].
    pub fn calculate_threshold_delta(
        epsilon: f64,
        noise_delta: f64,
        threshold: f64,
        max_partitions_contributed: i64,
    ) -> Result<f64> {
        if threshold.is_nan() {
            return Err(DpAggError::invalid_argument(
                "Threshold must be a valid numeric value, but is NaN.",
            ));
        }
        let sigma = Self::stddev_for(epsilon, noise_delta, max_partitions_contributed)?;
        let normal = Normal::new(0.0, 1.0).expect("standard normal distribution");
        let adjusted = normal.sf((threshold - 1.0) / sigma);
        calculate_unadjusted_delta(adjusted, max_partitions_contributed)
    }
}

impl PartitionSelectionStrategy for GaussianPartitionSelection {
    fn should_keep(&mut self, num_users: i64) -> bool {
        let noised = self.mechanism.add_noise(num_users as f64);
        noised >= self.threshold
    }

    fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn delta(&self) -> f64 {
        self.noise_delta + self.threshold_delta
    }

    fn max_partitions_contributed(&self) -> i64 {
        self.max_partitions_contributed
    }
}

/// Fluent configuration for [`GaussianPartitionSelection`].
///
/// Either set a combined delta, which is split evenly across the two
/// sub-budgets, or set the noise and threshold deltas individually.
#[derive(Clone, Debug)]
pub struct GaussianPartitionSelectionBuilder {
    epsilon: Option<f64>,
    delta: Option<f64>,
    noise_delta: Option<f64>,
    threshold_delta: Option<f64>,
    max_partitions_contributed: Option<i64>,
    mechanism_builder: MechanismBuilder,
}

impl Default for GaussianPartitionSelectionBuilder {
    fn default() -> Self {
        Self {
            epsilon: None,
            delta: None,
            noise_delta: None,
            threshold_delta: None,
            max_partitions_contributed: None,
            mechanism_builder: MechanismBuilder::gaussian(),
        }
    }
}

impl GaussianPartitionSelectionBuilder {
    /// Set the per-user epsilon.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Set the combined per-user delta, split evenly across noise and
    /// threshold.
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Set the delta sub-budget for the noise.
    pub fn with_noise_delta(mut self, noise_delta: f64) -> Self {
        self.noise_delta = Some(noise_delta);
        self
    }

    /// Set the delta sub-budget for the threshold.
    pub fn with_threshold_delta(mut self, threshold_delta: f64) -> Self {
        self.threshold_delta = Some(threshold_delta);
        self
    }

    /// Set the maximum number of partitions one user contributes to.
    pub fn with_max_partitions_contributed(mut self, max_partitions_contributed: i64) -> Self {
        self.max_partitions_contributed = Some(max_partitions_contributed);
        self
    }

    /// Seed the noise stream; intended for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.mechanism_builder = self.mechanism_builder.with_seed(seed);
        self
    }

    /// Validate the configuration and construct the strategy.
    pub fn build(&self) -> Result<GaussianPartitionSelection> {
        let epsilon = validate_is_finite_and_positive(self.epsilon, "Epsilon")?;
        validate_is_positive(
            self.max_partitions_contributed.map(|v| v as f64),
            "Max number of partitions a user can contribute to",
        )?;
        let max_partitions_contributed = self.max_partitions_contributed.unwrap_or_default();

        let (noise_delta, threshold_delta) = match (self.delta, self.noise_delta, self.threshold_delta)
        {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(DpAggError::invalid_argument(
                    "Either delta or both noise delta and threshold delta must be set, but not \
                     both.",
                ))
            }
            (Some(delta), None, None) => {
                validate_is_in_inclusive_interval(Some(delta), 0.0, 2.0, "Delta")?;
                (delta / 2.0, delta / 2.0)
            }
            (None, noise_delta, threshold_delta) => {
                let noise_delta =
                    validate_is_in_inclusive_interval(noise_delta, 0.0, 1.0, "Noise delta")?;
                let threshold_delta = validate_is_in_inclusive_interval(
                    threshold_delta,
                    0.0,
                    1.0,
                    "Threshold delta",
                )?;
                (noise_delta, threshold_delta)
            }
        };

        let threshold = GaussianPartitionSelection::calculate_threshold(
            epsilon,
            noise_delta,
            threshold_delta,
            max_partitions_contributed,
        )?;
        let mechanism = self
            .mechanism_builder
            .clone()
            .with_epsilon(epsilon)
            .with_delta(noise_delta)
            .with_l0_sensitivity(max_partitions_contributed as f64)
            .with_linf_sensitivity(1.0)
            .build()?;
        let Mechanism::Gaussian(mechanism) = mechanism else {
            return Err(DpAggError::invalid_argument(
                "Gaussian partition selection requires a Gaussian mechanism.",
            ));
        };

        Ok(GaussianPartitionSelection {
            epsilon,
            noise_delta,
            threshold_delta,
            max_partitions_contributed,
            threshold,
            mechanism,
        })
    }
}

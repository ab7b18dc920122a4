//! Near-truncated-geometric partition selection.
//!
//! The optimal keep-probability curve is piecewise: linear in the user count
//! up to a first crossover, a truncated-geometric segment up to a second
//! crossover, and one beyond it. The crossovers depend only on the adjusted
//! per-partition budget.

use dpagg_core::validate::{
    validate_is_finite_and_positive, validate_is_in_inclusive_interval, validate_is_positive,
};
use dpagg_core::{Result, SecureRng};

use crate::{calculate_adjusted_delta, PartitionSelectionStrategy};

/// Partition selection with the near-truncated-geometric keep probability.
#[derive(Clone, Debug)]
pub struct NearTruncatedGeometricPartitionSelection {
    epsilon: f64,
    delta: f64,
    max_partitions_contributed: i64,
    adjusted_epsilon: f64,
    adjusted_delta: f64,
    crossover_1: f64,
    crossover_2: f64,
    rng: SecureRng,
}

impl NearTruncatedGeometricPartitionSelection {
    /// Builder for this strategy.
    pub fn builder() -> NearTruncatedGeometricPartitionSelectionBuilder {
        NearTruncatedGeometricPartitionSelectionBuilder::default()
    }

    /// The user count at which the keep probability leaves the linear
    /// segment.
    pub fn first_crossover(&self) -> f64 {
        self.crossover_1
    }

    /// The user count beyond which partitions are always kept.
    pub fn second_crossover(&self) -> f64 {
        self.crossover_2
    }

    /// Probability of keeping a partition with `num_users` users.
    pub fn probability_of_keep(&self, num_users: f64) -> f64 {
        if num_users <= 0.0 {
            return 0.0;
        }
        if num_users <= self.crossover_1 {
            return f64::exp_m1(num_users * self.adjusted_epsilon)
                / f64::exp_m1(self.adjusted_epsilon)
                * self.adjusted_delta;
        }
        if num_users <= self.crossover_2 {
            let m = num_users - self.crossover_1;
            let p_crossover = self.probability_of_keep(self.crossover_1);
            return p_crossover
                - (1.0 - p_crossover + self.adjusted_delta / f64::exp_m1(self.adjusted_epsilon))
                    * f64::exp_m1(-m * self.adjusted_epsilon);
        }
        1.0
    }
}

impl PartitionSelectionStrategy for NearTruncatedGeometricPartitionSelection {
    fn should_keep(&mut self, num_users: i64) -> bool {
        let draw = self.rng.uniform_double();
        draw <= self.probability_of_keep(num_users as f64)
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

/// Fluent configuration for [`NearTruncatedGeometricPartitionSelection`].
#[derive(Clone, Debug, Default)]
pub struct NearTruncatedGeometricPartitionSelectionBuilder {
    epsilon: Option<f64>,
    delta: Option<f64>,
    max_partitions_contributed: Option<i64>,
    seed: Option<u64>,
}

impl NearTruncatedGeometricPartitionSelectionBuilder {
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

    /// Seed the random stream; intended for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validate the configuration and construct the strategy.
    pub fn build(&self) -> Result<NearTruncatedGeometricPartitionSelection> {
        let epsilon = validate_is_finite_and_positive(self.epsilon, "Epsilon")?;
        let delta = validate_is_in_inclusive_interval(self.delta, 0.0, 1.0, "Delta")?;
        validate_is_positive(
            self.max_partitions_contributed.map(|v| v as f64),
            "Max number of partitions a user can contribute to",
        )?;
        let max_partitions_contributed = self.max_partitions_contributed.unwrap_or_default();

        let adjusted_epsilon = epsilon / max_partitions_contributed as f64;
        let adjusted_delta = calculate_adjusted_delta(delta, max_partitions_contributed)?;

        let crossover_1 = 1.0
            + (f64::ln_1p((adjusted_epsilon / 2.0).tanh() * (1.0 / adjusted_delta - 1.0))
                / adjusted_epsilon)
                .floor();

        let mut selection = NearTruncatedGeometricPartitionSelection {
            epsilon,
            delta,
            max_partitions_contributed,
            adjusted_epsilon,
            adjusted_delta,
            crossover_1,
            crossover_2: crossover_1,
            rng: match self.seed {
                Some(seed) => SecureRng::from_seed_value(seed),
                None => SecureRng::new(),
            },
        };
        let p_crossover = selection.probability_of_keep(crossover_1);
        selection.crossover_2 = crossover_1
            + (f64::ln_1p(
                f64::exp_m1(adjusted_epsilon) / adjusted_delta * (1.0 - p_crossover),
            ) / adjusted_epsilon)
                .floor();
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUM_SAMPLES: usize = 1_000_000;

    fn keep_fraction(
        selection: &mut NearTruncatedGeometricPartitionSelection,
        num_users: i64,
        samples: usize,
    ) -> f64 {
        let mut kept = 0usize;
        for _ in 0..samples {
            if selection.should_keep(num_users) {
                kept += 1;
            }
        }
        kept as f64 / samples as f64
    }

    fn standard_selection(seed: u64) -> NearTruncatedGeometricPartitionSelection {
        NearTruncatedGeometricPartitionSelection::builder()
            .with_epsilon(0.5)
            .with_delta(0.02)
            .with_max_partitions_contributed(1)
            .with_seed(seed)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_epsilon() {
        let err = NearTruncatedGeometricPartitionSelection::builder()
            .with_delta(0.1)
            .with_max_partitions_contributed(2)
            .build()
            .unwrap_err();
        assert!(err.message().starts_with("Epsilon must be set"));
    }

    #[test]
    fn builder_rejects_nan_and_infinite_epsilon() {
        let err = NearTruncatedGeometricPartitionSelection::builder()
            .with_epsilon(f64::NAN)
            .with_delta(0.3)
            .with_max_partitions_contributed(4)
            .build()
            .unwrap_err();
        assert!(err
            .message()
            .starts_with("Epsilon must be a valid numeric value"));

        let err = NearTruncatedGeometricPartitionSelection::builder()
            .with_epsilon(f64::INFINITY)
            .with_delta(0.3)
            .with_max_partitions_contributed(4)
            .build()
            .unwrap_err();
        assert!(err.message().starts_with("Epsilon must be finite"));

        let err = NearTruncatedGeometricPartitionSelection::builder()
            .with_epsilon(-5.0)
            .with_delta(0.6)
            .with_max_partitions_contributed(7)
            .build()
            .unwrap_err();
        assert!(err
            .message()
            .starts_with("Epsilon must be finite and positive"));
    }

    #[test]
    fn builder_requires_valid_delta() {
        let err = NearTruncatedGeometricPartitionSelection::builder()
            .with_epsilon(8.0)
            .with_max_partitions_contributed(9)
            .build()
            .unwrap_err();
        assert!(err.message().starts_with("Delta must be set"));

        let err = NearTruncatedGeometricPartitionSelection::builder()
            .with_epsilon(4.5)
            .with_delta(6.0)
            .with_max_partitions_contributed(7)
            .build()
            .unwrap_err();
        assert!(err
            .message()
            .starts_with("Delta must be in the inclusive interval"));
    }

    #[test]
    fn builder_requires_positive_max_partitions() {
        for builder in [
            NearTruncatedGeometricPartitionSelection::builder()
                .with_epsilon(0.8)
                .with_delta(0.9),
            NearTruncatedGeometricPartitionSelection::builder()
                .with_epsilon(0.1)
                .with_delta(0.2)
                .with_max_partitions_contributed(0),
            NearTruncatedGeometricPartitionSelection::builder()
                .with_epsilon(0.1)
                .with_delta(0.2)
                .with_max_partitions_contributed(-3),
        ] {
            let err = builder.build().unwrap_err();
            assert!(err
                .message()
                .starts_with("Max number of partitions a user can contribute to"));
        }
    }

    #[test]
    fn crossovers_match_reference_values() {
        let selection = standard_selection(0);
        assert_eq!(selection.first_crossover(), 6.0);
        assert_eq!(selection.second_crossover(), 11.0);
    }

    #[test]
    fn no_users_are_never_kept() {
        let mut selection = standard_selection(1);
        for _ in 0..1000 {
            assert!(!selection.should_keep(0));
        }
    }

    #[test]
    fn many_users_are_always_kept() {
        let mut selection = standard_selection(2);
        for _ in 0..1000 {
            assert!(selection.should_keep(15));
        }
    }

    #[test]
    fn one_user_keeps_with_probability_delta() {
        let mut selection = standard_selection(3);
        let fraction = keep_fraction(&mut selection, 1, NUM_SAMPLES);
        assert!(
            (fraction - 0.02).abs() < 0.001,
            "keep fraction {fraction}"
        );
    }

    #[test]
    fn keep_probability_at_first_crossover() {
        let selection = standard_selection(4);
        assert!((selection.probability_of_keep(6.0) - 0.58840484458).abs() < 1e-9);
        let mut selection = selection;
        let fraction = keep_fraction(&mut selection, 6, NUM_SAMPLES);
        assert!(
            (fraction - 0.58840484458).abs() < 0.0025,
            "keep fraction {fraction}"
        );
    }

    #[test]
    fn keep_probability_between_crossovers() {
        let selection = standard_selection(5);
        assert!((selection.probability_of_keep(8.0) - 0.86807080625).abs() < 1e-9);
        let mut selection = selection;
        let fraction = keep_fraction(&mut selection, 8, NUM_SAMPLES);
        assert!(
            (fraction - 0.86807080625).abs() < 0.0025,
            "keep fraction {fraction}"
        );
    }

    #[test]
    fn tiny_epsilon_keep_probability_is_n_times_delta() {
        let mut selection = NearTruncatedGeometricPartitionSelection::builder()
            .with_epsilon(1e-20)
            .with_delta(0.02)
            .with_max_partitions_contributed(1)
            .with_seed(6)
            .build()
            .unwrap();
        assert!((selection.probability_of_keep(6.0) - 0.12).abs() < 1e-9);
        let fraction = keep_fraction(&mut selection, 6, NUM_SAMPLES);
        assert!((fraction - 0.12).abs() < 0.0025, "keep fraction {fraction}");
    }

    #[test]
    fn tiny_epsilon_between_crossovers() {
        let selection = NearTruncatedGeometricPartitionSelection::builder()
            .with_epsilon(1e-20)
            .with_delta(0.02)
            .with_max_partitions_contributed(1)
            .with_seed(7)
            .build()
            .unwrap();
        assert!((selection.probability_of_keep(40.0) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn keep_probability_is_monotone_in_num_users() {
        let selection = standard_selection(8);
        let mut previous = 0.0;
        for n in 0..20 {
            let p = selection.probability_of_keep(n as f64);
            assert!(p >= previous, "p({n}) = {p} < {previous}");
            previous = p;
        }
        assert_eq!(previous, 1.0);
    }
}

//! Differentially private count of contributions.

use serde::{Deserialize, Serialize};

use dpagg_core::validate::{
    validate_delta, validate_epsilon, validate_max_contributions_per_partition,
    validate_max_partitions_contributed,
};
use dpagg_core::{
    default_epsilon, safe_cast_from_double, Aggregand, Algorithm, AlgorithmState, Mechanism,
    MechanismBuilder, Output, OutputValue, Result, Summary,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct CountSummary {
    count: i64,
}

/// DP count aggregator.
///
/// The entry value is ignored; only its presence is counted, so NaN entries
/// still count. Non-positive repeat counts are silently dropped.
#[derive(Clone, Debug)]
pub struct Count<T: Aggregand> {
    epsilon: f64,
    delta: f64,
    mechanism: Mechanism,
    count: i64,
    state: AlgorithmState,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Aggregand> Count<T> {
    /// Builder for a count aggregator.
    pub fn builder() -> CountBuilder<T> {
        CountBuilder::default()
    }

    /// Accumulate `num_of_entries` occurrences of an entry.
    pub fn add_multiple_entries(&mut self, _entry: T, num_of_entries: i64) {
        if num_of_entries <= 0 {
            return;
        }
        self.count = self.count.saturating_add(num_of_entries);
    }
}

impl<T: Aggregand> Algorithm<T> for Count<T> {
    fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn delta(&self) -> f64 {
        self.delta
    }

    fn add_entry(&mut self, entry: T) {
        self.add_multiple_entries(entry, 1);
    }

    fn partial_result_with_confidence(&mut self, confidence_level: f64) -> Result<Output> {
        self.state.begin_result()?;
        let noised = self.mechanism.add_noise(self.count as f64);
        let value = safe_cast_from_double::<i64>(noised).value;
        match self.mechanism.noise_confidence_interval(confidence_level, 1.0) {
            Ok(interval) => Ok(Output::single_with_interval(
                OutputValue::Int(value),
                interval.offset_by(value as f64),
            )),
            Err(_) => Ok(Output::single(OutputValue::Int(value))),
        }
    }

    fn reset(&mut self) {
        self.count = 0;
        self.state.reset();
    }

    fn serialize(&self) -> Summary {
        Summary::encode(&CountSummary { count: self.count })
    }

    fn merge(&mut self, summary: &Summary) -> Result<()> {
        let data: CountSummary = summary.decode()?;
        self.count = self.count.saturating_add(data.count);
        Ok(())
    }

    fn memory_used(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Fluent configuration for [`Count`].
#[derive(Clone, Debug)]
pub struct CountBuilder<T: Aggregand> {
    epsilon: Option<f64>,
    delta: f64,
    max_partitions_contributed: i64,
    max_contributions_per_partition: i64,
    mechanism_builder: MechanismBuilder,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Aggregand> Default for CountBuilder<T> {
    fn default() -> Self {
        Self {
            epsilon: None,
            delta: 0.0,
            max_partitions_contributed: 1,
            max_contributions_per_partition: 1,
            mechanism_builder: MechanismBuilder::laplace(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Aggregand> CountBuilder<T> {
    /// Set the privacy parameter epsilon.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Set the privacy parameter delta.
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    /// Set the maximum number of partitions one user contributes to.
    pub fn with_max_partitions_contributed(mut self, max_partitions_contributed: i64) -> Self {
        self.max_partitions_contributed = max_partitions_contributed;
        self
    }

    /// Set the maximum contributions of one user to one partition.
    pub fn with_max_contributions_per_partition(
        mut self,
        max_contributions_per_partition: i64,
    ) -> Self {
        self.max_contributions_per_partition = max_contributions_per_partition;
        self
    }

    /// Replace the noise mechanism template.
    pub fn with_mechanism_builder(mut self, mechanism_builder: MechanismBuilder) -> Self {
        self.mechanism_builder = mechanism_builder;
        self
    }

    /// Seed the noise stream; intended for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.mechanism_builder = self.mechanism_builder.with_seed(seed);
        self
    }

    /// Validate the configuration and construct the aggregator.
    pub fn build(&self) -> Result<Count<T>> {
        let epsilon = match self.epsilon {
            Some(epsilon) => epsilon,
            None => {
                let epsilon = default_epsilon();
                tracing::warn!(
                    epsilon,
                    "Default epsilon is being used. Consider setting your own epsilon based on \
                     privacy considerations."
                );
                epsilon
            }
        };
        validate_epsilon(Some(epsilon))?;
        let delta = validate_delta(Some(self.delta))?;
        validate_max_partitions_contributed(Some(self.max_partitions_contributed))?;
        validate_max_contributions_per_partition(Some(self.max_contributions_per_partition))?;

        let mechanism = self
            .mechanism_builder
            .clone()
            .with_epsilon(epsilon)
            .with_delta(delta)
            .with_l0_sensitivity(self.max_partitions_contributed as f64)
            .with_linf_sensitivity(self.max_contributions_per_partition as f64)
            .build()?;

        Ok(Count {
            epsilon,
            delta,
            mechanism,
            count: 0,
            state: AlgorithmState::default(),
            _marker: std::marker::PhantomData,
        })
    }
}

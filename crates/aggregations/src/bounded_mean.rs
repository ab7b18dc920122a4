//! Differentially private bounded mean.
//!
//! Maintains a count and a clamped sum. Before noising, the sum is normalized
//! around the bound midpoint, which keeps its sensitivity at half the bound
//! width; the noised mean is then shifted back and clamped into the bounds.

use serde::{Deserialize, Serialize};

use dpagg_core::validate::{
    validate_delta, validate_epsilon, validate_is_set, validate_max_contributions_per_partition,
    validate_max_partitions_contributed,
};
use dpagg_core::{
    clamp, default_epsilon, Aggregand, Algorithm, AlgorithmState, DpAggError, Mechanism,
    MechanismBuilder, Output, OutputValue, Result, Summary,
};

use crate::approx_bounds::{ApproxBounds, ApproxBoundsBuilder, ApproxBoundsSummary};

/// Serialized partial state of a bounded mean.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundedMeanSummary<T> {
    count: i64,
    pos_sum: Vec<T>,
    neg_sum: Vec<T>,
    bounds: Option<ApproxBoundsSummary>,
}

/// DP bounded-mean aggregator.
#[derive(Clone, Debug)]
pub enum BoundedMean<T: Aggregand> {
    /// Caller-supplied clamp range.
    Fixed(BoundedMeanWithFixedBounds<T>),
    /// Privately inferred clamp range.
    Approx(BoundedMeanWithApproxBounds<T>),
}

impl<T: Aggregand> BoundedMean<T> {
    /// Builder selecting the variant from which bounds are set.
    pub fn builder() -> BoundedMeanBuilder<T> {
        BoundedMeanBuilder::default()
    }

    /// Accumulate `num_of_entries` occurrences of `entry`.
    pub fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        match self {
            BoundedMean::Fixed(mean) => mean.add_multiple_entries(entry, num_of_entries),
            BoundedMean::Approx(mean) => mean.add_multiple_entries(entry, num_of_entries),
        }
    }

    /// Epsilon spent inferring bounds; zero for the fixed variant.
    pub fn bounding_epsilon(&self) -> f64 {
        match self {
            BoundedMean::Fixed(_) => 0.0,
            BoundedMean::Approx(mean) => mean.approx_bounds.epsilon(),
        }
    }

    fn build_normalized_sum_mechanism(
        mechanism_builder: &MechanismBuilder,
        epsilon: f64,
        l0_sensitivity: i64,
        max_contributions_per_partition: i64,
        lower: T,
        upper: T,
    ) -> Result<Mechanism> {
        mechanism_builder
            .clone()
            .with_epsilon(epsilon)
            .with_l0_sensitivity(l0_sensitivity as f64)
            .with_linf_sensitivity(
                max_contributions_per_partition as f64 * (upper.to_f64() - lower.to_f64()) / 2.0,
            )
            .build()
    }

    fn build_count_mechanism(
        mechanism_builder: &MechanismBuilder,
        epsilon: f64,
        l0_sensitivity: i64,
        max_contributions_per_partition: i64,
    ) -> Result<Mechanism> {
        mechanism_builder
            .clone()
            .with_epsilon(epsilon)
            .with_l0_sensitivity(l0_sensitivity as f64)
            .with_linf_sensitivity(max_contributions_per_partition as f64)
            .build()
    }
}

fn mean_from_noised(noised_normalized_sum: f64, noised_count: f64, midpoint: f64) -> f64 {
    noised_normalized_sum / noised_count.max(1.0) + midpoint
}

impl<T: Aggregand> Algorithm<T> for BoundedMean<T> {
    fn epsilon(&self) -> f64 {
        match self {
            BoundedMean::Fixed(mean) => mean.epsilon,
            BoundedMean::Approx(mean) => mean.epsilon,
        }
    }

    fn delta(&self) -> f64 {
        match self {
            BoundedMean::Fixed(mean) => mean.delta,
            BoundedMean::Approx(mean) => mean.delta,
        }
    }

    fn add_entry(&mut self, entry: T) {
        self.add_multiple_entries(entry, 1);
    }

    fn partial_result_with_confidence(&mut self, confidence_level: f64) -> Result<Output> {
        match self {
            BoundedMean::Fixed(mean) => mean.generate_result(confidence_level),
            BoundedMean::Approx(mean) => mean.generate_result(confidence_level),
        }
    }

    fn reset(&mut self) {
        match self {
            BoundedMean::Fixed(mean) => {
                mean.partial_count = 0;
                mean.partial_sum = T::zero();
                mean.state.reset();
            }
            BoundedMean::Approx(mean) => {
                mean.partial_count = 0;
                mean.pos_sum.fill(T::zero());
                mean.neg_sum.fill(T::zero());
                mean.approx_bounds.reset();
                mean.state.reset();
            }
        }
    }

    fn serialize(&self) -> Summary {
        let data = match self {
            BoundedMean::Fixed(mean) => BoundedMeanSummary {
                count: mean.partial_count,
                pos_sum: vec![mean.partial_sum],
                neg_sum: Vec::new(),
                bounds: None,
            },
            BoundedMean::Approx(mean) => BoundedMeanSummary {
                count: mean.partial_count,
                pos_sum: mean.pos_sum.clone(),
                neg_sum: mean.neg_sum.clone(),
                bounds: Some(mean.approx_bounds.summary_data()),
            },
        };
        Summary::encode(&data)
    }

    fn merge(&mut self, summary: &Summary) -> Result<()> {
        let data: BoundedMeanSummary<T> = summary.decode()?;
        match self {
            BoundedMean::Fixed(mean) => {
                if data.bounds.is_some() {
                    return Err(DpAggError::internal(
                        "Merged BoundedMean must have the same bounding strategy.",
                    ));
                }
                if data.pos_sum.len() != 1 {
                    return Err(DpAggError::internal(format!(
                        "Bounded mean summary must have exactly one pos_sum but got {}.",
                        data.pos_sum.len()
                    )));
                }
                mean.partial_count = mean.partial_count.saturating_add(data.count);
                mean.partial_sum = mean.partial_sum.saturating_add_value(data.pos_sum[0]);
                Ok(())
            }
            BoundedMean::Approx(mean) => {
                let Some(bounds) = &data.bounds else {
                    return Err(DpAggError::internal(
                        "Merged BoundedMean must have the same bounding strategy.",
                    ));
                };
                if data.pos_sum.len() != mean.pos_sum.len()
                    || data.neg_sum.len() != mean.neg_sum.len()
                {
                    return Err(DpAggError::internal(
                        "Merged BoundedMean must have the same amount of partial sum values as \
                         this BoundedMean.",
                    ));
                }
                mean.approx_bounds.merge_summary_data(bounds)?;
                mean.partial_count = mean.partial_count.saturating_add(data.count);
                for (partial, other) in mean.pos_sum.iter_mut().zip(&data.pos_sum) {
                    *partial = partial.saturating_add_value(*other);
                }
                for (partial, other) in mean.neg_sum.iter_mut().zip(&data.neg_sum) {
                    *partial = partial.saturating_add_value(*other);
                }
                Ok(())
            }
        }
    }

    fn memory_used(&self) -> usize {
        match self {
            BoundedMean::Fixed(_) => std::mem::size_of::<Self>(),
            BoundedMean::Approx(mean) => {
                std::mem::size_of::<Self>()
                    + std::mem::size_of::<T>()
                        * (mean.pos_sum.capacity() + mean.neg_sum.capacity())
                    + mean.approx_bounds.memory_used()
            }
        }
    }
}

/// Bounded mean with a caller-supplied clamp range.
#[derive(Clone, Debug)]
pub struct BoundedMeanWithFixedBounds<T: Aggregand> {
    epsilon: f64,
    delta: f64,
    lower: T,
    upper: T,
    count_mechanism: Mechanism,
    sum_mechanism: Mechanism,
    partial_count: i64,
    partial_sum: T,
    state: AlgorithmState,
}

impl<T: Aggregand> BoundedMeanWithFixedBounds<T> {
    fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        if entry.is_nan_value() || num_of_entries <= 0 {
            return;
        }
        self.partial_count = self.partial_count.saturating_add(num_of_entries);
        let clamped = clamp(self.lower, self.upper, entry);
        self.partial_sum = self
            .partial_sum
            .saturating_add_value(clamped.saturating_mul_count(num_of_entries));
    }

    fn generate_result(&mut self, _confidence_level: f64) -> Result<Output> {
        self.state.begin_result()?;
        let midpoint =
            self.lower.to_f64() + (self.upper.to_f64() - self.lower.to_f64()) / 2.0;
        let noised_count = self.count_mechanism.add_noise(self.partial_count as f64);
        let noised_normalized_sum = self
            .sum_mechanism
            .add_noise(self.partial_sum.to_f64() - self.partial_count as f64 * midpoint);
        let mean = mean_from_noised(noised_normalized_sum, noised_count, midpoint);
        Ok(Output::single(OutputValue::Float(clamp(
            self.lower.to_f64(),
            self.upper.to_f64(),
            mean,
        ))))
    }
}

/// Bounded mean with a privately inferred clamp range.
#[derive(Clone, Debug)]
pub struct BoundedMeanWithApproxBounds<T: Aggregand> {
    epsilon: f64,
    delta: f64,
    epsilon_for_sum: f64,
    l0_sensitivity: i64,
    max_contributions_per_partition: i64,
    mechanism_builder: MechanismBuilder,
    count_mechanism: Mechanism,
    approx_bounds: ApproxBounds<T>,
    partial_count: i64,
    pos_sum: Vec<T>,
    neg_sum: Vec<T>,
    state: AlgorithmState,
}

impl<T: Aggregand> BoundedMeanWithApproxBounds<T> {
    fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        if entry.is_nan_value() || num_of_entries <= 0 {
            return;
        }
        self.partial_count = self.partial_count.saturating_add(num_of_entries);
        self.approx_bounds.add_multiple_entries(entry, num_of_entries);
        if entry >= T::zero() {
            self.approx_bounds
                .add_to_partial_sums(&mut self.pos_sum, entry, num_of_entries);
        } else {
            self.approx_bounds
                .add_to_partial_sums(&mut self.neg_sum, entry, num_of_entries);
        }
    }

    fn generate_result(&mut self, _confidence_level: f64) -> Result<Output> {
        self.state.begin_result()?;
        let (lower, upper) = self.approx_bounds.finalize_bounds()?;
        if lower > upper {
            return Err(DpAggError::invalid_argument(
                "Lower bound cannot be greater than upper bound.",
            ));
        }

        let midpoint = lower.to_f64() + (upper.to_f64() - lower.to_f64()) / 2.0;
        let sum: T = self.approx_bounds.compute_from_partials(
            &self.pos_sum,
            &self.neg_sum,
            |x| x,
            lower,
            upper,
            self.partial_count,
        )?;

        let mut sum_mechanism = BoundedMean::<T>::build_normalized_sum_mechanism(
            &self.mechanism_builder,
            self.epsilon_for_sum,
            self.l0_sensitivity,
            self.max_contributions_per_partition,
            lower,
            upper,
        )?;

        let noised_count = self.count_mechanism.add_noise(self.partial_count as f64);
        let noised_normalized_sum =
            sum_mechanism.add_noise(sum.to_f64() - self.partial_count as f64 * midpoint);
        let mean = mean_from_noised(noised_normalized_sum, noised_count, midpoint);

        let mut output = Output::single(OutputValue::Float(clamp(
            lower.to_f64(),
            upper.to_f64(),
            mean,
        )));
        output.set_bounding_report(self.approx_bounds.bounding_report(lower, upper));
        Ok(output)
    }
}

/// Fluent configuration for [`BoundedMean`].
#[derive(Clone, Debug)]
pub struct BoundedMeanBuilder<T: Aggregand> {
    epsilon: Option<f64>,
    delta: f64,
    lower: Option<T>,
    upper: Option<T>,
    max_partitions_contributed: i64,
    max_contributions_per_partition: i64,
    mechanism_builder: MechanismBuilder,
    approx_bounds: Option<ApproxBounds<T>>,
}

impl<T: Aggregand> Default for BoundedMeanBuilder<T> {
    fn default() -> Self {
        Self {
            epsilon: None,
            delta: 0.0,
            lower: None,
            upper: None,
            max_partitions_contributed: 1,
            max_contributions_per_partition: 1,
            mechanism_builder: MechanismBuilder::laplace(),
            approx_bounds: None,
        }
    }
}

impl<T: Aggregand> BoundedMeanBuilder<T> {
    /// Set the total epsilon owned by the aggregator.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Set the total delta owned by the aggregator.
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = delta;
        self
    }

    /// Set the lower clamp bound.
    pub fn with_lower(mut self, lower: T) -> Self {
        self.lower = Some(lower);
        self
    }

    /// Set the upper clamp bound.
    pub fn with_upper(mut self, upper: T) -> Self {
        self.upper = Some(upper);
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

    /// Supply a configured approx-bounds sub-aggregator.
    pub fn with_approx_bounds(mut self, approx_bounds: ApproxBounds<T>) -> Self {
        self.approx_bounds = Some(approx_bounds);
        self
    }

    /// Seed the noise streams; intended for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.mechanism_builder = self.mechanism_builder.with_seed(seed);
        self
    }

    /// Validate the configuration and construct the aggregator.
    pub fn build(&mut self) -> Result<BoundedMean<T>> {
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
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) => {
                validate_is_set(Some(lower.to_f64()), "Lower bound")?;
                validate_is_set(Some(upper.to_f64()), "Upper bound")?;
                if lower > upper {
                    return Err(DpAggError::invalid_argument(
                        "Lower bound cannot be greater than upper bound.",
                    ));
                }
            }
            (None, None) => {}
            _ => {
                return Err(DpAggError::invalid_argument(
                    "Lower and upper bounds must either both be set or both be unset.",
                ))
            }
        }
        validate_max_partitions_contributed(Some(self.max_partitions_contributed))?;
        validate_max_contributions_per_partition(Some(self.max_contributions_per_partition))?;

        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) => {
                let count_mechanism = BoundedMean::<T>::build_count_mechanism(
                    &self.mechanism_builder,
                    epsilon / 2.0,
                    self.max_partitions_contributed,
                    self.max_contributions_per_partition,
                )?;
                let sum_mechanism = BoundedMean::<T>::build_normalized_sum_mechanism(
                    &self.mechanism_builder,
                    epsilon / 2.0,
                    self.max_partitions_contributed,
                    self.max_contributions_per_partition,
                    lower,
                    upper,
                )?;
                Ok(BoundedMean::Fixed(BoundedMeanWithFixedBounds {
                    epsilon,
                    delta,
                    lower,
                    upper,
                    count_mechanism,
                    sum_mechanism,
                    partial_count: 0,
                    partial_sum: T::zero(),
                    state: AlgorithmState::default(),
                }))
            }
            (None, None) => {
                let approx_bounds = match self.approx_bounds.take() {
                    Some(bounds) => bounds,
                    None => ApproxBoundsBuilder::default()
                        .with_epsilon(epsilon / 2.0)
                        .with_mechanism_builder(self.mechanism_builder.clone())
                        .with_max_partitions_contributed(self.max_partitions_contributed)
                        .with_max_contributions_per_partition(
                            self.max_contributions_per_partition,
                        )
                        .build()?,
                };
                if epsilon <= approx_bounds.epsilon() {
                    return Err(DpAggError::invalid_argument(format!(
                        "Approx Bounds consumes more epsilon budget than available. Total \
                         Epsilon: {} Approx Bounds Epsilon: {}",
                        epsilon,
                        approx_bounds.epsilon()
                    )));
                }
                let remaining = epsilon - approx_bounds.epsilon();
                let epsilon_for_count = remaining / 2.0;
                let epsilon_for_sum = remaining - epsilon_for_count;
                let count_mechanism = BoundedMean::<T>::build_count_mechanism(
                    &self.mechanism_builder,
                    epsilon_for_count,
                    self.max_partitions_contributed,
                    self.max_contributions_per_partition,
                )?;
                let num_bins = approx_bounds.num_positive_bins();
                Ok(BoundedMean::Approx(BoundedMeanWithApproxBounds {
                    epsilon,
                    delta,
                    epsilon_for_sum,
                    l0_sensitivity: self.max_partitions_contributed,
                    max_contributions_per_partition: self.max_contributions_per_partition,
                    mechanism_builder: self.mechanism_builder.clone(),
                    count_mechanism,
                    approx_bounds,
                    partial_count: 0,
                    pos_sum: vec![T::zero(); num_bins],
                    neg_sum: vec![T::zero(); num_bins],
                    state: AlgorithmState::default(),
                }))
            }
            _ => Err(DpAggError::invalid_argument(
                "Lower and upper bounds must either both be set or both be unset.",
            )),
        }
    }
}

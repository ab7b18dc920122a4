//! Differentially private bounded sum.
//!
//! Entries are clamped into a bound range before accumulation. The range is
//! either supplied by the caller (fixed bounds) or inferred privately from
//! the data (approx bounds), in which case part of the epsilon budget is
//! spent on the inference.

use serde::{Deserialize, Serialize};

use dpagg_core::validate::{
    validate_delta, validate_epsilon, validate_is_set, validate_max_contributions_per_partition,
    validate_max_partitions_contributed,
};
use dpagg_core::{
    clamp, default_epsilon, safe_cast_from_double, Aggregand, Algorithm, AlgorithmState,
    DpAggError, Mechanism, MechanismBuilder, Output, OutputValue, Result, Summary,
};

use crate::approx_bounds::{ApproxBounds, ApproxBoundsBuilder, ApproxBoundsSummary};

/// Serialized partial state of a bounded sum.
///
/// Fixed-bounds sums carry a single positive partial; approx-bounds sums
/// carry one partial per histogram bin and the nested histogram counts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundedSumSummary<T> {
    pos_sum: Vec<T>,
    neg_sum: Vec<T>,
    bounds: Option<ApproxBoundsSummary>,
}

/// DP bounded-sum aggregator.
#[derive(Clone, Debug)]
pub enum BoundedSum<T: Aggregand> {
    /// Caller-supplied clamp range.
    Fixed(BoundedSumWithFixedBounds<T>),
    /// Privately inferred clamp range.
    Approx(BoundedSumWithApproxBounds<T>),
}

impl<T: Aggregand> BoundedSum<T> {
    /// Builder selecting the variant from which bounds are set.
    pub fn builder() -> BoundedSumBuilder<T> {
        BoundedSumBuilder::default()
    }

    /// Accumulate `num_of_entries` occurrences of `entry`.
    pub fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        match self {
            BoundedSum::Fixed(sum) => sum.add_multiple_entries(entry, num_of_entries),
            BoundedSum::Approx(sum) => sum.add_multiple_entries(entry, num_of_entries),
        }
    }

    /// The caller-supplied lower bound, for the fixed variant.
    pub fn lower(&self) -> Option<T> {
        match self {
            BoundedSum::Fixed(sum) => Some(sum.lower),
            BoundedSum::Approx(_) => None,
        }
    }

    /// The caller-supplied upper bound, for the fixed variant.
    pub fn upper(&self) -> Option<T> {
        match self {
            BoundedSum::Fixed(sum) => Some(sum.upper),
            BoundedSum::Approx(_) => None,
        }
    }

    /// Epsilon spent inferring bounds; zero for the fixed variant.
    pub fn bounding_epsilon(&self) -> f64 {
        match self {
            BoundedSum::Fixed(_) => 0.0,
            BoundedSum::Approx(sum) => sum.approx_bounds.epsilon(),
        }
    }

    /// Epsilon spent noising the sum itself.
    pub fn aggregation_epsilon(&self) -> f64 {
        self.epsilon() - self.bounding_epsilon()
    }

    fn build_mechanism(
        mechanism_builder: &MechanismBuilder,
        epsilon: f64,
        delta: f64,
        l0_sensitivity: i64,
        max_contributions_per_partition: i64,
        lower: T,
        upper: T,
    ) -> Result<Mechanism> {
        mechanism_builder
            .clone()
            .with_epsilon(epsilon)
            .with_delta(delta)
            .with_l0_sensitivity(l0_sensitivity as f64)
            .with_linf_sensitivity(
                max_contributions_per_partition as f64
                    * lower.to_f64().abs().max(upper.to_f64().abs()),
            )
            .build()
    }

    fn check_lower_bound(lower: T) -> Result<()> {
        if lower.to_f64() < -T::max_value().to_f64() {
            return Err(DpAggError::invalid_argument(
                "Lower bound cannot be higher in magnitude than the max numeric limit. If \
                 manually bounding, please increase it by at least 1.",
            ));
        }
        Ok(())
    }
}

impl<T: Aggregand> Algorithm<T> for BoundedSum<T> {
    fn epsilon(&self) -> f64 {
        match self {
            BoundedSum::Fixed(sum) => sum.epsilon,
            BoundedSum::Approx(sum) => sum.epsilon,
        }
    }

    fn delta(&self) -> f64 {
        match self {
            BoundedSum::Fixed(sum) => sum.delta,
            BoundedSum::Approx(sum) => sum.delta,
        }
    }

    fn add_entry(&mut self, entry: T) {
        self.add_multiple_entries(entry, 1);
    }

    fn partial_result_with_confidence(&mut self, confidence_level: f64) -> Result<Output> {
        match self {
            BoundedSum::Fixed(sum) => sum.generate_result(confidence_level),
            BoundedSum::Approx(sum) => sum.generate_result(confidence_level),
        }
    }

    fn reset(&mut self) {
        match self {
            BoundedSum::Fixed(sum) => {
                sum.partial_sum = T::zero();
                sum.state.reset();
            }
            BoundedSum::Approx(sum) => {
                sum.pos_sum.fill(T::zero());
                sum.neg_sum.fill(T::zero());
                sum.approx_bounds.reset();
                sum.state.reset();
            }
        }
    }

    fn serialize(&self) -> Summary {
        let data = match self {
            BoundedSum::Fixed(sum) => BoundedSumSummary {
                pos_sum: vec![sum.partial_sum],
                neg_sum: Vec::new(),
                bounds: None,
            },
            BoundedSum::Approx(sum) => BoundedSumSummary {
                pos_sum: sum.pos_sum.clone(),
                neg_sum: sum.neg_sum.clone(),
                bounds: Some(sum.approx_bounds.summary_data()),
            },
        };
        Summary::encode(&data)
    }

    fn merge(&mut self, summary: &Summary) -> Result<()> {
        let data: BoundedSumSummary<T> = summary.decode()?;
        match self {
            BoundedSum::Fixed(sum) => {
                if data.bounds.is_some() {
                    return Err(DpAggError::internal(
                        "Merged BoundedSum must have the same bounding strategy.",
                    ));
                }
                if data.pos_sum.len() != 1 {
                    return Err(DpAggError::internal(format!(
                        "Bounded sum summary must have exactly one pos_sum but got {}.",
                        data.pos_sum.len()
                    )));
                }
                sum.partial_sum = sum.partial_sum.saturating_add_value(data.pos_sum[0]);
                Ok(())
            }
            BoundedSum::Approx(sum) => {
                let Some(bounds) = &data.bounds else {
                    return Err(DpAggError::internal(
                        "Merged BoundedSum must have the same bounding strategy.",
                    ));
                };
                if data.pos_sum.len() != sum.pos_sum.len()
                    || data.neg_sum.len() != sum.neg_sum.len()
                {
                    return Err(DpAggError::internal(
                        "Merged BoundedSum must have the same amount of partial sum values as \
                         this BoundedSum.",
                    ));
                }
                sum.approx_bounds.merge_summary_data(bounds)?;
                for (partial, other) in sum.pos_sum.iter_mut().zip(&data.pos_sum) {
                    *partial = partial.saturating_add_value(*other);
                }
                for (partial, other) in sum.neg_sum.iter_mut().zip(&data.neg_sum) {
                    *partial = partial.saturating_add_value(*other);
                }
                Ok(())
            }
        }
    }

    fn memory_used(&self) -> usize {
        match self {
            BoundedSum::Fixed(_) => std::mem::size_of::<Self>(),
            BoundedSum::Approx(sum) => {
                std::mem::size_of::<Self>()
                    + std::mem::size_of::<T>() * (sum.pos_sum.capacity() + sum.neg_sum.capacity())
                    + sum.approx_bounds.memory_used()
            }
        }
    }
}

/// Bounded sum with a caller-supplied clamp range.
#[derive(Clone, Debug)]
pub struct BoundedSumWithFixedBounds<T: Aggregand> {
    epsilon: f64,
    delta: f64,
    lower: T,
    upper: T,
    mechanism: Mechanism,
    partial_sum: T,
    state: AlgorithmState,
}

impl<T: Aggregand> BoundedSumWithFixedBounds<T> {
    fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        if entry.is_nan_value() || num_of_entries <= 0 {
            return;
        }
        let clamped = clamp(self.lower, self.upper, entry);
        self.partial_sum = self
            .partial_sum
            .saturating_add_value(clamped.saturating_mul_count(num_of_entries));
    }

    fn generate_result(&mut self, confidence_level: f64) -> Result<Output> {
        self.state.begin_result()?;
        let noisy_sum = self.mechanism.add_noise(self.partial_sum.to_f64());
        let interval = self.mechanism.noise_confidence_interval(confidence_level, 1.0);
        Ok(make_sum_output::<T>(noisy_sum, interval.ok()))
    }
}

/// Bounded sum with a privately inferred clamp range.
#[derive(Clone, Debug)]
pub struct BoundedSumWithApproxBounds<T: Aggregand> {
    epsilon: f64,
    delta: f64,
    l0_sensitivity: i64,
    max_contributions_per_partition: i64,
    mechanism_builder: MechanismBuilder,
    approx_bounds: ApproxBounds<T>,
    pos_sum: Vec<T>,
    neg_sum: Vec<T>,
    state: AlgorithmState,
}

impl<T: Aggregand> BoundedSumWithApproxBounds<T> {
    fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        if entry.is_nan_value() || num_of_entries <= 0 {
            return;
        }
        self.approx_bounds.add_multiple_entries(entry, num_of_entries);
        if entry >= T::zero() {
            self.approx_bounds
                .add_to_partial_sums(&mut self.pos_sum, entry, num_of_entries);
        } else {
            self.approx_bounds
                .add_to_partial_sums(&mut self.neg_sum, entry, num_of_entries);
        }
    }

    fn aggregation_epsilon(&self) -> f64 {
        self.epsilon - self.approx_bounds.epsilon()
    }

    fn generate_result(&mut self, confidence_level: f64) -> Result<Output> {
        self.state.begin_result()?;
        let (bounds_lower, bounds_upper) = self.approx_bounds.finalize_bounds()?;

        // Sensitivity depends only on the larger-magnitude bound, so widen the
        // smaller side to its negation. That minimizes clamping without
        // spending more budget. The lowest value needs special care because
        // -lowest overflows two's complement.
        let (lower, upper) = if bounds_lower == T::min_value() {
            (T::min_value(), T::max_value())
        } else {
            let neg_upper = bounds_upper.saturating_neg_value();
            let neg_lower = bounds_lower.saturating_neg_value();
            (
                if bounds_lower < neg_upper { bounds_lower } else { neg_upper },
                if bounds_upper > neg_lower { bounds_upper } else { neg_lower },
            )
        };

        let mut mechanism = BoundedSum::<T>::build_mechanism(
            &self.mechanism_builder,
            self.aggregation_epsilon(),
            self.delta,
            self.l0_sensitivity,
            self.max_contributions_per_partition,
            lower,
            upper,
        )?;

        // Identity transform recovers the plain clamped sum; the range always
        // spans zero after symmetrization, so the count term is unused.
        let sum = self.approx_bounds.compute_from_partials(
            &self.pos_sum,
            &self.neg_sum,
            |x| x,
            lower,
            upper,
            0,
        )?;

        let noisy_sum = mechanism.add_noise(sum.to_f64());
        let interval = mechanism.noise_confidence_interval(confidence_level, 1.0);
        let mut output = make_sum_output::<T>(noisy_sum, interval.ok());
        output.set_bounding_report(self.approx_bounds.bounding_report(lower, upper));
        Ok(output)
    }
}

fn make_sum_output<T: Aggregand>(
    noisy_sum: f64,
    interval: Option<dpagg_core::ConfidenceInterval>,
) -> Output {
    let (value, center) = if T::INTEGRAL {
        let cast = safe_cast_from_double::<T>(noisy_sum);
        (cast.value.to_output_value(), cast.value.to_f64())
    } else {
        (OutputValue::Float(noisy_sum), noisy_sum)
    };
    match interval {
        Some(interval) => Output::single_with_interval(value, interval.offset_by(center)),
        None => Output::single(value),
    }
}

/// Fluent configuration for [`BoundedSum`].
///
/// Setting both bounds selects the fixed variant; leaving both unset selects
/// the approx variant. After a successful build an explicitly supplied
/// approx-bounds sub-aggregator has been transferred into the built
/// aggregator and the builder's slot is cleared.
#[derive(Clone, Debug)]
pub struct BoundedSumBuilder<T: Aggregand> {
    epsilon: Option<f64>,
    delta: f64,
    lower: Option<T>,
    upper: Option<T>,
    max_partitions_contributed: i64,
    max_contributions_per_partition: i64,
    mechanism_builder: MechanismBuilder,
    approx_bounds: Option<ApproxBounds<T>>,
}

impl<T: Aggregand> Default for BoundedSumBuilder<T> {
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

impl<T: Aggregand> BoundedSumBuilder<T> {
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

    /// Supply a configured approx-bounds sub-aggregator; ownership transfers
    /// to the built aggregator.
    pub fn with_approx_bounds(mut self, approx_bounds: ApproxBounds<T>) -> Self {
        self.approx_bounds = Some(approx_bounds);
        self
    }

    /// Seed the noise streams; intended for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.mechanism_builder = self.mechanism_builder.with_seed(seed);
        self
    }

    fn validated_bounds(&self) -> Result<Option<(T, T)>> {
        match (self.lower, self.upper) {
            (None, None) => Ok(None),
            (Some(lower), Some(upper)) => {
                validate_is_set(Some(lower.to_f64()), "Lower bound")?;
                validate_is_set(Some(upper.to_f64()), "Upper bound")?;
                if lower > upper {
                    return Err(DpAggError::invalid_argument(
                        "Lower bound cannot be greater than upper bound.",
                    ));
                }
                BoundedSum::<T>::check_lower_bound(lower)?;
                Ok(Some((lower, upper)))
            }
            _ => Err(DpAggError::invalid_argument(
                "Lower and upper bounds must either both be set or both be unset.",
            )),
        }
    }

    /// Validate the configuration and construct the aggregator.
    pub fn build(&mut self) -> Result<BoundedSum<T>> {
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
        let bounds = self.validated_bounds()?;
        validate_max_partitions_contributed(Some(self.max_partitions_contributed))?;
        validate_max_contributions_per_partition(Some(self.max_contributions_per_partition))?;

        match bounds {
            Some((lower, upper)) => {
                let mechanism = BoundedSum::<T>::build_mechanism(
                    &self.mechanism_builder,
                    epsilon,
                    delta,
                    self.max_partitions_contributed,
                    self.max_contributions_per_partition,
                    lower,
                    upper,
                )?;
                Ok(BoundedSum::Fixed(BoundedSumWithFixedBounds {
                    epsilon,
                    delta,
                    lower,
                    upper,
                    mechanism,
                    partial_sum: T::zero(),
                    state: AlgorithmState::default(),
                }))
            }
            None => {
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
                let num_bins = approx_bounds.num_positive_bins();
                Ok(BoundedSum::Approx(BoundedSumWithApproxBounds {
                    epsilon,
                    delta,
                    l0_sensitivity: self.max_partitions_contributed,
                    max_contributions_per_partition: self.max_contributions_per_partition,
                    mechanism_builder: self.mechanism_builder.clone(),
                    approx_bounds,
                    pos_sum: vec![T::zero(); num_bins],
                    neg_sum: vec![T::zero(); num_bins],
                    state: AlgorithmState::default(),
                }))
            }
        }
    }
}

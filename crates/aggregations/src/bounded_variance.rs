//! Differentially private bounded variance.
//!
//! Maintains a count, a clamped sum, and a clamped sum of squares. The two
//! sums are normalized around the bound midpoints before noising for
//! numerical stability, and the assembled variance is clamped into
//! `[0, (upper - lower)^2 / 4]`. Because the result is non-negative, this
//! aggregator also supports a DP standard deviation by post-processing.

use serde::{Deserialize, Serialize};

use dpagg_core::validate::{
    validate_delta, validate_epsilon, validate_is_set, validate_max_contributions_per_partition,
    validate_max_partitions_contributed,
};
use dpagg_core::{
    clamp, default_epsilon, safe_square, safe_subtract, Aggregand, Algorithm, AlgorithmState,
    DpAggError, Mechanism, MechanismBuilder, Output, OutputValue, Result, Summary,
};

use crate::approx_bounds::{ApproxBounds, ApproxBoundsBuilder, ApproxBoundsSummary};

/// Serialized partial state of a bounded variance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundedVarianceSummary<T> {
    count: i64,
    pos_sum: Vec<T>,
    neg_sum: Vec<T>,
    pos_sum_of_squares: Vec<f64>,
    neg_sum_of_squares: Vec<f64>,
    bounds: Option<ApproxBoundsSummary>,
}

/// DP bounded-variance aggregator.
#[derive(Clone, Debug)]
pub enum BoundedVariance<T: Aggregand> {
    /// Caller-supplied clamp range.
    Fixed(BoundedVarianceWithFixedBounds<T>),
    /// Privately inferred clamp range.
    Approx(BoundedVarianceWithApproxBounds<T>),
}

impl<T: Aggregand> BoundedVariance<T> {
    /// Builder selecting the variant from which bounds are set.
    pub fn builder() -> BoundedVarianceBuilder<T> {
        BoundedVarianceBuilder::default()
    }

    /// Accumulate `num_of_entries` occurrences of `entry`.
    pub fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        match self {
            BoundedVariance::Fixed(variance) => {
                variance.add_multiple_entries(entry, num_of_entries)
            }
            BoundedVariance::Approx(variance) => {
                variance.add_multiple_entries(entry, num_of_entries)
            }
        }
    }

    /// Epsilon spent inferring bounds; zero for the fixed variant.
    pub fn bounding_epsilon(&self) -> f64 {
        match self {
            BoundedVariance::Fixed(_) => 0.0,
            BoundedVariance::Approx(variance) => variance.approx_bounds.epsilon(),
        }
    }

    /// Epsilon spent noising the count, sum, and sum of squares.
    pub fn aggregation_epsilon(&self) -> f64 {
        self.epsilon() - self.bounding_epsilon()
    }

    fn check_bounds(lower: T, upper: T) -> Result<()> {
        if lower > upper {
            return Err(DpAggError::invalid_argument(
                "Lower cannot be greater than upper.",
            ));
        }
        if T::INTEGRAL {
            let difference = safe_subtract(upper, lower);
            let squared = safe_square(difference.value);
            if difference.overflow || squared.overflow {
                return Err(DpAggError::invalid_argument(
                    "Sensitivity calculation caused integer overflow.",
                ));
            }
            let sqrt_max = T::max_value().to_f64().sqrt();
            if upper.to_f64() > sqrt_max || lower.to_f64() < -sqrt_max {
                return Err(DpAggError::invalid_argument(
                    "Squaring the bounds caused overflow.",
                ));
            }
        }
        Ok(())
    }

    /// Midpoint of `x^2` over `[lower, upper]`.
    fn midpoint_of_squares(lower: f64, upper: f64) -> f64 {
        debug_assert!(upper >= lower);
        if lower < 0.0 && upper > 0.0 {
            return (lower * lower).max(upper * upper) / 2.0;
        }
        lower * lower + (upper * upper - lower * lower) / 2.0
    }

    /// Width of the range of `x^2` over `[lower, upper]`.
    fn range_of_squares(lower: f64, upper: f64) -> f64 {
        if lower < 0.0 && upper > 0.0 {
            return (lower * lower).max(upper * upper);
        }
        (upper * upper - lower * lower).abs()
    }

    fn interval_length_squared(lower: f64, upper: f64) -> f64 {
        (upper - lower) * (upper - lower)
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

    fn build_sum_mechanism(
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

    fn build_sum_of_squares_mechanism(
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
                max_contributions_per_partition as f64
                    * Self::range_of_squares(lower.to_f64(), upper.to_f64())
                    / 2.0,
            )
            .build()
    }
}

/// Assemble the clamped variance from noised accumulators.
///
/// Everything past the three noise additions is post-processing; the
/// `noised_count <= 1` guard falls back to the midpoint estimates.
fn variance_from_noised(
    noised_count: f64,
    noised_normalized_sum: f64,
    noised_normalized_sum_of_squares: f64,
    midpoint: f64,
    midpoint_of_squares: f64,
    interval_length_squared: f64,
) -> f64 {
    let (mean, mean_of_squares) = if noised_count <= 1.0 {
        (midpoint, midpoint_of_squares)
    } else {
        (
            noised_normalized_sum / noised_count + midpoint,
            noised_normalized_sum_of_squares / noised_count + midpoint_of_squares,
        )
    };
    let noised_variance = mean_of_squares - mean * mean;
    clamp(0.0, interval_length_squared / 4.0, noised_variance)
}

impl<T: Aggregand> Algorithm<T> for BoundedVariance<T> {
    fn epsilon(&self) -> f64 {
        match self {
            BoundedVariance::Fixed(variance) => variance.epsilon,
            BoundedVariance::Approx(variance) => variance.epsilon,
        }
    }

    fn delta(&self) -> f64 {
        match self {
            BoundedVariance::Fixed(variance) => variance.delta,
            BoundedVariance::Approx(variance) => variance.delta,
        }
    }

    fn add_entry(&mut self, entry: T) {
        self.add_multiple_entries(entry, 1);
    }

    fn partial_result_with_confidence(&mut self, confidence_level: f64) -> Result<Output> {
        match self {
            BoundedVariance::Fixed(variance) => variance.generate_result(confidence_level),
            BoundedVariance::Approx(variance) => variance.generate_result(confidence_level),
        }
    }

    fn reset(&mut self) {
        match self {
            BoundedVariance::Fixed(variance) => {
                variance.partial_count = 0;
                variance.partial_sum = T::zero();
                variance.partial_sum_of_squares = 0.0;
                variance.state.reset();
            }
            BoundedVariance::Approx(variance) => {
                variance.partial_count = 0;
                variance.pos_sum.fill(T::zero());
                variance.neg_sum.fill(T::zero());
                variance.pos_sum_of_squares.fill(0.0);
                variance.neg_sum_of_squares.fill(0.0);
                variance.approx_bounds.reset();
                variance.state.reset();
            }
        }
    }

    fn serialize(&self) -> Summary {
        let data = match self {
            BoundedVariance::Fixed(variance) => BoundedVarianceSummary {
                count: variance.partial_count,
                pos_sum: vec![variance.partial_sum],
                neg_sum: Vec::new(),
                pos_sum_of_squares: vec![variance.partial_sum_of_squares],
                neg_sum_of_squares: Vec::new(),
                bounds: None,
            },
            BoundedVariance::Approx(variance) => BoundedVarianceSummary {
                count: variance.partial_count,
                pos_sum: variance.pos_sum.clone(),
                neg_sum: variance.neg_sum.clone(),
                pos_sum_of_squares: variance.pos_sum_of_squares.clone(),
                neg_sum_of_squares: variance.neg_sum_of_squares.clone(),
                bounds: Some(variance.approx_bounds.summary_data()),
            },
        };
        Summary::encode(&data)
    }

    fn merge(&mut self, summary: &Summary) -> Result<()> {
        let data: BoundedVarianceSummary<T> = summary.decode()?;
        match self {
            BoundedVariance::Fixed(variance) => {
                if data.bounds.is_some() {
                    return Err(DpAggError::internal(
                        "Merged BoundedVariance must have the same bounding strategy.",
                    ));
                }
                if data.pos_sum.len() != 1 {
                    return Err(DpAggError::internal(format!(
                        "Expected positive sums of size exactly 1 but got {}.",
                        data.pos_sum.len()
                    )));
                }
                if data.pos_sum_of_squares.len() != 1 {
                    return Err(DpAggError::internal(format!(
                        "Expected positive sum of squares of size exactly 1 but got {}.",
                        data.pos_sum_of_squares.len()
                    )));
                }
                variance.partial_count = variance.partial_count.saturating_add(data.count);
                variance.partial_sum = variance.partial_sum.saturating_add_value(data.pos_sum[0]);
                variance.partial_sum_of_squares += data.pos_sum_of_squares[0];
                Ok(())
            }
            BoundedVariance::Approx(variance) => {
                let Some(bounds) = &data.bounds else {
                    return Err(DpAggError::internal(
                        "Merged BoundedVariance must have the same bounding strategy.",
                    ));
                };
                if data.pos_sum.len() != variance.pos_sum.len()
                    || data.neg_sum.len() != variance.neg_sum.len()
                    || data.pos_sum_of_squares.len() != variance.pos_sum_of_squares.len()
                    || data.neg_sum_of_squares.len() != variance.neg_sum_of_squares.len()
                {
                    return Err(DpAggError::internal(
                        "Merged BoundedVariance must have the same amount of partial sum or sum \
                         of squares values as this BoundedVariance.",
                    ));
                }
                variance.approx_bounds.merge_summary_data(bounds)?;
                variance.partial_count = variance.partial_count.saturating_add(data.count);
                for (partial, other) in variance.pos_sum.iter_mut().zip(&data.pos_sum) {
                    *partial = partial.saturating_add_value(*other);
                }
                for (partial, other) in variance.neg_sum.iter_mut().zip(&data.neg_sum) {
                    *partial = partial.saturating_add_value(*other);
                }
                for (partial, other) in variance
                    .pos_sum_of_squares
                    .iter_mut()
                    .zip(&data.pos_sum_of_squares)
                {
                    *partial += *other;
                }
                for (partial, other) in variance
                    .neg_sum_of_squares
                    .iter_mut()
                    .zip(&data.neg_sum_of_squares)
                {
                    *partial += *other;
                }
                Ok(())
            }
        }
    }

    fn memory_used(&self) -> usize {
        match self {
            BoundedVariance::Fixed(_) => std::mem::size_of::<Self>(),
            BoundedVariance::Approx(variance) => {
                std::mem::size_of::<Self>()
                    + std::mem::size_of::<T>()
                        * (variance.pos_sum.capacity() + variance.neg_sum.capacity())
                    + std::mem::size_of::<f64>()
                        * (variance.pos_sum_of_squares.capacity()
                            + variance.neg_sum_of_squares.capacity())
                    + variance.approx_bounds.memory_used()
            }
        }
    }
}

/// Bounded variance with a caller-supplied clamp range.
#[derive(Clone, Debug)]
pub struct BoundedVarianceWithFixedBounds<T: Aggregand> {
    epsilon: f64,
    delta: f64,
    lower: T,
    upper: T,
    count_mechanism: Mechanism,
    sum_mechanism: Mechanism,
    sum_of_squares_mechanism: Mechanism,
    partial_count: i64,
    partial_sum: T,
    partial_sum_of_squares: f64,
    state: AlgorithmState,
}

impl<T: Aggregand> BoundedVarianceWithFixedBounds<T> {
    fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        if entry.is_nan_value() || num_of_entries <= 0 {
            return;
        }
        self.partial_count = self.partial_count.saturating_add(num_of_entries);
        let clamped = clamp(self.lower, self.upper, entry);
        self.partial_sum = self
            .partial_sum
            .saturating_add_value(clamped.saturating_mul_count(num_of_entries));
        let clamped_f = clamped.to_f64();
        self.partial_sum_of_squares += clamped_f * clamped_f * num_of_entries as f64;
    }

    fn generate_result(&mut self, _confidence_level: f64) -> Result<Output> {
        self.state.begin_result()?;
        let lower = self.lower.to_f64();
        let upper = self.upper.to_f64();
        let midpoint = lower + (upper - lower) / 2.0;
        let midpoint_of_squares = BoundedVariance::<T>::midpoint_of_squares(lower, upper);

        let noised_count = self.count_mechanism.add_noise(self.partial_count as f64);
        let noised_normalized_sum = self
            .sum_mechanism
            .add_noise(self.partial_sum.to_f64() - self.partial_count as f64 * midpoint);
        let noised_normalized_sum_of_squares = self.sum_of_squares_mechanism.add_noise(
            self.partial_sum_of_squares - self.partial_count as f64 * midpoint_of_squares,
        );

        Ok(Output::single(OutputValue::Float(variance_from_noised(
            noised_count,
            noised_normalized_sum,
            noised_normalized_sum_of_squares,
            midpoint,
            midpoint_of_squares,
            BoundedVariance::<T>::interval_length_squared(lower, upper),
        ))))
    }
}

/// Bounded variance with a privately inferred clamp range.
#[derive(Clone, Debug)]
pub struct BoundedVarianceWithApproxBounds<T: Aggregand> {
    epsilon: f64,
    delta: f64,
    epsilon_for_sum: f64,
    epsilon_for_squares: f64,
    l0_sensitivity: i64,
    max_contributions_per_partition: i64,
    mechanism_builder: MechanismBuilder,
    count_mechanism: Mechanism,
    approx_bounds: ApproxBounds<T>,
    partial_count: i64,
    pos_sum: Vec<T>,
    neg_sum: Vec<T>,
    pos_sum_of_squares: Vec<f64>,
    neg_sum_of_squares: Vec<f64>,
    state: AlgorithmState,
}

impl<T: Aggregand> BoundedVarianceWithApproxBounds<T> {
    fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        if entry.is_nan_value() || num_of_entries <= 0 {
            return;
        }
        self.partial_count = self.partial_count.saturating_add(num_of_entries);
        self.approx_bounds.add_multiple_entries(entry, num_of_entries);

        // The (a+b)(a-b) rewrite keeps intermediate squares from overflowing
        // to infinity near the type limits.
        let difference_of_squares =
            |a: T, b: T| (a.to_f64() + b.to_f64()) * (a.to_f64() - b.to_f64());

        if entry >= T::zero() {
            self.approx_bounds
                .add_to_partial_sums(&mut self.pos_sum, entry, num_of_entries);
            self.approx_bounds.add_to_partials(
                &mut self.pos_sum_of_squares,
                entry,
                num_of_entries,
                difference_of_squares,
            );
        } else {
            self.approx_bounds
                .add_to_partial_sums(&mut self.neg_sum, entry, num_of_entries);
            self.approx_bounds.add_to_partials(
                &mut self.neg_sum_of_squares,
                entry,
                num_of_entries,
                difference_of_squares,
            );
        }
    }

    fn generate_result(&mut self, _confidence_level: f64) -> Result<Output> {
        self.state.begin_result()?;
        let (lower, upper) = self.approx_bounds.finalize_bounds()?;
        BoundedVariance::<T>::check_bounds(lower, upper)?;

        let sum: T = self.approx_bounds.compute_from_partials(
            &self.pos_sum,
            &self.neg_sum,
            |x| x,
            lower,
            upper,
            self.partial_count,
        )?;
        let sum_of_squares: f64 = self.approx_bounds.compute_from_partials(
            &self.pos_sum_of_squares,
            &self.neg_sum_of_squares,
            |x: T| x.to_f64() * x.to_f64(),
            lower,
            upper,
            self.partial_count,
        )?;

        let lower_f = lower.to_f64();
        let upper_f = upper.to_f64();
        let midpoint = lower_f + (upper_f - lower_f) / 2.0;
        let midpoint_of_squares = BoundedVariance::<T>::midpoint_of_squares(lower_f, upper_f);

        let mut sum_mechanism = BoundedVariance::<T>::build_sum_mechanism(
            &self.mechanism_builder,
            self.epsilon_for_sum,
            self.l0_sensitivity,
            self.max_contributions_per_partition,
            lower,
            upper,
        )?;
        let mut sum_of_squares_mechanism = BoundedVariance::<T>::build_sum_of_squares_mechanism(
            &self.mechanism_builder,
            self.epsilon_for_squares,
            self.l0_sensitivity,
            self.max_contributions_per_partition,
            lower,
            upper,
        )?;

        let noised_count = self.count_mechanism.add_noise(self.partial_count as f64);
        let noised_normalized_sum =
            sum_mechanism.add_noise(sum.to_f64() - self.partial_count as f64 * midpoint);
        let noised_normalized_sum_of_squares = sum_of_squares_mechanism
            .add_noise(sum_of_squares - self.partial_count as f64 * midpoint_of_squares);

        let mut output = Output::single(OutputValue::Float(variance_from_noised(
            noised_count,
            noised_normalized_sum,
            noised_normalized_sum_of_squares,
            midpoint,
            midpoint_of_squares,
            BoundedVariance::<T>::interval_length_squared(lower_f, upper_f),
        )));
        output.set_bounding_report(self.approx_bounds.bounding_report(lower, upper));
        Ok(output)
    }
}

/// Fluent configuration for [`BoundedVariance`].
#[derive(Clone, Debug)]
pub struct BoundedVarianceBuilder<T: Aggregand> {
    epsilon: Option<f64>,
    delta: f64,
    lower: Option<T>,
    upper: Option<T>,
    max_partitions_contributed: i64,
    max_contributions_per_partition: i64,
    mechanism_builder: MechanismBuilder,
    approx_bounds: Option<ApproxBounds<T>>,
}

impl<T: Aggregand> Default for BoundedVarianceBuilder<T> {
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

impl<T: Aggregand> BoundedVarianceBuilder<T> {
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
    pub fn build(&mut self) -> Result<BoundedVariance<T>> {
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
                BoundedVariance::<T>::check_bounds(lower, upper)?;
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
                let count_mechanism = BoundedVariance::<T>::build_count_mechanism(
                    &self.mechanism_builder,
                    epsilon / 3.0,
                    self.max_partitions_contributed,
                    self.max_contributions_per_partition,
                )?;
                let sum_mechanism = BoundedVariance::<T>::build_sum_mechanism(
                    &self.mechanism_builder,
                    epsilon / 3.0,
                    self.max_partitions_contributed,
                    self.max_contributions_per_partition,
                    lower,
                    upper,
                )?;
                let sum_of_squares_mechanism =
                    BoundedVariance::<T>::build_sum_of_squares_mechanism(
                        &self.mechanism_builder,
                        epsilon / 3.0,
                        self.max_partitions_contributed,
                        self.max_contributions_per_partition,
                        lower,
                        upper,
                    )?;
                Ok(BoundedVariance::Fixed(BoundedVarianceWithFixedBounds {
                    epsilon,
                    delta,
                    lower,
                    upper,
                    count_mechanism,
                    sum_mechanism,
                    sum_of_squares_mechanism,
                    partial_count: 0,
                    partial_sum: T::zero(),
                    partial_sum_of_squares: 0.0,
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
                let epsilon_for_count = remaining / 3.0;
                let epsilon_for_sum = remaining / 3.0;
                let epsilon_for_squares = remaining - epsilon_for_count - epsilon_for_sum;

                let count_mechanism = BoundedVariance::<T>::build_count_mechanism(
                    &self.mechanism_builder,
                    epsilon_for_count,
                    self.max_partitions_contributed,
                    self.max_contributions_per_partition,
                )?;
                let num_bins = approx_bounds.num_positive_bins();
                Ok(BoundedVariance::Approx(BoundedVarianceWithApproxBounds {
                    epsilon,
                    delta,
                    epsilon_for_sum,
                    epsilon_for_squares,
                    l0_sensitivity: self.max_partitions_contributed,
                    max_contributions_per_partition: self.max_contributions_per_partition,
                    mechanism_builder: self.mechanism_builder.clone(),
                    count_mechanism,
                    approx_bounds,
                    partial_count: 0,
                    pos_sum: vec![T::zero(); num_bins],
                    neg_sum: vec![T::zero(); num_bins],
                    pos_sum_of_squares: vec![0.0; num_bins],
                    neg_sum_of_squares: vec![0.0; num_bins],
                    state: AlgorithmState::default(),
                }))
            }
            _ => Err(DpAggError::invalid_argument(
                "Lower and upper bounds must either both be set or both be unset.",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn population_variance(values: &[f64]) -> f64 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64
    }

    #[test]
    fn fixed_variance_is_near_true_variance_with_large_epsilon() {
        let values = [1.0, 3.0, 5.0, 7.0, 9.0];
        let mut variance = BoundedVariance::<f64>::builder()
            .with_epsilon(1e7)
            .with_lower(0.0)
            .with_upper(10.0)
            .with_seed(5)
            .build()
            .unwrap();
        variance.add_entries(values);
        let output = variance.partial_result().unwrap();
        let expected = population_variance(&values);
        assert!(
            (output.elements[0].value.as_f64() - expected).abs() < 0.05,
            "got {} want {expected}",
            output.elements[0].value.as_f64()
        );
    }

    #[test]
    fn variance_result_is_clamped_to_valid_range() {
        let mut variance = BoundedVariance::<f64>::builder()
            .with_epsilon(0.1)
            .with_lower(-5.0)
            .with_upper(5.0)
            .with_seed(77)
            .build()
            .unwrap();
        variance.add_entries([1.0, 1.0]);
        let output = variance.partial_result().unwrap();
        let value = output.elements[0].value.as_f64();
        // Clamp range is [0, (upper - lower)^2 / 4] = [0, 25].
        assert!((0.0..=25.0).contains(&value));
    }

    #[test]
    fn empty_variance_returns_a_valid_value() {
        let mut variance = BoundedVariance::<f64>::builder()
            .with_epsilon(1.0)
            .with_lower(0.0)
            .with_upper(4.0)
            .with_seed(13)
            .build()
            .unwrap();
        let output = variance.partial_result().unwrap();
        let value = output.elements[0].value.as_f64();
        assert!((0.0..=4.0).contains(&value));
    }

    #[test]
    fn nan_entries_leave_accumulators_unchanged() {
        let mut variance = BoundedVariance::<f64>::builder()
            .with_epsilon(1.0)
            .with_lower(0.0)
            .with_upper(10.0)
            .build()
            .unwrap();
        variance.add_entry(f64::NAN);
        variance.add_multiple_entries(3.0, 0);
        let BoundedVariance::Fixed(fixed) = &variance else {
            panic!("expected fixed variant")
        };
        assert_eq!(fixed.partial_count, 0);
        assert_eq!(fixed.partial_sum, 0.0);
        assert_eq!(fixed.partial_sum_of_squares, 0.0);
    }

    #[test]
    fn integer_bounds_that_overflow_squaring_are_rejected() {
        let err = BoundedVariance::<i64>::builder()
            .with_epsilon(1.0)
            .with_lower(0)
            .with_upper(i64::MAX)
            .build()
            .unwrap_err();
        assert!(err.message().contains("overflow"));

        // sqrt(i32::MAX) is about 46341; a narrow range beyond it passes the
        // difference checks but fails the bound-magnitude check.
        let err = BoundedVariance::<i32>::builder()
            .with_epsilon(1.0)
            .with_lower(46_350)
            .with_upper(46_400)
            .build()
            .unwrap_err();
        assert!(err
            .message()
            .starts_with("Squaring the bounds caused overflow"));
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let err = BoundedVariance::<f64>::builder()
            .with_epsilon(1.0)
            .with_lower(2.0)
            .with_upper(1.0)
            .build()
            .unwrap_err();
        assert!(err
            .message()
            .starts_with("Lower cannot be greater than upper"));
    }

    #[test]
    fn midpoint_of_squares_handles_both_cases() {
        assert_eq!(BoundedVariance::<f64>::midpoint_of_squares(-3.0, 2.0), 4.5);
        assert_eq!(BoundedVariance::<f64>::midpoint_of_squares(1.0, 3.0), 5.0);
        assert_eq!(BoundedVariance::<f64>::midpoint_of_squares(-3.0, -1.0), 5.0);
    }

    #[test]
    fn approx_variance_budget_splits_bounds_then_thirds() {
        let variance = BoundedVariance::<f64>::builder()
            .with_epsilon(3.0)
            .build()
            .unwrap();
        assert_eq!(variance.bounding_epsilon(), 1.5);
        assert!((variance.aggregation_epsilon() - 1.5).abs() < 1e-12);
        let BoundedVariance::Approx(approx) = &variance else {
            panic!("expected approx variant")
        };
        assert!((approx.epsilon_for_sum - 0.5).abs() < 1e-12);
        assert!((approx.epsilon_for_squares - 0.5).abs() < 1e-12);
    }

    #[test]
    fn approx_variance_recovers_true_variance_with_large_epsilon() {
        let mut variance = BoundedVariance::<f64>::builder()
            .with_epsilon(4e7)
            .with_seed(23)
            .build()
            .unwrap();
        let mut values = Vec::new();
        for _ in 0..100 {
            values.extend([1.5, 2.5, 3.5]);
        }
        variance.add_entries(values.iter().copied());
        let output = variance.partial_result().unwrap();
        let expected = population_variance(&values);
        assert!(
            (output.elements[0].value.as_f64() - expected).abs() < 0.05,
            "got {} want {expected}",
            output.elements[0].value.as_f64()
        );
        let report = output
            .error_report
            .as_ref()
            .unwrap()
            .bounding_report
            .unwrap();
        assert_eq!(report.num_inputs, 300);
        assert_eq!(report.num_outside_inputs, 0);
    }

    #[test]
    fn fixed_serialize_merge_round_trip() {
        let mut a = BoundedVariance::<f64>::builder()
            .with_epsilon(1e7)
            .with_lower(0.0)
            .with_upper(10.0)
            .with_seed(1)
            .build()
            .unwrap();
        a.add_entries([1.0, 3.0]);
        let mut b = BoundedVariance::<f64>::builder()
            .with_epsilon(1e7)
            .with_lower(0.0)
            .with_upper(10.0)
            .with_seed(2)
            .build()
            .unwrap();
        b.add_entries([5.0, 7.0, 9.0]);
        b.merge(&a.serialize()).unwrap();
        let output = b.partial_result().unwrap();
        let expected = population_variance(&[1.0, 3.0, 5.0, 7.0, 9.0]);
        assert!((output.elements[0].value.as_f64() - expected).abs() < 0.05);
    }

    #[test]
    fn merge_rejects_variant_and_shape_mismatches() {
        let approx = BoundedVariance::<f64>::builder()
            .with_epsilon(1.0)
            .build()
            .unwrap();
        let mut fixed = BoundedVariance::<f64>::builder()
            .with_epsilon(1.0)
            .with_lower(0.0)
            .with_upper(1.0)
            .build()
            .unwrap();
        let err = fixed.merge(&approx.serialize()).unwrap_err();
        assert!(err.is_internal());
        assert!(err.message().contains("same bounding strategy"));
    }

    #[test]
    fn result_is_once_only_until_reset() {
        let mut variance = BoundedVariance::<f64>::builder()
            .with_epsilon(1.0)
            .with_lower(0.0)
            .with_upper(1.0)
            .build()
            .unwrap();
        variance.add_entry(0.5);
        assert!(variance.partial_result().is_ok());
        let err = variance.partial_result().unwrap_err();
        assert!(err.message().contains("can only produce results once"));
        variance.reset();
        assert!(variance.partial_result().is_ok());
    }
}

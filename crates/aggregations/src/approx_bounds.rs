//! Private inference of clamp bounds from unbounded input.
//!
//! Contributions are recorded in a logarithmic histogram with one set of bins
//! per sign. At finalize every bin count is noised and the outermost bins
//! whose noisy counts clear a success-probability threshold become the clamp
//! range. Per-bin partial sums let the bounded aggregators reconstruct a
//! clamped sum in the same single pass.

use serde::{Deserialize, Serialize};

use dpagg_core::validate::{
    validate_delta, validate_epsilon, validate_is_finite_and_positive,
    validate_is_in_exclusive_interval, validate_max_contributions_per_partition,
    validate_max_partitions_contributed,
};
use dpagg_core::{
    default_epsilon, safe_subtract, Aggregand, Algorithm, AlgorithmState, BoundingReport,
    DpAggError, Mechanism, MechanismBuilder, Output, Result, Summary,
};

const DEFAULT_BASE: f64 = 2.0;
const DEFAULT_SCALE: f64 = 1.0;
// Probability that the inferred range covers the data, absent a caller choice.
const DEFAULT_SUCCESS_PROBABILITY: f64 = 1.0 - 1e-9;

/// Serialized histogram state, nested inside dependent aggregator summaries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproxBoundsSummary {
    /// Raw per-bin counts for non-negative entries.
    pub pos_bin_count: Vec<i64>,
    /// Raw per-bin counts for negative entries.
    pub neg_bin_count: Vec<i64>,
}

/// DP approximate-bounds aggregator over a logarithmic histogram.
#[derive(Clone, Debug)]
pub struct ApproxBounds<T: Aggregand> {
    epsilon: f64,
    delta: f64,
    scale: f64,
    base: f64,
    num_bins: usize,
    success_probability: f64,
    mechanism: Mechanism,
    pos_bin_count: Vec<i64>,
    neg_bin_count: Vec<i64>,
    state: AlgorithmState,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Aggregand> ApproxBounds<T> {
    /// Builder with type-appropriate histogram defaults.
    pub fn builder() -> ApproxBoundsBuilder<T> {
        ApproxBoundsBuilder::default()
    }

    /// Number of bins per sign.
    pub fn num_positive_bins(&self) -> usize {
        self.num_bins
    }

    fn right_boundary_f64(&self, index: usize) -> f64 {
        self.scale * self.base.powi(index as i32)
    }

    fn left_boundary_f64(&self, index: usize) -> f64 {
        if index == 0 {
            0.0
        } else {
            self.right_boundary_f64(index - 1)
        }
    }

    /// Index of the bin containing a magnitude.
    fn bin_index(&self, magnitude: f64) -> usize {
        if !(magnitude >= self.scale) {
            return 0;
        }
        let approx = (magnitude / self.scale).log(self.base).floor() as i64 + 1;
        let mut index = approx.clamp(0, self.num_bins as i64 - 1) as usize;
        // Logarithm rounding can land one bin off near a boundary.
        while index > 0 && magnitude < self.left_boundary_f64(index) {
            index -= 1;
        }
        while index + 1 < self.num_bins && magnitude >= self.right_boundary_f64(index) {
            index += 1;
        }
        index
    }

    /// Smallest bin whose right boundary covers a magnitude.
    fn covering_bin(&self, magnitude: f64) -> usize {
        for i in 0..self.num_bins {
            if self.right_boundary_f64(i) >= magnitude {
                return i;
            }
        }
        self.num_bins - 1
    }

    /// Bin whose left boundary equals a magnitude (0 maps to bin 0).
    fn bin_with_left_boundary(&self, magnitude: f64) -> usize {
        for i in 0..self.num_bins {
            if self.right_boundary_f64(i) > magnitude {
                return i;
            }
        }
        self.num_bins - 1
    }

    /// Accumulate `num_of_entries` occurrences of `entry`.
    ///
    /// NaN entries and non-positive counts are silently dropped.
    pub fn add_multiple_entries(&mut self, entry: T, num_of_entries: i64) {
        if entry.is_nan_value() || num_of_entries <= 0 {
            return;
        }
        let bin = self.bin_index(entry.to_f64().abs());
        if entry >= T::zero() {
            self.pos_bin_count[bin] = self.pos_bin_count[bin].saturating_add(num_of_entries);
        } else {
            self.neg_bin_count[bin] = self.neg_bin_count[bin].saturating_add(num_of_entries);
        }
    }

    /// Record a value into per-bin partials with a caller-chosen combiner.
    ///
    /// For a value in bin `m`, every bin `i <= m` receives
    /// `combine(min(value, right(i)), left(i))` (mirrored for negatives), so
    /// a prefix sum over bins telescopes to `transform(clamp(value, ..))`
    /// whenever `combine(a, b) = transform(a) - transform(b)`.
    pub fn add_to_partials<P, F>(
        &self,
        partials: &mut [P],
        value: T,
        num_of_entries: i64,
        combine: F,
    ) where
        P: Aggregand,
        F: Fn(T, T) -> P,
    {
        if value.is_nan_value() || num_of_entries <= 0 {
            return;
        }
        let msb = self.bin_index(value.to_f64().abs());
        for i in 0..=msb {
            let partial = if value >= T::zero() {
                let right = T::from_f64_saturating(self.right_boundary_f64(i));
                let capped = if value < right { value } else { right };
                combine(capped, T::from_f64_saturating(self.left_boundary_f64(i)))
            } else {
                let right = T::from_f64_saturating(-self.right_boundary_f64(i));
                let capped = if value > right { value } else { right };
                combine(capped, T::from_f64_saturating(-self.left_boundary_f64(i)))
            };
            partials[i] = partials[i].saturating_add_value(partial.saturating_mul_count(num_of_entries));
        }
    }

    /// Record a value into per-bin partial sums.
    pub fn add_to_partial_sums(&self, sums: &mut [T], value: T, num_of_entries: i64) {
        self.add_to_partials(sums, value, num_of_entries, |a, b| safe_subtract(a, b).value);
    }

    /// Reconstruct `sum of transform(clamp(x, lower, upper))` over every
    /// recorded value from per-bin partials.
    ///
    /// `lower` and `upper` must be histogram bin boundaries, which holds for
    /// every range this aggregator emits. When the range excludes zero, the
    /// partials cannot see the wholly-clamped values, so their contribution is
    /// recovered as `count * transform(nearest bound)`.
    pub fn compute_from_partials<P, F>(
        &self,
        pos_partials: &[P],
        neg_partials: &[P],
        transform: F,
        lower: T,
        upper: T,
        count: i64,
    ) -> Result<P>
    where
        P: Aggregand,
        F: Fn(T) -> P,
    {
        if lower > upper {
            return Err(DpAggError::invalid_argument(
                "Lower bound cannot be greater than upper bound.",
            ));
        }
        if pos_partials.len() != self.num_bins || neg_partials.len() != self.num_bins {
            return Err(DpAggError::internal(
                "Partial values must have the same number of bins as this ApproxBounds.",
            ));
        }

        let lower_f = lower.to_f64();
        let upper_f = upper.to_f64();
        let mut value = P::zero();

        if lower_f < 0.0 && upper_f > 0.0 {
            let top_pos = self.covering_bin(upper_f);
            let top_neg = self.covering_bin(-lower_f);
            for partial in &pos_partials[..=top_pos] {
                value = value.saturating_add_value(*partial);
            }
            for partial in &neg_partials[..=top_neg] {
                value = value.saturating_add_value(*partial);
            }
        } else if lower_f >= 0.0 {
            // The range excludes negatives; everything below `lower` clamps
            // to it, contributing `count * transform(lower)` in total.
            let top = self.covering_bin(upper_f);
            let bottom = self.bin_with_left_boundary(lower_f);
            for partial in &pos_partials[bottom..=top] {
                value = value.saturating_add_value(*partial);
            }
            value = value.saturating_add_value(transform(lower).saturating_mul_count(count));
        } else {
            let top = self.covering_bin(-lower_f);
            let bottom = self.bin_with_left_boundary(-upper_f);
            for partial in &neg_partials[bottom..=top] {
                value = value.saturating_add_value(*partial);
            }
            value = value.saturating_add_value(transform(upper).saturating_mul_count(count));
        }
        Ok(value)
    }

    fn bin_threshold(&self) -> Result<f64> {
        let per_bin_success = self
            .success_probability
            .powf(1.0 / (2.0 * self.num_bins as f64));
        self.mechanism.quantile(per_bin_success)
    }

    /// Noise the histogram and choose the clamp range. Transitions the
    /// aggregator into the finalized state.
    pub(crate) fn finalize_bounds(&mut self) -> Result<(T, T)> {
        self.state.begin_result()?;
        let threshold = self.bin_threshold()?;

        let mut noised_pos = Vec::with_capacity(self.num_bins);
        let mut noised_neg = Vec::with_capacity(self.num_bins);
        for i in 0..self.num_bins {
            let count = self.pos_bin_count[i] as f64;
            noised_pos.push(self.mechanism.add_noise(count));
        }
        for i in 0..self.num_bins {
            let count = self.neg_bin_count[i] as f64;
            noised_neg.push(self.mechanism.add_noise(count));
        }

        let top_pos = noised_pos.iter().rposition(|&c| c >= threshold);
        let top_neg = noised_neg.iter().rposition(|&c| c >= threshold);
        let low_pos = noised_pos.iter().position(|&c| c >= threshold);
        let low_neg = noised_neg.iter().position(|&c| c >= threshold);

        let upper = match (top_pos, low_neg) {
            (Some(i), _) => T::from_f64_saturating(self.right_boundary_f64(i)),
            (None, Some(j)) => T::from_f64_saturating(-self.left_boundary_f64(j)),
            (None, None) => {
                return Err(DpAggError::failed_precondition(
                    "Bin count threshold was too large to find approximate bounds. Either run \
                     over a larger dataset or decrease success_probability and try again.",
                ))
            }
        };
        let lower = match (top_neg, low_pos) {
            (Some(i), _) => T::from_f64_saturating(-self.right_boundary_f64(i)),
            (None, Some(j)) => T::from_f64_saturating(self.left_boundary_f64(j)),
            (None, None) => {
                return Err(DpAggError::failed_precondition(
                    "Bin count threshold was too large to find approximate bounds. Either run \
                     over a larger dataset or decrease success_probability and try again.",
                ))
            }
        };
        Ok((lower, upper))
    }

    /// Audit record for a chosen clamp range.
    pub fn bounding_report(&self, lower: T, upper: T) -> BoundingReport {
        let num_inputs: i64 = self
            .pos_bin_count
            .iter()
            .chain(self.neg_bin_count.iter())
            .sum();
        BoundingReport {
            lower: lower.to_f64(),
            upper: upper.to_f64(),
            num_inputs,
            num_outside_inputs: self.num_inputs_outside(lower, upper),
        }
    }

    fn num_inputs_outside(&self, lower: T, upper: T) -> i64 {
        let lower_f = lower.to_f64();
        let upper_f = upper.to_f64();
        let mut outside: i64 = 0;

        if upper_f > 0.0 {
            let top = self.covering_bin(upper_f);
            outside += self.pos_bin_count[top + 1..].iter().sum::<i64>();
            if lower_f > 0.0 {
                let bottom = self.bin_with_left_boundary(lower_f);
                outside += self.pos_bin_count[..bottom].iter().sum::<i64>();
            }
        } else if upper_f == 0.0 {
            outside += self.pos_bin_count[1..].iter().sum::<i64>();
        } else {
            outside += self.pos_bin_count.iter().sum::<i64>();
            let bottom = self.bin_with_left_boundary(-upper_f);
            outside += self.neg_bin_count[..bottom].iter().sum::<i64>();
        }

        if lower_f < 0.0 {
            let top = self.covering_bin(-lower_f);
            outside += self.neg_bin_count[top + 1..].iter().sum::<i64>();
        } else {
            outside += self.neg_bin_count.iter().sum::<i64>();
        }
        outside
    }

    pub(crate) fn summary_data(&self) -> ApproxBoundsSummary {
        ApproxBoundsSummary {
            pos_bin_count: self.pos_bin_count.clone(),
            neg_bin_count: self.neg_bin_count.clone(),
        }
    }

    pub(crate) fn merge_summary_data(&mut self, data: &ApproxBoundsSummary) -> Result<()> {
        if data.pos_bin_count.len() != self.num_bins || data.neg_bin_count.len() != self.num_bins {
            return Err(DpAggError::internal(
                "Merged ApproxBounds must have the same amount of bin counts as this \
                 ApproxBounds.",
            ));
        }
        for (bin, count) in self.pos_bin_count.iter_mut().zip(&data.pos_bin_count) {
            *bin = bin.saturating_add(*count);
        }
        for (bin, count) in self.neg_bin_count.iter_mut().zip(&data.neg_bin_count) {
            *bin = bin.saturating_add(*count);
        }
        Ok(())
    }
}

impl<T: Aggregand> Algorithm<T> for ApproxBounds<T> {
    fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn delta(&self) -> f64 {
        self.delta
    }

    fn add_entry(&mut self, entry: T) {
        self.add_multiple_entries(entry, 1);
    }

    fn partial_result_with_confidence(&mut self, _confidence_level: f64) -> Result<Output> {
        let (lower, upper) = self.finalize_bounds()?;
        Ok(Output {
            elements: vec![
                dpagg_core::Element {
                    value: lower.to_output_value(),
                    noise_confidence_interval: None,
                },
                dpagg_core::Element {
                    value: upper.to_output_value(),
                    noise_confidence_interval: None,
                },
            ],
            error_report: None,
        })
    }

    fn reset(&mut self) {
        self.pos_bin_count.fill(0);
        self.neg_bin_count.fill(0);
        self.state.reset();
    }

    fn serialize(&self) -> Summary {
        Summary::encode(&self.summary_data())
    }

    fn merge(&mut self, summary: &Summary) -> Result<()> {
        let data: ApproxBoundsSummary = summary.decode()?;
        self.merge_summary_data(&data)
    }

    fn memory_used(&self) -> usize {
        std::mem::size_of::<Self>()
            + std::mem::size_of::<i64>()
                * (self.pos_bin_count.capacity() + self.neg_bin_count.capacity())
    }
}

/// Fluent configuration for [`ApproxBounds`].
#[derive(Clone, Debug)]
pub struct ApproxBoundsBuilder<T: Aggregand> {
    epsilon: Option<f64>,
    delta: f64,
    max_partitions_contributed: i64,
    max_contributions_per_partition: i64,
    num_bins: Option<usize>,
    scale: Option<f64>,
    base: Option<f64>,
    success_probability: f64,
    mechanism_builder: MechanismBuilder,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Aggregand> Default for ApproxBoundsBuilder<T> {
    fn default() -> Self {
        Self {
            epsilon: None,
            delta: 0.0,
            max_partitions_contributed: 1,
            max_contributions_per_partition: 1,
            num_bins: None,
            scale: None,
            base: None,
            success_probability: DEFAULT_SUCCESS_PROBABILITY,
            mechanism_builder: MechanismBuilder::laplace(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Aggregand> ApproxBoundsBuilder<T> {
    /// Set the epsilon consumed by bound inference.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Set delta, forwarded to the per-bin noise mechanism.
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

    /// Override the number of bins per sign.
    pub fn with_num_bins(mut self, num_bins: usize) -> Self {
        self.num_bins = Some(num_bins);
        self
    }

    /// Override the width of bin zero.
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Override the histogram growth base.
    pub fn with_base(mut self, base: f64) -> Self {
        self.base = Some(base);
        self
    }

    /// Set the probability that the inferred range covers the data.
    pub fn with_success_probability(mut self, success_probability: f64) -> Self {
        self.success_probability = success_probability;
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

    fn default_num_bins() -> usize {
        // Enough bins that the top boundary reaches the type's maximum.
        T::max_value().to_f64().log2().ceil() as usize + 1
    }

    /// Validate the configuration and construct the aggregator.
    pub fn build(&self) -> Result<ApproxBounds<T>> {
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

        let scale = validate_is_finite_and_positive(Some(self.scale.unwrap_or(DEFAULT_SCALE)), "Scale")?;
        let base = self.base.unwrap_or(DEFAULT_BASE);
        if !base.is_finite() || base <= 1.0 {
            return Err(DpAggError::invalid_argument(format!(
                "Base must be finite and greater than 1, but is {base}."
            )));
        }
        let num_bins = self.num_bins.unwrap_or_else(Self::default_num_bins);
        if num_bins == 0 {
            return Err(DpAggError::invalid_argument(
                "Number of bins must be positive, but is 0.",
            ));
        }
        validate_is_in_exclusive_interval(
            Some(self.success_probability),
            0.0,
            1.0,
            "Success probability",
        )?;

        let mechanism = self
            .mechanism_builder
            .clone()
            .with_epsilon(epsilon)
            .with_delta(delta)
            .with_l0_sensitivity(self.max_partitions_contributed as f64)
            .with_linf_sensitivity(self.max_contributions_per_partition as f64)
            .build()?;

        Ok(ApproxBounds {
            epsilon,
            delta,
            scale,
            base,
            num_bins,
            success_probability: self.success_probability,
            mechanism,
            pos_bin_count: vec![0; num_bins],
            neg_bin_count: vec![0; num_bins],
            state: AlgorithmState::default(),
            _marker: std::marker::PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpagg_core::OutputValue;

    fn bounds_f64(epsilon: f64, seed: u64) -> ApproxBounds<f64> {
        ApproxBounds::<f64>::builder()
            .with_epsilon(epsilon)
            .with_seed(seed)
            .build()
            .unwrap()
    }

    #[test]
    fn default_bin_counts_cover_the_type() {
        let int_bounds = ApproxBounds::<i64>::builder()
            .with_epsilon(1.0)
            .build()
            .unwrap();
        assert_eq!(int_bounds.num_positive_bins(), 64);

        let float_bounds = ApproxBounds::<f64>::builder()
            .with_epsilon(1.0)
            .build()
            .unwrap();
        assert_eq!(float_bounds.num_positive_bins(), 1025);

        let int32_bounds = ApproxBounds::<i32>::builder()
            .with_epsilon(1.0)
            .build()
            .unwrap();
        assert_eq!(int32_bounds.num_positive_bins(), 32);
    }

    #[test]
    fn bin_index_respects_boundaries() {
        let bounds = bounds_f64(1.0, 0);
        assert_eq!(bounds.bin_index(0.0), 0);
        assert_eq!(bounds.bin_index(0.5), 0);
        assert_eq!(bounds.bin_index(1.0), 1);
        assert_eq!(bounds.bin_index(1.9), 1);
        assert_eq!(bounds.bin_index(2.0), 2);
        assert_eq!(bounds.bin_index(3.0), 2);
        assert_eq!(bounds.bin_index(4.0), 3);
        assert_eq!(bounds.bin_index(7.9), 3);
    }

    #[test]
    fn infers_tight_bounds_with_generous_budget() {
        // With a huge epsilon the per-bin noise is negligible, so the chosen
        // range is the histogram range of the data.
        let mut bounds = bounds_f64(1e3, 7);
        for _ in 0..100 {
            bounds.add_entry(1.5);
            bounds.add_entry(3.0);
        }
        let (lower, upper) = bounds.finalize_bounds().unwrap();
        assert_eq!(lower, 1.0);
        assert_eq!(upper, 4.0);
    }

    #[test]
    fn negative_entries_mirror_positive_bounds() {
        let mut bounds = bounds_f64(1e3, 11);
        for _ in 0..100 {
            bounds.add_entry(-1.5);
            bounds.add_entry(-3.0);
        }
        let (lower, upper) = bounds.finalize_bounds().unwrap();
        assert_eq!(lower, -4.0);
        assert_eq!(upper, -1.0);
    }

    #[test]
    fn mixed_sign_entries_span_zero() {
        let mut bounds = bounds_f64(1e3, 13);
        for _ in 0..100 {
            bounds.add_entry(-5.0);
            bounds.add_entry(9.0);
        }
        let (lower, upper) = bounds.finalize_bounds().unwrap();
        assert_eq!(lower, -8.0);
        assert_eq!(upper, 16.0);
    }

    #[test]
    fn empty_histogram_cannot_produce_bounds() {
        let mut bounds = bounds_f64(1.0, 3);
        let err = bounds.finalize_bounds().unwrap_err();
        assert!(err
            .message()
            .starts_with("Bin count threshold was too large"));
    }

    #[test]
    fn partial_result_emits_lower_then_upper() {
        let mut bounds = bounds_f64(1e3, 19);
        for _ in 0..100 {
            bounds.add_entry(2.5);
        }
        let output = bounds.partial_result().unwrap();
        assert_eq!(output.elements.len(), 2);
        assert_eq!(output.elements[0].value, OutputValue::Float(2.0));
        assert_eq!(output.elements[1].value, OutputValue::Float(4.0));
    }

    #[test]
    fn second_partial_result_requires_reset() {
        let mut bounds = bounds_f64(1e3, 23);
        for _ in 0..100 {
            bounds.add_entry(2.5);
        }
        bounds.partial_result().unwrap();
        let err = bounds.partial_result().unwrap_err();
        assert!(err.message().contains("can only produce results once"));
        bounds.reset();
        for _ in 0..100 {
            bounds.add_entry(2.5);
        }
        assert!(bounds.partial_result().is_ok());
    }

    #[test]
    fn nan_and_nonpositive_counts_are_dropped() {
        let mut bounds = bounds_f64(1.0, 0);
        bounds.add_entry(f64::NAN);
        bounds.add_multiple_entries(5.0, 0);
        bounds.add_multiple_entries(5.0, -2);
        assert_eq!(bounds.summary_data().pos_bin_count.iter().sum::<i64>(), 0);
    }

    #[test]
    fn partial_sums_reconstruct_clamped_identity_sum() {
        let bounds = bounds_f64(1.0, 0);
        let bins = bounds.num_positive_bins();
        let mut pos = vec![0.0f64; bins];
        let mut neg = vec![0.0f64; bins];
        for value in [1.0, 2.0, 3.0, 100.0, -2.0] {
            if value >= 0.0 {
                bounds.add_to_partial_sums(&mut pos, value, 1);
            } else {
                bounds.add_to_partial_sums(&mut neg, value, 1);
            }
        }
        // Clamp range [-4, 4]: 1 + 2 + 3 + 4 - 2 = 8.
        let total = bounds
            .compute_from_partials(&pos, &neg, |x| x, -4.0, 4.0, 0)
            .unwrap();
        assert_eq!(total, 8.0);
    }

    #[test]
    fn partials_recover_positive_only_range_with_count_term() {
        let bounds = bounds_f64(1.0, 0);
        let bins = bounds.num_positive_bins();
        let mut pos = vec![0.0f64; bins];
        let mut neg = vec![0.0f64; bins];
        for value in [0.5, 2.0, 8.0] {
            bounds.add_to_partial_sums(&mut pos, value, 1);
        }
        // Clamp range [1, 4]: 1 + 2 + 4 = 7.
        let total = bounds
            .compute_from_partials(&pos, &neg, |x| x, 1.0, 4.0, 3)
            .unwrap();
        assert_eq!(total, 7.0);
    }

    #[test]
    fn squared_partials_use_difference_of_squares() {
        let bounds = bounds_f64(1.0, 0);
        let bins = bounds.num_positive_bins();
        let mut pos = vec![0.0f64; bins];
        let mut neg = vec![0.0f64; bins];
        let diff_of_squares = |a: f64, b: f64| (a + b) * (a - b);
        for value in [1.5, -3.0, 10.0] {
            if value >= 0.0 {
                bounds.add_to_partials(&mut pos, value, 1, diff_of_squares);
            } else {
                bounds.add_to_partials(&mut neg, value, 1, diff_of_squares);
            }
        }
        // Clamp range [-4, 4]: 1.5^2 + 3^2 + 4^2 = 27.25.
        let total = bounds
            .compute_from_partials(&pos, &neg, |x| x * x, -4.0, 4.0, 0)
            .unwrap();
        assert!((total - 27.25).abs() < 1e-9);
    }

    #[test]
    fn bounding_report_counts_outside_inputs() {
        let mut bounds = bounds_f64(1.0, 0);
        for value in [0.5, 2.0, 8.0, -3.0] {
            bounds.add_entry(value);
        }
        let report = bounds.bounding_report(1.0, 4.0);
        assert_eq!(report.num_inputs, 4);
        // 0.5 (below), 8.0 (above), and -3.0 (negative) fall outside [1, 4].
        assert_eq!(report.num_outside_inputs, 3);
        assert_eq!(report.lower, 1.0);
        assert_eq!(report.upper, 4.0);
    }

    #[test]
    fn serialize_merge_round_trip_preserves_counts() {
        let mut a = bounds_f64(1.0, 0);
        for value in [1.0, 2.0, -7.0] {
            a.add_entry(value);
        }
        let mut b = bounds_f64(1.0, 1);
        b.merge(&a.serialize()).unwrap();
        assert_eq!(a.summary_data(), b.summary_data());
    }

    #[test]
    fn merge_rejects_bin_count_mismatch() {
        let a = ApproxBounds::<f64>::builder()
            .with_epsilon(1.0)
            .with_num_bins(8)
            .build()
            .unwrap();
        let mut b = ApproxBounds::<f64>::builder()
            .with_epsilon(1.0)
            .with_num_bins(16)
            .build()
            .unwrap();
        let err = b.merge(&a.serialize()).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn builder_rejects_invalid_parameters() {
        assert!(ApproxBounds::<f64>::builder()
            .with_epsilon(0.0)
            .build()
            .is_err());
        assert!(ApproxBounds::<f64>::builder()
            .with_epsilon(1.0)
            .with_base(1.0)
            .build()
            .is_err());
        assert!(ApproxBounds::<f64>::builder()
            .with_epsilon(1.0)
            .with_success_probability(1.0)
            .build()
            .is_err());
        assert!(ApproxBounds::<f64>::builder()
            .with_epsilon(1.0)
            .with_max_partitions_contributed(0)
            .build()
            .is_err());
    }

    #[test]
    fn reset_clears_histogram() {
        let mut bounds = bounds_f64(1e3, 29);
        for _ in 0..50 {
            bounds.add_entry(2.0);
        }
        bounds.reset();
        assert_eq!(bounds.summary_data().pos_bin_count.iter().sum::<i64>(), 0);
    }
}

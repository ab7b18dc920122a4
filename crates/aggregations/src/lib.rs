//! Differentially private aggregators.
//!
//! Each aggregator follows the lifecycle contract of
//! [`dpagg_core::Algorithm`]: build, add entries, optionally serialize and
//! merge partial state, finalize exactly once, reset. Bounded aggregators
//! come in a fixed-bounds variant and an approx-bounds variant that spends
//! part of its budget privately inferring the clamp range.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod approx_bounds;
pub mod bounded_mean;
pub mod bounded_sum;
pub mod bounded_variance;
pub mod count;

pub use approx_bounds::{ApproxBounds, ApproxBoundsBuilder, ApproxBoundsSummary};
pub use bounded_mean::{BoundedMean, BoundedMeanBuilder, BoundedMeanSummary};
pub use bounded_sum::{BoundedSum, BoundedSumBuilder, BoundedSumSummary};
pub use bounded_variance::{BoundedVariance, BoundedVarianceBuilder, BoundedVarianceSummary};
pub use count::{Count, CountBuilder};

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        ApproxBounds, ApproxBoundsBuilder, BoundedMean, BoundedMeanBuilder, BoundedSum,
        BoundedSumBuilder, BoundedVariance, BoundedVarianceBuilder, Count, CountBuilder,
    };
}

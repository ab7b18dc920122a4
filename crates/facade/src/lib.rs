//! Differentially private aggregation.
//!
//! This crate re-exports the full public API: the core primitives
//! (mechanisms, validation, lifecycle, envelopes), the aggregators
//! (approximate bounds, count, bounded sum, mean, and variance), and the
//! partition-selection strategies.
//!
//! # Example
//!
//! ```
//! use dpagg::prelude::*;
//!
//! let mut sum = BoundedSum::<f64>::builder()
//!     .with_epsilon(1.0)
//!     .with_lower(-10.0)
//!     .with_upper(10.0)
//!     .build()
//!     .expect("valid configuration");
//! sum.add_entries([1.0, 2.0, 30.0]);
//! let output = sum.partial_result().expect("first result");
//! assert_eq!(output.elements.len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use dpagg_aggregations::{
    ApproxBounds, ApproxBoundsBuilder, ApproxBoundsSummary, BoundedMean, BoundedMeanBuilder,
    BoundedMeanSummary, BoundedSum, BoundedSumBuilder, BoundedSumSummary, BoundedVariance,
    BoundedVarianceBuilder, BoundedVarianceSummary, Count, CountBuilder,
};
pub use dpagg_core::{
    clamp, default_epsilon, Aggregand, Algorithm, AlgorithmState, BoundingReport,
    ConfidenceInterval, DpAggError, Element, ErrorReport, GaussianMechanism, LaplaceMechanism,
    Mechanism, MechanismBuilder, MechanismKind, Output, OutputValue, Result, SecureRng, Summary,
    DEFAULT_CONFIDENCE_LEVEL,
};
pub use dpagg_partition::{
    calculate_adjusted_delta, calculate_unadjusted_delta, GaussianPartitionSelection,
    GaussianPartitionSelectionBuilder, LaplacePartitionSelection,
    LaplacePartitionSelectionBuilder, NearTruncatedGeometricPartitionSelection,
    NearTruncatedGeometricPartitionSelectionBuilder, PartitionSelectionStrategy,
};

/// Access to the underlying crates for advanced use.
pub mod core {
    pub use dpagg_core::*;
}

/// Common imports for downstream users.
pub mod prelude {
    pub use dpagg_aggregations::prelude::*;
    pub use dpagg_core::prelude::*;
    pub use dpagg_partition::prelude::*;
}

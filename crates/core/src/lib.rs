//! Core primitives for differentially private aggregation.
//!
//! This crate provides the building blocks shared by every aggregator:
//! parameter validation, overflow-aware numerics, calibrated noise
//! mechanisms, the algorithm lifecycle contract, and the output and summary
//! envelopes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod algorithm;
pub mod error;
pub mod mechanisms;
pub mod numeric;
pub mod output;
pub mod rng;
pub mod summary;
pub mod validate;
pub mod value;

pub use algorithm::{Algorithm, AlgorithmState, DEFAULT_CONFIDENCE_LEVEL};
pub use error::{DpAggError, Result};
pub use mechanisms::{
    GaussianMechanism, LaplaceMechanism, Mechanism, MechanismBuilder, MechanismKind,
};
pub use numeric::{
    clamp, default_epsilon, inverse_error_function, next_power_of_two, qnorm,
    round_to_nearest_double_multiple, round_to_nearest_int64_multiple, safe_add,
    safe_cast_from_double, safe_square, safe_subtract, SafeOpResult,
};
pub use output::{
    BoundingReport, ConfidenceInterval, Element, ErrorReport, Output, OutputValue,
};
pub use rng::SecureRng;
pub use summary::Summary;
pub use value::Aggregand;

/// Common imports for downstream users.
pub mod prelude {
    pub use crate::{
        clamp, default_epsilon, Aggregand, Algorithm, AlgorithmState, BoundingReport,
        ConfidenceInterval, DpAggError, Element, ErrorReport, GaussianMechanism,
        LaplaceMechanism, Mechanism, MechanismBuilder, MechanismKind, Output, OutputValue,
        Result, SecureRng, Summary, DEFAULT_CONFIDENCE_LEVEL,
    };
}

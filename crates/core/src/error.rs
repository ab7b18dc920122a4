//! Error types for differentially private aggregation.

/// Errors produced by builders, aggregators, and partition selection.
///
/// The display string of each variant is the raw message; callers test
/// against stable message prefixes (e.g. "Epsilon must be finite and
/// positive").
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DpAggError {
    /// A builder parameter or function argument failed validation.
    #[error("{msg}")]
    InvalidArgument {
        /// Human-readable error description.
        msg: String,
    },

    /// An operation was invoked in a state that does not permit it.
    #[error("{msg}")]
    FailedPrecondition {
        /// Human-readable error description.
        msg: String,
    },

    /// A summary could not be decoded or has an incompatible shape.
    #[error("{msg}")]
    Internal {
        /// Human-readable error description.
        msg: String,
    },
}

/// Result type for DP aggregation operations.
pub type Result<T> = std::result::Result<T, DpAggError>;

impl DpAggError {
    /// Create an invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument { msg: msg.into() }
    }

    /// Create a failed-precondition error.
    pub fn failed_precondition<S: Into<String>>(msg: S) -> Self {
        Self::FailedPrecondition { msg: msg.into() }
    }

    /// Create an internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal { msg: msg.into() }
    }

    /// The raw message carried by this error.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument { msg }
            | Self::FailedPrecondition { msg }
            | Self::Internal { msg } => msg,
        }
    }

    /// Whether this is an invalid-argument error.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    /// Whether this is a failed-precondition error.
    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Self::FailedPrecondition { .. })
    }

    /// Whether this is an internal error.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

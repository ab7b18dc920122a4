//! The lifecycle contract shared by every aggregation algorithm.

use crate::error::{DpAggError, Result};
use crate::output::Output;
use crate::summary::Summary;

/// Confidence level used when `partial_result` is called without one.
pub const DEFAULT_CONFIDENCE_LEVEL: f64 = 0.95;

/// Lifecycle state of an aggregator.
///
/// An explicit enum rather than a boolean so further states can be added
/// without changing the transition sites.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlgorithmState {
    /// Accepting entries and merges.
    #[default]
    Active,
    /// A result has been produced; a reset is required before the next one.
    Finalized,
}

impl AlgorithmState {
    /// Transition into `Finalized`, failing if a result was already produced.
    pub fn begin_result(&mut self) -> Result<()> {
        match self {
            AlgorithmState::Active => {
                *self = AlgorithmState::Finalized;
                Ok(())
            }
            AlgorithmState::Finalized => Err(DpAggError::failed_precondition(
                "Algorithm can only produce results once. Reset the algorithm to produce results \
                 again.",
            )),
        }
    }

    /// Return to `Active`.
    pub fn reset(&mut self) {
        *self = AlgorithmState::Active;
    }

    /// Whether a result has been produced since the last reset.
    pub fn is_finalized(&self) -> bool {
        matches!(self, AlgorithmState::Finalized)
    }
}

/// Contract implemented by every aggregator.
///
/// The state machine is `Active --partial_result--> Finalized
/// --reset--> Active`. `serialize` never mutates and is legal in any state;
/// `merge` is intended for `Active` aggregators, so callers that finalized
/// should reset before merging further partial state.
pub trait Algorithm<T> {
    /// The total epsilon owned by this aggregator.
    fn epsilon(&self) -> f64;

    /// The total delta owned by this aggregator.
    fn delta(&self) -> f64;

    /// Accumulate one contribution. NaN input is silently dropped.
    fn add_entry(&mut self, entry: T);

    /// Accumulate a sequence of contributions.
    fn add_entries<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = T>,
        Self: Sized,
    {
        for entry in entries {
            self.add_entry(entry);
        }
    }

    /// Finalize with the default confidence level of 0.95.
    fn partial_result(&mut self) -> Result<Output>
    where
        Self: Sized,
    {
        self.partial_result_with_confidence(DEFAULT_CONFIDENCE_LEVEL)
    }

    /// Finalize and emit the noised result.
    ///
    /// Fails with a failed-precondition error on a second call without an
    /// intervening [`Algorithm::reset`].
    fn partial_result_with_confidence(&mut self, confidence_level: f64) -> Result<Output>;

    /// Clear accumulators and return to the `Active` state.
    fn reset(&mut self);

    /// Capture the current accumulators without changing state.
    fn serialize(&self) -> Summary;

    /// Fold another aggregator's serialized accumulators into this one.
    fn merge(&mut self, summary: &Summary) -> Result<()>;

    /// Best-effort count of bytes owned by the aggregator.
    fn memory_used(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_result_is_once_only_until_reset() {
        let mut state = AlgorithmState::default();
        assert!(state.begin_result().is_ok());
        let err = state.begin_result().unwrap_err();
        assert!(err.message().contains("can only produce results once"));
        assert!(err.is_failed_precondition());
        state.reset();
        assert!(state.begin_result().is_ok());
    }
}

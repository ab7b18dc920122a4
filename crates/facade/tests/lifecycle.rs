//! Lifecycle properties shared by every aggregator.

use dpagg::prelude::*;
use dpagg::{Algorithm, DEFAULT_CONFIDENCE_LEVEL};

fn assert_once_only<T, A>(mut algorithm: A, entry: T)
where
    A: Algorithm<T>,
    T: Copy,
{
    algorithm.add_entry(entry);
    assert!(algorithm.partial_result().is_ok());

    let err = algorithm.partial_result().unwrap_err();
    assert!(
        err.message().contains("can only produce results once"),
        "unexpected message: {}",
        err.message()
    );
    assert!(err.is_failed_precondition());

    algorithm.reset();
    algorithm.add_entry(entry);
    assert!(algorithm.partial_result().is_ok());
}

#[test]
fn every_aggregator_produces_results_once_per_reset() {
    assert_once_only(
        Count::<i64>::builder().with_epsilon(1.0).build().unwrap(),
        1,
    );
    assert_once_only(
        BoundedSum::<f64>::builder()
            .with_epsilon(1.0)
            .with_lower(-1.0)
            .with_upper(1.0)
            .build()
            .unwrap(),
        0.5,
    );
    assert_once_only(
        BoundedMean::<f64>::builder()
            .with_epsilon(1.0)
            .with_lower(-1.0)
            .with_upper(1.0)
            .build()
            .unwrap(),
        0.5,
    );
    assert_once_only(
        BoundedVariance::<f64>::builder()
            .with_epsilon(1.0)
            .with_lower(-1.0)
            .with_upper(1.0)
            .build()
            .unwrap(),
        0.5,
    );
}

#[test]
fn every_builder_rejects_invalid_epsilon() {
    for bad in [f64::NAN, 0.0, -1.0, f64::INFINITY] {
        assert!(Count::<i64>::builder().with_epsilon(bad).build().is_err());
        assert!(BoundedSum::<f64>::builder()
            .with_epsilon(bad)
            .with_lower(0.0)
            .with_upper(1.0)
            .build()
            .is_err());
        assert!(BoundedMean::<f64>::builder()
            .with_epsilon(bad)
            .with_lower(0.0)
            .with_upper(1.0)
            .build()
            .is_err());
        assert!(BoundedVariance::<f64>::builder()
            .with_epsilon(bad)
            .with_lower(0.0)
            .with_upper(1.0)
            .build()
            .is_err());
        assert!(ApproxBounds::<f64>::builder().with_epsilon(bad).build().is_err());
    }
}

#[test]
fn epsilon_error_messages_are_stable() {
    let err = BoundedSum::<f64>::builder()
        .with_epsilon(-1.0)
        .with_lower(0.0)
        .with_upper(1.0)
        .build()
        .unwrap_err();
    assert!(err
        .message()
        .starts_with("Epsilon must be finite and positive"));

    let err = BoundedSum::<f64>::builder()
        .with_epsilon(f64::NAN)
        .with_lower(0.0)
        .with_upper(1.0)
        .build()
        .unwrap_err();
    assert!(err
        .message()
        .starts_with("Epsilon must be a valid numeric value"));
}

#[test]
fn every_builder_rejects_delta_outside_unit_interval() {
    for bad in [-0.1, 1.1, f64::NAN, f64::INFINITY] {
        let err = BoundedSum::<f64>::builder()
            .with_epsilon(1.0)
            .with_delta(bad)
            .with_lower(0.0)
            .with_upper(1.0)
            .build()
            .unwrap_err();
        assert!(err.message().starts_with("Delta must be"), "{}", err);
    }
}

#[test]
fn nan_entries_do_not_change_serialized_state() {
    let mut sum = BoundedSum::<f64>::builder()
        .with_epsilon(1.0)
        .with_lower(-5.0)
        .with_upper(5.0)
        .build()
        .unwrap();
    let before = sum.serialize();
    sum.add_entry(f64::NAN);
    assert_eq!(before, sum.serialize());

    let mut variance = BoundedVariance::<f64>::builder()
        .with_epsilon(1.0)
        .with_lower(-5.0)
        .with_upper(5.0)
        .build()
        .unwrap();
    let before = variance.serialize();
    variance.add_entry(f64::NAN);
    assert_eq!(before, variance.serialize());

    let mut bounds = ApproxBounds::<f64>::builder().with_epsilon(1.0).build().unwrap();
    let before = bounds.serialize();
    bounds.add_entry(f64::NAN);
    assert_eq!(before, bounds.serialize());
}

#[test]
fn default_confidence_level_is_95_percent() {
    let mut sum = BoundedSum::<f64>::builder()
        .with_epsilon(1.0)
        .with_lower(-1.0)
        .with_upper(1.0)
        .build()
        .unwrap();
    sum.add_entry(0.5);
    let output = sum.partial_result().unwrap();
    let interval = output.elements[0].noise_confidence_interval.unwrap();
    assert_eq!(interval.confidence_level, DEFAULT_CONFIDENCE_LEVEL);
    assert_eq!(interval.confidence_level, 0.95);
    // The deprecated top-level interval mirrors the element interval.
    assert_eq!(
        output
            .error_report
            .unwrap()
            .noise_confidence_interval
            .unwrap(),
        interval
    );
}

#[test]
fn serialize_is_legal_after_finalize() {
    let mut sum = BoundedSum::<f64>::builder()
        .with_epsilon(1.0)
        .with_lower(-1.0)
        .with_upper(1.0)
        .build()
        .unwrap();
    sum.add_entry(0.5);
    let before = sum.serialize();
    sum.partial_result().unwrap();
    // Serialization does not mutate and still reflects the accumulators.
    assert_eq!(before, sum.serialize());
}

#[test]
fn epsilon_and_delta_are_introspectable() {
    let sum = BoundedSum::<f64>::builder()
        .with_epsilon(2.5)
        .with_delta(0.25)
        .with_lower(0.0)
        .with_upper(1.0)
        .build()
        .unwrap();
    assert_eq!(sum.epsilon(), 2.5);
    assert_eq!(sum.delta(), 0.25);
}

#[test]
fn memory_used_is_nonzero_and_grows_with_bins() {
    let sum = BoundedSum::<f64>::builder()
        .with_epsilon(1.0)
        .with_lower(0.0)
        .with_upper(1.0)
        .build()
        .unwrap();
    let approx = BoundedSum::<f64>::builder().with_epsilon(1.0).build().unwrap();
    assert!(sum.memory_used() > 0);
    assert!(approx.memory_used() > sum.memory_used());
}

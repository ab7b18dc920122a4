//! Result envelopes returned by aggregation algorithms.

/// A typed result value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutputValue {
    /// Integer-valued result.
    Int(i64),
    /// Floating-point result.
    Float(f64),
}

impl OutputValue {
    /// The value as a double, regardless of the stored variant.
    pub fn as_f64(&self) -> f64 {
        match self {
            OutputValue::Int(v) => *v as f64,
            OutputValue::Float(v) => *v,
        }
    }

    /// The integer value, when this is an integer result.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OutputValue::Int(v) => Some(*v),
            OutputValue::Float(_) => None,
        }
    }
}

/// A two-sided confidence interval for the noise added to a result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConfidenceInterval {
    /// Confidence level in (0, 1).
    pub confidence_level: f64,
    /// Lower bound of the interval.
    pub lower_bound: f64,
    /// Upper bound of the interval.
    pub upper_bound: f64,
}

impl ConfidenceInterval {
    /// Shift the interval so it is centered on `center`.
    ///
    /// Mechanisms report the interval of the noise around zero; aggregators
    /// shift it by the noised result before attaching it to an output element.
    pub fn offset_by(&self, center: f64) -> ConfidenceInterval {
        ConfidenceInterval {
            confidence_level: self.confidence_level,
            lower_bound: self.lower_bound + center,
            upper_bound: self.upper_bound + center,
        }
    }
}

/// Audit record of the clamp range chosen by approximate bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingReport {
    /// Chosen lower clamp bound.
    pub lower: f64,
    /// Chosen upper clamp bound.
    pub upper: f64,
    /// Total number of inputs counted by the bounding histogram.
    pub num_inputs: i64,
    /// Number of inputs falling outside the chosen range.
    pub num_outside_inputs: i64,
}

/// Diagnostics attached to an output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorReport {
    /// Clamp-range audit record, present for approx-bounds variants.
    pub bounding_report: Option<BoundingReport>,
    /// Deprecated mirror of the first element's noise confidence interval,
    /// retained for compatibility with older consumers.
    pub noise_confidence_interval: Option<ConfidenceInterval>,
}

/// One element of an algorithm output.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    /// The noised result value.
    pub value: OutputValue,
    /// Confidence interval of the value at the requested level.
    pub noise_confidence_interval: Option<ConfidenceInterval>,
}

/// An ordered list of result elements plus an optional error report.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Output {
    /// Result elements in algorithm-defined order.
    pub elements: Vec<Element>,
    /// Optional diagnostics.
    pub error_report: Option<ErrorReport>,
}

impl Output {
    /// Build a single-element output without a confidence interval.
    pub fn single(value: OutputValue) -> Output {
        Output {
            elements: vec![Element {
                value,
                noise_confidence_interval: None,
            }],
            error_report: None,
        }
    }

    /// Build a single-element output with a confidence interval, mirroring it
    /// into the deprecated error-report slot.
    pub fn single_with_interval(value: OutputValue, interval: ConfidenceInterval) -> Output {
        Output {
            elements: vec![Element {
                value,
                noise_confidence_interval: Some(interval),
            }],
            error_report: Some(ErrorReport {
                bounding_report: None,
                noise_confidence_interval: Some(interval),
            }),
        }
    }

    /// Attach a bounding report, creating the error report when absent.
    pub fn set_bounding_report(&mut self, report: BoundingReport) {
        self.error_report
            .get_or_insert_with(ErrorReport::default)
            .bounding_report = Some(report);
    }

    /// Convenience accessor for the first element's value.
    pub fn first_value(&self) -> Option<&OutputValue> {
        self.elements.first().map(|e| &e.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_with_interval_mirrors_deprecated_field() {
        let interval = ConfidenceInterval {
            confidence_level: 0.95,
            lower_bound: -2.0,
            upper_bound: 2.0,
        };
        let output = Output::single_with_interval(OutputValue::Float(5.0), interval);
        assert_eq!(output.elements.len(), 1);
        assert_eq!(
            output.elements[0].noise_confidence_interval,
            output
                .error_report
                .as_ref()
                .unwrap()
                .noise_confidence_interval
        );
    }

    #[test]
    fn offset_preserves_width_and_level() {
        let interval = ConfidenceInterval {
            confidence_level: 0.9,
            lower_bound: -1.5,
            upper_bound: 1.5,
        };
        let shifted = interval.offset_by(10.0);
        assert_eq!(shifted.confidence_level, 0.9);
        assert_eq!(shifted.lower_bound, 8.5);
        assert_eq!(shifted.upper_bound, 11.5);
    }
}

//! Laplace and Gaussian noise mechanisms calibrated from a privacy budget and
//! contribution sensitivities.

use rand_distr::{Distribution, Exp, Normal};
use statrs::distribution::{ContinuousCDF, Normal as StandardNormal};

use crate::error::Result;
use crate::numeric::qnorm;
use crate::output::ConfidenceInterval;
use crate::rng::SecureRng;
use crate::validate::{
    validate_delta, validate_epsilon, validate_is_finite_and_positive,
    validate_is_in_exclusive_interval,
};

/// Relative accuracy of the binary search for the Gaussian standard deviation.
const GAUSSIAN_SIGMA_ACCURACY: f64 = 1e-3;

fn standard_normal() -> StandardNormal {
    StandardNormal::new(0.0, 1.0).expect("standard normal distribution")
}

/// The noise distribution family of a mechanism.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MechanismKind {
    /// Pure-epsilon Laplace noise.
    Laplace,
    /// Analytic (epsilon, delta) Gaussian noise.
    Gaussian,
}

/// Additive Laplace noise with scale `L0 * LInf / epsilon`.
///
/// Sampling uses the difference of two exponential draws, which avoids the
/// single-uniform logarithm mapping exploited by the floating-point attack of
/// Mironov (2012).
#[derive(Clone, Debug)]
pub struct LaplaceMechanism {
    epsilon: f64,
    delta: f64,
    diversity: f64,
    rng: SecureRng,
}

impl LaplaceMechanism {
    /// Scale parameter of the underlying Laplace distribution.
    pub fn diversity(&self) -> f64 {
        self.diversity
    }

    /// Add calibrated noise to a raw value.
    pub fn add_noise(&mut self, x: f64) -> f64 {
        let Ok(dist) = Exp::new(1.0 / self.diversity) else {
            return x;
        };
        let noise = dist.sample(&mut self.rng) - dist.sample(&mut self.rng);
        x + noise
    }

    /// Two-sided interval containing the noise with probability
    /// `confidence_level`, scaled by `scaling`.
    pub fn noise_confidence_interval(
        &self,
        confidence_level: f64,
        scaling: f64,
    ) -> Result<ConfidenceInterval> {
        validate_is_in_exclusive_interval(Some(confidence_level), 0.0, 1.0, "Confidence level")?;
        let bound = self.diversity * (1.0 / (1.0 - confidence_level)).ln() * scaling.abs();
        Ok(ConfidenceInterval {
            confidence_level,
            lower_bound: -bound,
            upper_bound: bound,
        })
    }

    /// Quantile of the noise distribution.
    pub fn quantile(&self, p: f64) -> Result<f64> {
        validate_is_in_exclusive_interval(Some(p), 0.0, 1.0, "Probability")?;
        if p >= 0.5 {
            Ok(-self.diversity * (2.0 * (1.0 - p)).ln())
        } else {
            Ok(self.diversity * (2.0 * p).ln())
        }
    }
}

/// Additive Gaussian noise calibrated by the analytic Gaussian mechanism of
/// Balle & Wang (2018).
#[derive(Clone, Debug)]
pub struct GaussianMechanism {
    epsilon: f64,
    delta: f64,
    stddev: f64,
    rng: SecureRng,
}

impl GaussianMechanism {
    /// Standard deviation of the calibrated noise.
    pub fn stddev(&self) -> f64 {
        self.stddev
    }

    /// Add calibrated noise to a raw value.
    pub fn add_noise(&mut self, x: f64) -> f64 {
        let Ok(dist) = Normal::new(0.0, self.stddev) else {
            return x;
        };
        x + dist.sample(&mut self.rng)
    }

    /// Two-sided interval containing the noise with probability
    /// `confidence_level`, scaled by `scaling`.
    pub fn noise_confidence_interval(
        &self,
        confidence_level: f64,
        scaling: f64,
    ) -> Result<ConfidenceInterval> {
        validate_is_in_exclusive_interval(Some(confidence_level), 0.0, 1.0, "Confidence level")?;
        let bound =
            qnorm(1.0 - (1.0 - confidence_level) / 2.0, 0.0, self.stddev)? * scaling.abs();
        Ok(ConfidenceInterval {
            confidence_level,
            lower_bound: -bound,
            upper_bound: bound,
        })
    }

    /// Quantile of the noise distribution.
    pub fn quantile(&self, p: f64) -> Result<f64> {
        qnorm(p, 0.0, self.stddev)
    }

    /// The delta consumed by Gaussian noise of deviation `sigma` at privacy
    /// parameter `epsilon` and L2 sensitivity `l2_sensitivity`.
    ///
    /// Theorem 8 of Balle & Wang (2018).
    pub fn calculate_delta(sigma: f64, epsilon: f64, l2_sensitivity: f64) -> f64 {
        let normal = standard_normal();
        let a = l2_sensitivity / (2.0 * sigma) - epsilon * sigma / l2_sensitivity;
        let b = -l2_sensitivity / (2.0 * sigma) - epsilon * sigma / l2_sensitivity;
        let lower_tail = normal.cdf(b);
        // Guard the product against inf * 0 when epsilon is enormous.
        let scaled_tail = if lower_tail > 0.0 {
            epsilon.exp() * lower_tail
        } else {
            0.0
        };
        normal.cdf(a) - scaled_tail
    }

    /// Smallest standard deviation for which Gaussian noise with the given
    /// L2 sensitivity is (epsilon, delta)-DP.
    pub fn calculate_stddev(epsilon: f64, delta: f64, l2_sensitivity: f64) -> f64 {
        let mut lower = f64::MIN_POSITIVE;
        let mut upper = l2_sensitivity;
        while Self::calculate_delta(upper, epsilon, l2_sensitivity) > delta {
            lower = upper;
            upper *= 2.0;
        }
        while upper - lower > GAUSSIAN_SIGMA_ACCURACY * lower {
            let middle = lower * 0.5 + upper * 0.5;
            if Self::calculate_delta(middle, epsilon, l2_sensitivity) > delta {
                lower = middle;
            } else {
                upper = middle;
            }
        }
        upper
    }
}

/// A built noise mechanism, dispatching on the distribution family.
#[derive(Clone, Debug)]
pub enum Mechanism {
    /// Laplace noise.
    Laplace(LaplaceMechanism),
    /// Gaussian noise.
    Gaussian(GaussianMechanism),
}

impl Mechanism {
    /// Add calibrated noise to a raw value.
    pub fn add_noise(&mut self, x: f64) -> f64 {
        match self {
            Mechanism::Laplace(m) => m.add_noise(x),
            Mechanism::Gaussian(m) => m.add_noise(x),
        }
    }

    /// Two-sided noise confidence interval at `confidence_level`, scaled.
    pub fn noise_confidence_interval(
        &self,
        confidence_level: f64,
        scaling: f64,
    ) -> Result<ConfidenceInterval> {
        match self {
            Mechanism::Laplace(m) => m.noise_confidence_interval(confidence_level, scaling),
            Mechanism::Gaussian(m) => m.noise_confidence_interval(confidence_level, scaling),
        }
    }

    /// Quantile of the noise distribution.
    pub fn quantile(&self, p: f64) -> Result<f64> {
        match self {
            Mechanism::Laplace(m) => m.quantile(p),
            Mechanism::Gaussian(m) => m.quantile(p),
        }
    }

    /// Epsilon consumed by this mechanism.
    pub fn epsilon(&self) -> f64 {
        match self {
            Mechanism::Laplace(m) => m.epsilon,
            Mechanism::Gaussian(m) => m.epsilon,
        }
    }

    /// Delta consumed by this mechanism.
    pub fn delta(&self) -> f64 {
        match self {
            Mechanism::Laplace(m) => m.delta,
            Mechanism::Gaussian(m) => m.delta,
        }
    }

    /// Best-effort bytes owned by the mechanism.
    pub fn memory_used(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Clonable configuration template for noise mechanisms.
///
/// A single configured builder can mint several mechanisms (count, sum,
/// sum-of-squares, threshold) by cloning and overriding the budget or
/// sensitivities before `build`.
#[derive(Clone, Debug)]
pub struct MechanismBuilder {
    kind: MechanismKind,
    epsilon: Option<f64>,
    delta: Option<f64>,
    l0_sensitivity: Option<f64>,
    linf_sensitivity: Option<f64>,
    seed: Option<u64>,
}

impl MechanismBuilder {
    /// Template for a Laplace mechanism.
    pub fn laplace() -> Self {
        Self {
            kind: MechanismKind::Laplace,
            epsilon: None,
            delta: None,
            l0_sensitivity: None,
            linf_sensitivity: None,
            seed: None,
        }
    }

    /// Template for a Gaussian mechanism.
    pub fn gaussian() -> Self {
        Self {
            kind: MechanismKind::Gaussian,
            ..Self::laplace()
        }
    }

    /// The distribution family this builder produces.
    pub fn kind(&self) -> MechanismKind {
        self.kind
    }

    /// Set the privacy parameter epsilon.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Set the privacy parameter delta.
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }

    /// Set the L0 sensitivity (maximum partitions contributed).
    pub fn with_l0_sensitivity(mut self, l0_sensitivity: f64) -> Self {
        self.l0_sensitivity = Some(l0_sensitivity);
        self
    }

    /// Set the LInf sensitivity (maximum per-partition magnitude).
    pub fn with_linf_sensitivity(mut self, linf_sensitivity: f64) -> Self {
        self.linf_sensitivity = Some(linf_sensitivity);
        self
    }

    /// Seed the mechanism's random stream; intended for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn make_rng(&self) -> SecureRng {
        match self.seed {
            Some(seed) => SecureRng::from_seed_value(seed),
            None => SecureRng::new(),
        }
    }

    /// Validate the configuration and construct the mechanism.
    pub fn build(&self) -> Result<Mechanism> {
        let epsilon = validate_epsilon(self.epsilon)?;
        let l0_sensitivity = validate_is_finite_and_positive(
            Some(self.l0_sensitivity.unwrap_or(1.0)),
            "L0 sensitivity",
        )?;
        let linf_sensitivity = validate_is_finite_and_positive(
            Some(self.linf_sensitivity.unwrap_or(1.0)),
            "LInf sensitivity",
        )?;

        match self.kind {
            MechanismKind::Laplace => {
                let delta = validate_delta(Some(self.delta.unwrap_or(0.0)))?;
                let l1_sensitivity = l0_sensitivity * linf_sensitivity;
                validate_is_finite_and_positive(Some(l1_sensitivity), "L1 sensitivity")?;
                Ok(Mechanism::Laplace(LaplaceMechanism {
                    epsilon,
                    delta,
                    diversity: l1_sensitivity / epsilon,
                    rng: self.make_rng(),
                }))
            }
            MechanismKind::Gaussian => {
                let delta =
                    validate_is_in_exclusive_interval(self.delta, 0.0, 1.0, "Delta")?;
                let l2_sensitivity = l0_sensitivity.sqrt() * linf_sensitivity;
                validate_is_finite_and_positive(Some(l2_sensitivity), "L2 sensitivity")?;
                let stddev = GaussianMechanism::calculate_stddev(epsilon, delta, l2_sensitivity);
                Ok(Mechanism::Gaussian(GaussianMechanism {
                    epsilon,
                    delta,
                    stddev,
                    rng: self.make_rng(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laplace_builder_rejects_invalid_epsilon() {
        for bad in [0.0, -1.0, f64::INFINITY] {
            let err = MechanismBuilder::laplace()
                .with_epsilon(bad)
                .build()
                .unwrap_err();
            assert!(err
                .message()
                .starts_with("Epsilon must be finite and positive"));
        }
        let err = MechanismBuilder::laplace()
            .with_epsilon(f64::NAN)
            .build()
            .unwrap_err();
        assert!(err
            .message()
            .starts_with("Epsilon must be a valid numeric value"));
    }

    #[test]
    fn gaussian_builder_requires_delta_in_open_interval() {
        for bad in [Some(0.0), Some(1.0), Some(-0.5), None] {
            let mut builder = MechanismBuilder::gaussian().with_epsilon(1.0);
            if let Some(delta) = bad {
                builder = builder.with_delta(delta);
            }
            let err = builder.build().unwrap_err();
            assert!(err.message().starts_with("Delta must be"), "{}", err);
        }
    }

    #[test]
    fn laplace_scale_combines_sensitivities() {
        let mechanism = MechanismBuilder::laplace()
            .with_epsilon(2.0)
            .with_l0_sensitivity(3.0)
            .with_linf_sensitivity(4.0)
            .build()
            .unwrap();
        let Mechanism::Laplace(laplace) = mechanism else {
            panic!("expected laplace")
        };
        assert!((laplace.diversity() - 6.0).abs() < 1e-12);
    }

    #[test]
    fn seeded_mechanisms_are_deterministic() {
        let builder = MechanismBuilder::laplace().with_epsilon(1.0).with_seed(17);
        let mut a = builder.clone().build().unwrap();
        let mut b = builder.build().unwrap();
        for _ in 0..16 {
            assert_eq!(a.add_noise(1.0), b.add_noise(1.0));
        }
    }

    #[test]
    fn laplace_noise_has_expected_spread() {
        let mut mechanism = MechanismBuilder::laplace()
            .with_epsilon(1.0)
            .with_linf_sensitivity(1.0)
            .with_seed(99)
            .build()
            .unwrap();
        let n = 50_000;
        let samples: Vec<f64> = (0..n).map(|_| mechanism.add_noise(0.0)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        // Laplace(b = 1) has mean 0 and variance 2.
        assert!(mean.abs() < 0.05, "mean = {mean}");
        assert!((var - 2.0).abs() < 0.2, "var = {var}");
    }

    #[test]
    fn laplace_confidence_interval_matches_quantile() {
        let mechanism = MechanismBuilder::laplace()
            .with_epsilon(1.0)
            .with_linf_sensitivity(10.0)
            .build()
            .unwrap();
        let interval = mechanism.noise_confidence_interval(0.95, 1.0).unwrap();
        let expected = 10.0 * (1.0f64 / 0.05).ln();
        assert!((interval.upper_bound - expected).abs() < 1e-9);
        assert_eq!(interval.lower_bound, -interval.upper_bound);
        // The CI bound is the symmetric-quantile at 1 - (1-c)/2 = 0.975.
        let q = mechanism.quantile(0.975).unwrap();
        assert!((q - expected).abs() < 1e-9);
    }

    #[test]
    fn confidence_interval_rejects_degenerate_levels() {
        let mechanism = MechanismBuilder::laplace().with_epsilon(1.0).build().unwrap();
        for bad in [0.0, 1.0, -0.3, 1.5] {
            let err = mechanism.noise_confidence_interval(bad, 1.0).unwrap_err();
            assert!(err.message().starts_with("Confidence level"));
        }
    }

    #[test]
    fn gaussian_stddev_is_tightly_calibrated() {
        let epsilon = 1.0986122886681098;
        let delta = 1e-5;
        let sigma = GaussianMechanism::calculate_stddev(epsilon, delta, 1.0);
        assert!(GaussianMechanism::calculate_delta(sigma, epsilon, 1.0) <= delta);
        // Slightly smaller noise must violate the target delta.
        assert!(GaussianMechanism::calculate_delta(sigma * 0.99, epsilon, 1.0) > delta);
    }

    #[test]
    fn gaussian_stddev_scales_with_l2_sensitivity() {
        let sigma_1 = GaussianMechanism::calculate_stddev(1.0, 1e-6, 1.0);
        let sigma_2 = GaussianMechanism::calculate_stddev(1.0, 1e-6, 2.0);
        assert!((sigma_2 / sigma_1 - 2.0).abs() < 0.01);
    }

    #[test]
    fn gaussian_noise_matches_calibrated_stddev() {
        let mechanism = MechanismBuilder::gaussian()
            .with_epsilon(1.0)
            .with_delta(1e-5)
            .with_seed(3)
            .build()
            .unwrap();
        let Mechanism::Gaussian(mut gaussian) = mechanism else {
            panic!("expected gaussian")
        };
        let expected = gaussian.stddev();
        let n = 50_000;
        let samples: Vec<f64> = (0..n).map(|_| gaussian.add_noise(0.0)).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < expected * 0.05);
        assert!((var.sqrt() - expected).abs() < expected * 0.05);
    }

    #[test]
    fn builder_template_mints_independent_budgets() {
        let template = MechanismBuilder::laplace()
            .with_l0_sensitivity(2.0)
            .with_linf_sensitivity(5.0);
        let m1 = template.clone().with_epsilon(1.0).build().unwrap();
        let m2 = template.with_epsilon(0.5).build().unwrap();
        assert_eq!(m1.epsilon(), 1.0);
        assert_eq!(m2.epsilon(), 0.5);
    }
}

//! Fit options and problem bounds.
//!
//! Options are plain serde structs with defaults for every field, so an empty
//! TOML document is a valid configuration. [`FitOptions::validate`] and
//! [`FitProblem::validate`] turn contradictory settings into [`ConfigError`]s
//! before any recording is made.

use crate::cholesky::FillOrdering;
use crate::types::PackLayout;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal configuration errors. A fit never starts when one is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse TOML options: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("{name} has {found} entries, but {expected} were expected.")]
    SizeMismatch {
        name: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("{name}[{index}]: lower bound {lower} exceeds upper bound {upper}.")]
    BoundsOutOfOrder {
        name: &'static str,
        index: usize,
        lower: f64,
        upper: f64,
    },

    #[error("{name}[{index}]: initial value {value} lies outside [{lower}, {upper}].")]
    InitialOutOfBounds {
        name: &'static str,
        index: usize,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error("quasi_fixed is set, so {option} cannot be {value}.")]
    ConflictingOption { option: &'static str, value: String },

    #[error("{name} must be positive and finite, found {value}.")]
    NonPositive { name: &'static str, value: f64 },

    #[error("{name} must be at least 1.")]
    ZeroIterations { name: &'static str },

    #[error(
        "The random likelihood returned {found} values; it must return exactly one (or none when there are no random effects, here n_random = {n_random})."
    )]
    RandomLikelihoodSize { found: usize, n_random: usize },

    #[error("The random likelihood must be smooth in the random effects, but its recording contains an absolute value.")]
    NonSmoothRandomLikelihood,

    #[error("Invalid prior: {0}")]
    Prior(#[from] crate::residual::ResidualError),
}

/// How the outer optimizer obtains second-order information.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HessianApproximation {
    Exact,
    QuasiNewton,
}

/// Finite-difference check of the outer derivatives at the initial point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DerivativeTest {
    #[default]
    None,
    FirstOrder,
    SecondOrder,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedOptions {
    /// Convergence threshold on the (projected) gradient.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Unset means: quasi-Newton when `quasi_fixed`, exact otherwise.
    pub hessian_approximation: Option<HessianApproximation>,
    /// Largest acceptable constraint violation.
    pub constraint_tolerance: f64,
    pub max_penalty_rounds: usize,
    pub initial_penalty: f64,
}

impl Default for FixedOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 200,
            hessian_approximation: None,
            constraint_tolerance: 1e-6,
            max_penalty_rounds: 8,
            initial_penalty: 10.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomOptions {
    /// Convergence threshold on the max-norm of the projected gradient.
    pub tolerance: f64,
    pub max_iterations: usize,
    pub ordering: FillOrdering,
}

impl Default for RandomOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 50,
            ordering: FillOrdering::Amd,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Approximate the fixed-effects Hessian instead of recording it.
    pub quasi_fixed: bool,
    /// Start each inner optimization from the previous optimum.
    pub warm_start: bool,
    pub derivative_test: DerivativeTest,
    pub derivative_tolerance: f64,
    pub fixed: FixedOptions,
    pub random: RandomOptions,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            quasi_fixed: true,
            warm_start: true,
            derivative_test: DerivativeTest::None,
            derivative_tolerance: 1e-4,
            fixed: FixedOptions::default(),
            random: RandomOptions::default(),
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

impl FitOptions {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: FitOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("fixed.tolerance", self.fixed.tolerance)?;
        positive("fixed.constraint_tolerance", self.fixed.constraint_tolerance)?;
        positive("fixed.initial_penalty", self.fixed.initial_penalty)?;
        positive("random.tolerance", self.random.tolerance)?;
        positive("derivative_tolerance", self.derivative_tolerance)?;
        if self.fixed.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations {
                name: "fixed.max_iterations",
            });
        }
        if self.random.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations {
                name: "random.max_iterations",
            });
        }
        if self.fixed.max_penalty_rounds == 0 {
            return Err(ConfigError::ZeroIterations {
                name: "fixed.max_penalty_rounds",
            });
        }
        if self.quasi_fixed {
            if self.fixed.hessian_approximation == Some(HessianApproximation::Exact) {
                return Err(ConfigError::ConflictingOption {
                    option: "fixed.hessian_approximation",
                    value: "exact".to_string(),
                });
            }
            if self.derivative_test == DerivativeTest::SecondOrder {
                return Err(ConfigError::ConflictingOption {
                    option: "derivative_test",
                    value: "second-order".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The strategy the outer optimizer will use.
    pub fn hessian_approximation(&self) -> HessianApproximation {
        if self.quasi_fixed {
            HessianApproximation::QuasiNewton
        } else {
            self.fixed
                .hessian_approximation
                .unwrap_or(HessianApproximation::Exact)
        }
    }
}

/// Bounds and starting values of one fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitProblem {
    pub fixed_lower: Vec<f64>,
    pub fixed_upper: Vec<f64>,
    pub fixed_init: Vec<f64>,
    #[serde(default)]
    pub constraint_lower: Vec<f64>,
    #[serde(default)]
    pub constraint_upper: Vec<f64>,
    pub random_lower: Vec<f64>,
    pub random_upper: Vec<f64>,
    pub random_init: Vec<f64>,
}

impl FitProblem {
    /// No bounds on any effect and no constraints.
    pub fn unbounded(fixed_init: Vec<f64>, random_init: Vec<f64>) -> Self {
        Self {
            fixed_lower: vec![f64::NEG_INFINITY; fixed_init.len()],
            fixed_upper: vec![f64::INFINITY; fixed_init.len()],
            constraint_lower: Vec::new(),
            constraint_upper: Vec::new(),
            random_lower: vec![f64::NEG_INFINITY; random_init.len()],
            random_upper: vec![f64::INFINITY; random_init.len()],
            fixed_init,
            random_init,
        }
    }

    pub fn with_fixed_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.fixed_lower = lower;
        self.fixed_upper = upper;
        self
    }

    pub fn with_random_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.random_lower = lower;
        self.random_upper = upper;
        self
    }

    pub fn with_constraint_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.constraint_lower = lower;
        self.constraint_upper = upper;
        self
    }

    pub fn validate(&self, layout: PackLayout, n_constraints: usize) -> Result<(), ConfigError> {
        check_len("fixed_lower", &self.fixed_lower, layout.n_fixed)?;
        check_len("fixed_upper", &self.fixed_upper, layout.n_fixed)?;
        check_len("fixed_init", &self.fixed_init, layout.n_fixed)?;
        check_len("random_lower", &self.random_lower, layout.n_random)?;
        check_len("random_upper", &self.random_upper, layout.n_random)?;
        check_len("random_init", &self.random_init, layout.n_random)?;
        check_len("constraint_lower", &self.constraint_lower, n_constraints)?;
        check_len("constraint_upper", &self.constraint_upper, n_constraints)?;

        check_box("fixed", &self.fixed_lower, &self.fixed_upper, Some(&self.fixed_init))?;
        check_box("random", &self.random_lower, &self.random_upper, Some(&self.random_init))?;
        check_box("constraint", &self.constraint_lower, &self.constraint_upper, None)
    }
}

fn check_len(name: &'static str, values: &[f64], expected: usize) -> Result<(), ConfigError> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(ConfigError::SizeMismatch {
            name,
            found: values.len(),
            expected,
        })
    }
}

fn check_box(
    name: &'static str,
    lower: &[f64],
    upper: &[f64],
    init: Option<&[f64]>,
) -> Result<(), ConfigError> {
    for (index, (&lo, &hi)) in lower.iter().zip(upper).enumerate() {
        if !(lo <= hi) {
            return Err(ConfigError::BoundsOutOfOrder {
                name,
                index,
                lower: lo,
                upper: hi,
            });
        }
        if let Some(init) = init {
            let value = init[index];
            if !(lo <= value && value <= hi) {
                return Err(ConfigError::InitialOutOfBounds {
                    name,
                    index,
                    value,
                    lower: lo,
                    upper: hi,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let options = FitOptions::from_toml_str("").unwrap();
        assert_eq!(options, FitOptions::default());
        assert_eq!(options.hessian_approximation(), HessianApproximation::QuasiNewton);
    }

    #[test]
    fn sections_override_individual_fields() {
        let text = r#"
            quasi_fixed = false
            derivative_test = "second-order"

            [fixed]
            tolerance = 1e-9
            hessian_approximation = "exact"

            [random]
            ordering = "natural"
        "#;
        let options = FitOptions::from_toml_str(text).unwrap();
        assert!(!options.quasi_fixed);
        assert_eq!(options.fixed.tolerance, 1e-9);
        assert_eq!(options.fixed.max_iterations, 200);
        assert_eq!(options.random.ordering, FillOrdering::Natural);
        assert_eq!(options.hessian_approximation(), HessianApproximation::Exact);
    }

    #[test]
    fn quasi_fixed_rejects_exact_hessians() {
        let mut options = FitOptions::default();
        options.fixed.hessian_approximation = Some(HessianApproximation::Exact);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::ConflictingOption { option: "fixed.hessian_approximation", .. })
        ));

        let mut options = FitOptions::default();
        options.derivative_test = DerivativeTest::SecondOrder;
        assert!(matches!(options.validate(), Err(ConfigError::ConflictingOption { .. })));

        options.quasi_fixed = false;
        assert!(options.validate().is_ok());
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            FitOptions::from_toml_str("[random]\ntolerance = -1.0"),
            Err(ConfigError::NonPositive { name: "random.tolerance", .. })
        ));
        assert!(matches!(
            FitOptions::from_toml_str("quasi_fixed = 3"),
            Err(ConfigError::TomlParseError(_))
        ));
        assert!(matches!(
            FitOptions::from_toml_str("[fixed]\nmax_iterations = 0"),
            Err(ConfigError::ZeroIterations { .. })
        ));
    }

    #[test]
    fn problem_validation_checks_sizes_and_boxes() {
        let layout = PackLayout::new(2, 1);
        let problem = FitProblem::unbounded(vec![0.0, 1.0], vec![0.0]);
        assert!(problem.validate(layout, 0).is_ok());

        let short = FitProblem::unbounded(vec![0.0], vec![0.0]);
        assert!(matches!(
            short.validate(layout, 0),
            Err(ConfigError::SizeMismatch { name: "fixed_lower", found: 1, expected: 2 })
        ));

        let outside = problem
            .clone()
            .with_fixed_bounds(vec![0.5, 0.0], vec![1.0, 2.0]);
        assert!(matches!(
            outside.validate(layout, 0),
            Err(ConfigError::InitialOutOfBounds { name: "fixed", index: 0, .. })
        ));

        let inverted = problem
            .clone()
            .with_random_bounds(vec![1.0], vec![-1.0]);
        assert!(matches!(
            inverted.validate(layout, 0),
            Err(ConfigError::BoundsOutOfOrder { name: "random", .. })
        ));

        assert!(matches!(
            problem.validate(layout, 1),
            Err(ConfigError::SizeMismatch { name: "constraint_lower", .. })
        ));
    }
}

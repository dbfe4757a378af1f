//! # Laplace Approximation Engine
//!
//! [`MixedEngine`] owns everything recorded for one model: the two levels of
//! the random-likelihood recording, the recordings of the fixed likelihood and
//! the constraints, the symbolic Cholesky plan of `f_uu`, a cache of inner
//! solutions keyed by the bits of θ, and the fixed-effects Hessian recording
//! once it is first needed.
//!
//! The Laplace objective it minimizes over θ is
//!
//! ```text
//! L(θ) = f(θ, û) + ½ log det f_uu(θ, û) − (n_random/2) log 2π + g(θ)
//! ```
//!
//! with `û = argmin_u f(θ, u)` inside the random-effects box and
//! `g(θ) = v_0(θ) + Σ_k |v_k(θ)|`.
//!
//! An engine is single threaded; its caches use interior mutability and are
//! never shared. [`fit_replicates`] runs independent fits in parallel, each
//! with a private engine.

use crate::ad::{AdError, Tape};
use crate::cholesky::{CholeskyError, SymbolicCholesky};
use crate::config::{ConfigError, DerivativeTest, FitOptions, FitProblem, HessianApproximation};
use crate::finite_diff::{self, DerivativeMismatch};
use crate::hes_fix::{FixedHessianError, FixedHessianRecording};
use crate::inner::{InnerFailure, InnerOptimizer, InnerSolution};
use crate::model::MixedModel;
use crate::nlp::{EvalFailure, NlpProblem, NlpSettings, SolverStatus, solve_nlp};
use crate::outer::OuterOptimizer;
use crate::ranobj::ObjectiveGradientAssembler;
use crate::recorder::{FunctionRecorder, RandomRecordings, Recording, RecordingError};
use crate::sparsity::{HessianBlock, SparsityPattern};
use crate::types::{FixedEffects, PackLayout, RandomEffects};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// A comprehensive error type for the estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Recording the random likelihood failed: {0}")]
    Recording(#[from] RecordingError),

    #[error("Recording a fixed-effects function failed: {0}")]
    Ad(#[from] AdError),

    #[error("Symbolic analysis of the random-effects Hessian failed: {0}")]
    Cholesky(#[from] CholeskyError),

    #[error(transparent)]
    FixedHessian(#[from] FixedHessianError),

    #[error("Random-effects optimization failed at the {stage}: {source}")]
    RandomEffects {
        stage: &'static str,
        #[source]
        source: InnerFailure,
    },

    #[error("The objective cannot be evaluated at the initial fixed effects: {0}")]
    InitialPoint(EvalFailure),
}

/// Estimates and diagnostics of one fit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitResult {
    pub fixed: FixedEffects,
    /// `û` at the estimated fixed effects.
    pub random: RandomEffects,
    /// `L(θ)` at the estimate.
    pub objective: f64,
    pub status: SolverStatus,
    pub iterations: usize,
    pub max_constraint_violation: f64,
}

const MAX_CACHED_SOLUTIONS: usize = 256;

struct RandomBox {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

pub struct MixedEngine<M: MixedModel> {
    model: M,
    layout: PackLayout,
    options: FitOptions,
    random: RandomRecordings,
    fixed_likelihood: Option<Recording>,
    constraint: Option<Recording>,
    symbolic: Option<Arc<SymbolicCholesky>>,
    random_init: Vec<f64>,
    random_box: RefCell<RandomBox>,
    warm_start: RefCell<Vec<f64>>,
    solutions: RefCell<HashMap<Vec<u64>, InnerSolution>>,
    fixed_hessian: OnceCell<FixedHessianRecording>,
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Jacobian of all outputs of `tape`, one reverse sweep per output.
fn tape_jacobian(tape: &Tape, x: &[f64]) -> Array2<f64> {
    let m = tape.n_outputs();
    let mut jacobian = Array2::zeros((m, x.len()));
    let mut weights = vec![0.0; m];
    for k in 0..m {
        weights[k] = 1.0;
        let (_, gradient) = tape.gradient(x, &weights);
        jacobian.row_mut(k).assign(&Array1::from(gradient));
        weights[k] = 0.0;
    }
    jacobian
}

impl<M: MixedModel> MixedEngine<M> {
    /// Records the model at `(fixed_init, random_init)`.
    pub fn new(
        model: M,
        fixed_init: &[f64],
        random_init: &[f64],
        options: FitOptions,
    ) -> Result<Self, EstimationError> {
        options.validate()?;
        let layout = PackLayout::new(model.n_fixed(), model.n_random());
        if fixed_init.len() != layout.n_fixed {
            return Err(ConfigError::SizeMismatch {
                name: "fixed_init",
                found: fixed_init.len(),
                expected: layout.n_fixed,
            }
            .into());
        }
        if random_init.len() != layout.n_random {
            return Err(ConfigError::SizeMismatch {
                name: "random_init",
                found: random_init.len(),
                expected: layout.n_random,
            }
            .into());
        }

        log::info!(
            "Recording model with {} fixed and {} random effects.",
            layout.n_fixed,
            layout.n_random
        );
        let recorder = FunctionRecorder::new(layout);
        let random = recorder.record_random(
            |theta, u| model.ran_likelihood(theta, u),
            fixed_init,
            random_init,
        )?;
        let fixed_likelihood = recorder.record_fixed(|theta| model.fix_likelihood(theta), fixed_init)?;
        let constraint = recorder.record_fixed(|theta| model.fix_constraint(theta), fixed_init)?;

        let symbolic = match random.hessian() {
            Some(hessian) => {
                let symbolic =
                    SymbolicCholesky::analyze(layout.n_random, hessian.pattern(), options.random.ordering)?;
                log::info!(
                    "Symbolic Cholesky of f_uu: {} pattern entries, {} factor entries.",
                    hessian.pattern().len(),
                    symbolic.factor_nnz()
                );
                Some(Arc::new(symbolic))
            }
            None => None,
        };

        Ok(Self {
            model,
            layout,
            random,
            fixed_likelihood,
            constraint,
            symbolic,
            random_init: random_init.to_vec(),
            random_box: RefCell::new(RandomBox {
                lower: vec![f64::NEG_INFINITY; layout.n_random],
                upper: vec![f64::INFINITY; layout.n_random],
            }),
            warm_start: RefCell::new(random_init.to_vec()),
            solutions: RefCell::new(HashMap::new()),
            fixed_hessian: OnceCell::new(),
            options,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn layout(&self) -> PackLayout {
        self.layout
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    pub fn n_constraints(&self) -> usize {
        self.constraint.as_ref().map_or(0, |c| c.tape().n_outputs())
    }

    /// Number of absolute-value terms in the fixed likelihood.
    pub fn n_abs_terms(&self) -> usize {
        self.fixed_likelihood
            .as_ref()
            .map_or(0, |r| r.tape().n_outputs().saturating_sub(1))
    }

    /// Pattern of `f_uu` in random-effect numbering; empty without random effects.
    pub fn random_hessian_pattern(&self) -> SparsityPattern {
        self.random
            .hessian()
            .map(|h| h.pattern().clone())
            .unwrap_or_default()
    }

    /// Minimizes `f(θ, ·)` over the box, without touching the cache.
    pub fn optimize_random(
        &self,
        theta: &[f64],
        lower: &[f64],
        upper: &[f64],
        initial: &[f64],
    ) -> Result<InnerSolution, InnerFailure> {
        let mut inner = InnerOptimizer::new(&self.random, self.symbolic.as_ref(), &self.options.random);
        inner.solve(theta, lower, upper, initial, self.options.random.tolerance)
    }

    /// `û(θ)` inside the current random-effects box, cached by the bits of θ.
    pub fn random_solution(&self, theta: &[f64]) -> Result<InnerSolution, InnerFailure> {
        let key = FixedEffects::cache_key(theta);
        if let Some(solution) = self.solutions.borrow().get(&key) {
            return Ok(solution.clone());
        }

        let solution = {
            let bounds = self.random_box.borrow();
            let start = if self.options.warm_start {
                self.warm_start.borrow().clone()
            } else {
                self.random_init.clone()
            };
            match self.optimize_random(theta, &bounds.lower, &bounds.upper, &start) {
                Ok(solution) => solution,
                Err(failure) if self.options.warm_start => {
                    log::debug!("Warm-started inner optimization failed ({failure}); retrying from the initial random effects.");
                    self.optimize_random(theta, &bounds.lower, &bounds.upper, &self.random_init)?
                }
                Err(failure) => return Err(failure),
            }
        };

        if self.options.warm_start {
            *self.warm_start.borrow_mut() = solution.random.to_vec();
        }
        let mut cache = self.solutions.borrow_mut();
        if cache.len() >= MAX_CACHED_SOLUTIONS {
            cache.clear();
        }
        cache.insert(key, solution.clone());
        Ok(solution)
    }

    fn assembler(&self) -> ObjectiveGradientAssembler<'_> {
        ObjectiveGradientAssembler::new(&self.random, self.symbolic.as_ref())
            .with_stationarity_tolerance(self.options.random.tolerance)
    }

    /// `f(θ, û) + ½ log det f_uu(θ, û) − (n_random/2) log 2π`.
    pub fn ranobj(&self, theta: &[f64], random: &[f64]) -> Result<f64, InnerFailure> {
        self.assembler().objective(theta, random)
    }

    /// Gradient of [`Self::ranobj`] along `û(θ)`, by the implicit function theorem.
    pub fn ranobj_gradient(&self, theta: &[f64], random: &[f64]) -> Result<Vec<f64>, InnerFailure> {
        self.assembler().gradient(theta, random)
    }

    /// `∂û/∂θ_j`.
    pub fn implicit_derivative(&self, theta: &[f64], random: &[f64], j: usize) -> Result<Vec<f64>, InnerFailure> {
        self.assembler().implicit_derivative(theta, random, j)
    }

    /// Lower triangle of the Hessian of [`Self::ranobj`] along `û(θ)`.
    ///
    /// The recording behind it is made on first use, at `(θ, θ, random)`.
    pub fn ranobj_hessian(&self, theta: &[f64], random: &[f64]) -> Result<(SparsityPattern, Vec<f64>), EstimationError> {
        let recording = match self.fixed_hessian.get() {
            Some(recording) => recording,
            None => {
                let recording = FixedHessianRecording::record(&self.random, self.symbolic.as_ref(), theta, random)?;
                self.fixed_hessian.get_or_init(|| recording)
            }
        };
        let values = recording
            .evaluate(theta, random)
            .map_err(|source| EstimationError::RandomEffects {
                stage: "fixed-effects Hessian",
                source,
            })?;
        Ok((recording.pattern().clone(), values))
    }

    /// Raw outputs `v` of the fixed likelihood.
    pub fn fix_likelihood_values(&self, theta: &[f64]) -> Vec<f64> {
        self.fixed_likelihood
            .as_ref()
            .map(|r| r.tape().eval(theta))
            .unwrap_or_default()
    }

    /// Jacobian of the fixed-likelihood outputs.
    pub fn fix_likelihood_jacobian(&self, theta: &[f64]) -> Array2<f64> {
        match &self.fixed_likelihood {
            Some(recording) => tape_jacobian(recording.tape(), theta),
            None => Array2::zeros((0, theta.len())),
        }
    }

    /// Lower triangle of `∇² Σ_k weights[k]·v_k`.
    pub fn fix_likelihood_hessian(&self, theta: &[f64], weights: &[f64]) -> (SparsityPattern, Vec<f64>) {
        weighted_hessian(self.fixed_likelihood.as_ref(), theta, weights)
    }

    /// `g(θ) = v_0 + Σ_k |v_k|`, zero without a fixed likelihood.
    pub fn fixobj(&self, theta: &[f64]) -> f64 {
        let values = self.fix_likelihood_values(theta);
        match values.split_first() {
            Some((smooth, rest)) => smooth + rest.iter().map(|v| v.abs()).sum::<f64>(),
            None => 0.0,
        }
    }

    /// Gradient of `g` where it is differentiable; at a kink the sign of zero is taken as zero.
    pub fn fixobj_gradient(&self, theta: &[f64]) -> Vec<f64> {
        let Some(recording) = &self.fixed_likelihood else {
            return vec![0.0; theta.len()];
        };
        let weights = self.fixobj_weights(theta);
        recording.tape().gradient(theta, &weights).1
    }

    fn fixobj_weights(&self, theta: &[f64]) -> Vec<f64> {
        self.fix_likelihood_values(theta)
            .iter()
            .enumerate()
            .map(|(k, &v)| if k == 0 { 1.0 } else { sign(v) })
            .collect()
    }

    pub fn constraint_values(&self, theta: &[f64]) -> Vec<f64> {
        self.constraint
            .as_ref()
            .map(|r| r.tape().eval(theta))
            .unwrap_or_default()
    }

    pub fn constraint_jacobian(&self, theta: &[f64]) -> Array2<f64> {
        match &self.constraint {
            Some(recording) => tape_jacobian(recording.tape(), theta),
            None => Array2::zeros((0, theta.len())),
        }
    }

    /// Lower triangle of `∇² Σ_k weights[k]·c_k`.
    pub fn constraint_hessian(&self, theta: &[f64], weights: &[f64]) -> (SparsityPattern, Vec<f64>) {
        weighted_hessian(self.constraint.as_ref(), theta, weights)
    }

    /// `L(θ)`, solving for `û(θ)` first.
    pub fn laplace_objective(&self, theta: &[f64]) -> Result<f64, InnerFailure> {
        let solution = self.random_solution(theta)?;
        let random = solution.random.to_vec();
        Ok(self.ranobj(theta, &random)? + self.fixobj(theta))
    }

    /// Gradient of `L(θ)` where `g` is differentiable.
    pub fn laplace_gradient(&self, theta: &[f64]) -> Result<Vec<f64>, InnerFailure> {
        let solution = self.random_solution(theta)?;
        let random = solution.random.to_vec();
        let mut gradient = self.ranobj_gradient(theta, &random)?;
        for (g, f) in gradient.iter_mut().zip(self.fixobj_gradient(theta)) {
            *g += f;
        }
        Ok(gradient)
    }

    fn set_random_box(&self, lower: &[f64], upper: &[f64]) {
        let mut bounds = self.random_box.borrow_mut();
        bounds.lower = lower.to_vec();
        bounds.upper = upper.to_vec();
        // Cached solutions belong to the previous box.
        self.solutions.borrow_mut().clear();
    }

    /// Compares the outer derivatives at the initial point with finite differences.
    pub fn derivative_test(&self, problem: &FitProblem) -> Result<Vec<DerivativeMismatch>, EstimationError> {
        problem.validate(self.layout, self.n_constraints())?;
        self.set_random_box(&problem.random_lower, &problem.random_upper);
        let outer = OuterOptimizer::new(self, problem);
        let x0 = outer.initial_point(&problem.fixed_init);
        let tolerance = self.options.derivative_tolerance;
        let initial = |failure: EvalFailure| EstimationError::InitialPoint(failure);

        let gradient = outer.gradient(&x0).map_err(initial)?;
        let mut mismatches =
            finite_diff::check_gradient(|x| outer.objective(x), &gradient, &x0, tolerance).map_err(initial)?;
        if self.options.derivative_test == DerivativeTest::SecondOrder {
            let multipliers = vec![0.0; outer.constraint_bounds().0.len()];
            let hessian = outer.lagrangian_hessian(&x0, 1.0, &multipliers).map_err(initial)?;
            mismatches.extend(
                finite_diff::check_hessian(|x| outer.gradient(x), &hessian, &x0, tolerance).map_err(initial)?,
            );
        }
        Ok(mismatches)
    }

    /// Estimates the fixed effects; û is re-optimized for every trial θ.
    pub fn optimize_fixed(&self, problem: &FitProblem) -> Result<FitResult, EstimationError> {
        problem.validate(self.layout, self.n_constraints())?;
        self.set_random_box(&problem.random_lower, &problem.random_upper);
        *self.warm_start.borrow_mut() = problem.random_init.clone();

        if self.options.derivative_test != DerivativeTest::None {
            let mismatches = self.derivative_test(problem)?;
            if mismatches.is_empty() {
                log::info!("Derivative test passed at the initial fixed effects.");
            }
            for mismatch in &mismatches {
                log::warn!("Derivative test: {mismatch}");
            }
        }

        let approximation = self.options.hessian_approximation();
        let settings = NlpSettings::from_options(&self.options.fixed, approximation);
        let outer = OuterOptimizer::new(self, problem);
        let x0 = outer.initial_point(&problem.fixed_init);
        let solution = solve_nlp(&outer, &x0, &settings).map_err(|failure| match failure {
            EvalFailure::Inner(source) => EstimationError::RandomEffects {
                stage: "initial fixed effects",
                source,
            },
            other => EstimationError::InitialPoint(other),
        })?;
        match solution.status {
            SolverStatus::Converged => {}
            SolverStatus::NotConverged => log::warn!(
                "Fixed-effects optimization did not converge after {} iterations; returning the best iterate.",
                solution.iterations
            ),
            SolverStatus::Infeasible => log::warn!(
                "Constraints are violated by {:.3e} at the best iterate after {} penalty rounds.",
                solution.max_violation,
                solution.penalty_rounds
            ),
        }
        if approximation == HessianApproximation::Exact {
            log::debug!("Exact fixed-effects Hessians were used.");
        }

        let theta = solution.x[..self.layout.n_fixed].to_vec();
        let inner = self
            .random_solution(&theta)
            .map_err(|source| EstimationError::RandomEffects {
                stage: "estimated fixed effects",
                source,
            })?;
        let random = inner.random.to_vec();
        let objective = self
            .ranobj(&theta, &random)
            .map_err(|source| EstimationError::RandomEffects {
                stage: "estimated fixed effects",
                source,
            })?
            + self.fixobj(&theta);

        Ok(FitResult {
            fixed: FixedEffects::new(Array1::from(theta)),
            random: inner.random,
            objective,
            status: solution.status,
            iterations: solution.iterations,
            max_constraint_violation: solution.max_violation,
        })
    }
}

fn weighted_hessian(recording: Option<&Recording>, x: &[f64], weights: &[f64]) -> (SparsityPattern, Vec<f64>) {
    match recording {
        Some(recording) => {
            let block = recording.hessian(HessianBlock::FixedFixed);
            let values = block.evaluate(recording.tape(), x, weights);
            (block.pattern().clone(), values)
        }
        None => (SparsityPattern::default(), Vec::new()),
    }
}

/// Records `model` and estimates its fixed effects.
pub fn fit<M: MixedModel>(model: M, problem: &FitProblem, options: &FitOptions) -> Result<FitResult, EstimationError> {
    let engine = MixedEngine::new(model, &problem.fixed_init, &problem.random_init, options.clone())?;
    engine.optimize_fixed(problem)
}

/// Fits independent models in parallel, one private engine per model.
pub fn fit_replicates<M>(
    models: Vec<M>,
    problem: &FitProblem,
    options: &FitOptions,
) -> Vec<Result<FitResult, EstimationError>>
where
    M: MixedModel + Send,
{
    log::info!("Fitting {} replicates in parallel.", models.len());
    models
        .into_par_iter()
        .map(|model| fit(model, problem, options))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::Scalar;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    /// `f = (u − θ)² + u²` with a Gaussian prior of mean 2 on θ.
    struct Toy {
        prior: bool,
    }

    impl MixedModel for Toy {
        fn n_fixed(&self) -> usize {
            1
        }
        fn n_random(&self) -> usize {
            1
        }
        fn ran_likelihood<T: Scalar>(&self, fixed: &[T], random: &[T]) -> Vec<T> {
            let d = random[0] - fixed[0];
            vec![d * d + random[0] * random[0]]
        }
        fn fix_likelihood<T: Scalar>(&self, fixed: &[T]) -> Vec<T> {
            if self.prior {
                let r = fixed[0] - 2.0;
                vec![r * r * 0.5]
            } else {
                Vec::new()
            }
        }
    }

    fn constant() -> f64 {
        0.5 * 4.0f64.ln() - 0.5 * (2.0 * PI).ln()
    }

    #[test]
    fn laplace_objective_of_the_quadratic_model() {
        let engine = MixedEngine::new(Toy { prior: false }, &[0.0], &[0.0], FitOptions::default()).unwrap();
        let theta = [1.3];
        let solution = engine.random_solution(&theta).unwrap();
        assert_relative_eq!(solution.random[0], 0.65, epsilon = 1e-10);
        assert_relative_eq!(
            engine.laplace_objective(&theta).unwrap(),
            theta[0] * theta[0] / 2.0 + constant(),
            epsilon = 1e-10
        );
        assert_relative_eq!(engine.laplace_gradient(&theta).unwrap()[0], 1.3, epsilon = 1e-9);
        let du = engine.implicit_derivative(&theta, &[0.65], 0).unwrap();
        assert_relative_eq!(du[0], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn quadratic_model_fit_balances_prior_and_likelihood() {
        // L(θ) = θ²/2 + (θ − 2)²/2 + const is minimized at θ = 1.
        let problem = FitProblem::unbounded(vec![0.0], vec![0.0]);
        for quasi_fixed in [true, false] {
            let options = FitOptions {
                quasi_fixed,
                ..FitOptions::default()
            };
            let result = fit(Toy { prior: true }, &problem, &options).unwrap();
            assert_eq!(result.status, SolverStatus::Converged);
            assert_relative_eq!(result.fixed[0], 1.0, epsilon = 1e-5);
            assert_relative_eq!(result.random[0], 0.5, epsilon = 1e-5);
            assert_relative_eq!(result.objective, 1.0 + constant(), epsilon = 1e-8);
        }
    }

    #[test]
    fn ranobj_hessian_is_recorded_once_and_reused() {
        let engine = MixedEngine::new(Toy { prior: false }, &[0.0], &[0.0], FitOptions::default()).unwrap();
        let (pattern, values) = engine.ranobj_hessian(&[1.0], &[0.5]).unwrap();
        assert_eq!(pattern.entries().collect::<Vec<_>>(), vec![(0, 0)]);
        assert_relative_eq!(values[0], 1.0, epsilon = 1e-10);
        let (_, again) = engine.ranobj_hessian(&[-3.0], &[-1.5]).unwrap();
        assert_relative_eq!(again[0], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn inner_solutions_are_cached_by_theta() {
        let engine = MixedEngine::new(Toy { prior: false }, &[0.0], &[0.0], FitOptions::default()).unwrap();
        let first = engine.random_solution(&[0.7]).unwrap();
        assert_eq!(engine.solutions.borrow().len(), 1);
        let second = engine.random_solution(&[0.7]).unwrap();
        assert_eq!(first.random, second.random);
        assert_eq!(engine.solutions.borrow().len(), 1);
        engine.random_solution(&[0.8]).unwrap();
        assert_eq!(engine.solutions.borrow().len(), 2);
        assert!(engine.solutions.borrow().contains_key(&FixedEffects::cache_key(&[0.8])));
        engine.random_solution(&[-0.0]).unwrap();
        engine.random_solution(&[0.0]).unwrap();
        assert_eq!(engine.solutions.borrow().len(), 4);
    }

    #[test]
    fn wrong_initial_sizes_are_configuration_errors() {
        let result = MixedEngine::new(Toy { prior: false }, &[0.0, 1.0], &[0.0], FitOptions::default());
        assert!(matches!(
            result,
            Err(EstimationError::Config(ConfigError::SizeMismatch { name: "fixed_init", .. }))
        ));
    }
}

//! Optimization of the random effects for fixed θ.
//!
//! Projected Newton iterations on `f(θ, ·)` inside a box. The Newton system is
//! the sparse `f_uu` from the level-2 recording, factored with the cached
//! symbolic plan. Rows and columns of random effects held at a bound are
//! replaced by identity rows so the sparsity pattern never changes.

use crate::cholesky::{CholeskyError, CholeskyFactor, SymbolicCholesky};
use crate::config::RandomOptions;
use crate::recorder::RandomRecordings;
use crate::types::RandomEffects;
use ndarray::Array1;
use std::sync::Arc;
use thiserror::Error;

/// Recoverable failures of the inner optimization and of the quantities
/// evaluated at its solution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InnerFailure {
    #[error("Non-finite {quantity} at inner iteration {iteration}.")]
    NonFinite {
        quantity: &'static str,
        iteration: usize,
    },

    #[error("The random-effects Hessian is not positive definite: {0}")]
    NotPositiveDefinite(#[from] CholeskyError),

    #[error(
        "Line search failed at inner iteration {iteration}; projected gradient norm {gradient_norm:.3e}."
    )]
    LineSearchFailed { iteration: usize, gradient_norm: f64 },

    #[error(
        "Inner optimization did not converge in {max_iterations} iterations; projected gradient norm {gradient_norm:.3e}."
    )]
    MaxIterations {
        max_iterations: usize,
        gradient_norm: f64,
    },
}

/// Where the inner optimizer is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InnerState {
    Uninitialized,
    Iterating { iteration: usize },
    Converged { iterations: usize },
    Failed,
}

/// The optimal random effects û(θ) and the likelihood there.
#[derive(Clone, Debug)]
pub struct InnerSolution {
    pub random: RandomEffects,
    pub objective: f64,
    pub iterations: usize,
    /// Random effects that finished on a bound.
    pub active_bounds: Vec<usize>,
}

const ARMIJO: f64 = 1e-4;
const MAX_HALVINGS: usize = 40;
const MAX_SHIFTS: i32 = 10;

pub struct InnerOptimizer<'a> {
    recordings: &'a RandomRecordings,
    symbolic: Option<&'a Arc<SymbolicCholesky>>,
    options: &'a RandomOptions,
    diagonal: Vec<usize>,
    state: InnerState,
}

impl<'a> InnerOptimizer<'a> {
    /// `symbolic` must be the plan of the level-2 Hessian pattern whenever
    /// there are random effects.
    pub fn new(
        recordings: &'a RandomRecordings,
        symbolic: Option<&'a Arc<SymbolicCholesky>>,
        options: &'a RandomOptions,
    ) -> Self {
        let diagonal = recordings
            .hessian()
            .map(|h| {
                h.pattern()
                    .entries()
                    .enumerate()
                    .filter(|(_, (r, c))| r == c)
                    .map(|(k, _)| k)
                    .collect()
            })
            .unwrap_or_default();
        Self {
            recordings,
            symbolic,
            options,
            diagonal,
            state: InnerState::Uninitialized,
        }
    }

    pub fn state(&self) -> InnerState {
        self.state
    }

    /// Minimizes `f(θ, u)` over `lower <= u <= upper` starting from `initial`.
    pub fn solve(
        &mut self,
        theta: &[f64],
        lower: &[f64],
        upper: &[f64],
        initial: &[f64],
        tolerance: f64,
    ) -> Result<InnerSolution, InnerFailure> {
        let result = self.iterate(theta, lower, upper, initial, tolerance);
        match &result {
            Ok(solution) => {
                self.state = InnerState::Converged {
                    iterations: solution.iterations,
                };
                if !solution.active_bounds.is_empty() {
                    log::warn!(
                        "{} random effect(s) are at a bound at the inner optimum (first: {}); derivatives of û(θ) assume inactive bounds and are approximate.",
                        solution.active_bounds.len(),
                        solution.active_bounds[0]
                    );
                }
            }
            Err(failure) => {
                self.state = InnerState::Failed;
                log::debug!("Inner optimization failed: {failure}");
            }
        }
        result
    }

    fn iterate(
        &mut self,
        theta: &[f64],
        lower: &[f64],
        upper: &[f64],
        initial: &[f64],
        tolerance: f64,
    ) -> Result<InnerSolution, InnerFailure> {
        let layout = self.recordings.layout();
        let n = layout.n_random;
        assert_eq!(lower.len(), n, "random lower bounds have the wrong length");
        assert_eq!(upper.len(), n, "random upper bounds have the wrong length");
        assert_eq!(initial.len(), n, "initial random effects have the wrong length");

        let mut u: Vec<f64> = initial
            .iter()
            .zip(lower.iter().zip(upper))
            .map(|(&v, (&lo, &hi))| v.clamp(lo, hi))
            .collect();

        let (symbolic, hessian_recording) = match (self.symbolic, self.recordings.hessian()) {
            (Some(symbolic), Some(hessian)) if n > 0 => (symbolic, hessian),
            _ => {
                let objective = self.recordings.value(theta, &u);
                if !objective.is_finite() {
                    return Err(InnerFailure::NonFinite {
                        quantity: "objective",
                        iteration: 0,
                    });
                }
                return Ok(InnerSolution {
                    random: RandomEffects::new(Array1::from(u)),
                    objective,
                    iterations: 0,
                    active_bounds: Vec::new(),
                });
            }
        };
        let pattern = hessian_recording.pattern();

        let mut gradient_norm = f64::INFINITY;
        for iteration in 0..self.options.max_iterations {
            self.state = InnerState::Iterating { iteration };
            let (objective, packed_gradient) = self.recordings.gradient(theta, &u);
            let g = &packed_gradient[layout.n_fixed..];
            if !objective.is_finite() {
                return Err(InnerFailure::NonFinite {
                    quantity: "objective",
                    iteration,
                });
            }
            if g.iter().any(|v| !v.is_finite()) {
                return Err(InnerFailure::NonFinite {
                    quantity: "gradient",
                    iteration,
                });
            }

            let held: Vec<bool> = (0..n)
                .map(|i| {
                    lower[i] == upper[i]
                        || (u[i] <= lower[i] && g[i] > 0.0)
                        || (u[i] >= upper[i] && g[i] < 0.0)
                })
                .collect();
            gradient_norm = (0..n)
                .filter(|&i| !held[i])
                .map(|i| g[i].abs())
                .fold(0.0, f64::max);
            log::debug!(
                "Inner iteration {iteration}: f = {objective:.10e}, |projected gradient| = {gradient_norm:.3e}"
            );
            if gradient_norm <= tolerance {
                return Ok(Self::finish(u, lower, upper, objective, iteration));
            }

            let mut values = self.recordings.random_hessian(theta, &u);
            if values.iter().any(|v| !v.is_finite()) {
                return Err(InnerFailure::NonFinite {
                    quantity: "Hessian",
                    iteration,
                });
            }
            for (k, (r, c)) in pattern.entries().enumerate() {
                if held[r] || held[c] {
                    values[k] = if r == c { 1.0 } else { 0.0 };
                }
            }
            let rhs: Vec<f64> = (0..n).map(|i| if held[i] { 0.0 } else { -g[i] }).collect();

            let factor = self.factor_with_shifts(symbolic, &values, &held, iteration)?;
            let step = factor.solve(&rhs);
            if step.iter().any(|v| !v.is_finite()) {
                return Err(InnerFailure::NonFinite {
                    quantity: "Newton step",
                    iteration,
                });
            }

            let predicted: f64 = g.iter().zip(&step).map(|(a, b)| a * b).sum();
            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_HALVINGS {
                let trial: Vec<f64> = (0..n)
                    .map(|i| (u[i] + alpha * step[i]).clamp(lower[i], upper[i]))
                    .collect();
                let value = self.recordings.value(theta, &trial);
                let decrease: f64 = (0..n).map(|i| g[i] * (trial[i] - u[i])).sum();
                if value.is_finite() && value <= objective + ARMIJO * decrease {
                    accepted = Some(trial);
                    break;
                }
                alpha *= 0.5;
            }

            let Some(trial) = accepted else {
                // At the floating-point floor no step can decrease f any further.
                if -predicted <= 1e-12 * (1.0 + objective.abs()) {
                    return Ok(Self::finish(u, lower, upper, objective, iteration));
                }
                return Err(InnerFailure::LineSearchFailed {
                    iteration,
                    gradient_norm,
                });
            };
            let moved = (0..n).map(|i| (trial[i] - u[i]).abs()).fold(0.0, f64::max);
            let scale = u.iter().map(|v| v.abs()).fold(1.0, f64::max);
            u = trial;
            if moved <= 1e-15 * scale {
                let objective = self.recordings.value(theta, &u);
                return Ok(Self::finish(u, lower, upper, objective, iteration + 1));
            }
        }

        Err(InnerFailure::MaxIterations {
            max_iterations: self.options.max_iterations,
            gradient_norm,
        })
    }

    fn factor_with_shifts(
        &self,
        symbolic: &Arc<SymbolicCholesky>,
        values: &[f64],
        held: &[bool],
        iteration: usize,
    ) -> Result<CholeskyFactor, InnerFailure> {
        let first = match CholeskyFactor::factorize(Arc::clone(symbolic), values) {
            Ok(factor) => return Ok(factor),
            Err(err) => err,
        };
        let scale = self
            .diagonal
            .iter()
            .map(|&k| values[k].abs())
            .fold(1.0, f64::max);
        let pattern = self.recordings.hessian().map(|h| h.pattern());
        let mut shifted = values.to_vec();
        for power in 0..=MAX_SHIFTS {
            let shift = 1e-8 * scale * 10f64.powi(power);
            for &k in &self.diagonal {
                let free = pattern.is_some_and(|p| !held[p.rows[k]]);
                shifted[k] = if free { values[k] + shift } else { values[k] };
            }
            if let Ok(factor) = CholeskyFactor::factorize(Arc::clone(symbolic), &shifted) {
                log::warn!(
                    "Random-effects Hessian is not positive definite at inner iteration {iteration}; added diagonal shift {shift:.2e}."
                );
                return Ok(factor);
            }
        }
        Err(InnerFailure::NotPositiveDefinite(first))
    }

    fn finish(
        u: Vec<f64>,
        lower: &[f64],
        upper: &[f64],
        objective: f64,
        iterations: usize,
    ) -> InnerSolution {
        let active_bounds = (0..u.len())
            .filter(|&i| lower[i] < upper[i] && (u[i] <= lower[i] || u[i] >= upper[i]))
            .collect();
        InnerSolution {
            random: RandomEffects::new(Array1::from(u)),
            objective,
            iterations,
            active_bounds,
        }
    }
}

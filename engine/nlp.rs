//! Bound- and constraint-aware minimization of a smooth objective.
//!
//! The problem is described by the callbacks of [`NlpProblem`]. Variable
//! bounds are honored exactly: the quasi-Newton strategy runs `wolfe_bfgs` on
//! transformed variables that cannot leave the box, and the exact strategy
//! projects its Newton steps. General constraints `c_lo <= c(x) <= c_hi` are
//! handled by quadratic-penalty rounds of increasing weight.

use crate::config::{FixedOptions, HessianApproximation};
use crate::faer_ndarray::{FaerCholesky, FaerEigh, FaerLinalgError};
use crate::inner::InnerFailure;
use faer::Side;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use thiserror::Error;
use wolfe_bfgs::Bfgs;

/// A trial point the problem could not evaluate. The solver rejects the point
/// and keeps going.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalFailure {
    #[error(transparent)]
    Inner(#[from] InnerFailure),

    #[error("Non-finite {quantity} at the trial point.")]
    NonFinite { quantity: &'static str },
}

/// The callbacks of a constrained nonlinear program.
pub trait NlpProblem {
    fn n_variables(&self) -> usize;

    /// `(lower, upper)` for every variable; equal bounds fix the variable.
    fn variable_bounds(&self) -> (&[f64], &[f64]);

    /// `(lower, upper)` for every constraint function.
    fn constraint_bounds(&self) -> (&[f64], &[f64]);

    fn objective(&self, x: &[f64]) -> Result<f64, EvalFailure>;

    fn gradient(&self, x: &[f64]) -> Result<Vec<f64>, EvalFailure>;

    fn constraints(&self, x: &[f64]) -> Result<Vec<f64>, EvalFailure>;

    /// Dense `n_constraints × n_variables` Jacobian.
    fn constraint_jacobian(&self, x: &[f64]) -> Result<Array2<f64>, EvalFailure>;

    /// Full symmetric `σ ∇²F(x) + Σ_k λ_k ∇²c_k(x)`.
    fn lagrangian_hessian(
        &self,
        x: &[f64],
        objective_factor: f64,
        multipliers: &[f64],
    ) -> Result<Array2<f64>, EvalFailure>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolverStatus {
    Converged,
    NotConverged,
    Infeasible,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NlpSettings {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub hessian: HessianApproximation,
    pub constraint_tolerance: f64,
    pub max_penalty_rounds: usize,
    pub initial_penalty: f64,
}

impl NlpSettings {
    pub fn from_options(options: &FixedOptions, hessian: HessianApproximation) -> Self {
        Self {
            tolerance: options.tolerance,
            max_iterations: options.max_iterations,
            hessian,
            constraint_tolerance: options.constraint_tolerance,
            max_penalty_rounds: options.max_penalty_rounds,
            initial_penalty: options.initial_penalty,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NlpSolution {
    pub x: Vec<f64>,
    /// Objective without any penalty.
    pub objective: f64,
    pub status: SolverStatus,
    /// Iterations summed over all penalty rounds.
    pub iterations: usize,
    pub penalty_rounds: usize,
    pub max_violation: f64,
}

/// A penalty round that keeps more than this share of the previous violation
/// ends the rounds; a larger weight would only worsen the conditioning.
const PENALTY_STALL_RATIO: f64 = 0.9;

/// Result of one bound-constrained minimization.
struct RoundResult {
    x: Vec<f64>,
    converged: bool,
    iterations: usize,
}

fn constraint_violations(values: &[f64], lower: &[f64], upper: &[f64]) -> Vec<f64> {
    values
        .iter()
        .zip(lower.iter().zip(upper))
        .map(|(&c, (&lo, &hi))| if c < lo { c - lo } else if c > hi { c - hi } else { 0.0 })
        .collect()
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().map(|v| v.abs()).fold(0.0, f64::max)
}

/// `F(x) + (μ/2) Σ_k viol_k(x)²`, where `viol_k` is the distance of `c_k(x)`
/// from its interval.
struct Penalized<'a, P: NlpProblem> {
    problem: &'a P,
    weight: f64,
}

impl<P: NlpProblem> Penalized<'_, P> {
    fn has_constraints(&self) -> bool {
        !self.problem.constraint_bounds().0.is_empty()
    }

    fn violations(&self, x: &[f64]) -> Result<Vec<f64>, EvalFailure> {
        let (lower, upper) = self.problem.constraint_bounds();
        Ok(constraint_violations(&self.problem.constraints(x)?, lower, upper))
    }

    fn value(&self, x: &[f64]) -> Result<f64, EvalFailure> {
        let mut value = self.problem.objective(x)?;
        if self.has_constraints() {
            let violations = self.violations(x)?;
            value += 0.5 * self.weight * violations.iter().map(|v| v * v).sum::<f64>();
        }
        if !value.is_finite() {
            return Err(EvalFailure::NonFinite { quantity: "objective" });
        }
        Ok(value)
    }

    fn value_and_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), EvalFailure> {
        let value = self.value(x)?;
        let mut gradient = self.problem.gradient(x)?;
        if self.has_constraints() {
            let violations = self.violations(x)?;
            if violations.iter().any(|&v| v != 0.0) {
                let jacobian = self.problem.constraint_jacobian(x)?;
                for (k, &v) in violations.iter().enumerate() {
                    if v == 0.0 {
                        continue;
                    }
                    for (g, &d) in gradient.iter_mut().zip(jacobian.row(k)) {
                        *g += self.weight * v * d;
                    }
                }
            }
        }
        if gradient.iter().any(|g| !g.is_finite()) {
            return Err(EvalFailure::NonFinite { quantity: "gradient" });
        }
        Ok((value, gradient))
    }

    fn hessian(&self, x: &[f64]) -> Result<Array2<f64>, EvalFailure> {
        let violations = if self.has_constraints() {
            self.violations(x)?
        } else {
            Vec::new()
        };
        let multipliers: Vec<f64> = violations.iter().map(|v| self.weight * v).collect();
        let mut hessian = self.problem.lagrangian_hessian(x, 1.0, &multipliers)?;
        if violations.iter().any(|&v| v != 0.0) {
            let jacobian = self.problem.constraint_jacobian(x)?;
            for (k, &v) in violations.iter().enumerate() {
                if v == 0.0 {
                    continue;
                }
                let row = jacobian.row(k);
                for i in 0..row.len() {
                    for j in 0..row.len() {
                        hessian[(i, j)] += self.weight * row[i] * row[j];
                    }
                }
            }
        }
        if hessian.iter().any(|h| !h.is_finite()) {
            return Err(EvalFailure::NonFinite { quantity: "Hessian" });
        }
        Ok(hessian)
    }
}

/// Minimizes the problem from `x0`.
///
/// Returns an error only when the starting point itself cannot be evaluated.
pub fn solve_nlp<P: NlpProblem>(
    problem: &P,
    x0: &[f64],
    settings: &NlpSettings,
) -> Result<NlpSolution, EvalFailure> {
    let (lower, upper) = problem.variable_bounds();
    let mut x: Vec<f64> = x0
        .iter()
        .zip(lower.iter().zip(upper))
        .map(|(&v, (&lo, &hi))| v.clamp(lo, hi))
        .collect();
    let (c_lower, c_upper) = problem.constraint_bounds();
    let constrained = !c_lower.is_empty();

    let start = problem.objective(&x)?;
    if !start.is_finite() {
        return Err(EvalFailure::NonFinite { quantity: "objective" });
    }
    log::info!(
        "Starting {:?} minimization over {} variables with {} constraints; F(x0) = {start:.8e}",
        settings.hessian,
        problem.n_variables(),
        c_lower.len()
    );

    let rounds = if constrained {
        settings.max_penalty_rounds.max(1)
    } else {
        1
    };
    let mut iterations = 0;
    let mut converged = false;
    let mut max_violation = 0.0;
    let mut previous_violation = f64::INFINITY;
    let mut penalty_rounds = 0;
    for round in 0..rounds {
        let penalized = Penalized {
            problem,
            weight: settings.initial_penalty * 10f64.powi(round as i32),
        };
        let result = match settings.hessian {
            HessianApproximation::QuasiNewton => minimize_bfgs(&penalized, &x, lower, upper, settings),
            HessianApproximation::Exact => minimize_newton(&penalized, &x, lower, upper, settings),
        };
        iterations += result.iterations;
        penalty_rounds += 1;
        converged = result.converged;
        x = result.x;
        if !constrained {
            break;
        }
        max_violation = match problem.constraints(&x) {
            Ok(values) => max_abs(&constraint_violations(&values, c_lower, c_upper)),
            Err(_) => f64::INFINITY,
        };
        log::debug!(
            "Penalty round {round}: weight {:.1e}, max violation {max_violation:.3e}",
            penalized.weight
        );
        if max_violation <= settings.constraint_tolerance {
            break;
        }
        if max_violation > PENALTY_STALL_RATIO * previous_violation {
            log::warn!(
                "Penalty rounds stalled at weight {:.1e}: max violation {max_violation:.3e} after {previous_violation:.3e}; the penalized Hessian scales with the weight, so it is not raised further",
                penalized.weight
            );
            break;
        }
        previous_violation = max_violation;
    }

    let status = if constrained && !(max_violation <= settings.constraint_tolerance) {
        SolverStatus::Infeasible
    } else if converged {
        SolverStatus::Converged
    } else {
        SolverStatus::NotConverged
    };
    let objective = problem.objective(&x)?;
    log::info!("Minimization finished: {status:?} after {iterations} iterations, F = {objective:.8e}");
    Ok(NlpSolution {
        x,
        objective,
        status,
        iterations,
        penalty_rounds,
        max_violation,
    })
}

/// Smooth map from an unconstrained coordinate onto one variable's range.
#[derive(Clone, Copy, Debug)]
enum BoundTransform {
    Fixed(f64),
    Free,
    Lower(f64),
    Upper(f64),
    Interval(f64, f64),
}

impl BoundTransform {
    fn new(lower: f64, upper: f64) -> Self {
        match (lower.is_finite(), upper.is_finite()) {
            _ if lower == upper => BoundTransform::Fixed(lower),
            (true, true) => BoundTransform::Interval(lower, upper),
            (true, false) => BoundTransform::Lower(lower),
            (false, true) => BoundTransform::Upper(upper),
            (false, false) => BoundTransform::Free,
        }
    }

    /// `(x, dx/dz)`.
    fn forward(&self, z: f64) -> (f64, f64) {
        match *self {
            BoundTransform::Fixed(value) => (value, 0.0),
            BoundTransform::Free => (z, 1.0),
            BoundTransform::Lower(lo) => {
                let e = z.exp();
                (lo + e, e)
            }
            BoundTransform::Upper(hi) => {
                let e = z.exp();
                (hi - e, -e)
            }
            BoundTransform::Interval(lo, hi) => {
                let s = 1.0 / (1.0 + (-z).exp());
                ((lo + (hi - lo) * s).clamp(lo, hi), (hi - lo) * s * (1.0 - s))
            }
        }
    }

    fn inverse(&self, x: f64) -> f64 {
        match *self {
            BoundTransform::Fixed(_) => 0.0,
            BoundTransform::Free => x,
            BoundTransform::Lower(lo) => (x - lo).max(1e-8 * (1.0 + lo.abs())).ln(),
            BoundTransform::Upper(hi) => (hi - x).max(1e-8 * (1.0 + hi.abs())).ln(),
            BoundTransform::Interval(lo, hi) => {
                let t = ((x - lo) / (hi - lo)).clamp(1e-8, 1.0 - 1e-8);
                (t / (1.0 - t)).ln()
            }
        }
    }

    fn is_fixed(&self) -> bool {
        matches!(self, BoundTransform::Fixed(_))
    }
}

// Finite stand-in for a trial point that could not be evaluated.
const FAILED_COST: f64 = 1e50;

fn minimize_bfgs<P: NlpProblem>(
    penalized: &Penalized<'_, P>,
    x0: &[f64],
    lower: &[f64],
    upper: &[f64],
    settings: &NlpSettings,
) -> RoundResult {
    let transforms: Vec<BoundTransform> = lower
        .iter()
        .zip(upper)
        .map(|(&lo, &hi)| BoundTransform::new(lo, hi))
        .collect();
    let free: Vec<usize> = (0..transforms.len()).filter(|&i| !transforms[i].is_fixed()).collect();
    let to_x = |z: &Array1<f64>| -> (Vec<f64>, Vec<f64>) {
        let mut x = x0.to_vec();
        let mut jacobian = vec![0.0; x0.len()];
        for (i, t) in transforms.iter().enumerate() {
            if let BoundTransform::Fixed(value) = t {
                x[i] = *value;
            }
        }
        for (k, &i) in free.iter().enumerate() {
            let (xi, dxi) = transforms[i].forward(z[k]);
            x[i] = xi;
            jacobian[i] = dxi;
        }
        (x, jacobian)
    };
    let z0 = Array1::from_iter(free.iter().map(|&i| transforms[i].inverse(x0[i])));
    if free.is_empty() {
        let (x, _) = to_x(&z0);
        return RoundResult {
            x,
            converged: true,
            iterations: 0,
        };
    }

    let best: RefCell<Option<(f64, Vec<f64>)>> = RefCell::new(None);
    let evaluations = Cell::new(0usize);
    let cost_and_grad = |z: &Array1<f64>| -> (f64, Array1<f64>) {
        evaluations.set(evaluations.get() + 1);
        let (x, jacobian) = to_x(z);
        match penalized.value_and_gradient(&x) {
            Ok((value, gradient)) => {
                let mut record = best.borrow_mut();
                if record.as_ref().is_none_or(|(v, _)| value < *v) {
                    *record = Some((value, x.clone()));
                }
                let gz = Array1::from_iter(free.iter().map(|&i| gradient[i] * jacobian[i]));
                (value, gz)
            }
            Err(failure) => {
                log::debug!("Rejected trial point: {failure}");
                let gz = z.mapv(|v| if v.abs() < 1e-6 { 1.0 } else { v });
                (FAILED_COST + 0.5 * z.dot(z), gz)
            }
        }
    };

    let outcome = Bfgs::new(z0, cost_and_grad)
        .with_tolerance(settings.tolerance)
        .with_max_iterations(settings.max_iterations)
        .run();
    let fallback = || best.borrow().as_ref().map(|(_, x)| x.clone()).unwrap_or_else(|| x0.to_vec());
    match outcome {
        Ok(solution) => {
            let (x, _) = to_x(&solution.final_point);
            log::debug!(
                "BFGS converged in {} iterations, |g| = {:.3e}",
                solution.iterations,
                solution.final_gradient_norm
            );
            RoundResult {
                x,
                converged: true,
                iterations: solution.iterations,
            }
        }
        Err(err) => {
            log::debug!("BFGS stopped early: {err}");
            let x = fallback();
            let converged = penalized
                .value_and_gradient(&x)
                .map(|(_, g)| projected_gradient_norm(&x, &g, lower, upper) <= settings.tolerance)
                .unwrap_or(false);
            RoundResult {
                x,
                converged,
                iterations: evaluations.get().min(settings.max_iterations),
            }
        }
    }
}

fn held_at_bound(x: f64, g: f64, lo: f64, hi: f64) -> bool {
    lo == hi || (x <= lo && g > 0.0) || (x >= hi && g < 0.0)
}

fn projected_gradient_norm(x: &[f64], g: &[f64], lower: &[f64], upper: &[f64]) -> f64 {
    (0..x.len())
        .filter(|&i| !held_at_bound(x[i], g[i], lower[i], upper[i]))
        .map(|i| g[i].abs())
        .fold(0.0, f64::max)
}

const ARMIJO: f64 = 1e-4;
const MAX_HALVINGS: usize = 40;
const MAX_SHIFTS: usize = 12;

/// Newton direction on the free variables, shifted towards steepest descent
/// until the reduced Hessian is positive definite.
fn newton_direction(hessian: &Array2<f64>, gradient: &[f64], held: &[bool]) -> Result<Vec<f64>, FaerLinalgError> {
    let free: Vec<usize> = (0..gradient.len()).filter(|&i| !held[i]).collect();
    let n = free.len();
    if n == 0 {
        return Ok(vec![0.0; gradient.len()]);
    }
    let reduced = Array2::from_shape_fn((n, n), |(a, b)| hessian[(free[a], free[b])]);
    let rhs = Array1::from_iter(free.iter().map(|&i| -gradient[i]));

    let factor = match reduced.cholesky(Side::Lower) {
        Ok(factor) => factor,
        Err(first) => {
            let smallest = reduced.eigenvalues(Side::Lower)?.iter().copied().fold(f64::INFINITY, f64::min);
            let scale = reduced.diag().iter().map(|d| d.abs()).fold(1.0, f64::max);
            let mut shift = (-smallest).max(0.0) + 1e-8 * scale;
            let mut found = None;
            for _ in 0..MAX_SHIFTS {
                let mut shifted = reduced.clone();
                shifted.diag_mut().mapv_inplace(|d| d + shift);
                if let Ok(factor) = shifted.cholesky(Side::Lower) {
                    log::debug!("Shifted the fixed-effects Hessian by {shift:.2e}");
                    found = Some(factor);
                    break;
                }
                shift *= 10.0;
            }
            match found {
                Some(factor) => factor,
                None => return Err(first),
            }
        }
    };
    let step = factor.solve_vec(&rhs);
    let mut direction = vec![0.0; gradient.len()];
    for (a, &i) in free.iter().enumerate() {
        direction[i] = step[a];
    }
    Ok(direction)
}

fn minimize_newton<P: NlpProblem>(
    penalized: &Penalized<'_, P>,
    x0: &[f64],
    lower: &[f64],
    upper: &[f64],
    settings: &NlpSettings,
) -> RoundResult {
    let n = x0.len();
    let mut x = x0.to_vec();
    let stop = |x: Vec<f64>, converged: bool, iterations: usize| RoundResult {
        x,
        converged,
        iterations,
    };

    for iteration in 0..settings.max_iterations {
        let (value, gradient) = match penalized.value_and_gradient(&x) {
            Ok(sample) => sample,
            Err(failure) => {
                log::warn!("Evaluation failed at the current iterate: {failure}");
                return stop(x, false, iteration);
            }
        };
        let held: Vec<bool> = (0..n)
            .map(|i| held_at_bound(x[i], gradient[i], lower[i], upper[i]))
            .collect();
        let gradient_norm = projected_gradient_norm(&x, &gradient, lower, upper);
        log::debug!("Newton iteration {iteration}: F = {value:.10e}, |projected g| = {gradient_norm:.3e}");
        if gradient_norm <= settings.tolerance {
            return stop(x, true, iteration);
        }

        let hessian = match penalized.hessian(&x) {
            Ok(hessian) => hessian,
            Err(failure) => {
                log::warn!("Hessian evaluation failed: {failure}");
                return stop(x, false, iteration);
            }
        };
        let direction = match newton_direction(&hessian, &gradient, &held) {
            Ok(direction) => direction,
            Err(err) => {
                log::warn!("No usable Newton direction: {err}");
                return stop(x, false, iteration);
            }
        };

        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            let trial: Vec<f64> = (0..n)
                .map(|i| (x[i] + alpha * direction[i]).clamp(lower[i], upper[i]))
                .collect();
            let decrease: f64 = (0..n).map(|i| gradient[i] * (trial[i] - x[i])).sum();
            if let Ok(trial_value) = penalized.value(&trial) {
                if trial_value <= value + ARMIJO * decrease {
                    accepted = Some(trial);
                    break;
                }
            }
            alpha *= 0.5;
        }
        match accepted {
            Some(trial) => x = trial,
            None => {
                let predicted: f64 = gradient.iter().zip(&direction).map(|(g, d)| g * d).sum();
                let floor = -predicted <= 1e-12 * (1.0 + value.abs());
                return stop(x, floor, iteration + 1);
            }
        }
    }
    let converged = penalized
        .value_and_gradient(&x)
        .map(|(_, g)| projected_gradient_norm(&x, &g, lower, upper) <= settings.tolerance)
        .unwrap_or(false);
    stop(x, converged, settings.max_iterations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    struct Rosenbrock {
        lower: Vec<f64>,
        upper: Vec<f64>,
        c_lower: Vec<f64>,
        c_upper: Vec<f64>,
        // Constraint x0 + x1, present when bounds are given.
        sum_constraint: bool,
        fail_beyond: Option<f64>,
    }

    impl Rosenbrock {
        fn unbounded() -> Self {
            Self {
                lower: vec![f64::NEG_INFINITY; 2],
                upper: vec![f64::INFINITY; 2],
                c_lower: Vec::new(),
                c_upper: Vec::new(),
                sum_constraint: false,
                fail_beyond: None,
            }
        }
    }

    impl NlpProblem for Rosenbrock {
        fn n_variables(&self) -> usize {
            2
        }
        fn variable_bounds(&self) -> (&[f64], &[f64]) {
            (&self.lower, &self.upper)
        }
        fn constraint_bounds(&self) -> (&[f64], &[f64]) {
            (&self.c_lower, &self.c_upper)
        }
        fn objective(&self, x: &[f64]) -> Result<f64, EvalFailure> {
            if self.fail_beyond.is_some_and(|limit| x[0] > limit) {
                return Err(EvalFailure::NonFinite { quantity: "objective" });
            }
            Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
        }
        fn gradient(&self, x: &[f64]) -> Result<Vec<f64>, EvalFailure> {
            Ok(vec![
                -2.0 * (1.0 - x[0]) - 400.0 * (x[1] - x[0] * x[0]) * x[0],
                200.0 * (x[1] - x[0] * x[0]),
            ])
        }
        fn constraints(&self, x: &[f64]) -> Result<Vec<f64>, EvalFailure> {
            Ok(if self.sum_constraint { vec![x[0] + x[1]] } else { Vec::new() })
        }
        fn constraint_jacobian(&self, _x: &[f64]) -> Result<Array2<f64>, EvalFailure> {
            Ok(if self.sum_constraint {
                array![[1.0, 1.0]]
            } else {
                Array2::zeros((0, 2))
            })
        }
        fn lagrangian_hessian(&self, x: &[f64], sigma: f64, _multipliers: &[f64]) -> Result<Array2<f64>, EvalFailure> {
            let h = array![
                [2.0 - 400.0 * (x[1] - 3.0 * x[0] * x[0]), -400.0 * x[0]],
                [-400.0 * x[0], 200.0]
            ];
            Ok(h * sigma)
        }
    }

    fn settings(hessian: HessianApproximation) -> NlpSettings {
        NlpSettings {
            tolerance: 1e-8,
            max_iterations: 500,
            hessian,
            constraint_tolerance: 1e-6,
            max_penalty_rounds: 10,
            initial_penalty: 10.0,
        }
    }

    #[test]
    fn both_strategies_find_the_unconstrained_minimum() {
        for hessian in [HessianApproximation::QuasiNewton, HessianApproximation::Exact] {
            let solution = solve_nlp(&Rosenbrock::unbounded(), &[-1.2, 1.0], &settings(hessian)).unwrap();
            assert_eq!(solution.status, SolverStatus::Converged, "{hessian:?}");
            assert_relative_eq!(solution.x[0], 1.0, epsilon = 1e-4);
            assert_relative_eq!(solution.x[1], 1.0, epsilon = 1e-4);
            assert_eq!(solution.max_violation, 0.0);
        }
    }

    #[test]
    fn active_upper_bound_is_respected() {
        let mut problem = Rosenbrock::unbounded();
        problem.upper = vec![0.5, f64::INFINITY];
        for hessian in [HessianApproximation::QuasiNewton, HessianApproximation::Exact] {
            let solution = solve_nlp(&problem, &[0.0, 0.0], &settings(hessian)).unwrap();
            assert!(solution.x[0] <= 0.5);
            assert_relative_eq!(solution.x[0], 0.5, epsilon = 1e-4);
            assert_relative_eq!(solution.x[1], 0.25, epsilon = 1e-3);
        }
    }

    #[test]
    fn equal_bounds_fix_a_variable() {
        let mut problem = Rosenbrock::unbounded();
        problem.lower = vec![0.3, f64::NEG_INFINITY];
        problem.upper = vec![0.3, f64::INFINITY];
        for hessian in [HessianApproximation::QuasiNewton, HessianApproximation::Exact] {
            let solution = solve_nlp(&problem, &[0.0, 0.0], &settings(hessian)).unwrap();
            assert_eq!(solution.x[0], 0.3);
            assert_relative_eq!(solution.x[1], 0.09, epsilon = 1e-5);
        }
    }

    #[test]
    fn equality_constraint_is_met_by_penalty_rounds() {
        let mut problem = Rosenbrock::unbounded();
        problem.sum_constraint = true;
        problem.c_lower = vec![1.0];
        problem.c_upper = vec![1.0];
        let solution = solve_nlp(&problem, &[0.0, 0.0], &settings(HessianApproximation::Exact)).unwrap();
        assert_eq!(solution.status, SolverStatus::Converged);
        assert!(solution.penalty_rounds > 1);
        assert!(solution.max_violation <= 1e-6);
        assert_relative_eq!(solution.x[0] + solution.x[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn unreachable_constraint_is_reported_infeasible() {
        let mut problem = Rosenbrock::unbounded();
        problem.sum_constraint = true;
        problem.lower = vec![0.0, 0.0];
        problem.upper = vec![1.0, 1.0];
        problem.c_lower = vec![3.0];
        problem.c_upper = vec![4.0];
        let mut options = settings(HessianApproximation::Exact);
        options.max_penalty_rounds = 3;
        let solution = solve_nlp(&problem, &[0.5, 0.5], &options).unwrap();
        assert_eq!(solution.status, SolverStatus::Infeasible);
        assert!(solution.max_violation > 0.5);
    }

    #[test]
    fn penalty_weight_stops_growing_once_the_violation_stalls() {
        // The box keeps x0 + x1 ≤ 2, so the violation of [3, 4] cannot drop below 1.
        let mut problem = Rosenbrock::unbounded();
        problem.sum_constraint = true;
        problem.lower = vec![0.0, 0.0];
        problem.upper = vec![1.0, 1.0];
        problem.c_lower = vec![3.0];
        problem.c_upper = vec![4.0];
        let mut options = settings(HessianApproximation::Exact);
        options.max_penalty_rounds = 10;
        let solution = solve_nlp(&problem, &[0.5, 0.5], &options).unwrap();
        assert_eq!(solution.status, SolverStatus::Infeasible);
        assert!(solution.penalty_rounds < 10, "ran {} rounds", solution.penalty_rounds);
        assert_relative_eq!(solution.max_violation, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn failed_trial_points_are_rejected_not_fatal() {
        let mut problem = Rosenbrock::unbounded();
        problem.fail_beyond = Some(0.8);
        for hessian in [HessianApproximation::QuasiNewton, HessianApproximation::Exact] {
            let solution = solve_nlp(&problem, &[-1.2, 1.0], &settings(hessian)).unwrap();
            assert!(solution.x[0] <= 0.8);
            assert!(solution.objective.is_finite());
        }

        problem.fail_beyond = Some(-2.0);
        assert!(solve_nlp(&problem, &[-1.2, 1.0], &settings(HessianApproximation::Exact)).is_err());
    }

    #[test]
    fn bound_transforms_round_trip_inside_the_box() {
        for (lo, hi, x) in [(0.0, 1.0, 0.25), (2.0, f64::INFINITY, 5.0), (f64::NEG_INFINITY, -1.0, -3.0)] {
            let transform = BoundTransform::new(lo, hi);
            let (back, slope) = transform.forward(transform.inverse(x));
            assert_relative_eq!(back, x, epsilon = 1e-12);
            assert!(slope != 0.0);
        }
        assert!(BoundTransform::new(1.0, 1.0).is_fixed());
    }
}

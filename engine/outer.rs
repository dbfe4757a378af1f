//! The fixed-effects problem as seen by the NLP solver.
//!
//! The absolute-value terms of `g(θ) = v_0 + Σ_k |v_k|` are smoothed out by
//! auxiliary variables: the solver works on `(θ, ξ)` with objective
//! `L_ran(θ) + v_0(θ) + Σ_k ξ_k` and the extra constraints
//! `ξ_k − v_k(θ) >= 0` and `ξ_k + v_k(θ) >= 0`, which hold with equality
//! `ξ_k = |v_k|` at the optimum.

use crate::config::FitProblem;
use crate::estimate::{EstimationError, MixedEngine};
use crate::hes_fix::FixedHessianError;
use crate::model::MixedModel;
use crate::nlp::{EvalFailure, NlpProblem};
use crate::sparsity::SparsityPattern;
use ndarray::Array2;

pub struct OuterOptimizer<'a, M: MixedModel> {
    engine: &'a MixedEngine<M>,
    n_fixed: usize,
    n_abs: usize,
    lower: Vec<f64>,
    upper: Vec<f64>,
    c_lower: Vec<f64>,
    c_upper: Vec<f64>,
}

fn add_lower_triangle(target: &mut Array2<f64>, pattern: &SparsityPattern, values: &[f64], scale: f64) {
    for ((r, c), &v) in pattern.entries().zip(values) {
        target[(r, c)] += scale * v;
        if r != c {
            target[(c, r)] += scale * v;
        }
    }
}

impl<'a, M: MixedModel> OuterOptimizer<'a, M> {
    pub fn new(engine: &'a MixedEngine<M>, problem: &FitProblem) -> Self {
        let n_fixed = engine.layout().n_fixed;
        let n_abs = engine.n_abs_terms();

        let mut lower = problem.fixed_lower.clone();
        let mut upper = problem.fixed_upper.clone();
        lower.extend(std::iter::repeat_n(0.0, n_abs));
        upper.extend(std::iter::repeat_n(f64::INFINITY, n_abs));

        let mut c_lower = problem.constraint_lower.clone();
        let mut c_upper = problem.constraint_upper.clone();
        c_lower.extend(std::iter::repeat_n(0.0, 2 * n_abs));
        c_upper.extend(std::iter::repeat_n(f64::INFINITY, 2 * n_abs));

        Self {
            engine,
            n_fixed,
            n_abs,
            lower,
            upper,
            c_lower,
            c_upper,
        }
    }

    /// `(θ, |v_k(θ)|)`.
    pub fn initial_point(&self, theta: &[f64]) -> Vec<f64> {
        let mut x = theta.to_vec();
        let values = self.engine.fix_likelihood_values(theta);
        x.extend(values.iter().skip(1).map(|v| v.abs()));
        x
    }

    fn split<'x>(&self, x: &'x [f64]) -> (&'x [f64], &'x [f64]) {
        x.split_at(self.n_fixed)
    }

    fn user_constraints(&self) -> usize {
        self.c_lower.len() - 2 * self.n_abs
    }
}

impl<M: MixedModel> NlpProblem for OuterOptimizer<'_, M> {
    fn n_variables(&self) -> usize {
        self.n_fixed + self.n_abs
    }

    fn variable_bounds(&self) -> (&[f64], &[f64]) {
        (&self.lower, &self.upper)
    }

    fn constraint_bounds(&self) -> (&[f64], &[f64]) {
        (&self.c_lower, &self.c_upper)
    }

    fn objective(&self, x: &[f64]) -> Result<f64, EvalFailure> {
        let (theta, xi) = self.split(x);
        let solution = self.engine.random_solution(theta)?;
        let random = solution.random.to_vec();
        let smooth = self
            .engine
            .fix_likelihood_values(theta)
            .first()
            .copied()
            .unwrap_or(0.0);
        let value = self.engine.ranobj(theta, &random)? + smooth + xi.iter().sum::<f64>();
        if !value.is_finite() {
            return Err(EvalFailure::NonFinite { quantity: "Laplace objective" });
        }
        Ok(value)
    }

    fn gradient(&self, x: &[f64]) -> Result<Vec<f64>, EvalFailure> {
        let (theta, _) = self.split(x);
        let solution = self.engine.random_solution(theta)?;
        let random = solution.random.to_vec();
        let mut gradient = self.engine.ranobj_gradient(theta, &random)?;
        let jacobian = self.engine.fix_likelihood_jacobian(theta);
        if jacobian.nrows() > 0 {
            for (g, d) in gradient.iter_mut().zip(jacobian.row(0)) {
                *g += d;
            }
        }
        gradient.extend(std::iter::repeat_n(1.0, self.n_abs));
        Ok(gradient)
    }

    fn constraints(&self, x: &[f64]) -> Result<Vec<f64>, EvalFailure> {
        let (theta, xi) = self.split(x);
        let mut values = self.engine.constraint_values(theta);
        let v = self.engine.fix_likelihood_values(theta);
        for k in 0..self.n_abs {
            values.push(xi[k] - v[k + 1]);
            values.push(xi[k] + v[k + 1]);
        }
        if values.iter().any(|c| !c.is_finite()) {
            return Err(EvalFailure::NonFinite { quantity: "constraint" });
        }
        Ok(values)
    }

    fn constraint_jacobian(&self, x: &[f64]) -> Result<Array2<f64>, EvalFailure> {
        let (theta, _) = self.split(x);
        let n = self.n_variables();
        let m_user = self.user_constraints();
        let mut jacobian = Array2::zeros((self.c_lower.len(), n));
        let user = self.engine.constraint_jacobian(theta);
        for k in 0..m_user {
            for j in 0..self.n_fixed {
                jacobian[(k, j)] = user[(k, j)];
            }
        }
        let fixed = self.engine.fix_likelihood_jacobian(theta);
        for k in 0..self.n_abs {
            let minus = m_user + 2 * k;
            let plus = minus + 1;
            for j in 0..self.n_fixed {
                jacobian[(minus, j)] = -fixed[(k + 1, j)];
                jacobian[(plus, j)] = fixed[(k + 1, j)];
            }
            jacobian[(minus, self.n_fixed + k)] = 1.0;
            jacobian[(plus, self.n_fixed + k)] = 1.0;
        }
        Ok(jacobian)
    }

    fn lagrangian_hessian(
        &self,
        x: &[f64],
        objective_factor: f64,
        multipliers: &[f64],
    ) -> Result<Array2<f64>, EvalFailure> {
        let (theta, _) = self.split(x);
        let n = self.n_variables();
        let m_user = self.user_constraints();
        let mut hessian = Array2::zeros((n, n));

        let solution = self.engine.random_solution(theta)?;
        let random = solution.random.to_vec();
        let (pattern, values) = self
            .engine
            .ranobj_hessian(theta, &random)
            .map_err(|err| match err {
                EstimationError::RandomEffects { source, .. }
                | EstimationError::FixedHessian(FixedHessianError::Inner(source)) => EvalFailure::Inner(source),
                _ => EvalFailure::NonFinite {
                    quantity: "fixed-effects Hessian",
                },
            })?;
        add_lower_triangle(&mut hessian, &pattern, &values, objective_factor);

        if !self.engine.fix_likelihood_values(theta).is_empty() {
            let mut weights = vec![objective_factor];
            for k in 0..self.n_abs {
                weights.push(multipliers[m_user + 2 * k + 1] - multipliers[m_user + 2 * k]);
            }
            let (pattern, values) = self.engine.fix_likelihood_hessian(theta, &weights);
            add_lower_triangle(&mut hessian, &pattern, &values, 1.0);
        }
        if m_user > 0 {
            let (pattern, values) = self.engine.constraint_hessian(theta, &multipliers[..m_user]);
            add_lower_triangle(&mut hessian, &pattern, &values, 1.0);
        }
        if hessian.iter().any(|h| !h.is_finite()) {
            return Err(EvalFailure::NonFinite { quantity: "Lagrangian Hessian" });
        }
        Ok(hessian)
    }
}

//! Value and gradient of the random part of the Laplace objective,
//!
//! ```text
//! r(θ) = f(θ, û) + ½ log det f_uu(θ, û) − (n_random/2) log 2π,
//! ```
//!
//! at a point `û` that minimizes `f(θ, ·)`.
//!
//! By the implicit function theorem `∂û/∂θ_j = −f_uu⁻¹ f_uθ_j`, so
//!
//! ```text
//! ∂r/∂θ_j = f_θj + ½ ∂_θj logdet + Σ_i (f_ui + ½ ∂_ui logdet) · ∂û_i/∂θ_j.
//! ```
//!
//! `f_u` vanishes at an interior optimum but is kept so the formula also holds
//! at a point where a bound is active. The log-determinant partials come from
//! one reverse sweep of the level-2 recording weighted by the entries of
//! `f_uu⁻¹` on the factor pattern.

use crate::cholesky::{CholeskyFactor, SymbolicCholesky};
use crate::inner::InnerFailure;
use crate::recorder::RandomRecordings;
use std::f64::consts::PI;
use std::sync::Arc;

pub struct ObjectiveGradientAssembler<'a> {
    recordings: &'a RandomRecordings,
    symbolic: Option<&'a Arc<SymbolicCholesky>>,
    stationarity_tolerance: Option<f64>,
}

impl<'a> ObjectiveGradientAssembler<'a> {
    pub fn new(recordings: &'a RandomRecordings, symbolic: Option<&'a Arc<SymbolicCholesky>>) -> Self {
        Self {
            recordings,
            symbolic,
            stationarity_tolerance: None,
        }
    }

    /// Reports `max|f_u|` at the evaluation point when it exceeds `tolerance`.
    pub fn with_stationarity_tolerance(mut self, tolerance: f64) -> Self {
        self.stationarity_tolerance = Some(tolerance);
        self
    }

    fn stationarity_excess(&self, f_u: &[f64]) -> Option<f64> {
        let tolerance = self.stationarity_tolerance?;
        let largest = f_u.iter().fold(0.0, |m: f64, g| m.max(g.abs()));
        (largest > tolerance).then_some(largest)
    }

    fn factor(&self, theta: &[f64], random: &[f64]) -> Result<Option<CholeskyFactor>, InnerFailure> {
        let Some(symbolic) = self.symbolic else {
            return Ok(None);
        };
        if self.recordings.layout().n_random == 0 {
            return Ok(None);
        }
        let values = self.recordings.random_hessian(theta, random);
        Ok(Some(CholeskyFactor::factorize(Arc::clone(symbolic), &values)?))
    }

    pub fn objective(&self, theta: &[f64], random: &[f64]) -> Result<f64, InnerFailure> {
        let mut total = self.recordings.value(theta, random);
        if let Some(factor) = self.factor(theta, random)? {
            let n_random = self.recordings.layout().n_random as f64;
            total += 0.5 * factor.log_determinant() - 0.5 * n_random * (2.0 * PI).ln();
        }
        if !total.is_finite() {
            return Err(InnerFailure::NonFinite {
                quantity: "Laplace objective",
                iteration: 0,
            });
        }
        Ok(total)
    }

    /// `∂û/∂θ_j = −f_uu⁻¹ f_uθ_j`.
    pub fn implicit_derivative(
        &self,
        theta: &[f64],
        random: &[f64],
        j: usize,
    ) -> Result<Vec<f64>, InnerFailure> {
        let n_random = self.recordings.layout().n_random;
        let Some(factor) = self.factor(theta, random)? else {
            return Ok(vec![0.0; n_random]);
        };
        let (pattern, values) = self.recordings.cross_hessian(theta, random);
        let mut rhs = vec![0.0; n_random];
        for k in pattern.column_positions(j) {
            rhs[pattern.rows[k]] = -values[k];
        }
        Ok(factor.solve(&rhs))
    }

    /// Partials of `log det f_uu` with respect to the packed `(θ, u)`.
    fn log_det_gradient(&self, theta: &[f64], random: &[f64], factor: &CholeskyFactor) -> Vec<f64> {
        let layout = self.recordings.layout();
        let Some(hessian) = self.recordings.hessian() else {
            return vec![0.0; layout.len()];
        };
        let selected = factor.selected_inverse();
        // An off-diagonal entry stands for both (r, c) and (c, r).
        let weights: Vec<f64> = hessian
            .pattern()
            .entries()
            .map(|(r, c)| {
                let value = selected.get(r, c).unwrap_or(0.0);
                if r == c { value } else { 2.0 * value }
            })
            .collect();
        let (_, gradient) = hessian.tape().gradient(&layout.pack(theta, random), &weights);
        gradient
    }

    pub fn gradient(&self, theta: &[f64], random: &[f64]) -> Result<Vec<f64>, InnerFailure> {
        let layout = self.recordings.layout();
        let (_, packed) = self.recordings.gradient(theta, random);
        let (f_theta, f_u) = layout.unpack(&packed);
        if let Some(largest) = self.stationarity_excess(f_u) {
            log::debug!(
                "Random objective gradient: max |f_u| = {largest:.3e} at u_hat is above the inner tolerance (bound active or inner solve not converged)"
            );
        }
        let Some(factor) = self.factor(theta, random)? else {
            return Ok(f_theta.to_vec());
        };

        let log_det = self.log_det_gradient(theta, random, &factor);
        let (log_det_theta, log_det_u) = layout.unpack(&log_det);
        let (cross_pattern, cross_values) = self.recordings.cross_hessian(theta, random);
        let weight_u: Vec<f64> = f_u
            .iter()
            .zip(log_det_u)
            .map(|(f, l)| f + 0.5 * l)
            .collect();

        let mut gradient = vec![0.0; layout.n_fixed];
        let mut rhs = vec![0.0; layout.n_random];
        for j in 0..layout.n_fixed {
            gradient[j] = f_theta[j] + 0.5 * log_det_theta[j];

            let column = cross_pattern.column_positions(j);
            if column.is_empty() {
                continue;
            }
            rhs.iter_mut().for_each(|v| *v = 0.0);
            for k in column {
                rhs[cross_pattern.rows[k]] = -cross_values[k];
            }
            let du = factor.solve(&rhs);
            for (i, &dui) in du.iter().enumerate() {
                if dui == 0.0 {
                    continue;
                }
                gradient[j] += weight_u[i] * dui;
            }
        }

        if gradient.iter().any(|v| !v.is_finite()) {
            return Err(InnerFailure::NonFinite {
                quantity: "Laplace gradient",
                iteration: 0,
            });
        }
        Ok(gradient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::{AVar, Scalar};
    use crate::cholesky::FillOrdering;
    use crate::config::RandomOptions;
    use crate::inner::InnerOptimizer;
    use crate::recorder::FunctionRecorder;
    use crate::types::PackLayout;
    use approx::assert_relative_eq;

    fn build<F>(layout: PackLayout, f: F, theta: &[f64], u: &[f64]) -> (RandomRecordings, Arc<SymbolicCholesky>)
    where
        F: Fn(&[AVar], &[AVar]) -> Vec<AVar>,
    {
        let recordings = FunctionRecorder::new(layout).record_random(f, theta, u).unwrap();
        let pattern = recordings.hessian().unwrap().pattern().clone();
        let symbolic = Arc::new(
            SymbolicCholesky::analyze(layout.n_random, &pattern, FillOrdering::Amd).unwrap(),
        );
        (recordings, symbolic)
    }

    /// Nonlinear in both blocks so every term of the gradient formula matters.
    fn poisson_like<T: Scalar>(theta: &[T], u: &[T]) -> Vec<T> {
        let counts = [3.0, 0.0, 5.0];
        let sigma = theta[1].exp();
        let mut total = T::from_f64(0.0);
        for (i, &ui) in u.iter().enumerate() {
            let eta = theta[0] + ui;
            total += eta.exp() - eta * counts[i];
            total += ui * ui / (sigma * sigma * 2.0) + theta[1];
        }
        total += (u[0] - u[1]) * (u[0] - u[1]) * theta[1].exp() * 0.3;
        vec![total]
    }

    fn optimum(recordings: &RandomRecordings, symbolic: &Arc<SymbolicCholesky>, theta: &[f64]) -> Vec<f64> {
        let options = RandomOptions::default();
        let n = recordings.layout().n_random;
        let mut inner = InnerOptimizer::new(recordings, Some(symbolic), &options);
        let solution = inner
            .solve(theta, &vec![f64::NEG_INFINITY; n], &vec![f64::INFINITY; n], &vec![0.0; n], 1e-12)
            .unwrap();
        solution.random.to_vec()
    }

    #[test]
    fn quadratic_toy_model_matches_closed_form() {
        let layout = PackLayout::new(1, 1);
        let f = |t: &[AVar], u: &[AVar]| vec![(u[0] - t[0]) * (u[0] - t[0]) + u[0] * u[0]];
        let (recordings, symbolic) = build(layout, f, &[0.0], &[0.0]);
        let assembler = ObjectiveGradientAssembler::new(&recordings, Some(&symbolic));
        let theta = 1.7;
        let u_hat = theta / 2.0;
        let objective = assembler.objective(&[theta], &[u_hat]).unwrap();
        let expected = theta * theta / 2.0 + 0.5 * 4.0f64.ln() - 0.5 * (2.0 * PI).ln();
        assert_relative_eq!(objective, expected, max_relative = 1e-12);
        let gradient = assembler.gradient(&[theta], &[u_hat]).unwrap();
        assert_relative_eq!(gradient[0], theta, max_relative = 1e-12);
        let du = assembler.implicit_derivative(&[theta], &[u_hat], 0).unwrap();
        assert_relative_eq!(du[0], 0.5, max_relative = 1e-12);
    }

    #[test]
    fn stationarity_is_checked_against_the_inner_tolerance() {
        let layout = PackLayout::new(1, 1);
        let f = |t: &[AVar], u: &[AVar]| vec![(u[0] - t[0]) * (u[0] - t[0]) + u[0] * u[0]];
        let (recordings, symbolic) = build(layout, f, &[0.0], &[0.0]);
        let theta = 1.7;

        let unchecked = ObjectiveGradientAssembler::new(&recordings, Some(&symbolic));
        assert_eq!(unchecked.stationarity_excess(&[5.0]), None);

        let assembler = unchecked.with_stationarity_tolerance(1e-8);
        let (_, packed) = recordings.gradient(&[theta], &[theta / 2.0]);
        assert_eq!(assembler.stationarity_excess(&packed[1..]), None);

        // f_u = 2(u − θ) + 2u = −2θ at u = 0.
        let (_, packed) = recordings.gradient(&[theta], &[0.0]);
        let excess = assembler.stationarity_excess(&packed[1..]).unwrap();
        assert_relative_eq!(excess, 2.0 * theta, max_relative = 1e-12);
        assert!(assembler.gradient(&[theta], &[0.0]).is_ok());
    }

    #[test]
    fn gradient_matches_finite_differences_of_the_laplace_objective() {
        let layout = PackLayout::new(2, 3);
        let (recordings, symbolic) = build(layout, |t, u| poisson_like(t, u), &[0.1, 0.0], &[0.0; 3]);
        let assembler = ObjectiveGradientAssembler::new(&recordings, Some(&symbolic));
        let laplace = |theta: &[f64]| {
            let u = optimum(&recordings, &symbolic, theta);
            assembler.objective(theta, &u).unwrap()
        };

        let theta = [0.4, -0.2];
        let u_hat = optimum(&recordings, &symbolic, &theta);
        let gradient = assembler.gradient(&theta, &u_hat).unwrap();
        let h = 1e-5;
        for j in 0..2 {
            let mut plus = theta;
            let mut minus = theta;
            plus[j] += h;
            minus[j] -= h;
            let numeric = (laplace(&plus) - laplace(&minus)) / (2.0 * h);
            assert_relative_eq!(gradient[j], numeric, epsilon = 1e-6, max_relative = 1e-5);
        }
    }

    #[test]
    fn gradient_is_idempotent() {
        let layout = PackLayout::new(2, 3);
        let (recordings, symbolic) = build(layout, |t, u| poisson_like(t, u), &[0.1, 0.0], &[0.0; 3]);
        let assembler = ObjectiveGradientAssembler::new(&recordings, Some(&symbolic));
        let theta = [0.2, 0.1];
        let u = [0.3, -0.4, 0.8];
        let first = assembler.gradient(&theta, &u).unwrap();
        let second = assembler.gradient(&theta, &u).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn fixed_effect_without_cross_terms_uses_direct_derivative_only() {
        // θ1 enters only additively, so its cross-Hessian column is empty.
        let layout = PackLayout::new(2, 1);
        let f = |t: &[AVar], u: &[AVar]| vec![(u[0] - t[0]) * (u[0] - t[0]) + u[0] * u[0] + t[1] * t[1] * 3.0];
        let (recordings, symbolic) = build(layout, f, &[0.0, 0.0], &[0.0]);
        let (pattern, _) = recordings.cross_hessian(&[0.0, 0.0], &[0.0]);
        assert!(pattern.column_positions(1).is_empty());
        let assembler = ObjectiveGradientAssembler::new(&recordings, Some(&symbolic));
        let gradient = assembler.gradient(&[1.0, 0.5], &[0.5]).unwrap();
        assert_relative_eq!(gradient[0], 1.0, max_relative = 1e-12);
        assert_relative_eq!(gradient[1], 3.0, max_relative = 1e-12);
    }

    #[test]
    fn without_random_effects_the_gradient_is_the_direct_derivative() {
        let layout = PackLayout::new(2, 0);
        let recordings = FunctionRecorder::new(layout)
            .record_random(|t: &[AVar], _: &[AVar]| vec![t[0] * t[1] + t[1].exp()], &[0.0, 0.0], &[])
            .unwrap();
        let assembler = ObjectiveGradientAssembler::new(&recordings, None);
        let gradient = assembler.gradient(&[2.0, 0.5], &[]).unwrap();
        assert_relative_eq!(gradient[0], 0.5);
        assert_relative_eq!(gradient[1], 2.0 + 0.5f64.exp(), max_relative = 1e-14);
        assert_relative_eq!(assembler.objective(&[2.0, 0.5], &[]).unwrap(), 1.0 + 0.5f64.exp());
    }

    #[test]
    fn indefinite_random_hessian_is_a_recoverable_failure() {
        let layout = PackLayout::new(1, 1);
        let f = |t: &[AVar], u: &[AVar]| vec![-(u[0] * u[0]) + t[0] * u[0]];
        let (recordings, symbolic) = build(layout, f, &[0.0], &[0.0]);
        let assembler = ObjectiveGradientAssembler::new(&recordings, Some(&symbolic));
        assert!(matches!(
            assembler.objective(&[1.0], &[0.5]),
            Err(InnerFailure::NotPositiveDefinite(_))
        ));
        assert!(assembler.gradient(&[1.0], &[0.5]).is_err());
    }
}

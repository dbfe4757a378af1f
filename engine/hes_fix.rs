//! Recorded Hessian of the random part of the Laplace objective.
//!
//! The recording runs over the packed `(β, θ, u)`. With `A = f_uu(θ, u)` held
//! at the frozen copy θ, two Newton steps from `u` towards the optimum for β
//!
//! ```text
//! U = u − A⁻¹ f_u(β, u),    W = U − A⁻¹ f_u(β, U),
//! ```
//!
//! reproduce `û(β)` to second order around `β = θ, u = û(θ)`. Consequently the
//! β-Hessian of
//!
//! ```text
//! H(β, θ, u) = f(β, W) + ½ log det f_uu(β, W)
//! ```
//!
//! at `(θ, θ, û(θ))` equals the Hessian of the Laplace objective. Only the
//! lower triangle of the β block is ever evaluated.

use crate::ad::{self, AVar, AdError, Tape};
use crate::cholesky::{CholeskyError, RecordedFactor, SymbolicCholesky};
use crate::inner::InnerFailure;
use crate::recorder::RandomRecordings;
use crate::sparsity::{SparseHessian, SparsityPattern};
use crate::types::PackLayout;
use log::info;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FixedHessianError {
    #[error("Recording the fixed-effects Hessian failed: {0}")]
    Ad(#[from] AdError),

    #[error("Recording the fixed-effects Hessian failed: {0}")]
    Inner(#[from] InnerFailure),
}

pub struct FixedHessianRecording {
    layout: PackLayout,
    tape: Tape,
    hessian: SparseHessian,
}

impl FixedHessianRecording {
    /// Records at `(θ, θ, random)`; `random` should be `û(θ)`.
    pub fn record(
        recordings: &RandomRecordings,
        symbolic: Option<&Arc<SymbolicCholesky>>,
        theta: &[f64],
        random: &[f64],
    ) -> Result<Self, FixedHessianError> {
        let layout = recordings.layout();
        let point = layout.pack_three(theta, theta, random);
        let mut failure: Option<CholeskyError> = None;
        let tape = ad::record(&point, |x| {
            let (beta, frozen, u) = layout.unpack_three(x);
            match laplace_at_newton_point(recordings, symbolic, beta, frozen, u) {
                Ok(value) => value,
                Err(err) => {
                    failure = Some(err);
                    Vec::new()
                }
            }
        })?;
        if let Some(err) = failure {
            return Err(InnerFailure::NotPositiveDefinite(err).into());
        }

        let n_fixed = layout.n_fixed;
        let hessian = SparseHessian::new(&tape, 0..n_fixed, 0..n_fixed, false);
        info!(
            "Recorded fixed-effects Hessian: {} operations, {} entries in {} colors.",
            tape.n_operations(),
            hessian.pattern().len(),
            hessian.n_colors()
        );
        Ok(Self {
            layout,
            tape,
            hessian,
        })
    }

    /// Lower triangle of the fixed-effects block.
    pub fn pattern(&self) -> &SparsityPattern {
        self.hessian.pattern()
    }

    /// Hessian values at `(θ, θ, û)`, in pattern order.
    pub fn evaluate(&self, theta: &[f64], random: &[f64]) -> Result<Vec<f64>, InnerFailure> {
        if self.tape.n_outputs() == 0 {
            return Ok(vec![0.0; self.pattern().len()]);
        }
        let point = self.layout.pack_three(theta, theta, random);
        let values = self.hessian.evaluate(&self.tape, &point, &[1.0]);
        if values.iter().any(|v| !v.is_finite()) {
            return Err(InnerFailure::NonFinite {
                quantity: "fixed-effects Hessian",
                iteration: 0,
            });
        }
        Ok(values)
    }
}

fn laplace_at_newton_point(
    recordings: &RandomRecordings,
    symbolic: Option<&Arc<SymbolicCholesky>>,
    beta: &[AVar],
    frozen: &[AVar],
    u: &[AVar],
) -> Result<Vec<AVar>, CholeskyError> {
    let layout = recordings.layout();
    let Some(likelihood) = recordings.likelihood() else {
        return Ok(Vec::new());
    };
    let (Some(symbolic), Some(hessian)) = (symbolic, recordings.hessian()) else {
        return Ok(likelihood.tape().eval(&layout.pack(beta, u)));
    };
    let n_fixed = layout.n_fixed;
    let one = [AVar::constant(1.0)];

    let a = hessian.tape().eval(&layout.pack(frozen, u));
    let factor = RecordedFactor::factorize(Arc::clone(symbolic), &a)?;
    let newton = |from: &[AVar]| -> Vec<AVar> {
        let (_, gradient) = likelihood.tape().gradient(&layout.pack(beta, from), &one);
        let step = factor.solve(&gradient[n_fixed..]);
        from.iter().zip(&step).map(|(&v, &s)| v - s).collect()
    };
    let first = newton(u);
    let w = newton(&first);

    let packed = layout.pack(beta, &w);
    let value = likelihood.tape().eval(&packed)[0];
    let at_w = RecordedFactor::factorize(Arc::clone(symbolic), &hessian.tape().eval(&packed))?;
    Ok(vec![value + at_w.log_determinant() * 0.5])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::Scalar;
    use crate::cholesky::FillOrdering;
    use crate::config::RandomOptions;
    use crate::inner::InnerOptimizer;
    use crate::ranobj::ObjectiveGradientAssembler;
    use crate::recorder::FunctionRecorder;
    use approx::assert_relative_eq;

    fn counts_model<T: Scalar>(theta: &[T], u: &[T]) -> Vec<T> {
        let counts = [2.0, 7.0, 1.0, 4.0];
        let log_sd = theta[1];
        let mut total = T::from_f64(0.0);
        for (i, &ui) in u.iter().enumerate() {
            let eta = theta[0] + theta[2] * (i as f64) * 0.1 + ui;
            total += eta.exp() - eta * counts[i];
            total += ui * ui * (log_sd * -2.0).exp() * 0.5 + log_sd;
        }
        vec![total]
    }

    struct Setup {
        recordings: RandomRecordings,
        symbolic: Arc<SymbolicCholesky>,
    }

    impl Setup {
        fn new() -> Self {
            let recordings = FunctionRecorder::new(PackLayout::new(3, 4))
                .record_random(|t, u| counts_model(t, u), &[0.5, 0.0, 0.0], &[0.0; 4])
                .unwrap();
            let pattern = recordings.hessian().unwrap().pattern().clone();
            let symbolic =
                Arc::new(SymbolicCholesky::analyze(4, &pattern, FillOrdering::Amd).unwrap());
            Self {
                recordings,
                symbolic,
            }
        }

        fn optimum(&self, theta: &[f64]) -> Vec<f64> {
            let options = RandomOptions::default();
            let mut inner = InnerOptimizer::new(&self.recordings, Some(&self.symbolic), &options);
            inner
                .solve(theta, &[f64::NEG_INFINITY; 4], &[f64::INFINITY; 4], &[0.0; 4], 1e-12)
                .unwrap()
                .random
                .to_vec()
        }

        fn gradient(&self, theta: &[f64]) -> Vec<f64> {
            let u = self.optimum(theta);
            ObjectiveGradientAssembler::new(&self.recordings, Some(&self.symbolic))
                .gradient(theta, &u)
                .unwrap()
        }
    }

    #[test]
    fn hessian_matches_differences_of_the_gradient() {
        let setup = Setup::new();
        let theta = [0.8, -0.1, 0.3];
        let u_hat = setup.optimum(&theta);
        let recording =
            FixedHessianRecording::record(&setup.recordings, Some(&setup.symbolic), &theta, &u_hat).unwrap();
        // Every fixed effect interacts with every other through û.
        assert_eq!(recording.pattern().len(), 6);
        let values = recording.evaluate(&theta, &u_hat).unwrap();

        let h = 1e-5;
        for j in 0..3 {
            let mut plus = theta;
            let mut minus = theta;
            plus[j] += h;
            minus[j] -= h;
            let g_plus = setup.gradient(&plus);
            let g_minus = setup.gradient(&minus);
            for i in j..3 {
                let numeric = (g_plus[i] - g_minus[i]) / (2.0 * h);
                let k = recording.pattern().position(i, j).unwrap();
                assert_relative_eq!(values[k], numeric, epsilon = 1e-5, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn replay_at_a_new_point_matches_a_fresh_recording() {
        let setup = Setup::new();
        let theta = [0.8, -0.1, 0.3];
        let recording = FixedHessianRecording::record(
            &setup.recordings,
            Some(&setup.symbolic),
            &theta,
            &setup.optimum(&theta),
        )
        .unwrap();
        let other = [0.2, 0.3, -0.5];
        let u_other = setup.optimum(&other);
        let fresh =
            FixedHessianRecording::record(&setup.recordings, Some(&setup.symbolic), &other, &u_other).unwrap();
        assert_eq!(recording.pattern(), fresh.pattern());
        let replayed = recording.evaluate(&other, &u_other).unwrap();
        let recorded = fresh.evaluate(&other, &u_other).unwrap();
        for (a, b) in replayed.iter().zip(&recorded) {
            assert_relative_eq!(*a, *b, epsilon = 1e-10, max_relative = 1e-10);
        }
    }

    #[test]
    fn without_random_effects_the_hessian_is_that_of_the_likelihood() {
        let recordings = FunctionRecorder::new(PackLayout::new(2, 0))
            .record_random(|t: &[AVar], _: &[AVar]| vec![t[0] * t[0] * t[1] + t[1].exp()], &[1.0, 0.0], &[])
            .unwrap();
        let recording = FixedHessianRecording::record(&recordings, None, &[1.0, 0.0], &[]).unwrap();
        let values = recording.evaluate(&[2.0, 0.5], &[]).unwrap();
        let entries: Vec<_> = recording.pattern().entries().collect();
        assert_eq!(entries, vec![(0, 0), (1, 0), (1, 1)]);
        assert_relative_eq!(values[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(values[1], 4.0, epsilon = 1e-12);
        assert_relative_eq!(values[2], 0.5f64.exp(), epsilon = 1e-12);
    }

    #[test]
    fn indefinite_random_hessian_is_reported_at_recording() {
        let recordings = FunctionRecorder::new(PackLayout::new(1, 1))
            .record_random(|t: &[AVar], u: &[AVar]| vec![-(u[0] * u[0]) + t[0] * u[0]], &[0.0], &[0.0])
            .unwrap();
        let pattern = recordings.hessian().unwrap().pattern().clone();
        let symbolic = Arc::new(SymbolicCholesky::analyze(1, &pattern, FillOrdering::Natural).unwrap());
        let result = FixedHessianRecording::record(&recordings, Some(&symbolic), &[1.0], &[0.5]);
        assert!(matches!(
            result,
            Err(FixedHessianError::Inner(InnerFailure::NotPositiveDefinite(_)))
        ));
    }
}

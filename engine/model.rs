use crate::ad::Scalar;

/// A nonlinear mixed-effects model, described by its negative log-likelihoods.
///
/// Every function is written once against [`Scalar`]; the engine evaluates it
/// with `f64` and records it with active variables.
pub trait MixedModel {
    fn n_fixed(&self) -> usize;

    fn n_random(&self) -> usize;

    /// Random negative log-likelihood `f(θ, u)`.
    ///
    /// Returns one value, or no values only when there are no random effects.
    /// Must be smooth in the random effects.
    fn ran_likelihood<T: Scalar>(&self, fixed: &[T], random: &[T]) -> Vec<T>;

    /// Fixed negative log-likelihood `g(θ) = v[0] + Σ_{k>0} |v[k]|`.
    ///
    /// An empty vector means `g ≡ 0`.
    fn fix_likelihood<T: Scalar>(&self, fixed: &[T]) -> Vec<T> {
        let _ = fixed;
        Vec::new()
    }

    /// Nonlinear constraint functions `c(θ)`; their bounds come with the problem.
    fn fix_constraint<T: Scalar>(&self, fixed: &[T]) -> Vec<T> {
        let _ = fixed;
        Vec::new()
    }
}

use crate::ad::Scalar;
use crate::model::MixedModel;
use crate::residual::{Density, PriorSpec, ResidualError, prior_likelihood, random_likelihood, residual_density};
use serde::{Deserialize, Serialize};

fn default_nu() -> f64 {
    5.0
}

/// Grouped observations `y_ij` with mean `θ_0 + u_i` and group effects
/// `u_i ~ N(0, exp(θ_1))`.
///
/// `θ_1` is the log variance of the group effects. The data density must be
/// smooth; a Laplace density is rejected when the model is recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomInterceptModel {
    pub groups: Vec<Vec<f64>>,
    #[serde(default)]
    pub density: Density,
    pub data_std: f64,
    #[serde(default)]
    pub eta: f64,
    #[serde(default = "default_nu")]
    pub nu: f64,
    /// Priors on `(θ_0, θ_1)`; missing entries mean no prior.
    #[serde(default)]
    pub priors: Vec<PriorSpec>,
}

impl RandomInterceptModel {
    pub fn new(groups: Vec<Vec<f64>>, data_std: f64) -> Self {
        Self {
            groups,
            density: Density::Gaussian,
            data_std,
            eta: 0.0,
            nu: default_nu(),
            priors: Vec::new(),
        }
    }

    pub fn with_density(mut self, density: Density) -> Self {
        self.density = density;
        self
    }

    pub fn with_priors(mut self, priors: Vec<PriorSpec>) -> Self {
        self.priors = priors;
        self
    }

    pub fn n_observations(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn validate(&self) -> Result<(), ResidualError> {
        if !(self.data_std > 0.0 && self.data_std.is_finite()) {
            return Err(ResidualError::NonPositiveStd {
                index: 0,
                std: self.data_std,
            });
        }
        if matches!(self.density, Density::Students | Density::LogStudents) && !(self.nu > 2.0) {
            return Err(ResidualError::DegreesOfFreedom { index: 0, nu: self.nu });
        }
        for (index, prior) in self.priors.iter().enumerate() {
            prior.validate(index)?;
        }
        Ok(())
    }
}

impl MixedModel for RandomInterceptModel {
    fn n_fixed(&self) -> usize {
        2
    }

    fn n_random(&self) -> usize {
        self.groups.len()
    }

    fn ran_likelihood<T: Scalar>(&self, fixed: &[T], random: &[T]) -> Vec<T> {
        let data_std = T::from_f64(self.data_std);
        let effect_std = (fixed[1] * 0.5).exp();
        let zero = T::from_f64(0.0);
        let mut residuals = Vec::with_capacity(self.n_observations() + self.groups.len());
        let mut index = 0;
        for (group, &effect) in self.groups.iter().zip(random) {
            let mean = fixed[0] + effect;
            for &y in group {
                residuals.push(residual_density(
                    T::from_f64(y),
                    mean,
                    data_std,
                    self.density,
                    self.eta,
                    self.nu,
                    index,
                ));
                index += 1;
            }
        }
        for (i, &effect) in random.iter().enumerate() {
            residuals.push(residual_density(
                effect,
                zero,
                effect_std,
                Density::Gaussian,
                0.0,
                self.nu,
                index + i,
            ));
        }
        random_likelihood(&residuals)
    }

    fn fix_likelihood<T: Scalar>(&self, fixed: &[T]) -> Vec<T> {
        if self.priors.is_empty() {
            return Vec::new();
        }
        prior_likelihood(&self.priors, fixed)
    }
}

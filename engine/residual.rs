//! Weighted residuals and log-densities for data and priors.
//!
//! Every density is split as `log p = logden_smooth − |logden_sub_abs|` so that
//! both parts are smooth in the mean and standard deviation. The smooth parts go
//! into element 0 of a fixed likelihood and every absolute-value part becomes an
//! element of its own; the random likelihood only accepts smooth densities.

use crate::ad::Scalar;
use serde::{Deserialize, Serialize};
use std::f64::consts::{LN_2, PI, SQRT_2};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResidualError {
    #[error("Prior {index}: standard deviation must be positive and finite, found {std}.")]
    NonPositiveStd { index: usize, std: f64 },

    #[error("Prior {index}: Students densities need more than 2 degrees of freedom, found {nu}.")]
    DegreesOfFreedom { index: usize, nu: f64 },

    #[error("Prior {index}: log density needs mean + eta > 0, found mean {mean} and eta {eta}.")]
    LogOffset { index: usize, mean: f64, eta: f64 },

    #[error("Prior {index}: censored densities only apply to data, not to priors.")]
    CensoredPrior { index: usize },

    #[error("Prior {index}: lower bound {lower} exceeds upper bound {upper}.")]
    BoundsOutOfOrder { index: usize, lower: f64, upper: f64 },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Density {
    Uniform,
    #[default]
    Gaussian,
    Laplace,
    Students,
    LogGaussian,
    LogLaplace,
    LogStudents,
    CenGaussian,
    CenLaplace,
    CenLogGaussian,
    CenLogLaplace,
}

impl Density {
    pub fn is_log(self) -> bool {
        matches!(
            self,
            Density::LogGaussian
                | Density::LogLaplace
                | Density::LogStudents
                | Density::CenLogGaussian
                | Density::CenLogLaplace
        )
    }

    pub fn is_censored(self) -> bool {
        matches!(
            self,
            Density::CenGaussian | Density::CenLaplace | Density::CenLogGaussian | Density::CenLogLaplace
        )
    }

    /// Densities whose log contains an absolute-value term.
    pub fn is_nonsmooth(self) -> bool {
        matches!(
            self,
            Density::Laplace | Density::LogLaplace | Density::CenLaplace | Density::CenLogLaplace
        )
    }
}

/// Weighted residual and the two parts of its log-density.
#[derive(Clone, Copy, Debug)]
pub struct Residual<T> {
    pub wres: T,
    pub logden_smooth: T,
    /// `None` when the density has no absolute-value term.
    pub logden_sub_abs: Option<T>,
    pub density: Density,
    pub index: usize,
}

impl<T: Scalar> Residual<T> {
    pub fn log_density(&self) -> T {
        match self.logden_sub_abs {
            Some(sub_abs) => self.logden_smooth - sub_abs.abs(),
            None => self.logden_smooth,
        }
    }
}

fn smooth_and_abs<T: Scalar>(wres: T, std: T, density: Density, nu: f64) -> (T, Option<T>) {
    match density {
        Density::Uniform => (T::from_f64(0.0), None),
        Density::Gaussian | Density::LogGaussian | Density::CenGaussian | Density::CenLogGaussian => {
            let smooth = -(std * (2.0 * PI).sqrt()).ln() - wres * wres / 2.0;
            (smooth, None)
        }
        Density::Laplace | Density::LogLaplace | Density::CenLaplace | Density::CenLogLaplace => {
            (-(std * SQRT_2).ln(), Some(wres * SQRT_2))
        }
        Density::Students | Density::LogStudents => {
            let r = wres * wres / (nu - 2.0) + 1.0;
            (-r.ln() * ((nu + 1.0) / 2.0), None)
        }
    }
}

/// Residual of `value` under `density` with the given mean and standard deviation.
///
/// Log densities measure the residual between `ln(value + eta)` and
/// `ln(mean + eta)`, with `std` in log space. For censored densities a
/// non-positive `value` is replaced by the probability of being at or below zero.
pub fn residual_density<T: Scalar>(
    value: T,
    mean: T,
    std: T,
    density: Density,
    eta: f64,
    nu: f64,
    index: usize,
) -> Residual<T> {
    debug_assert!(density == Density::Uniform || std.value() > 0.0);
    let wres = match density {
        Density::Uniform => T::from_f64(0.0),
        d if d.is_log() => ((value + eta).ln() - (mean + eta).ln()) / std,
        _ => (value - mean) / std,
    };

    if density.is_censored() && value.value() <= 0.0 {
        let distance = if density.is_log() {
            (mean + eta).ln() - eta.ln()
        } else {
            mean
        };
        let logden_smooth = match density {
            Density::CenGaussian | Density::CenLogGaussian => {
                ((distance / (std * SQRT_2)).erfc() * 0.5).ln()
            }
            _ => -(distance * SQRT_2) / std - LN_2,
        };
        return Residual {
            wres,
            logden_smooth,
            logden_sub_abs: None,
            density,
            index,
        };
    }

    let (logden_smooth, logden_sub_abs) = smooth_and_abs(wres, std, density, nu);
    Residual {
        wres,
        logden_smooth,
        logden_sub_abs,
        density,
        index,
    }
}

/// Residual of the difference `z − y` against `mean`, as used by smoothing priors.
///
/// Log densities difference the log-transformed values. Censoring does not
/// apply to differences, so censored densities behave like their uncensored form.
#[allow(clippy::too_many_arguments)]
pub fn difference_residual<T: Scalar>(
    z: T,
    y: T,
    mean: T,
    std: T,
    density: Density,
    eta: f64,
    nu: f64,
    index: usize,
) -> Residual<T> {
    let wres = match density {
        Density::Uniform => T::from_f64(0.0),
        d if d.is_log() => ((z + eta).ln() - (y + eta).ln() - mean) / std,
        _ => (z - y - mean) / std,
    };
    let (logden_smooth, logden_sub_abs) = smooth_and_abs(wres, std, density, nu);
    Residual {
        wres,
        logden_smooth,
        logden_sub_abs,
        density,
        index,
    }
}

/// One-element random likelihood `−Σ log p` of a set of residuals.
///
/// Absolute-value terms are kept as `|·|`; recording them makes the random
/// likelihood non-smooth, which the engine rejects.
pub fn random_likelihood<T: Scalar>(residuals: &[Residual<T>]) -> Vec<T> {
    let mut total = T::from_f64(0.0);
    for residual in residuals {
        total -= residual.log_density();
    }
    vec![total]
}

/// Fixed likelihood of a set of residuals: the smooth part first, then one
/// element per absolute-value term.
pub fn fixed_likelihood<T: Scalar>(residuals: &[Residual<T>]) -> Vec<T> {
    let mut smooth = T::from_f64(0.0);
    let mut terms = vec![T::from_f64(0.0)];
    for residual in residuals {
        smooth -= residual.logden_smooth;
        if let Some(sub_abs) = residual.logden_sub_abs {
            terms.push(sub_abs);
        }
    }
    terms[0] = smooth;
    terms
}

fn default_std() -> f64 {
    1.0
}

fn default_nu() -> f64 {
    5.0
}

fn default_lower() -> f64 {
    f64::NEG_INFINITY
}

fn default_upper() -> f64 {
    f64::INFINITY
}

/// Prior on one fixed effect, with its box constraint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    #[serde(default)]
    pub density: Density,
    #[serde(default)]
    pub mean: f64,
    #[serde(default = "default_std")]
    pub std: f64,
    #[serde(default)]
    pub eta: f64,
    #[serde(default = "default_nu")]
    pub nu: f64,
    #[serde(default = "default_lower")]
    pub lower: f64,
    #[serde(default = "default_upper")]
    pub upper: f64,
}

impl PriorSpec {
    pub fn gaussian(mean: f64, std: f64) -> Self {
        Self {
            density: Density::Gaussian,
            mean,
            std,
            eta: 0.0,
            nu: default_nu(),
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    pub fn uniform(lower: f64, upper: f64) -> Self {
        Self {
            density: Density::Uniform,
            lower,
            upper,
            ..Self::gaussian(0.0, 1.0)
        }
    }

    pub fn with_density(mut self, density: Density) -> Self {
        self.density = density;
        self
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = lower;
        self.upper = upper;
        self
    }

    pub fn validate(&self, index: usize) -> Result<(), ResidualError> {
        if !(self.lower <= self.upper) {
            return Err(ResidualError::BoundsOutOfOrder {
                index,
                lower: self.lower,
                upper: self.upper,
            });
        }
        if self.density == Density::Uniform {
            return Ok(());
        }
        if self.density.is_censored() {
            return Err(ResidualError::CensoredPrior { index });
        }
        if !(self.std > 0.0 && self.std.is_finite()) {
            return Err(ResidualError::NonPositiveStd { index, std: self.std });
        }
        if matches!(self.density, Density::Students | Density::LogStudents) && !(self.nu > 2.0) {
            return Err(ResidualError::DegreesOfFreedom { index, nu: self.nu });
        }
        if self.density.is_log() && !(self.mean + self.eta > 0.0) {
            return Err(ResidualError::LogOffset {
                index,
                mean: self.mean,
                eta: self.eta,
            });
        }
        Ok(())
    }
}

/// Fixed likelihood of independent priors on the leading fixed effects.
pub fn prior_likelihood<T: Scalar>(priors: &[PriorSpec], fixed: &[T]) -> Vec<T> {
    assert!(priors.len() <= fixed.len(), "more priors than fixed effects");
    let residuals: Vec<Residual<T>> = priors
        .iter()
        .zip(fixed)
        .enumerate()
        .map(|(index, (prior, &value))| {
            residual_density(
                value,
                T::from_f64(prior.mean),
                T::from_f64(prior.std),
                prior.density,
                prior.eta,
                prior.nu,
                index,
            )
        })
        .collect();
    fixed_likelihood(&residuals)
}

#![deny(unused_imports)]

pub mod ad;
pub mod cholesky;
pub mod config;
pub mod estimate;
pub mod faer_ndarray;
pub mod finite_diff;
pub mod hes_fix;
pub mod inner;
pub mod model;
pub mod models;
pub mod nlp;
pub mod outer;
pub mod ranobj;
pub mod recorder;
pub mod residual;
pub mod sparsity;
pub mod types;

pub use ad::Scalar;
pub use config::{ConfigError, DerivativeTest, FitOptions, FitProblem, HessianApproximation};
pub use estimate::{EstimationError, FitResult, MixedEngine, fit, fit_replicates};
pub use inner::InnerFailure;
pub use model::MixedModel;
pub use models::RandomInterceptModel;
pub use nlp::SolverStatus;
pub use residual::{Density, PriorSpec};
pub use types::{FixedEffects, PackLayout, RandomEffects};

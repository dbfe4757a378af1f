//! Recordings of the model likelihoods.
//!
//! The random likelihood is recorded twice. Level 1 is `f(θ, u)` itself and
//! serves values, gradients and the cross Hessian `f_uθ`. Level 2 maps `(θ, u)`
//! to the values of `f_uu` in pattern order; it is obtained by replaying the
//! level-1 colored Hessian sweeps with active variables, and its reverse sweep
//! yields the third-order terms of the log-determinant gradient.

use crate::ad::{self, AVar, AdError, Tape};
use crate::config::ConfigError;
use crate::sparsity::{HessianBlock, SparseHessian, SparseHessianCache, SparsityPattern};
use crate::types::PackLayout;
use log::info;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Recording failed: {0}")]
    Ad(#[from] AdError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A tape together with the lazily computed sparse Hessians of its blocks.
#[derive(Debug)]
pub struct Recording {
    tape: Tape,
    hessians: SparseHessianCache,
}

impl Recording {
    pub fn new(tape: Tape, layout: PackLayout) -> Self {
        Self {
            tape,
            hessians: SparseHessianCache::new(layout),
        }
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    pub fn layout(&self) -> PackLayout {
        self.hessians.layout()
    }

    pub fn hessian(&self, block: HessianBlock) -> &SparseHessian {
        self.hessians.get(&self.tape, block)
    }
}

/// `f_uu` values as a recorded function of the packed `(θ, u)`.
#[derive(Debug)]
pub struct HessianRecording {
    tape: Tape,
    pattern: SparsityPattern,
}

impl HessianRecording {
    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    /// Lower-triangle pattern of `f_uu` in random-effect numbering.
    pub fn pattern(&self) -> &SparsityPattern {
        &self.pattern
    }
}

/// Both levels of the random-likelihood recording.
#[derive(Debug)]
pub struct RandomRecordings {
    layout: PackLayout,
    likelihood: Option<Recording>,
    hessian: Option<HessianRecording>,
}

impl RandomRecordings {
    pub fn layout(&self) -> PackLayout {
        self.layout
    }

    /// Level 1; `None` when the random likelihood has no outputs.
    pub fn likelihood(&self) -> Option<&Recording> {
        self.likelihood.as_ref()
    }

    /// Level 2; `None` when there are no random effects.
    pub fn hessian(&self) -> Option<&HessianRecording> {
        self.hessian.as_ref()
    }

    pub fn value(&self, fixed: &[f64], random: &[f64]) -> f64 {
        match &self.likelihood {
            Some(recording) => recording.tape().eval(&self.layout.pack(fixed, random))[0],
            None => 0.0,
        }
    }

    /// Value and gradient with respect to the packed `(θ, u)`.
    pub fn gradient(&self, fixed: &[f64], random: &[f64]) -> (f64, Vec<f64>) {
        match &self.likelihood {
            Some(recording) => {
                let (values, gradient) = recording
                    .tape()
                    .gradient(&self.layout.pack(fixed, random), &[1.0]);
                (values[0], gradient)
            }
            None => (0.0, vec![0.0; self.layout.len()]),
        }
    }

    /// `f_uu` values from the level-2 recording, in the order of its pattern.
    pub fn random_hessian(&self, fixed: &[f64], random: &[f64]) -> Vec<f64> {
        match &self.hessian {
            Some(hessian) => hessian.tape.eval(&self.layout.pack(fixed, random)),
            None => Vec::new(),
        }
    }

    /// Pattern (rows random, columns fixed) and values of `f_uθ`.
    pub fn cross_hessian(&self, fixed: &[f64], random: &[f64]) -> (SparsityPattern, Vec<f64>) {
        match &self.likelihood {
            Some(recording) if self.layout.n_random > 0 && self.layout.n_fixed > 0 => {
                let cross = recording.hessian(HessianBlock::RandomFixed);
                let values = cross.evaluate(recording.tape(), &self.layout.pack(fixed, random), &[1.0]);
                (cross.block_pattern().clone(), values)
            }
            _ => (SparsityPattern::default(), Vec::new()),
        }
    }
}

/// Records model functions over a fixed packing layout.
#[derive(Clone, Copy, Debug)]
pub struct FunctionRecorder {
    layout: PackLayout,
}

impl FunctionRecorder {
    pub fn new(layout: PackLayout) -> Self {
        Self { layout }
    }

    /// Records the random likelihood at `(fixed, random)` at both levels.
    pub fn record_random<F>(
        &self,
        likelihood: F,
        fixed: &[f64],
        random: &[f64],
    ) -> Result<RandomRecordings, RecordingError>
    where
        F: Fn(&[AVar], &[AVar]) -> Vec<AVar>,
    {
        let layout = self.layout;
        let packed = layout.pack(fixed, random);
        let tape = ad::record(&packed, |x| {
            let (theta, u) = layout.unpack(x);
            likelihood(theta, u)
        })?;

        let n_outputs = tape.n_outputs();
        let size_ok = n_outputs == 1 || (n_outputs == 0 && layout.n_random == 0);
        if !size_ok {
            return Err(ConfigError::RandomLikelihoodSize {
                found: n_outputs,
                n_random: layout.n_random,
            }
            .into());
        }
        if n_outputs == 0 {
            info!("Random likelihood is empty; L(θ) reduces to the fixed likelihood.");
            return Ok(RandomRecordings {
                layout,
                likelihood: None,
                hessian: None,
            });
        }
        if tape.has_abs() {
            return Err(ConfigError::NonSmoothRandomLikelihood.into());
        }
        info!(
            "Recorded random likelihood: {} inputs, {} operations.",
            tape.n_inputs(),
            tape.n_operations()
        );

        let recording = Recording::new(tape, layout);
        let hessian = if layout.n_random > 0 {
            let block = recording.hessian(HessianBlock::RandomRandom);
            let level_two = ad::record(&packed, |x| {
                block.evaluate(recording.tape(), x, &[AVar::constant(1.0)])
            })?;
            info!(
                "Recorded random Hessian: {} entries, {} operations.",
                block.pattern().len(),
                level_two.n_operations()
            );
            Some(HessianRecording {
                tape: level_two,
                pattern: block.block_pattern().clone(),
            })
        } else {
            None
        };

        Ok(RandomRecordings {
            layout,
            likelihood: Some(recording),
            hessian,
        })
    }

    /// Records a function of the fixed effects alone; `None` when it has no outputs.
    pub fn record_fixed<F>(&self, function: F, fixed: &[f64]) -> Result<Option<Recording>, AdError>
    where
        F: Fn(&[AVar]) -> Vec<AVar>,
    {
        let tape = ad::record(fixed, |x| function(x))?;
        if tape.n_outputs() == 0 {
            return Ok(None);
        }
        Ok(Some(Recording::new(
            tape,
            PackLayout::fixed_only(self.layout.n_fixed),
        )))
    }
}

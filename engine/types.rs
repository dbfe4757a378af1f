use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut, Range};

/// Fixed effects θ, the parameters the outer optimizer estimates.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedEffects(pub Array1<f64>);

impl FixedEffects {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }


    /// Bit pattern of every component of θ; identical vectors map to identical keys.
    pub fn cache_key(theta: &[f64]) -> Vec<u64> {
        theta.iter().map(|v| v.to_bits()).collect()
    }
}

impl Deref for FixedEffects {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for FixedEffects {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for FixedEffects {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<FixedEffects> for Array1<f64> {
    fn from(values: FixedEffects) -> Self {
        values.0
    }
}

/// Random effects u, integrated out by the Laplace approximation.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RandomEffects(pub Array1<f64>);

impl RandomEffects {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

}

impl Deref for RandomEffects {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RandomEffects {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for RandomEffects {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<RandomEffects> for Array1<f64> {
    fn from(values: RandomEffects) -> Self {
        values.0
    }
}

/// Layout of the packed argument vectors handed to recorded functions.
///
/// The two-part layout is `(θ, u)`; the three-part layout used by the
/// fixed-Hessian recording is `(β, θ, u)` where β is a second copy of θ.
/// Packing and unpacking are exact inverses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackLayout {
    pub n_fixed: usize,
    pub n_random: usize,
}

impl PackLayout {
    pub fn new(n_fixed: usize, n_random: usize) -> Self {
        Self { n_fixed, n_random }
    }

    /// Layout of a function of the fixed effects alone.
    pub fn fixed_only(n_fixed: usize) -> Self {
        Self { n_fixed, n_random: 0 }
    }

    pub fn len(&self) -> usize {
        self.n_fixed + self.n_random
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn three_len(&self) -> usize {
        2 * self.n_fixed + self.n_random
    }

    pub fn fixed_range(&self) -> Range<usize> {
        0..self.n_fixed
    }

    pub fn random_range(&self) -> Range<usize> {
        self.n_fixed..self.n_fixed + self.n_random
    }

    pub fn pack<T: Copy>(&self, fixed: &[T], random: &[T]) -> Vec<T> {
        assert_eq!(fixed.len(), self.n_fixed, "fixed effects have the wrong length");
        assert_eq!(random.len(), self.n_random, "random effects have the wrong length");
        let mut packed = Vec::with_capacity(self.len());
        packed.extend_from_slice(fixed);
        packed.extend_from_slice(random);
        packed
    }

    pub fn unpack<'a, T>(&self, both: &'a [T]) -> (&'a [T], &'a [T]) {
        assert_eq!(both.len(), self.len(), "packed vector has the wrong length");
        both.split_at(self.n_fixed)
    }

    pub fn pack_three<T: Copy>(&self, beta: &[T], theta: &[T], random: &[T]) -> Vec<T> {
        assert_eq!(beta.len(), self.n_fixed, "β has the wrong length");
        assert_eq!(theta.len(), self.n_fixed, "θ has the wrong length");
        assert_eq!(random.len(), self.n_random, "random effects have the wrong length");
        let mut packed = Vec::with_capacity(self.three_len());
        packed.extend_from_slice(beta);
        packed.extend_from_slice(theta);
        packed.extend_from_slice(random);
        packed
    }

    pub fn unpack_three<'a, T>(&self, three: &'a [T]) -> (&'a [T], &'a [T], &'a [T]) {
        assert_eq!(three.len(), self.three_len(), "packed vector has the wrong length");
        let (beta, rest) = three.split_at(self.n_fixed);
        let (theta, random) = rest.split_at(self.n_fixed);
        (beta, theta, random)
    }
}

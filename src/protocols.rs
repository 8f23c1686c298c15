//! Trait seams between the detection engine and its collaborators.
//!
//! The engine never reaches for a global random generator. The single
//! probabilistic decision it makes (whether a same-source duplicate counts as
//! suspicious) draws from a [`UniformSource`] owned by that engine, so tests
//! can script the outcome and simulations can seed each receiver
//! independently.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Provider of uniform samples in `[0, 1)`.
pub trait UniformSource: Send {
    fn next_uniform(&mut self) -> f64;
}

/// Adapts any [`rand::Rng`] into a [`UniformSource`].
#[derive(Clone, Debug)]
pub struct RngSource<R>(R);

impl<R: Rng + Send> RngSource<R> {
    pub fn new(rng: R) -> Self {
        Self(rng)
    }
}

impl RngSource<ChaCha8Rng> {
    /// Reproducible source for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self(ChaCha8Rng::seed_from_u64(seed))
    }

    /// Source seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self(ChaCha8Rng::from_entropy())
    }
}

impl<R: Rng + Send> UniformSource for RngSource<R> {
    #[inline]
    fn next_uniform(&mut self) -> f64 {
        self.0.r#gen::<f64>()
    }
}

impl<U: UniformSource + ?Sized> UniformSource for Box<U> {
    fn next_uniform(&mut self) -> f64 {
        (**self).next_uniform()
    }
}

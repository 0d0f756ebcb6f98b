//! Explicit random state.
//!
//! Every source of randomness in the model (weight initialization, dropout
//! masks, token sampling) draws from a [`SeededRng`] handed in by the caller.
//! Same seed and same call sequence give bit-identical results.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{LumiError, Result};

/// Seeded random generator threaded through construction and forward calls.
#[derive(Debug, Clone)]
pub struct SeededRng {
    inner: StdRng,
    seed: u64,
}

impl SeededRng {
    /// Create a generator from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seed this generator was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Draw `len` samples from N(mean, std).
    pub fn normal_vec(&mut self, len: usize, mean: f64, std: f64) -> Result<Vec<f32>> {
        let dist = Normal::new(mean, std)
            .map_err(|e| LumiError::config(format!("invalid normal distribution: {e}")))?;
        Ok((0..len)
            .map(|_| dist.sample(&mut self.inner) as f32)
            .collect())
    }

    /// Inverted-dropout keep mask: each entry is `0` with probability `p`,
    /// otherwise `1 / (1 - p)`.
    pub fn dropout_mask(&mut self, len: usize, p: f32) -> Vec<f32> {
        let scale = 1.0 / (1.0 - p);
        (0..len)
            .map(|_| {
                if self.inner.gen::<f32>() < p {
                    0.0
                } else {
                    scale
                }
            })
            .collect()
    }

    /// Uniform sample in `[0, 1)`.
    pub fn uniform(&mut self) -> f32 {
        self.inner.gen::<f32>()
    }
}

/// Per-call forward context.
///
/// Carries the training/inference switch. In training mode it also holds the
/// generator that dropout draws its masks from.
#[derive(Debug)]
pub struct ForwardCtx<'a> {
    rng: Option<&'a mut SeededRng>,
}

impl<'a> ForwardCtx<'a> {
    /// Inference mode: dropout is disabled.
    pub fn inference() -> Self {
        Self { rng: None }
    }

    /// Training mode: dropout is active and consumes `rng`.
    pub fn training(rng: &'a mut SeededRng) -> Self {
        Self { rng: Some(rng) }
    }

    /// Whether dropout is active.
    pub fn is_training(&self) -> bool {
        self.rng.is_some()
    }

    /// Generator for dropout masks, if training.
    pub(crate) fn rng(&mut self) -> Option<&mut SeededRng> {
        self.rng.as_deref_mut()
    }

    /// Copy of the current generator state, used to replay a segment.
    pub(crate) fn snapshot(&self) -> Option<SeededRng> {
        self.rng.as_deref().cloned()
    }
}

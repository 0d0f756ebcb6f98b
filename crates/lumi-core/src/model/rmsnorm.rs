//! Root Mean Square Layer Normalization.
//!
//! RMSNorm is a simpler alternative to LayerNorm that only
//! normalizes by the root mean square, without centering.
//!
//! # Formula
//!
//! `RMSNorm(x) = x * weight / sqrt(mean(x^2) + eps)`
//!
//! # Reference
//!
//! [Root Mean Square Layer Normalization](https://arxiv.org/abs/1910.07467)

use crate::error::{LumiError, Result};
use candle_core::{DType, Device, Tensor, D};

/// RMS Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter (gamma).
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
    /// Hidden dimension.
    hidden_size: usize,
}

impl RmsNorm {
    /// Create a new RMSNorm layer with given weight.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        let hidden_size = weight.dims1().map_err(|_| {
            LumiError::ShapeMismatch(format!(
                "rmsnorm weight must be 1-D, got {:?}",
                weight.dims()
            ))
        })?;
        Ok(Self {
            weight,
            eps,
            hidden_size,
        })
    }

    /// Create a new RMSNorm layer with ones (for testing).
    pub fn ones(hidden_size: usize, eps: f64, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, DType::F32, device)?;
        Self::new(weight, eps)
    }

    /// Forward pass.
    ///
    /// Statistics are computed in F32 regardless of the input dtype; the
    /// output is cast back to the input dtype.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;

        // 1/sqrt(mean + eps)
        let rsqrt = (mean_sq + self.eps)?.sqrt()?.recip()?;

        let normalized = x.broadcast_mul(&rsqrt)?;
        let output = normalized.broadcast_mul(&self.weight.to_dtype(DType::F32)?)?;

        Ok(output.to_dtype(in_dtype)?)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Get epsilon value.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    /// Get the weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

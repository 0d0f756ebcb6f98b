//! SwiGLU MLP (Swish-Gated Linear Unit).
//!
//! SwiGLU is a gated activation function used in modern transformers
//! like Llama and PaLM. It combines SiLU (Swish) with a gating mechanism.
//!
//! # Formula
//!
//! `SwiGLU(x) = (silu(x @ up_proj) * (x @ gate_proj)) @ down_proj`
//!
//! Where `silu(x) = x * sigmoid(x)`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::{Dropout, Linear};
use crate::error::Result;
use crate::rng::ForwardCtx;
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::silu;

/// SwiGLU MLP block.
#[derive(Debug, Clone)]
pub struct SwiGluMlp {
    /// Gate projection: hidden -> intermediate
    gate_proj: Linear,
    /// Up projection: hidden -> intermediate
    up_proj: Linear,
    /// Down projection: intermediate -> hidden
    down_proj: Linear,
    /// Output dropout, applied before the residual add.
    dropout: Dropout,
}

impl SwiGluMlp {
    /// Create a new SwiGLU MLP with given weights.
    pub fn new(gate_proj: Tensor, up_proj: Tensor, down_proj: Tensor, dropout: f32) -> Result<Self> {
        Ok(Self {
            gate_proj: Linear::new(gate_proj)?,
            up_proj: Linear::new(up_proj)?,
            down_proj: Linear::new(down_proj)?,
            dropout: Dropout::new(dropout),
        })
    }

    /// Create a new SwiGLU MLP with random weights (for testing).
    pub fn random(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        // Weight shapes: [out_features, in_features]
        let gate_proj = Tensor::randn(0.0f32, 0.02, &[intermediate_size, hidden_size], device)?;
        let up_proj = Tensor::randn(0.0f32, 0.02, &[intermediate_size, hidden_size], device)?;
        let down_proj = Tensor::randn(0.0f32, 0.02, &[hidden_size, intermediate_size], device)?;
        Self::new(gate_proj, up_proj, down_proj, 0.0)
    }

    /// Create with zeros (for testing specific behaviors).
    pub fn zeros(hidden_size: usize, intermediate_size: usize, device: &Device) -> Result<Self> {
        let gate_proj = Tensor::zeros(&[intermediate_size, hidden_size], DType::F32, device)?;
        let up_proj = Tensor::zeros(&[intermediate_size, hidden_size], DType::F32, device)?;
        let down_proj = Tensor::zeros(&[hidden_size, intermediate_size], DType::F32, device)?;
        Self::new(gate_proj, up_proj, down_proj, 0.0)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., hidden_size]
    /// * `ctx` - Forward context (dropout)
    pub fn forward(&self, x: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?;
        let up = self.up_proj.forward(x)?;

        // silu(up) * gate
        let activated = (silu(&up)? * gate)?;

        let output = self.down_proj.forward(&activated)?;
        self.dropout.forward(&output, ctx)
    }

    /// Get the hidden size.
    pub fn hidden_size(&self) -> usize {
        self.gate_proj.in_features()
    }

    /// Get the intermediate size.
    pub fn intermediate_size(&self) -> usize {
        self.gate_proj.out_features()
    }
}

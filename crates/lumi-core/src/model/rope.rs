//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Coordinate `k` is paired with coordinate
//! `k + head_dim / 2` and each pair is rotated by `position * theta^(-2k/d)`.
//!
//! The cache covers positions `[0, max_seq_len)`. There is no extrapolation
//! strategy, so anything beyond is rejected.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{LumiError, Result};
use candle_core::{Device, Tensor, D};

/// Rotary Position Embedding implementation.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine cache for positions: [max_seq_len, head_dim / 2]
    cos_cache: Tensor,
    /// Sine cache for positions: [max_seq_len, head_dim / 2]
    sin_cache: Tensor,
    /// Head dimension.
    head_dim: usize,
    /// Maximum sequence length cached.
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Create a new rotary embedding.
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head (must be even)
    /// * `max_seq_len` - Maximum sequence length to cache
    /// * `theta` - Base frequency
    /// * `device` - Device for tensors
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(LumiError::config(format!(
                "rotary head_dim must be even and positive, got {head_dim}"
            )));
        }

        // Inverse frequencies: 1 / (theta^(2i/d)) for i in [0, d/2)
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_slice(&positions, (max_seq_len, 1), device)?;

        // freqs = positions * inv_freq -> [max_seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            head_dim,
            max_seq_len,
        })
    }

    /// Rotate `x` for positions `offset..offset + seq_len`.
    ///
    /// # Arguments
    ///
    /// * `x` - Query or key tensor [batch, heads, seq_len, head_dim]
    /// * `offset` - Position of the first token
    pub fn apply(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (cos, sin) = self.tables(x, offset)?;
        Self::rotate(x, &cos, &sin)
    }

    /// Apply rotary embeddings to query and key tensors.
    ///
    /// # Arguments
    ///
    /// * `query` - Query tensor [batch, num_heads, seq_len, head_dim]
    /// * `key` - Key tensor [batch, num_kv_heads, seq_len, head_dim]
    /// * `offset` - Starting position for each sequence
    pub fn apply_pair(
        &self,
        query: &Tensor,
        key: &Tensor,
        offset: usize,
    ) -> Result<(Tensor, Tensor)> {
        let (cos, sin) = self.tables(query, offset)?;
        let query_rot = Self::rotate(query, &cos, &sin)?;
        let key_rot = Self::rotate(key, &cos, &sin)?;
        Ok((query_rot, key_rot))
    }

    /// Slice cos/sin for the positions covered by `x`, cast to its dtype.
    fn tables(&self, x: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        if head_dim != self.head_dim {
            return Err(LumiError::ShapeMismatch(format!(
                "rotary head_dim {} does not match input head_dim {}",
                self.head_dim, head_dim
            )));
        }
        if offset + seq_len > self.max_seq_len {
            return Err(LumiError::SequenceTooLong {
                len: offset + seq_len,
                max: self.max_seq_len,
            });
        }

        let cos = self.cos_cache.narrow(0, offset, seq_len)?.to_dtype(x.dtype())?;
        let sin = self.sin_cache.narrow(0, offset, seq_len)?.to_dtype(x.dtype())?;
        Ok((cos, sin))
    }

    /// Rotate `[x1, x2] -> [x1*cos - x2*sin, x1*sin + x2*cos]`.
    ///
    /// `cos`/`sin` are [seq_len, head_dim / 2] and broadcast over batch and heads.
    fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let half_dim = x.dim(D::Minus1)? / 2;

        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;

        // [1, 1, seq_len, half_dim]
        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

        let out1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let out2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;

        Ok(Tensor::cat(&[out1, out2], D::Minus1)?)
    }

    /// Get the maximum sequence length this embedding supports.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

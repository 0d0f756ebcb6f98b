//! Inverted dropout driven by the caller's [`SeededRng`].

use crate::error::Result;
use crate::rng::ForwardCtx;
use candle_core::Tensor;

/// Dropout with probability `p`. Identity in inference mode or when `p == 0`.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    /// Create a dropout layer.
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    /// Drop probability.
    pub fn p(&self) -> f32 {
        self.p
    }

    /// Apply dropout. The mask is drawn on the host from the context's
    /// generator so that it is reproducible on every device.
    ///
    /// Cost: one host draw per element plus an upload. On attention
    /// probabilities that is `batch * heads * q_len * kv_len` draws per
    /// layer, repeated during checkpoint replay. Set `dropout.attention` to
    /// 0 when that dominates GPU step time.
    pub fn forward(&self, x: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        if self.p <= 0.0 {
            return Ok(x.clone());
        }
        let Some(rng) = ctx.rng() else {
            return Ok(x.clone());
        };

        let mask = rng.dropout_mask(x.elem_count(), self.p);
        let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
        Ok((x * mask)?)
    }
}

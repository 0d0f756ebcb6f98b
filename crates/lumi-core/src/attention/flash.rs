//! Flash-attention kernel tier.
//!
//! Uses Flash Attention 2 kernels from candle-flash-attn. The kernel handles
//! grouped KV heads natively and aligns the causal mask to the bottom-right
//! corner, which matches a cached prefix of length `kv_len - q_len`.

use super::AttentionConfig;
use crate::error::Result;
use candle_core::{DType, Device, Tensor};

/// Whether the kernel can run for this configuration.
#[cfg(feature = "flash-attn")]
pub(crate) fn probe(config: &AttentionConfig, device: &Device, dtype: DType) -> std::result::Result<(), String> {
    if !device.is_cuda() {
        return Err("flash attention requires a CUDA device".to_string());
    }
    if !matches!(dtype, DType::F16 | DType::BF16) {
        return Err(format!("flash attention requires f16 or bf16, got {dtype:?}"));
    }
    if config.dropout > 0.0 {
        return Err("flash attention tier does not apply attention dropout".to_string());
    }
    if config.head_dim > 256 || config.head_dim % 8 != 0 {
        return Err(format!("unsupported head_dim {} for flash attention", config.head_dim));
    }
    Ok(())
}

#[cfg(not(feature = "flash-attn"))]
pub(crate) fn probe(_config: &AttentionConfig, _device: &Device, _dtype: DType) -> std::result::Result<(), String> {
    Err("built without the flash-attn feature".to_string())
}

#[cfg(feature = "flash-attn")]
pub(crate) fn forward(query: &Tensor, key: &Tensor, value: &Tensor, config: &AttentionConfig) -> Result<Tensor> {
    // Flash attention expects [batch, seq_len, num_heads, head_dim]
    let q = query.transpose(1, 2)?.contiguous()?;
    let k = key.transpose(1, 2)?.contiguous()?;
    let v = value.transpose(1, 2)?.contiguous()?;

    let output = candle_flash_attn::flash_attn(&q, &k, &v, config.scale, true)?;

    // Back to [batch, num_heads, seq_len, head_dim]
    Ok(output.transpose(1, 2)?)
}

#[cfg(not(feature = "flash-attn"))]
pub(crate) fn forward(_query: &Tensor, _key: &Tensor, _value: &Tensor, _config: &AttentionConfig) -> Result<Tensor> {
    Err(crate::error::LumiError::Config(
        "fused attention kernel is not compiled in (enable the flash-attn feature)".to_string(),
    ))
}

//! Causal masks.
//!
//! Masks are rebuilt on every call from the query and key lengths. When the
//! keys include a cached prefix (`kv_len > q_len`), query row `i` sits at
//! absolute position `i + kv_len - q_len` and may attend to every key up to
//! and including that position.

use crate::error::{LumiError, Result};
use candle_core::{DType, Device, Tensor};

fn check_lengths(q_len: usize, kv_len: usize) -> Result<usize> {
    if q_len == 0 || kv_len < q_len {
        return Err(LumiError::ShapeMismatch(format!(
            "causal mask needs 0 < q_len <= kv_len, got q_len={q_len} kv_len={kv_len}"
        )));
    }
    Ok(kv_len - q_len)
}

/// Additive causal mask [q_len, kv_len]: `0` where attention is allowed,
/// `-inf` for future positions.
pub fn causal_mask(q_len: usize, kv_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let offset = check_lengths(q_len, kv_len)?;
    let mut mask_data = vec![0.0f32; q_len * kv_len];
    for i in 0..q_len {
        for j in (i + offset + 1)..kv_len {
            mask_data[i * kv_len + j] = f32::NEG_INFINITY;
        }
    }
    let mask = Tensor::from_vec(mask_data, (q_len, kv_len), device)?;
    Ok(mask.to_dtype(dtype)?)
}

/// Boolean causal mask [q_len, kv_len] as `u8`: `1` marks a forbidden
/// (future) position.
pub fn causal_mask_bool(q_len: usize, kv_len: usize, device: &Device) -> Result<Tensor> {
    let offset = check_lengths(q_len, kv_len)?;
    let mask_data: Vec<u8> = (0..q_len)
        .flat_map(|i| (0..kv_len).map(move |j| u8::from(j > i + offset)))
        .collect();
    Ok(Tensor::from_vec(mask_data, (q_len, kv_len), device)?)
}

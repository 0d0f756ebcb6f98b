//! Attention backend selection and the scaled dot-product computation.
//!
//! This module provides:
//! - [`AttentionBackend`] - The tier chosen for a model: fused kernel,
//!   fused primitive, or manual reference
//! - [`BackendPreference`] - Requested tier, stored in the model config
//! - [`AttentionConfig`] - Configuration for attention computation
//!
//! Selection runs once when the model is built. Every tier computes
//! `softmax(Q K^T / sqrt(d) + causal) V` and they agree up to rounding.

use super::{causal_mask, causal_mask_bool};
use crate::error::{LumiError, Result};
use crate::model::Dropout;
use crate::rng::ForwardCtx;
use candle_core::{DType, Device, Tensor, D};
use serde::{Deserialize, Serialize};

/// Configuration for attention computation.
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    /// Number of query heads.
    pub num_heads: usize,
    /// Number of KV heads (for GQA).
    pub num_kv_heads: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Softmax scale (1/sqrt(head_dim) by default).
    pub scale: f32,
    /// Dropout probability on attention weights.
    pub dropout: f32,
}

impl AttentionConfig {
    /// Create a new attention config.
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f32).sqrt(),
            dropout: 0.0,
        }
    }

    /// Set attention-probability dropout.
    pub fn with_dropout(mut self, p: f32) -> Self {
        self.dropout = p;
        self
    }

    /// Number of query heads per KV head (for GQA).
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self::new(8, 8, 64) // 8 heads, 64 dim
    }
}

/// Requested attention tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Probe from the fastest tier down.
    #[default]
    Auto,
    /// Start at the fused flash-attention kernel.
    ///
    /// The kernel has no attention dropout, so it is only eligible when
    /// `dropout.attention` is 0. The presets use 0.1; build with
    /// `with_dropout(DropoutConfig::disabled())` for inference on CUDA.
    Fused,
    /// Start at the fused scaled-dot-product primitive.
    FusedPrimitive,
    /// Use the manual reference formula.
    Manual,
}

/// Attention tier in use by a model. Chosen once, never re-probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionBackend {
    /// Flash-attention kernel (CUDA, half precision).
    Fused,
    /// Grouped scaled-dot-product built from substrate primitives: query
    /// groups are folded into the row axis so K/V are never repeated, and the
    /// causal mask is a boolean fill.
    FusedPrimitive,
    /// Reference formula with explicit intermediates: repeated K/V heads and
    /// an additive `-inf` mask.
    Manual,
}

const TIERS: [AttentionBackend; 3] = [
    AttentionBackend::Fused,
    AttentionBackend::FusedPrimitive,
    AttentionBackend::Manual,
];

impl AttentionBackend {
    /// Pick the first usable tier at or below `preference`.
    ///
    /// Rejected tiers are logged; selection itself never fails because the
    /// manual tier is always available.
    pub fn select(
        preference: BackendPreference,
        config: &AttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> Self {
        let start = match preference {
            BackendPreference::Auto | BackendPreference::Fused => 0,
            BackendPreference::FusedPrimitive => 1,
            BackendPreference::Manual => 2,
        };

        for tier in &TIERS[start..] {
            match tier.probe(config, device, dtype) {
                Ok(()) => {
                    tracing::info!(backend = tier.name(), ?dtype, "attention backend selected");
                    return *tier;
                }
                Err(reason) if preference == BackendPreference::Auto => {
                    tracing::debug!(backend = tier.name(), %reason, "attention tier unavailable");
                }
                Err(reason) => {
                    tracing::warn!(backend = tier.name(), %reason, "attention tier unavailable, falling back");
                }
            }
        }
        AttentionBackend::Manual
    }

    /// Capability check for this tier.
    pub fn probe(
        &self,
        config: &AttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<(), String> {
        match self {
            Self::Fused => super::flash::probe(config, device, dtype),
            Self::FusedPrimitive => match dtype {
                DType::BF16 if device.is_cpu() => Err("no bf16 matmul on cpu".to_string()),
                DType::F16 | DType::BF16 | DType::F32 => Ok(()),
                other => Err(format!("no fused primitive for {other:?}")),
            },
            Self::Manual => Ok(()),
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fused => "fused",
            Self::FusedPrimitive => "fused_primitive",
            Self::Manual => "manual",
        }
    }

    /// Causal attention over already-rotated inputs.
    ///
    /// # Arguments
    ///
    /// * `query` - [batch, num_heads, q_len, head_dim]
    /// * `key` / `value` - [batch, num_kv_heads, kv_len, head_dim], where
    ///   `kv_len - q_len` is the length of any cached prefix
    ///
    /// Returns [batch, num_heads, q_len, head_dim].
    pub fn compute(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        config: &AttentionConfig,
        ctx: &mut ForwardCtx<'_>,
    ) -> Result<Tensor> {
        check_shapes(query, key, value, config)?;
        match self {
            Self::Fused => super::flash::forward(query, key, value, config),
            Self::FusedPrimitive => fused_primitive(query, key, value, config, ctx),
            Self::Manual => manual(query, key, value, config, ctx),
        }
    }

    /// Attention probabilities [batch, num_heads, q_len, kv_len] without
    /// dropout. Used for inspection; the fused kernel never materializes
    /// them, so every tier reports the reference values.
    pub fn probabilities(
        &self,
        query: &Tensor,
        key: &Tensor,
        config: &AttentionConfig,
    ) -> Result<Tensor> {
        let key = repeat_kv(key, config.num_queries_per_kv())?;
        let scores = scores_with_mask(query, &key, config)?;
        Ok(candle_nn::ops::softmax(&scores, D::Minus1)?)
    }
}

fn check_shapes(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    config: &AttentionConfig,
) -> Result<()> {
    let (b, h, q_len, d) = query.dims4()?;
    let (kb, kh, kv_len, kd) = key.dims4()?;
    if (b, h, d) != (kb, config.num_heads, kd)
        || kh != config.num_kv_heads
        || d != config.head_dim
        || key.dims() != value.dims()
        || kv_len < q_len
    {
        return Err(LumiError::ShapeMismatch(format!(
            "attention inputs q={:?} k={:?} v={:?} do not match {} heads / {} kv heads / head_dim {}",
            query.dims(),
            key.dims(),
            value.dims(),
            config.num_heads,
            config.num_kv_heads,
            config.head_dim
        )));
    }
    Ok(())
}

/// `Q K^T * scale + causal` with K already expanded to every query head.
fn scores_with_mask(query: &Tensor, key: &Tensor, config: &AttentionConfig) -> Result<Tensor> {
    let q_len = query.dim(2)?;
    let kv_len = key.dim(2)?;

    let scores = (query.matmul(&key.t()?)? * config.scale as f64)?;
    let mask = causal_mask(q_len, kv_len, scores.dtype(), scores.device())?;
    Ok(scores.broadcast_add(&mask)?)
}

fn manual(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    config: &AttentionConfig,
    ctx: &mut ForwardCtx<'_>,
) -> Result<Tensor> {
    let repeat = config.num_queries_per_kv();
    let key = repeat_kv(key, repeat)?;
    let value = repeat_kv(value, repeat)?;

    let scores = scores_with_mask(query, &key, config)?;
    let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let attn_weights = Dropout::new(config.dropout).forward(&attn_weights, ctx)?;

    Ok(attn_weights.matmul(&value)?)
}

fn fused_primitive(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    config: &AttentionConfig,
    ctx: &mut ForwardCtx<'_>,
) -> Result<Tensor> {
    let (batch, num_heads, q_len, head_dim) = query.dims4()?;
    let num_kv_heads = key.dim(1)?;
    let kv_len = key.dim(2)?;
    let group = num_heads / num_kv_heads;

    // Query head h uses KV head h / group, so heads of one group are adjacent
    // and can be stacked along the row axis.
    let query = query
        .contiguous()?
        .reshape((batch, num_kv_heads, group * q_len, head_dim))?;

    let scores = (query.matmul(&key.t()?)? * config.scale as f64)?;
    let scores = scores.reshape((batch, num_kv_heads, group, q_len, kv_len))?;

    let mask = causal_mask_bool(q_len, kv_len, scores.device())?.broadcast_as(scores.shape())?;
    let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(scores.shape())?;
    let scores = mask.where_cond(&neg_inf, &scores)?;

    let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
    let attn_weights = Dropout::new(config.dropout).forward(&attn_weights, ctx)?;

    let output = attn_weights
        .reshape((batch, num_kv_heads, group * q_len, kv_len))?
        .matmul(&value.contiguous()?)?;
    Ok(output.reshape((batch, num_heads, q_len, head_dim))?)
}

/// Repeat KV heads for GQA.
///
/// `[batch, num_kv_heads, seq, head_dim] -> [batch, num_kv_heads * repeat, seq, head_dim]`
/// with output head `h` taken from input head `h / repeat`.
pub fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.clone());
    }

    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

    // [batch, num_kv_heads, seq, head_dim] -> [batch, num_kv_heads, 1, seq, head_dim]
    let x = x.unsqueeze(2)?;
    // Expand to [batch, num_kv_heads, repeat, seq, head_dim]
    let x = x.broadcast_as((batch, num_kv_heads, repeat, seq_len, head_dim))?;
    // Reshape to [batch, num_heads, seq, head_dim]
    Ok(x.reshape((batch, num_kv_heads * repeat, seq_len, head_dim))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SeededRng;

    fn create_dummy_tensor(rng: &mut SeededRng, dims: &[usize]) -> Tensor {
        let n = dims.iter().product();
        Tensor::from_vec(rng.normal_vec(n, 0.0, 1.0).unwrap(), dims, &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn attention_config_scale() {
        let config = AttentionConfig::new(8, 8, 64);
        let expected_scale = 1.0 / (64.0f32).sqrt();
        assert!((config.scale - expected_scale).abs() < 1e-6);
        assert_eq!(config.dropout, 0.0);
    }

    #[test]
    fn attention_config_gqa() {
        let config = AttentionConfig::new(12, 4, 64);
        assert_eq!(config.num_queries_per_kv(), 3);
    }

    #[test]
    fn preference_serde_names() {
        let json = serde_json::to_string(&BackendPreference::FusedPrimitive).unwrap();
        assert_eq!(json, "\"fused_primitive\"");
        let parsed: BackendPreference = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(parsed, BackendPreference::Manual);
    }

    #[test]
    fn selection_on_cpu_skips_fused_kernel() {
        let config = AttentionConfig::new(4, 4, 64);
        let auto = AttentionBackend::select(BackendPreference::Auto, &config, &Device::Cpu, DType::F32);
        assert_eq!(auto, AttentionBackend::FusedPrimitive);

        let forced = AttentionBackend::select(BackendPreference::Fused, &config, &Device::Cpu, DType::F32);
        assert_eq!(forced, AttentionBackend::FusedPrimitive);
    }

    #[test]
    fn selection_honors_manual_preference() {
        let config = AttentionConfig::new(4, 4, 64);
        let manual = AttentionBackend::select(BackendPreference::Manual, &config, &Device::Cpu, DType::F32);
        assert_eq!(manual, AttentionBackend::Manual);
    }

    #[test]
    fn fused_primitive_rejects_bf16_on_cpu() {
        let config = AttentionConfig::new(4, 4, 64);
        assert!(AttentionBackend::FusedPrimitive.probe(&config, &Device::Cpu, DType::BF16).is_err());
        assert!(AttentionBackend::FusedPrimitive.probe(&config, &Device::Cpu, DType::F16).is_ok());
    }

    #[test]
    fn selection_falls_to_manual_for_f64() {
        let config = AttentionConfig::new(4, 4, 64);
        let tier = AttentionBackend::select(BackendPreference::Auto, &config, &Device::Cpu, DType::F64);
        assert_eq!(tier, AttentionBackend::Manual);
    }

    #[test]
    fn repeat_kv_identity() {
        let mut rng = SeededRng::new(0);
        let x = create_dummy_tensor(&mut rng, &[1, 8, 4, 64]);
        let repeated = repeat_kv(&x, 1).unwrap();
        assert_eq!(repeated.dims(), x.dims());
    }

    #[test]
    fn repeat_kv_groups_adjacent_heads() {
        let mut rng = SeededRng::new(1);
        // [batch=1, num_kv_heads=2, seq=4, head_dim=8]
        let x = create_dummy_tensor(&mut rng, &[1, 2, 4, 8]);
        let repeated = repeat_kv(&x, 3).unwrap();
        assert_eq!(repeated.dims(), &[1, 6, 4, 8]);

        for h in 0..6 {
            let got = repeated.narrow(1, h, 1).unwrap();
            let want = x.narrow(1, h / 3, 1).unwrap();
            assert_eq!(max_abs_diff(&got, &want), 0.0);
        }
    }

    #[test]
    fn tiers_agree_full_precision() {
        let mut rng = SeededRng::new(2);
        let config = AttentionConfig::new(12, 4, 16);
        let q = create_dummy_tensor(&mut rng, &[2, 12, 9, 16]);
        let k = create_dummy_tensor(&mut rng, &[2, 4, 9, 16]);
        let v = create_dummy_tensor(&mut rng, &[2, 4, 9, 16]);

        let mut ctx = ForwardCtx::inference();
        let manual = AttentionBackend::Manual.compute(&q, &k, &v, &config, &mut ctx).unwrap();
        let fused = AttentionBackend::FusedPrimitive
            .compute(&q, &k, &v, &config, &mut ctx)
            .unwrap();

        assert_eq!(manual.dims(), &[2, 12, 9, 16]);
        assert!(max_abs_diff(&manual, &fused) < 1e-5);
    }

    #[test]
    fn tiers_agree_with_cached_prefix() {
        let mut rng = SeededRng::new(3);
        let config = AttentionConfig::new(4, 2, 8);
        let q = create_dummy_tensor(&mut rng, &[1, 4, 3, 8]);
        let k = create_dummy_tensor(&mut rng, &[1, 2, 7, 8]);
        let v = create_dummy_tensor(&mut rng, &[1, 2, 7, 8]);

        let mut ctx = ForwardCtx::inference();
        let manual = AttentionBackend::Manual.compute(&q, &k, &v, &config, &mut ctx).unwrap();
        let fused = AttentionBackend::FusedPrimitive
            .compute(&q, &k, &v, &config, &mut ctx)
            .unwrap();
        assert!(max_abs_diff(&manual, &fused) < 1e-5);
    }

    #[test]
    fn tiers_agree_reduced_precision() {
        let mut rng = SeededRng::new(4);
        let config = AttentionConfig::new(12, 4, 32);
        let q = create_dummy_tensor(&mut rng, &[1, 12, 32, 32]).to_dtype(DType::F16).unwrap();
        let k = create_dummy_tensor(&mut rng, &[1, 4, 32, 32]).to_dtype(DType::F16).unwrap();
        let v = create_dummy_tensor(&mut rng, &[1, 4, 32, 32]).to_dtype(DType::F16).unwrap();

        let mut ctx = ForwardCtx::inference();
        let manual = AttentionBackend::Manual
            .compute(&q, &k, &v, &config, &mut ctx)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap();
        let fused = AttentionBackend::FusedPrimitive
            .compute(&q, &k, &v, &config, &mut ctx)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap();
        assert!(max_abs_diff(&manual, &fused) < 1e-3);
    }

    #[test]
    fn causal_probabilities_are_zero_above_diagonal() {
        let mut rng = SeededRng::new(5);
        let config = AttentionConfig::new(6, 3, 8);
        let q = create_dummy_tensor(&mut rng, &[2, 6, 10, 8]);
        let k = create_dummy_tensor(&mut rng, &[2, 3, 10, 8]);

        let probs = AttentionBackend::Manual.probabilities(&q, &k, &config).unwrap();
        let probs: Vec<f32> = probs.flatten_all().unwrap().to_vec1().unwrap();

        for (idx, p) in probs.iter().enumerate() {
            let j = idx % 10;
            let i = (idx / 10) % 10;
            if j > i {
                assert_eq!(*p, 0.0, "future weight at i={i} j={j}");
            }
        }
    }

    #[test]
    fn first_position_attends_only_to_itself() {
        let mut rng = SeededRng::new(6);
        let config = AttentionConfig::new(2, 2, 8);
        let q = create_dummy_tensor(&mut rng, &[1, 2, 5, 8]);
        let k = create_dummy_tensor(&mut rng, &[1, 2, 5, 8]);
        let v = create_dummy_tensor(&mut rng, &[1, 2, 5, 8]);

        let out = AttentionBackend::FusedPrimitive
            .compute(&q, &k, &v, &config, &mut ForwardCtx::inference())
            .unwrap();
        let first = out.narrow(2, 0, 1).unwrap();
        let v_first = v.narrow(2, 0, 1).unwrap();
        assert!(max_abs_diff(&first, &v_first) < 1e-6);
    }

    #[test]
    fn attention_dropout_uses_ctx_rng() {
        let mut rng = SeededRng::new(7);
        let config = AttentionConfig::new(2, 2, 8).with_dropout(0.5);
        let q = create_dummy_tensor(&mut rng, &[1, 2, 6, 8]);
        let k = create_dummy_tensor(&mut rng, &[1, 2, 6, 8]);
        let v = create_dummy_tensor(&mut rng, &[1, 2, 6, 8]);

        let run = |tier: AttentionBackend, seed: u64| {
            let mut rng = SeededRng::new(seed);
            tier.compute(&q, &k, &v, &config, &mut ForwardCtx::training(&mut rng))
                .unwrap()
        };

        // Same seed reproduces; both tiers draw masks in the same order.
        let a = run(AttentionBackend::Manual, 11);
        let b = run(AttentionBackend::Manual, 11);
        let c = run(AttentionBackend::FusedPrimitive, 11);
        assert_eq!(max_abs_diff(&a, &b), 0.0);
        assert!(max_abs_diff(&a, &c) < 1e-5);

        let inference = AttentionBackend::Manual
            .compute(&q, &k, &v, &config, &mut ForwardCtx::inference())
            .unwrap();
        assert!(max_abs_diff(&a, &inference) > 0.0);
    }

    #[test]
    fn rejects_mismatched_heads() {
        let mut rng = SeededRng::new(8);
        let config = AttentionConfig::new(4, 2, 8);
        let q = create_dummy_tensor(&mut rng, &[1, 4, 3, 8]);
        let k = create_dummy_tensor(&mut rng, &[1, 4, 3, 8]);
        let v = create_dummy_tensor(&mut rng, &[1, 4, 3, 8]);
        let result = AttentionBackend::Manual.compute(&q, &k, &v, &config, &mut ForwardCtx::inference());
        assert!(matches!(result, Err(LumiError::ShapeMismatch(_))));
    }
}

//! Transformer layer implementation.
//!
//! A single transformer decoder layer combining:
//! - Pre-attention RMSNorm
//! - Grouped Query Attention
//! - Post-attention RMSNorm
//! - SwiGLU MLP

use super::{Dropout, LayerCache, Linear, ModelConfig, RmsNorm, RotaryEmbedding, SwiGluMlp};
use crate::attention::{AttentionBackend, AttentionConfig};
use crate::error::Result;
use crate::params::ParameterStore;
use crate::rng::{ForwardCtx, SeededRng};
use candle_core::Tensor;

/// Standard deviation of the normal weight initialization.
pub(crate) const INIT_STD: f64 = 0.02;

/// Self-attention module for transformer layers.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection: [num_heads * head_dim, hidden_size]
    q_proj: Linear,
    /// Key projection: [num_kv_heads * head_dim, hidden_size]
    k_proj: Linear,
    /// Value projection: [num_kv_heads * head_dim, hidden_size]
    v_proj: Linear,
    /// Output projection: [hidden_size, num_heads * head_dim]
    o_proj: Linear,
    config: AttentionConfig,
    backend: AttentionBackend,
    /// Output dropout.
    dropout: Dropout,
}

impl Attention {
    /// Create attention with provided weights.
    pub fn new(
        q_proj: Tensor,
        k_proj: Tensor,
        v_proj: Tensor,
        o_proj: Tensor,
        config: AttentionConfig,
        backend: AttentionBackend,
        output_dropout: f32,
    ) -> Result<Self> {
        Ok(Self {
            q_proj: Linear::new(q_proj)?,
            k_proj: Linear::new(k_proj)?,
            v_proj: Linear::new(v_proj)?,
            o_proj: Linear::new(o_proj)?,
            config,
            backend,
            dropout: Dropout::new(output_dropout),
        })
    }

    /// Forward computing Q, K, V projections.
    ///
    /// Returns (query, key, value) tensors reshaped for attention:
    /// - query: [batch, num_heads, seq_len, head_dim]
    /// - key: [batch, num_kv_heads, seq_len, head_dim]
    /// - value: [batch, num_kv_heads, seq_len, head_dim]
    pub fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq_len, _) = x.dims3()?;
        let head_dim = self.config.head_dim;

        // [batch, seq, heads, head_dim] -> [batch, heads, seq, head_dim]
        let q = self
            .q_proj
            .forward(x)?
            .reshape((batch, seq_len, self.config.num_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batch, seq_len, self.config.num_kv_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batch, seq_len, self.config.num_kv_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        Ok((q, k, v))
    }

    /// Apply output projection after attention.
    ///
    /// Input: [batch, num_heads, seq_len, head_dim]
    /// Output: [batch, seq_len, hidden_size]
    pub fn output(&self, attn_output: &Tensor) -> Result<Tensor> {
        let (batch, _, seq_len, _) = attn_output.dims4()?;

        // Transpose and reshape: [batch, seq, num_heads * head_dim]
        let x = attn_output
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.config.num_heads * self.config.head_dim))?;
        self.o_proj.forward(&x)
    }

    /// Full attention sub-layer: project, rotate, attend, project out, drop.
    ///
    /// With a cache, new tokens sit at offset `cache.seq_len()` and attend to
    /// every cached position; their keys and values are appended.
    pub fn forward(
        &self,
        x: &Tensor,
        rope: &RotaryEmbedding,
        ctx: &mut ForwardCtx<'_>,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let (q, k, v) = self.project(x)?;

        let offset = cache.as_ref().map(|c| c.seq_len()).unwrap_or(0);
        let (q, k) = rope.apply_pair(&q, &k, offset)?;

        let (k, v) = match cache {
            Some(cache) => cache.append(&k, &v)?,
            None => (k, v),
        };

        let attn_output = self.backend.compute(&q, &k, &v, &self.config, ctx)?;
        let output = self.output(&attn_output)?;
        self.dropout.forward(&output, ctx)
    }

    /// Attention configuration.
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Selected compute tier.
    pub fn backend(&self) -> AttentionBackend {
        self.backend
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    /// Get the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.config.num_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.config.head_dim
    }
}

/// A single transformer decoder layer.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    /// Pre-attention layer norm.
    input_layernorm: RmsNorm,
    /// Self-attention.
    attention: Attention,
    /// Post-attention layer norm.
    post_attention_layernorm: RmsNorm,
    /// MLP.
    mlp: SwiGluMlp,
    /// Layer index (for debugging).
    layer_idx: usize,
}

impl TransformerLayer {
    /// Create a new transformer layer.
    pub fn new(
        input_layernorm: RmsNorm,
        attention: Attention,
        post_attention_layernorm: RmsNorm,
        mlp: SwiGluMlp,
        layer_idx: usize,
    ) -> Self {
        Self {
            input_layernorm,
            attention,
            post_attention_layernorm,
            mlp,
            layer_idx,
        }
    }

    /// Register this layer's parameters under `layers.{layer_idx}.` and
    /// build the layer around them.
    ///
    /// Draw order is fixed (q, k, v, o, gate, up, down) so that a seed fully
    /// determines the weights.
    pub(crate) fn init(
        layer_idx: usize,
        config: &ModelConfig,
        attn_config: &AttentionConfig,
        backend: AttentionBackend,
        params: &mut ParameterStore,
        rng: &mut SeededRng,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let q_out = config.num_attention_heads * config.head_dim();
        let kv_out = config.num_key_value_heads * config.head_dim();
        let ffn = config.intermediate_size;
        let prefix = format!("layers.{layer_idx}");

        let q = params.normal(format!("{prefix}.attn.q_proj.weight"), (q_out, hidden), INIT_STD, rng)?;
        let k = params.normal(format!("{prefix}.attn.k_proj.weight"), (kv_out, hidden), INIT_STD, rng)?;
        let v = params.normal(format!("{prefix}.attn.v_proj.weight"), (kv_out, hidden), INIT_STD, rng)?;
        let o = params.normal(format!("{prefix}.attn.o_proj.weight"), (hidden, q_out), INIT_STD, rng)?;
        let gate = params.normal(format!("{prefix}.mlp.gate_proj.weight"), (ffn, hidden), INIT_STD, rng)?;
        let up = params.normal(format!("{prefix}.mlp.up_proj.weight"), (ffn, hidden), INIT_STD, rng)?;
        let down = params.normal(format!("{prefix}.mlp.down_proj.weight"), (hidden, ffn), INIT_STD, rng)?;
        let input_norm = params.ones(format!("{prefix}.input_layernorm.weight"), hidden)?;
        let post_norm = params.ones(format!("{prefix}.post_attention_layernorm.weight"), hidden)?;

        let attention = Attention::new(q, k, v, o, attn_config.clone(), backend, config.dropout.hidden)?;
        let mlp = SwiGluMlp::new(gate, up, down, config.dropout.hidden)?;

        Ok(Self::new(
            RmsNorm::new(input_norm, config.rms_norm_eps)?,
            attention,
            RmsNorm::new(post_norm, config.rms_norm_eps)?,
            mlp,
            layer_idx,
        ))
    }

    /// Forward pass.
    ///
    /// `h + attn(norm(h))`, then `h + mlp(norm(h))`. Both residual adds use
    /// the un-normalized stream.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, hidden_size]
    /// * `rope` - Rotary position embeddings
    /// * `ctx` - Forward context (dropout)
    /// * `cache` - Optional layer KV cache to read from and update
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        rope: &RotaryEmbedding,
        ctx: &mut ForwardCtx<'_>,
        cache: Option<&mut LayerCache>,
    ) -> Result<Tensor> {
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn_output = self.attention.forward(&normed, rope, ctx, cache)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let mlp_output = self.mlp.forward(&normed, ctx)?;
        Ok((hidden_states + mlp_output)?)
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    /// Get the MLP module.
    pub fn mlp(&self) -> &SwiGluMlp {
        &self.mlp
    }
}

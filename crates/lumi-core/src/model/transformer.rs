//! Decoder-only transformer stack.
//!
//! Token ids -> embedding -> N decoder layers -> final RMSNorm -> LM head.

use super::{
    Dropout, Embedding, Linear, ModelCache, ModelConfig, Precision, RmsNorm, RotaryEmbedding,
    TransformerLayer, INIT_STD,
};
use crate::attention::{AttentionBackend, AttentionConfig};
use crate::error::{LumiError, Result};
use crate::params::ParameterStore;
use crate::rng::{ForwardCtx, SeededRng};
use candle_core::{DType, Device, Tensor};

/// Output of a forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Per-position logits [batch, seq_len, vocab_size] in the compute dtype.
    pub logits: Tensor,
    /// Final hidden states [batch, seq_len, hidden_size], after the final norm.
    pub hidden_states: Tensor,
}

/// A LLaMA-style decoder stack with untied embedding and output head.
pub struct DecoderStack {
    /// Model configuration.
    config: ModelConfig,
    precision: Precision,
    /// Device for computation.
    device: Device,
    params: ParameterStore,
    embed_tokens: Embedding,
    embed_dropout: Dropout,
    layers: Vec<TransformerLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rope: RotaryEmbedding,
    /// Attention tier, fixed for the model's lifetime.
    backend: AttentionBackend,
}

impl DecoderStack {
    /// Build and initialize a model.
    ///
    /// Linear and embedding weights are drawn from N(0, 0.02) in a fixed
    /// order from `rng`; norm gains start at one. Every `o_proj` and
    /// `down_proj` is then scaled once by `1 / sqrt(2 * num_layers)`.
    /// The attention tier is probed here and never again.
    pub fn new(
        config: ModelConfig,
        device: &Device,
        precision: Precision,
        rng: &mut SeededRng,
    ) -> Result<Self> {
        config.validate()?;
        if let Err(err) = precision.check_device(device) {
            tracing::warn!(compute_dtype = ?precision.compute_dtype, %err, "precision rejected for device");
            return Err(err);
        }

        let attn_config = AttentionConfig::new(
            config.num_attention_heads,
            config.num_key_value_heads,
            config.head_dim(),
        )
        .with_dropout(config.dropout.attention);
        let backend = AttentionBackend::select(
            config.attention_backend,
            &attn_config,
            device,
            precision.compute_dtype,
        );

        let mut params = ParameterStore::new(device, precision.param_dtype);
        let hidden = config.hidden_size;

        let embed = params.normal("embed_tokens.weight", (config.vocab_size, hidden), INIT_STD, rng)?;
        let layers = (0..config.num_hidden_layers)
            .map(|idx| TransformerLayer::init(idx, &config, &attn_config, backend, &mut params, rng))
            .collect::<Result<Vec<_>>>()?;
        let norm = params.ones("norm.weight", hidden)?;
        let lm_head = params.normal("lm_head.weight", (config.vocab_size, hidden), INIT_STD, rng)?;

        let residual_scale = 1.0 / (2.0 * config.num_hidden_layers as f64).sqrt();
        for idx in 0..config.num_hidden_layers {
            params.scale(&format!("layers.{idx}.attn.o_proj.weight"), residual_scale)?;
            params.scale(&format!("layers.{idx}.mlp.down_proj.weight"), residual_scale)?;
        }

        let rope = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
        )?;

        tracing::info!(
            parameters = params.num_parameters(),
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            backend = backend.name(),
            "model initialized"
        );

        Ok(Self {
            embed_tokens: Embedding::new(embed)?,
            embed_dropout: Dropout::new(config.dropout.embedding),
            layers,
            norm: RmsNorm::new(norm, config.rms_norm_eps)?,
            lm_head: Linear::new(lm_head)?,
            rope,
            backend,
            params,
            precision,
            device: device.clone(),
            config,
        })
    }

    /// Logits for a batch of token ids [batch, seq_len].
    pub fn forward(&self, input_ids: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        Ok(self.forward_with_hidden(input_ids, ctx)?.logits)
    }

    /// Logits plus the final hidden states.
    pub fn forward_with_hidden(&self, input_ids: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<ModelOutput> {
        let ids = self.check_ids(input_ids, 0)?;
        let mut hidden_states = self.embed(&ids, ctx)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &self.rope, ctx, None)?;
        }
        self.head(&hidden_states)
    }

    /// Process new tokens after everything already in `cache`.
    ///
    /// New tokens sit at positions `cache.seq_len()..` and attend to every
    /// cached position. The cache is extended in place.
    pub fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        cache: &mut ModelCache,
        ctx: &mut ForwardCtx<'_>,
    ) -> Result<ModelOutput> {
        if cache.num_layers() != self.layers.len() {
            return Err(LumiError::ShapeMismatch(format!(
                "cache has {} layers, model has {}",
                cache.num_layers(),
                self.layers.len()
            )));
        }
        let ids = self.check_ids(input_ids, cache.seq_len())?;

        let mut hidden_states = self.embed(&ids, ctx)?;
        for (layer, layer_cache) in self.layers.iter().zip(cache.layers_mut()) {
            hidden_states = layer.forward(&hidden_states, &self.rope, ctx, Some(layer_cache))?;
        }
        self.head(&hidden_states)
    }

    /// Fresh cache sized for this model.
    pub fn new_cache(&self) -> ModelCache {
        ModelCache::new(self.layers.len())
    }

    /// Embedding lookup in the compute dtype followed by embedding dropout.
    pub(crate) fn embed(&self, ids: &Tensor, ctx: &mut ForwardCtx<'_>) -> Result<Tensor> {
        let hidden_states = self.embed_tokens.forward(ids, self.precision.compute_dtype)?;
        self.embed_dropout.forward(&hidden_states, ctx)
    }

    /// Final norm and LM head.
    pub(crate) fn head(&self, hidden_states: &Tensor) -> Result<ModelOutput> {
        let hidden_states = self.norm.forward(hidden_states)?;
        let logits = self.lm_head.forward(&hidden_states)?;
        Ok(ModelOutput {
            logits,
            hidden_states,
        })
    }

    /// Validate a token-id tensor and normalize it to `u32`.
    ///
    /// Checks rank, dtype, emptiness, vocabulary range, and that
    /// `offset + seq_len` fits the rotary tables.
    pub(crate) fn check_ids(&self, input_ids: &Tensor, offset: usize) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2().map_err(|_| {
            LumiError::InvalidTokens(format!(
                "expected [batch, seq_len] token ids, got shape {:?}",
                input_ids.dims()
            ))
        })?;
        if batch == 0 || seq_len == 0 {
            return Err(LumiError::InvalidTokens(format!(
                "empty token batch {:?}",
                input_ids.dims()
            )));
        }
        if offset + seq_len > self.config.max_position_embeddings {
            return Err(LumiError::SequenceTooLong {
                len: offset + seq_len,
                max: self.config.max_position_embeddings,
            });
        }

        let vocab = self.config.vocab_size as i64;
        let values: Vec<i64> = match input_ids.dtype() {
            DType::U32 | DType::I64 | DType::U8 => {
                input_ids.to_dtype(DType::I64)?.flatten_all()?.to_vec1()?
            }
            other => {
                return Err(LumiError::InvalidTokens(format!(
                    "token ids must be integers, got {other:?}"
                )))
            }
        };
        if let Some(bad) = values.iter().find(|&&id| id < 0 || id >= vocab) {
            return Err(LumiError::InvalidTokens(format!(
                "token id {bad} outside vocabulary of {vocab}"
            )));
        }

        Ok(input_ids.to_dtype(DType::U32)?.to_device(&self.device)?)
    }

    /// Build a `[batch, seq_len]` id tensor from equal-length sequences.
    pub fn ids_tensor(sequences: &[Vec<u32>], device: &Device) -> Result<Tensor> {
        let seq_len = sequences.first().map(|s| s.len()).unwrap_or(0);
        if sequences.iter().any(|s| s.len() != seq_len) {
            return Err(LumiError::InvalidTokens(
                "sequences in a batch must have equal length".to_string(),
            ));
        }
        let flat: Vec<u32> = sequences.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (sequences.len(), seq_len), device)?)
    }

    /// Get model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Storage and compute precision.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Named parameters.
    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    /// Selected attention tier.
    pub fn backend(&self) -> AttentionBackend {
        self.backend
    }

    /// Get device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Decoder layers in order.
    pub fn layers(&self) -> &[TransformerLayer] {
        &self.layers
    }

    /// Shared rotary tables.
    pub fn rope(&self) -> &RotaryEmbedding {
        &self.rope
    }
}

impl std::fmt::Debug for DecoderStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderStack")
            .field("config", &self.config)
            .field("precision", &self.precision)
            .field("backend", &self.backend)
            .field("device", &self.device)
            .finish()
    }
}

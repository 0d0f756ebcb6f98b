//! High-level generation engine.

use anyhow::{bail, Result};
use candle_core::Device;
use lumi_core::{
    model::{DecoderStack, ModelConfig, Precision},
    sampling::{LogitsSampler, SamplingConfig},
    ForwardCtx, SeededRng,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling mass.
    pub top_p: f32,
    /// Top-k filter (0 = disabled).
    pub top_k: usize,
    /// Repetition penalty over prompt and generated tokens.
    pub repetition_penalty: f32,
    /// Ban repeated n-grams of this size (0 = disabled).
    pub no_repeat_ngram_size: usize,
    /// Sample instead of greedy decoding.
    pub do_sample: bool,
    /// Stop when this token is produced.
    pub eos_token_id: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 0,
            repetition_penalty: 1.1,
            no_repeat_ngram_size: 3,
            do_sample: true,
            eos_token_id: None,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding with no penalties.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            do_sample: false,
            ..Default::default()
        }
    }

    /// Token-selection part of this config.
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            no_repeat_ngram_size: self.no_repeat_ngram_size,
            do_sample: self.do_sample,
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The EOS token was produced.
    Eos,
    /// `max_new_tokens` reached.
    MaxTokens,
    /// The model's position limit reached.
    PositionLimit,
}

/// Result of a generation call.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    /// Prompt (after truncation) followed by generated tokens.
    pub tokens: Vec<u32>,
    /// Generated token IDs only.
    pub new_tokens: Vec<u32>,
    /// Number of prompt tokens actually used.
    pub num_prompt_tokens: usize,
    /// Why generation stopped.
    pub finish_reason: FinishReason,
}

/// Builder for creating a [`Generator`].
pub struct GeneratorBuilder {
    model_config: ModelConfig,
    device: Device,
    precision: Precision,
    seed: u64,
    generation: GenerationConfig,
}

impl GeneratorBuilder {
    /// Create a new generator builder.
    pub fn new() -> Self {
        Self {
            model_config: ModelConfig::default(),
            device: Device::Cpu,
            precision: Precision::default(),
            seed: 0,
            generation: GenerationConfig::default(),
        }
    }

    /// Set model configuration directly.
    pub fn model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = config;
        self
    }

    /// Set the compute device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Set parameter and compute precision.
    pub fn precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Seed for weight initialization and sampling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Default generation settings.
    pub fn generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation = config;
        self
    }

    /// Build a freshly initialized model and wrap it.
    pub fn build(self) -> Result<Generator> {
        let mut rng = SeededRng::new(self.seed);
        let model = DecoderStack::new(self.model_config, &self.device, self.precision, &mut rng)?;
        Ok(Generator {
            model: Arc::new(model),
            rng: Mutex::new(rng),
            defaults: self.generation,
        })
    }
}

impl Default for GeneratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Autoregressive token generator over a shared model.
pub struct Generator {
    model: Arc<DecoderStack>,
    rng: Mutex<SeededRng>,
    defaults: GenerationConfig,
}

impl Generator {
    /// Create a new generator builder.
    pub fn builder() -> GeneratorBuilder {
        GeneratorBuilder::new()
    }

    /// Wrap an existing model.
    pub fn new(model: Arc<DecoderStack>, seed: u64) -> Self {
        Self {
            model,
            rng: Mutex::new(SeededRng::new(seed)),
            defaults: GenerationConfig::default(),
        }
    }

    /// Get model reference.
    pub fn model(&self) -> &Arc<DecoderStack> {
        &self.model
    }

    /// Default generation settings.
    pub fn defaults(&self) -> &GenerationConfig {
        &self.defaults
    }

    /// Generate with the default settings.
    pub fn generate(&self, prompt_ids: &[u32]) -> Result<GenerateResult> {
        self.generate_with(prompt_ids, &self.defaults)
    }

    /// Generate a continuation of `prompt_ids`.
    ///
    /// The prompt keeps its last `max_position_embeddings` tokens, is
    /// prefilled through a KV cache, then one token is decoded per step.
    pub fn generate_with(&self, prompt_ids: &[u32], config: &GenerationConfig) -> Result<GenerateResult> {
        if prompt_ids.is_empty() {
            bail!("prompt must contain at least one token");
        }
        let sampler = LogitsSampler::new(config.sampling())?;
        let max_positions = self.model.config().max_position_embeddings;

        let start = prompt_ids.len().saturating_sub(max_positions);
        if start > 0 {
            tracing::debug!(dropped = start, "prompt truncated to position limit");
        }
        let mut tokens = prompt_ids[start..].to_vec();
        let num_prompt_tokens = tokens.len();
        let mut new_tokens = Vec::new();

        let mut cache = self.model.new_cache();
        let mut ctx = ForwardCtx::inference();
        let prompt = DecoderStack::ids_tensor(&[tokens.clone()], self.model.device())?;
        let mut logits = self.model.forward_with_cache(&prompt, &mut cache, &mut ctx)?.logits;

        let mut rng = self.rng.lock();
        let finish_reason = loop {
            if new_tokens.len() >= config.max_new_tokens {
                break FinishReason::MaxTokens;
            }

            let seq_len = logits.dim(1)?;
            let last = logits.narrow(1, seq_len - 1, 1)?;
            let next = sampler.sample_tensor(&last, &tokens, &mut rng)?;
            tokens.push(next);
            new_tokens.push(next);

            if config.eos_token_id == Some(next) {
                break FinishReason::Eos;
            }
            if new_tokens.len() >= config.max_new_tokens {
                break FinishReason::MaxTokens;
            }
            if cache.seq_len() >= max_positions {
                break FinishReason::PositionLimit;
            }

            let step = DecoderStack::ids_tensor(&[vec![next]], self.model.device())?;
            logits = self.model.forward_with_cache(&step, &mut cache, &mut ctx)?.logits;
        };

        tracing::debug!(
            prompt_tokens = num_prompt_tokens,
            new_tokens = new_tokens.len(),
            ?finish_reason,
            "generation finished"
        );

        Ok(GenerateResult {
            tokens,
            new_tokens,
            num_prompt_tokens,
            finish_reason,
        })
    }
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("model", &self.model)
            .field("defaults", &self.defaults)
            .finish()
    }
}

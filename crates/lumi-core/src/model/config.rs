//! Model configuration.

use crate::attention::BackendPreference;
use crate::error::{LumiError, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Dropout probabilities at the three dropout sites.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DropoutConfig {
    /// After the token embedding lookup.
    pub embedding: f32,
    /// On attention probabilities.
    pub attention: f32,
    /// On each sub-layer output, before the residual add.
    pub hidden: f32,
}

impl DropoutConfig {
    /// All sites share the same probability.
    pub fn uniform(p: f32) -> Self {
        Self {
            embedding: p,
            attention: p,
            hidden: p,
        }
    }

    /// No dropout anywhere.
    pub fn disabled() -> Self {
        Self::uniform(0.0)
    }
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self::uniform(0.1)
    }
}

/// Configuration for a decoder-only transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden dimension.
    pub hidden_size: usize,
    /// Intermediate dimension (FFN).
    pub intermediate_size: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Number of KV heads (for GQA).
    pub num_key_value_heads: usize,
    /// Number of layers.
    pub num_hidden_layers: usize,
    /// Maximum sequence length.
    pub max_position_embeddings: usize,
    /// RMS norm epsilon.
    pub rms_norm_eps: f64,
    /// Rope theta.
    pub rope_theta: f64,
    /// Dropout probabilities.
    #[serde(default)]
    pub dropout: DropoutConfig,
    /// Preferred attention backend tier.
    #[serde(default)]
    pub attention_backend: BackendPreference,
}

/// Presets use dropout 0.1 at every site. Attention dropout keeps the
/// flash-attention tier ineligible; disable it to reach that tier.
impl ModelConfig {
    /// 6 layers, hidden 256, 4 heads.
    pub fn tiny() -> Self {
        Self::preset(6, 256, 4, 1024, 1024)
    }

    /// 12 layers, hidden 512, 8 heads.
    pub fn small() -> Self {
        Self::preset(12, 512, 8, 2048, 1024)
    }

    /// 24 layers, hidden 768, 12 heads.
    pub fn base() -> Self {
        Self::preset(24, 768, 12, 3072, 2048)
    }

    fn preset(
        layers: usize,
        hidden: usize,
        heads: usize,
        ffn: usize,
        max_seq: usize,
    ) -> Self {
        Self {
            vocab_size: 32768,
            hidden_size: hidden,
            intermediate_size: ffn,
            num_attention_heads: heads,
            num_key_value_heads: heads,
            num_hidden_layers: layers,
            max_position_embeddings: max_seq,
            rms_norm_eps: 1e-5,
            rope_theta: 10000.0,
            dropout: DropoutConfig::default(),
            attention_backend: BackendPreference::Auto,
        }
    }

    /// Look up a preset by name (`tiny`, `small`, `base`).
    pub fn from_preset(name: &str) -> Result<Self> {
        match name {
            "tiny" => Ok(Self::tiny()),
            "small" => Ok(Self::small()),
            "base" => Ok(Self::base()),
            other => Err(LumiError::config(format!("unknown preset '{other}'"))),
        }
    }

    /// Set the number of KV heads. Below `num_attention_heads` enables GQA.
    pub fn with_num_key_value_heads(mut self, n: usize) -> Self {
        self.num_key_value_heads = n;
        self
    }

    /// Set the number of layers.
    pub fn with_num_layers(mut self, n: usize) -> Self {
        self.num_hidden_layers = n;
        self
    }

    /// Set dropout probabilities.
    pub fn with_dropout(mut self, dropout: DropoutConfig) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set the vocabulary size.
    pub fn with_vocab_size(mut self, n: usize) -> Self {
        self.vocab_size = n;
        self
    }

    /// Set the maximum sequence length.
    pub fn with_max_position_embeddings(mut self, n: usize) -> Self {
        self.max_position_embeddings = n;
        self
    }

    /// Set the preferred attention backend.
    pub fn with_attention_backend(mut self, preference: BackendPreference) -> Self {
        self.attention_backend = preference;
        self
    }

    /// Calculate head dimension.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Get GQA ratio.
    pub fn gqa_ratio(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Check every dimension invariant.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("max_position_embeddings", self.max_position_embeddings),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(LumiError::config(format!("{name} must be positive")));
            }
        }

        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(LumiError::config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_key_value_heads > self.num_attention_heads
            || self.num_attention_heads % self.num_key_value_heads != 0
        {
            return Err(LumiError::config(format!(
                "num_key_value_heads {} must divide num_attention_heads {}",
                self.num_key_value_heads, self.num_attention_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(LumiError::config(format!(
                "head_dim {} must be even for rotary embeddings",
                self.head_dim()
            )));
        }

        let probs = [
            ("embedding", self.dropout.embedding),
            ("attention", self.dropout.attention),
            ("hidden", self.dropout.hidden),
        ];
        for (site, p) in probs {
            if !(0.0..1.0).contains(&p) {
                return Err(LumiError::config(format!(
                    "{site} dropout {p} must be in [0, 1)"
                )));
            }
        }

        if !(self.rms_norm_eps > 0.0) {
            return Err(LumiError::config("rms_norm_eps must be positive"));
        }
        if !(self.rope_theta > 0.0) {
            return Err(LumiError::config("rope_theta must be positive"));
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Write as pretty JSON.
    pub fn to_file(&self, path: &std::path::Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::tiny()
    }
}

/// Parameter and activation precision.
///
/// Parameters live in `param_dtype`; activations are computed in
/// `compute_dtype`, with weights cast at use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    /// Storage dtype for parameters.
    pub param_dtype: DType,
    /// Dtype of activations during forward/backward.
    pub compute_dtype: DType,
}

impl Precision {
    /// F32 everywhere.
    pub fn full() -> Self {
        Self {
            param_dtype: DType::F32,
            compute_dtype: DType::F32,
        }
    }

    /// F32 parameters, `compute_dtype` activations.
    pub fn mixed(compute_dtype: DType) -> Self {
        Self {
            param_dtype: DType::F32,
            compute_dtype,
        }
    }

    /// Whether parameters and activations differ in dtype.
    pub fn is_mixed(&self) -> bool {
        self.param_dtype != self.compute_dtype
    }

    /// Check that `device` can run this precision.
    ///
    /// Both dtypes must be floating point. The CPU backend has no bf16
    /// matmul, so bf16 compute is only accepted on accelerators; bf16
    /// parameter storage is fine anywhere since weights are cast at use.
    pub fn check_device(&self, device: &Device) -> Result<()> {
        for dtype in [self.param_dtype, self.compute_dtype] {
            if !dtype.is_float() {
                return Err(LumiError::config(format!(
                    "precision dtype {dtype:?} is not a floating point type"
                )));
            }
        }
        if device.is_cpu() && self.compute_dtype == DType::BF16 {
            return Err(LumiError::config(
                "bf16 compute is not supported on cpu, use f16 or f32",
            ));
        }
        Ok(())
    }
}

impl Default for Precision {
    fn default() -> Self {
        Self::full()
    }
}

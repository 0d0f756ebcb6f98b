//! # Lumi Core
//!
//! Numerical core of a LLaMA-style decoder-only language model on candle.
//!
//! This crate provides:
//! - **Rotary embeddings, RMSNorm and SwiGLU** with exact numeric contracts
//! - **Causal grouped-query attention** with a fused kernel tier, a fused
//!   primitive tier and a manual reference tier, chosen once per model
//! - **DecoderStack** with `tiny`/`small`/`base` presets and mixed precision
//! - **Named parameters** with snapshot, restore and safetensors I/O
//! - **Activation recomputation** for memory-efficient backward passes
//! - **KV cache and logits sampling** for incremental decoding
//!
//! All randomness (initialization, dropout, sampling) comes from an explicit
//! [`SeededRng`].

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod attention;
pub mod checkpoint;
pub mod error;
pub mod model;
pub mod params;
pub mod rng;
pub mod sampling;

pub use error::{LumiError, Result};
pub use rng::{ForwardCtx, SeededRng};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::attention::{AttentionBackend, BackendPreference};
    pub use crate::checkpoint::CheckpointedPass;
    pub use crate::error::{LumiError, Result};
    pub use crate::model::{DecoderStack, DropoutConfig, ModelCache, ModelConfig, ModelOutput, Precision};
    pub use crate::params::{ParameterStore, StateSnapshot};
    pub use crate::rng::{ForwardCtx, SeededRng};
    pub use crate::sampling::{LogitsSampler, SamplingConfig};
}

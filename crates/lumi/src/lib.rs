//! # Lumi
//!
//! LLaMA-style decoder-only language model on candle.
//!
//! Lumi bundles the numerical core with a small generation layer:
//! - **Decoder core**: RoPE, RMSNorm, tiered causal GQA attention, SwiGLU
//! - **Presets**: `tiny`, `small` and `base` model configurations
//! - **Generation**: KV-cached decoding with temperature, top-k, top-p,
//!   repetition penalty and n-gram blocking
//! - **Prompt templates**: chatml, chat, instruct and raw
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lumi::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let generator = Generator::builder()
//!         .model_config(ModelConfig::tiny())
//!         .seed(42)
//!         .build()?;
//!
//!     let result = generator.generate(&[1, 42, 7])?;
//!     println!("{:?} ({:?})", result.new_tokens, result.finish_reason);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use lumi_core::*;

mod engine;
mod template;

pub use engine::{FinishReason, GenerateResult, GenerationConfig, Generator, GeneratorBuilder};
pub use template::PromptTemplate;

/// Commonly used types.
pub mod prelude {
    pub use crate::engine::{FinishReason, GenerateResult, GenerationConfig, Generator, GeneratorBuilder};
    pub use crate::template::PromptTemplate;
    pub use crate::{
        attention::{AttentionBackend, BackendPreference},
        checkpoint::CheckpointedPass,
        error::{LumiError, Result},
        model::{DecoderStack, DropoutConfig, ModelCache, ModelConfig, Precision},
        params::ParameterStore,
        rng::{ForwardCtx, SeededRng},
        sampling::{LogitsSampler, SamplingConfig},
    };

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}

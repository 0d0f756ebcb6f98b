//! Model components and the full decoder stack.
//!
//! Provides the building blocks of a LLaMA-style decoder:
//! - Model configuration and precision
//! - RMSNorm, rotary embeddings, SwiGLU MLP
//! - Decoder layers and the [`DecoderStack`]
//! - KV cache for incremental decoding

mod config;
mod dropout;
mod kv_cache;
mod layer;
mod linear;
mod mlp;
mod rmsnorm;
mod rope;
mod transformer;

pub use config::{DropoutConfig, ModelConfig, Precision};
pub use dropout::Dropout;
pub use kv_cache::{LayerCache, ModelCache};
pub use layer::{Attention, TransformerLayer};
pub(crate) use layer::INIT_STD;
pub use linear::{Embedding, Linear};
pub use mlp::SwiGluMlp;
pub use rmsnorm::RmsNorm;
pub use rope::RotaryEmbedding;
pub use transformer::{DecoderStack, ModelOutput};

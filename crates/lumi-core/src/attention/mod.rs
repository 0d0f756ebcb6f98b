//! Causal self-attention kernels.
//!
//! Provides three interchangeable tiers behind [`AttentionBackend`]:
//! - `Fused` - flash-attention kernel via candle-flash-attn (CUDA only)
//! - `FusedPrimitive` - grouped scaled-dot-product without KV repetition
//! - `Manual` - reference formula with explicit intermediates

mod backend;
mod flash;
mod mask;

pub use backend::{repeat_kv, AttentionBackend, AttentionConfig, BackendPreference};
pub use mask::{causal_mask, causal_mask_bool};

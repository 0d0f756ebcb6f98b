//! Error types for Lumi Core.

use thiserror::Error;

/// Result type alias for Lumi operations.
pub type Result<T> = std::result::Result<T, LumiError>;

/// Errors that can occur in Lumi operations.
#[derive(Error, Debug)]
pub enum LumiError {
    /// Invalid model configuration (raised at construction).
    #[error("configuration error: {0}")]
    Config(String),

    /// Input longer than the rotary cache supports.
    #[error("sequence length {len} exceeds maximum {max}")]
    SequenceTooLong {
        /// Requested length (including any cached prefix).
        len: usize,
        /// Configured `max_position_embeddings`.
        max: usize,
    },

    /// Malformed token-id input.
    #[error("invalid tokens: {0}")]
    InvalidTokens(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Missing or unknown named parameter.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// SafeTensors (de)serialization error.
    #[error("safetensors error: {0}")]
    SafeTensors(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

impl LumiError {
    /// Shorthand for a configuration error.
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

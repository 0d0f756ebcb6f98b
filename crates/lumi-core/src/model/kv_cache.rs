//! KV cache for incremental decoding.
//!
//! Each layer keeps its rotated keys and raw values for every token seen so
//! far. New tokens are processed at position offset [`ModelCache::seq_len`].

use crate::error::{LumiError, Result};
use candle_core::Tensor;

/// KV cache for a single layer.
#[derive(Debug, Clone, Default)]
pub struct LayerCache {
    /// Cached keys: [batch, num_kv_heads, seq_len, head_dim]
    key: Option<Tensor>,
    /// Cached values: [batch, num_kv_heads, seq_len, head_dim]
    value: Option<Tensor>,
}

impl LayerCache {
    /// Create a new empty layer cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.key.as_ref().map(|k| k.dims()[2]).unwrap_or(0)
    }

    /// Append new KV to cache and return concatenated KV.
    ///
    /// Returns (key, value) tensors that include all cached + new tokens.
    pub fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor)> {
        let (new_key, new_value) = match (&self.key, &self.value) {
            (Some(cached_k), Some(cached_v)) => {
                if cached_k.dim(0)? != key.dim(0)? {
                    return Err(LumiError::ShapeMismatch(format!(
                        "cache holds batch {}, got {}",
                        cached_k.dim(0)?,
                        key.dim(0)?
                    )));
                }
                // Concatenate along sequence dimension (dim 2)
                let k = Tensor::cat(&[cached_k, key], 2)?;
                let v = Tensor::cat(&[cached_v, value], 2)?;
                (k, v)
            }
            _ => (key.clone(), value.clone()),
        };

        self.key = Some(new_key.detach());
        self.value = Some(new_value.detach());

        Ok((new_key, new_value))
    }

    /// Get cached KV without modification.
    pub fn get(&self) -> Option<(&Tensor, &Tensor)> {
        match (&self.key, &self.value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }

    /// Clear the cache.
    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

/// KV cache for every layer of a model.
#[derive(Debug, Clone)]
pub struct ModelCache {
    layers: Vec<LayerCache>,
}

impl ModelCache {
    /// Create an empty cache for `num_layers` layers.
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: vec![LayerCache::new(); num_layers],
        }
    }

    /// Get mutable reference to layer cache.
    pub fn layer_mut(&mut self, layer_idx: usize) -> Option<&mut LayerCache> {
        self.layers.get_mut(layer_idx)
    }

    /// Get reference to layer cache.
    pub fn layer(&self, layer_idx: usize) -> Option<&LayerCache> {
        self.layers.get(layer_idx)
    }

    /// Mutable access to all layers in order.
    pub(crate) fn layers_mut(&mut self) -> &mut [LayerCache] {
        &mut self.layers
    }

    /// Get the current sequence length (from first layer).
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(|l| l.seq_len()).unwrap_or(0)
    }

    /// Clear all layer caches.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.first().map(|l| l.is_empty()).unwrap_or(true)
    }

    /// Get number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

//! Bias-free linear projection and token embedding.

use crate::error::{LumiError, Result};
use candle_core::{DType, Tensor};

/// Bias-free linear layer with weight [out_features, in_features].
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Wrap a weight tensor.
    pub fn new(weight: Tensor) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        Ok(Self {
            weight,
            in_features,
            out_features,
        })
    }

    /// `x @ W^T` over the last dimension. The weight is cast to the input
    /// dtype, so parameters can be stored wider than activations.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims();
        let last = dims.last().copied().unwrap_or(0);
        if last != self.in_features {
            return Err(LumiError::ShapeMismatch(format!(
                "linear expects last dim {}, got {:?}",
                self.in_features, dims
            )));
        }

        let weight = self.weight.to_dtype(x.dtype())?;
        let rows: usize = dims[..dims.len() - 1].iter().product();
        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.out_features);

        let out = x.reshape((rows, self.in_features))?.matmul(&weight.t()?)?;
        Ok(out.reshape(out_dims)?)
    }

    /// Weight tensor.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

/// Token embedding table [vocab_size, hidden_size]. Lookup only, no scaling.
#[derive(Debug, Clone)]
pub struct Embedding {
    weight: Tensor,
    vocab_size: usize,
    hidden_size: usize,
}

impl Embedding {
    /// Wrap an embedding table.
    pub fn new(weight: Tensor) -> Result<Self> {
        let (vocab_size, hidden_size) = weight.dims2()?;
        Ok(Self {
            weight,
            vocab_size,
            hidden_size,
        })
    }

    /// Look up `ids` [batch, seq_len] -> [batch, seq_len, hidden_size] in `dtype`.
    pub fn forward(&self, ids: &Tensor, dtype: DType) -> Result<Tensor> {
        let (batch, seq_len) = ids.dims2()?;
        let flat = ids.flatten_all()?;
        let rows = self.weight.index_select(&flat, 0)?;
        Ok(rows
            .reshape((batch, seq_len, self.hidden_size))?
            .to_dtype(dtype)?)
    }

    /// Vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Embedding table.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

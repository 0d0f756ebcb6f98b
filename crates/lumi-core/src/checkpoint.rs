//! Activation recomputation for memory-efficient training.
//!
//! Instead of keeping every intermediate activation of every layer alive
//! until backward, a checkpointed pass keeps only the hidden states at layer
//! boundaries (detached from the graph) plus the dropout generator state at
//! each boundary. During backward each layer is re-run from its saved input
//! with the same generator state, and gradients are chained from the head
//! back to the embedding one layer at a time.
//!
//! Gradients match a plain forward/backward up to rounding.
//!
//! # Usage
//! ```ignore
//! let pass = model.forward_checkpointed(&ids, &mut ForwardCtx::training(&mut rng))?;
//! let loss = cross_entropy(pass.logits(), &targets)?;
//! let grads = pass.backward(&loss)?;
//! optimizer.step(&grads)?;
//! ```

use crate::error::{LumiError, Result};
use crate::model::{DecoderStack, ModelOutput};
use crate::rng::{ForwardCtx, SeededRng};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

/// Forward state retained for a recomputing backward pass.
pub struct CheckpointedPass<'m> {
    model: &'m DecoderStack,
    /// Validated `u32` token ids.
    input_ids: Tensor,
    /// Generator state before embedding dropout (`None` in inference).
    embed_rng: Option<SeededRng>,
    /// `boundaries[i]` is the detached input of layer `i`.
    boundaries: Vec<Tensor>,
    /// Generator state before layer `i`.
    layer_rngs: Vec<Option<SeededRng>>,
    /// Output of the last layer; the head graph starts here.
    head_input: Var,
    output: ModelOutput,
}

impl DecoderStack {
    /// Forward pass that keeps only layer-boundary activations.
    ///
    /// Logits equal [`DecoderStack::forward`] for the same inputs and
    /// generator state, and `ctx` is advanced identically.
    pub fn forward_checkpointed<'m>(
        &'m self,
        input_ids: &Tensor,
        ctx: &mut ForwardCtx<'_>,
    ) -> Result<CheckpointedPass<'m>> {
        let input_ids = self.check_ids(input_ids, 0)?;

        let embed_rng = ctx.snapshot();
        let mut hidden_states = self.embed(&input_ids, ctx)?.detach();

        let mut boundaries = Vec::with_capacity(self.layers().len());
        let mut layer_rngs = Vec::with_capacity(self.layers().len());
        for layer in self.layers() {
            layer_rngs.push(ctx.snapshot());
            let next = layer.forward(&hidden_states, self.rope(), ctx, None)?.detach();
            boundaries.push(std::mem::replace(&mut hidden_states, next));
        }

        let head_input = Var::from_tensor(&hidden_states)?;
        let output = self.head(head_input.as_tensor())?;

        tracing::trace!(layers = boundaries.len(), "checkpointed forward");

        Ok(CheckpointedPass {
            model: self,
            input_ids,
            embed_rng,
            boundaries,
            layer_rngs,
            head_input,
            output,
        })
    }
}

impl<'m> CheckpointedPass<'m> {
    /// Logits [batch, seq_len, vocab_size].
    pub fn logits(&self) -> &Tensor {
        &self.output.logits
    }

    /// Final hidden states after the final norm.
    pub fn hidden_states(&self) -> &Tensor {
        &self.output.hidden_states
    }

    /// Back-propagate `loss` (a scalar computed from [`Self::logits`]).
    ///
    /// Returns a gradient store holding an entry for every model parameter
    /// that influences the loss, keyed by the parameter's variable.
    pub fn backward(&self, loss: &Tensor) -> Result<GradStore> {
        let mut grads = loss.backward()?;
        let mut upstream = grads.remove(self.head_input.as_tensor()).ok_or_else(|| {
            LumiError::Parameter("loss does not depend on the model output".to_string())
        })?;

        let params = self.model.params();
        for (idx, layer) in self.model.layers().iter().enumerate().rev() {
            let input = Var::from_tensor(&self.boundaries[idx])?;
            let mut replay = self.layer_rngs[idx].clone();
            let mut ctx = match replay.as_mut() {
                Some(rng) => ForwardCtx::training(rng),
                None => ForwardCtx::inference(),
            };

            let output = layer.forward(input.as_tensor(), self.model.rope(), &mut ctx, None)?;
            let layer_grads = (output * upstream.detach())?.sum_all()?.backward()?;

            let prefix = format!("layers.{idx}.");
            accumulate(&mut grads, &layer_grads, params.with_prefix(&prefix).map(|(_, v)| v))?;

            upstream = layer_grads.get(input.as_tensor()).cloned().ok_or_else(|| {
                LumiError::Parameter(format!("no gradient reached the input of layer {idx}"))
            })?;
        }

        let mut replay = self.embed_rng.clone();
        let mut ctx = match replay.as_mut() {
            Some(rng) => ForwardCtx::training(rng),
            None => ForwardCtx::inference(),
        };
        let embedded = self.model.embed(&self.input_ids, &mut ctx)?;
        let embed_grads = (embedded * upstream.detach())?.sum_all()?.backward()?;
        accumulate(&mut grads, &embed_grads, params.with_prefix("embed_tokens.").map(|(_, v)| v))?;

        Ok(grads)
    }
}

/// Add each variable's gradient from `partial` into `total`.
fn accumulate<'a>(
    total: &mut GradStore,
    partial: &GradStore,
    vars: impl Iterator<Item = &'a Var>,
) -> Result<()> {
    for var in vars {
        let Some(grad) = partial.get(var.as_tensor()) else {
            continue;
        };
        let grad = grad.detach();
        let merged = match total.get(var.as_tensor()) {
            Some(existing) => (existing + grad)?,
            None => grad,
        };
        total.insert(var.as_tensor(), merged);
    }
    Ok(())
}

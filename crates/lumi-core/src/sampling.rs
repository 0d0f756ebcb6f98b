//! Next-token selection from logits.
//!
//! Processing order: repetition penalty, n-gram ban, then either argmax or
//! temperature, top-k, softmax, top-p, categorical draw.

use crate::error::{LumiError, Result};
use crate::rng::SeededRng;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Temperature for sampling (0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Repetition penalty (1.0 = disabled).
    pub repetition_penalty: f32,
    /// Ban tokens that would repeat an n-gram of this size (0 = disabled).
    pub no_repeat_ngram_size: usize,
    /// Draw from the distribution instead of taking the argmax.
    pub do_sample: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            do_sample: true,
        }
    }
}

impl SamplingConfig {
    /// Greedy sampling (argmax).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            do_sample: false,
            ..Default::default()
        }
    }

    /// Whether this config picks the argmax.
    pub fn is_greedy(&self) -> bool {
        !self.do_sample || self.temperature <= 0.0
    }

    /// Reject values with no defined meaning.
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature >= 0.0) {
            return Err(LumiError::config(format!(
                "temperature {} must be non-negative",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(LumiError::config(format!("top_p {} must be in (0, 1]", self.top_p)));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(LumiError::config(format!(
                "repetition_penalty {} must be positive",
                self.repetition_penalty
            )));
        }
        Ok(())
    }
}

/// Picks the next token from a logits row.
#[derive(Debug, Clone)]
pub struct LogitsSampler {
    config: SamplingConfig,
}

impl LogitsSampler {
    /// Create a sampler, validating the config.
    pub fn new(config: SamplingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Sampling configuration.
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Sample from a logits tensor of shape [vocab_size] (or [1, vocab_size]).
    pub fn sample_tensor(&self, logits: &Tensor, history: &[u32], rng: &mut SeededRng) -> Result<u32> {
        let logits: Vec<f32> = logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        self.sample(&logits, history, rng)
    }

    /// Sample the next token given the tokens seen so far.
    ///
    /// Greedy decoding consumes no randomness.
    pub fn sample(&self, logits: &[f32], history: &[u32], rng: &mut SeededRng) -> Result<u32> {
        if logits.is_empty() {
            return Err(LumiError::ShapeMismatch("empty logits".to_string()));
        }
        let mut logits = logits.to_vec();

        apply_repetition_penalty(&mut logits, history, self.config.repetition_penalty);
        for token in banned_ngram_tokens(history, self.config.no_repeat_ngram_size) {
            if let Some(v) = logits.get_mut(token as usize) {
                *v = f32::NEG_INFINITY;
            }
        }

        if self.config.is_greedy() {
            return Ok(argmax(&logits));
        }

        let inv_t = 1.0 / self.config.temperature;
        for v in logits.iter_mut() {
            *v *= inv_t;
        }

        if self.config.top_k > 0 && self.config.top_k < logits.len() {
            let threshold = top_k_threshold(&logits, self.config.top_k);
            for v in logits.iter_mut() {
                if *v < threshold {
                    *v = f32::NEG_INFINITY;
                }
            }
        }

        let probs = softmax(&logits);
        if probs.iter().all(|p| *p == 0.0) {
            // Every token banned or non-finite: fall back to the raw argmax.
            return Ok(argmax(&logits));
        }
        let probs = if self.config.top_p < 1.0 {
            top_p_filter(&probs, self.config.top_p)
        } else {
            probs
        };

        Ok(categorical_sample(&probs, rng))
    }
}

/// Apply repetition penalty to logits in-place.
///
/// For each distinct token in `history`, a positive logit is divided by
/// `penalty` and a negative one multiplied by it.
pub fn apply_repetition_penalty(logits: &mut [f32], history: &[u32], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<u32> = history.iter().copied().collect();
    for tok in seen {
        if let Some(v) = logits.get_mut(tok as usize) {
            if *v > 0.0 {
                *v /= penalty;
            } else {
                *v *= penalty;
            }
        }
    }
}

/// Tokens that would complete an n-gram already present in `history`.
pub fn banned_ngram_tokens(history: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || history.len() + 1 < n {
        return Vec::new();
    }
    if n == 1 {
        let mut seen: Vec<u32> = history.to_vec();
        seen.sort_unstable();
        seen.dedup();
        return seen;
    }

    let prefix = &history[history.len() + 1 - n..];
    history
        .windows(n)
        .filter(|w| &w[..n - 1] == prefix)
        .map(|w| w[n - 1])
        .collect()
}

fn argmax(data: &[f32]) -> u32 {
    data.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !max_val.is_finite() {
        return vec![0.0; logits.len()];
    }
    let mut probs: Vec<f32> = logits.iter().map(|&v| (v - max_val).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }
    probs
}

/// Find the k-th largest value (threshold for top-k).
fn top_k_threshold(logits: &[f32], k: usize) -> f32 {
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    sorted[k.min(sorted.len()) - 1]
}

/// Keep the smallest set of most likely tokens whose mass reaches `p`,
/// then renormalize. At least one token always survives.
fn top_p_filter(probs: &[f32], p: f32) -> Vec<f32> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().cloned().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut cumsum = 0.0f32;
    let mut cutoff_idx = indexed.len();
    for (i, &(_, prob)) in indexed.iter().enumerate() {
        cumsum += prob;
        if cumsum >= p {
            cutoff_idx = i + 1;
            break;
        }
    }

    let mut filtered = vec![0.0f32; probs.len()];
    for &(idx, prob) in &indexed[..cutoff_idx] {
        filtered[idx] = prob;
    }

    let sum: f32 = filtered.iter().sum();
    if sum > 0.0 {
        for v in filtered.iter_mut() {
            *v /= sum;
        }
    }
    filtered
}

fn categorical_sample(probs: &[f32], rng: &mut SeededRng) -> u32 {
    let r = rng.uniform();
    let mut cumsum = 0.0f32;
    let mut last_nonzero = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last_nonzero = i;
        }
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    // Rounding left the cumulative sum just below r.
    last_nonzero as u32
}

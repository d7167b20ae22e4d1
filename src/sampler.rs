//! Token-selection policies.
//!
//! Each policy turns one row of next-token logits into a token id. Sampling
//! variants scale the logits by the temperature, optionally truncate the
//! distribution (top-k or nucleus), renormalize and draw with the row's own
//! generator.

use std::cmp::Ordering;

use rand::Rng;

use crate::{operator, MolgenError, Result};

/// User-facing sampling options.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Must be > 0. Ignored by greedy selection.
    pub temperature: f32,
    pub top_k: Option<usize>,
    /// Nucleus threshold in (0, 1].
    pub top_p: Option<f32>,
    /// Always pick the most likely token.
    pub greedy: bool,
    /// Defaults to the tokenizer's sequence length.
    pub max_length: Option<usize>,
    /// Fixes every row's generator; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            top_p: None,
            greedy: false,
            max_length: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Policy {
    Greedy,
    Temperature { temperature: f32 },
    TopK { k: usize, temperature: f32 },
    TopP { p: f32, temperature: f32 },
}

impl Policy {
    pub fn from_params(params: &SamplingParams) -> Result<Self> {
        let temperature = params.temperature;
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(MolgenError::Configuration(format!(
                "temperature must be > 0, got {temperature}"
            )));
        }
        if let Some(0) = params.top_k {
            return Err(MolgenError::Configuration(
                "top_k must be a positive integer".to_string(),
            ));
        }
        if let Some(p) = params.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(MolgenError::Configuration(format!(
                    "top_p must lie in (0, 1], got {p}"
                )));
            }
        }

        Ok(match (params.greedy, params.top_k, params.top_p) {
            (true, _, _) => Self::Greedy,
            (false, Some(_), Some(_)) => {
                return Err(MolgenError::Configuration(
                    "top_k and top_p are mutually exclusive".to_string(),
                ))
            }
            (false, Some(k), None) => Self::TopK { k, temperature },
            (false, None, Some(p)) => Self::TopP { p, temperature },
            (false, None, None) => Self::Temperature { temperature },
        })
    }

    /// Chooses the next token. `logits` is used as scratch space.
    pub fn select<R: Rng>(&self, logits: &mut [f32], rng: &mut R) -> Result<usize> {
        if logits.is_empty() {
            return Err(MolgenError::ModelInvocation("empty logits row".to_string()));
        }
        if logits.iter().any(|&v| v.is_nan() || v == f32::INFINITY) {
            return Err(MolgenError::ModelInvocation(
                "logits contain NaN or +inf".to_string(),
            ));
        }
        if logits.iter().all(|&v| v == f32::NEG_INFINITY) {
            return Err(MolgenError::Configuration(
                "every token is masked, nothing left to select".to_string(),
            ));
        }

        match *self {
            Self::Greedy => Ok(operator::argmax(logits)),
            Self::Temperature { temperature } => {
                scale(logits, temperature);
                operator::softmax(logits);
                Ok(operator::sample(logits, rng))
            }
            Self::TopK { k, temperature } => {
                scale(logits, temperature);
                let mut order = ranked(logits);
                order.truncate(k);
                let mut probs: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
                operator::softmax(&mut probs);
                Ok(order[operator::sample(&probs, rng)])
            }
            Self::TopP { p, temperature } => {
                scale(logits, temperature);
                operator::softmax(logits);
                let order = ranked(logits);

                // smallest prefix whose mass reaches p
                let mut mass = 0f32;
                let mut keep = order.len();
                for (n, &i) in order.iter().enumerate() {
                    mass += logits[i];
                    if mass >= p {
                        keep = n + 1;
                        break;
                    }
                }
                let probs: Vec<f32> = order[..keep].iter().map(|&i| logits[i]).collect();
                Ok(order[operator::sample(&probs, rng)])
            }
        }
    }
}

/// `(v - max) / temperature`. Shifting first keeps every value `<= 0`, so a
/// tiny temperature or a huge logit can underflow to `-inf` but never reach
/// `+inf`, and the maximum stays at exactly zero.
fn scale(logits: &mut [f32], temperature: f32) {
    let max_val = logits.iter().fold(f32::NEG_INFINITY, |acc, &v| v.max(acc));
    logits
        .iter_mut()
        .for_each(|v| *v = (*v - max_val) / temperature);
}

/// Token ids by descending value, lower id first on ties.
fn ranked(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    order
}

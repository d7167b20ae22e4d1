//! Batched autoregressive generation.
//!
//! ```text
//! prefixes ──tokenize──▶ TokenBatch ──prefill──▶ logits, cache
//!                                                  │
//!        ┌─────────────────────────────────────────┘
//!        ▼
//!   select per active row ──▶ append token ──▶ EOS / full? ──▶ freeze row
//!        ▲                                        │
//!        └──── step(newest token, cache) ◀────────┘ (while any row active)
//! ```
//!
//! Rows advance in lockstep: every step appends exactly one token to every
//! active row, each at its own position. Shorter prefixes are right-padded in
//! the buffer but keep their own cache length, so no row ever attends to
//! padding or waits for another.

use rand::{rngs::SmallRng, SeedableRng};
use tracing::{debug, info};

use crate::{
    batch::TokenBatch,
    model::SequenceModel,
    operator,
    sampler::{Policy, SamplingParams},
    state::KvCache,
    tensor::DTensor,
    tokenizer::Tokenizer,
    MolgenError, Result,
};

const ROW_SEED_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Result of one generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Prefix plus generated tokens, one row per input.
    pub sequences: TokenBatch,
    /// Log-probability of every generated token under the raw model logits.
    pub log_probs: Vec<Vec<f32>>,
    /// Entropy of the distribution each token was drawn from.
    pub entropies: Vec<Vec<f32>>,
    /// Prefill plus incremental steps.
    pub model_calls: usize,
}

impl Generation {
    /// Summed log-probability of the tokens generated for `row`.
    pub fn score(&self, row: usize) -> f32 {
        self.log_probs[row].iter().sum()
    }
}

pub struct SamplingEngine<'a, M: SequenceModel> {
    model: &'a M,
    tokenizer: &'a Tokenizer,
    params: SamplingParams,
    policy: Policy,
    max_length: usize,
}

impl<'a, M: SequenceModel> SamplingEngine<'a, M> {
    /// Validates every option up front; no model call happens here.
    pub fn new(model: &'a M, tokenizer: &'a Tokenizer, params: SamplingParams) -> Result<Self> {
        let policy = Policy::from_params(&params)?;

        if tokenizer.vocabulary_size() != model.vocab_size() {
            return Err(MolgenError::Configuration(format!(
                "tokenizer has {} tokens but the model predicts {}",
                tokenizer.vocabulary_size(),
                model.vocab_size()
            )));
        }

        let max_length = params.max_length.unwrap_or(tokenizer.sequence_length());
        if max_length == 0 || max_length > model.max_positions() {
            return Err(MolgenError::Configuration(format!(
                "max_length must lie in 1..={}, got {max_length}",
                model.max_positions()
            )));
        }

        Ok(Self {
            model,
            tokenizer,
            params,
            policy,
            max_length,
        })
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Completes every prefix and returns the decoded strings, in input order.
    pub fn sample<S: AsRef<str>>(&self, prefixes: &[S]) -> Result<Vec<String>> {
        let batch = self.tokenizer.tokenize_prefixes(prefixes, self.max_length)?;
        let generation = self.generate(batch)?;
        Ok(self.tokenizer.detokenize(&generation.sequences))
    }

    /// Extends each row of `batch` until it emits the end token or reaches
    /// the maximum length. The batch width must equal the maximum length.
    pub fn generate(&self, batch: TokenBatch) -> Result<Generation> {
        let (batch_size, max_len) = (batch.batch_size(), self.max_length);
        let eos = self.tokenizer.eos_id();

        if batch.width() != max_len {
            return Err(MolgenError::Configuration(format!(
                "batch width {} does not match max_length {max_len}",
                batch.width()
            )));
        }
        if let Some(row) = (0..batch_size).find(|&row| batch.len(row) == 0) {
            return Err(MolgenError::Tokenization(format!(
                "row {row} holds no tokens"
            )));
        }

        let mut seqs = batch;
        let mut active: Vec<bool> = (0..batch_size)
            .map(|row| seqs.len(row) < max_len && seqs.last(row) != Some(eos))
            .collect();
        let mut log_probs = vec![Vec::new(); batch_size];
        let mut entropies = vec![Vec::new(); batch_size];
        let mut model_calls = 0;

        if !active.iter().any(|&a| a) {
            info!(batch_size, "nothing to generate, every row is complete");
            return Ok(Generation {
                sequences: seqs,
                log_probs,
                entropies,
                model_calls,
            });
        }

        let mut rngs = self.row_rngs(batch_size);

        let cache = self.model.init_cache(batch_size, max_len);
        let (mut logits, mut cache) = self.model.prefill(&seqs, cache)?;
        model_calls += 1;
        expect_shape(&cache, batch_size, max_len)?;
        for row in 0..batch_size {
            expect_cached(&cache, row, seqs.len(row))?;
        }

        loop {
            self.check_logits(&logits, batch_size)?;

            for row in 0..batch_size {
                if !active[row] {
                    continue;
                }
                let row_logits = &mut logits[row];
                let lp = operator::log_softmax(row_logits);
                let token = self.policy.select(row_logits, &mut rngs[row])?;

                log_probs[row].push(lp[token]);
                entropies[row].push(operator::entropy(&lp));
                seqs.push(row, token)?;
                if token == eos || seqs.len(row) == max_len {
                    active[row] = false;
                }
            }

            let remaining = active.iter().filter(|&&a| a).count();
            debug!(step = model_calls, remaining, "selected next tokens");
            if remaining == 0 {
                break;
            }

            let mut tokens = vec![seqs.pad_id(); batch_size];
            let mut positions = vec![0; batch_size];
            for row in (0..batch_size).filter(|&row| active[row]) {
                let pos = seqs.len(row) - 1;
                expect_cached(&cache, row, pos)?;
                tokens[row] = seqs.row(row)[pos];
                positions[row] = pos;
            }

            let (next_logits, next_cache) = self.model.step(&tokens, &positions, &active, cache)?;
            model_calls += 1;
            expect_shape(&next_cache, batch_size, max_len)?;
            logits = next_logits;
            cache = next_cache;
        }

        info!(
            batch_size,
            model_calls,
            generated = log_probs.iter().map(Vec::len).sum::<usize>(),
            "generation finished"
        );
        Ok(Generation {
            sequences: seqs,
            log_probs,
            entropies,
            model_calls,
        })
    }

    fn row_rngs(&self, batch_size: usize) -> Vec<SmallRng> {
        (0..batch_size)
            .map(|row| match self.params.seed {
                Some(seed) => SmallRng::seed_from_u64(seed ^ (row as u64).wrapping_mul(ROW_SEED_MIX)),
                None => SmallRng::from_entropy(),
            })
            .collect()
    }

    fn check_logits(&self, logits: &DTensor, batch_size: usize) -> Result<()> {
        let expected = [batch_size, self.model.vocab_size()];
        if logits.layout() != expected.as_slice() {
            return Err(MolgenError::ModelInvocation(format!(
                "model returned logits shaped {:?}, expected {expected:?}",
                logits.layout()
            )));
        }
        Ok(())
    }
}

/// The model must hand back the cache it was given, not a resized one.
fn expect_shape(cache: &KvCache, batch_size: usize, capacity: usize) -> Result<()> {
    if cache.batch_size() != batch_size || cache.capacity() != capacity {
        return Err(MolgenError::CacheConsistency(format!(
            "model returned a cache of {} rows x {} positions, expected {batch_size} x {capacity}",
            cache.batch_size(),
            cache.capacity()
        )));
    }
    Ok(())
}

fn expect_cached(cache: &KvCache, row: usize, len: usize) -> Result<()> {
    if cache.len(row) != len {
        return Err(MolgenError::CacheConsistency(format!(
            "row {row} should hold {len} cached positions but holds {}",
            cache.len(row)
        )));
    }
    Ok(())
}

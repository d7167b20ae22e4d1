//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::cell::Cell;

use molgen::config::Config;
use molgen::tensor::DTensor;
use molgen::{KvCache, Result, SequenceModel, TokenBatch, Tokenizer, Transformer, Vocabulary};

pub const EOS: usize = 3;

/// A model whose logits are a function of the full token history of a row.
///
/// The history is recovered from the cache itself (each token id is stored as
/// a one-wide key), so anything that corrupts cache bookkeeping shows up in
/// the output.
pub struct ScriptedModel<F> {
    pub vocab_size: usize,
    pub max_positions: usize,
    pub next: F,
    pub calls: Cell<usize>,
    /// skip committing cache positions during `step`
    pub forget_steps: bool,
    /// hand back a cache with one extra row from `step`
    pub resize_cache: bool,
}

impl<F: Fn(&[usize]) -> Vec<f32>> ScriptedModel<F> {
    pub fn new(vocab_size: usize, max_positions: usize, next: F) -> Self {
        Self {
            vocab_size,
            max_positions,
            next,
            calls: Cell::new(0),
            forget_steps: false,
            resize_cache: false,
        }
    }

    fn history(cache: &KvCache, row: usize, upto: usize) -> Vec<usize> {
        cache
            .keys(0, row, upto)
            .iter()
            .map(|&v| v as usize)
            .collect()
    }
}

impl<F: Fn(&[usize]) -> Vec<f32>> SequenceModel for ScriptedModel<F> {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn init_cache(&self, batch_size: usize, capacity: usize) -> KvCache {
        KvCache::new(1, batch_size, capacity, 1)
    }

    fn prefill(&self, batch: &TokenBatch, mut cache: KvCache) -> Result<(DTensor, KvCache)> {
        self.calls.set(self.calls.get() + 1);
        let mut logits = DTensor::new(&[batch.batch_size(), self.vocab_size]);
        for row in 0..batch.batch_size() {
            let tokens = batch.row(row);
            cache.extend(row, tokens.len())?;
            for (pos, &t) in tokens.iter().enumerate() {
                cache.store(0, row, pos, &[t as f32], &[0.0]);
            }
            let history = Self::history(&cache, row, tokens.len());
            logits[row].copy_from_slice(&(self.next)(&history));
        }
        Ok((logits, cache))
    }

    fn step(
        &self,
        tokens: &[usize],
        positions: &[usize],
        active: &[bool],
        mut cache: KvCache,
    ) -> Result<(DTensor, KvCache)> {
        self.calls.set(self.calls.get() + 1);
        let mut logits = DTensor::new(&[tokens.len(), self.vocab_size]);
        for row in (0..tokens.len()).filter(|&r| active[r]) {
            let pos = positions[row];
            if self.forget_steps {
                continue;
            }
            cache.begin(row, pos)?;
            cache.store(0, row, pos, &[tokens[row] as f32], &[0.0]);
            cache.advance(row);
            let history = Self::history(&cache, row, pos + 1);
            logits[row].copy_from_slice(&(self.next)(&history));
        }
        if self.resize_cache {
            cache = KvCache::new(1, tokens.len() + 1, cache.capacity(), 1);
        }
        Ok((logits, cache))
    }
}

/// Logits strongly favouring `token`.
pub fn one_hot(vocab_size: usize, token: usize) -> Vec<f32> {
    let mut logits = vec![0.0; vocab_size];
    logits[token] = 10.0;
    logits
}

pub const CORPUS: [&str; 6] = [
    "CCO",
    "c1ccccc1",
    "CC(=O)O",
    "CN1C=NC2=C1C(=O)N(C(=O)N2C)C",
    "ClC(Cl)Cl",
    "C1CCNCC1",
];

pub fn tokenizer() -> Tokenizer {
    Tokenizer::new(Vocabulary::adapt(CORPUS).unwrap())
}

/// An untrained decoder sized for [`tokenizer`].
pub fn transformer(tokenizer: &Tokenizer, seed: u64) -> Transformer {
    let config = Config {
        dim: 16,
        hidden_dim: 32,
        n_layers: 2,
        n_heads: 4,
        vocab_size: tokenizer.vocabulary_size(),
        seq_len: tokenizer.sequence_length(),
    };
    Transformer::random(config, seed).unwrap()
}

/// Vocabulary of `n` learned single-letter tokens, for scripted models.
pub fn letters(n: usize, sequence_length: usize) -> Tokenizer {
    let learned = ["C", "N", "O", "S", "P", "F", "I", "B"];
    Tokenizer::new(Vocabulary::new(learned[..n].iter().copied(), sequence_length).unwrap())
}

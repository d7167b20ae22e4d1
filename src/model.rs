use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use tracing::info;

use crate::{
    batch::TokenBatch,
    config::Config,
    operator,
    state::{Activations, KvCache},
    tensor::DTensor,
    weights::TransformerWeights,
    MolgenError, Result,
};

const LAYER_NORM_EPS: f32 = 1e-5;

/// An autoregressive model the sampling engine can drive.
///
/// The cache is explicit state: every call consumes it and returns the
/// updated value next to the logits, so the engine owns the whole data flow.
pub trait SequenceModel {
    fn vocab_size(&self) -> usize;

    /// Longest sequence the model can attend over.
    fn max_positions(&self) -> usize;

    fn init_cache(&self, batch_size: usize, capacity: usize) -> KvCache;

    /// Full, non-incremental pass over each row's valid prefix.
    ///
    /// Seeds cache positions `[0, len_i)` of every row and returns the
    /// (batch, vocab) logits for position `len_i`.
    fn prefill(&self, batch: &TokenBatch, cache: KvCache) -> Result<(DTensor, KvCache)>;

    /// Incremental pass: feeds `tokens[i]` at `positions[i]` for every row
    /// with `active[i]` set, attending over the cached prefix. Rows that are
    /// not active are skipped; their logits row carries no meaning.
    fn step(
        &self,
        tokens: &[usize],
        positions: &[usize],
        active: &[bool],
        cache: KvCache,
    ) -> Result<(DTensor, KvCache)>;
}

/// Post-norm GPT-style decoder with learned positions.
pub struct Transformer {
    pub config: Config,
    weights: TransformerWeights,
}

impl Transformer {
    pub fn new(config: Config, weights: TransformerWeights) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, weights })
    }

    pub fn random(config: Config, seed: u64) -> Result<Self> {
        config.validate()?;
        let weights = TransformerWeights::random(&config, seed);
        Ok(Self { config, weights })
    }

    pub fn from_file<P: AsRef<Path>>(checkpoint_path: P) -> Result<Self> {
        let mut file = BufReader::new(File::open(checkpoint_path.as_ref())?);

        let config = Config::from_reader(&mut file)?;
        info!(?config, path = %checkpoint_path.as_ref().display(), "loaded checkpoint header");

        let weights = TransformerWeights::from_reader(&mut file, &config)?;
        Ok(Self { config, weights })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        self.config.write_to(w)?;
        self.weights.write_to(w)
    }

    pub fn save<P: AsRef<Path>>(&self, checkpoint_path: P) -> Result<()> {
        let mut file = BufWriter::new(File::create(checkpoint_path)?);
        self.write_to(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Logits for every position of `tokens`, computed from scratch without
    /// any cache. Row `p` predicts the token at `p + 1`.
    pub fn forward_full(&self, tokens: &[usize]) -> Result<DTensor> {
        let hidden = self.run_sequence(tokens, None)?;
        let mut logits = DTensor::new(&[tokens.len(), self.config.vocab_size]);
        for (t, x) in hidden.iter().enumerate() {
            self.classify(x, &mut logits[t]);
        }
        Ok(logits)
    }

    fn embed(&self, x: &mut [f32], token: usize, pos: usize) -> Result<()> {
        if token >= self.config.vocab_size {
            return Err(MolgenError::ModelInvocation(format!(
                "token id {token} outside vocabulary of {}",
                self.config.vocab_size
            )));
        }
        if pos >= self.config.seq_len {
            return Err(MolgenError::ModelInvocation(format!(
                "position {pos} beyond the {} learned positions",
                self.config.seq_len
            )));
        }
        x.copy_from_slice(&self.weights.token_embedding[token]);
        operator::add_inplace(x, &self.weights.position_embedding[pos]);
        Ok(())
    }

    fn project_qkv(&self, a: &mut Activations, layer: usize) {
        let (w, dim) = (&self.weights, self.config.dim);
        operator::linear(&mut a.q, &w.wq[layer], &w.bq[layer], &a.x, dim, dim);
        operator::linear(&mut a.k, &w.wk[layer], &w.bk[layer], &a.x, dim, dim);
        operator::linear(&mut a.v, &w.wv[layer], &w.bv[layer], &a.x, dim, dim);
    }

    /// Multi-head attention of one query over `keys`/`values` laid out as
    /// (n, dim).
    fn attend(&self, q: &[f32], keys: &[f32], values: &[f32], att: &mut [f32], out: &mut [f32]) {
        let dim = self.config.dim;
        let head_size = self.config.head_size();
        let n = keys.len() / dim;
        let scale = 1.0 / (head_size as f32).sqrt();

        for (h, out) in out.chunks_exact_mut(head_size).enumerate() {
            let qh = &q[h * head_size..(h + 1) * head_size];
            let att = &mut att[..n];
            for (t, score) in att.iter_mut().enumerate() {
                let kh = &keys[t * dim + h * head_size..t * dim + (h + 1) * head_size];
                *score = qh.iter().zip(kh.iter()).map(|(q, k)| q * k).sum::<f32>() * scale;
            }
            operator::softmax(att);

            out.iter_mut().for_each(|o| *o = 0.0);
            for (t, &a) in att.iter().enumerate() {
                let vh = &values[t * dim + h * head_size..t * dim + (h + 1) * head_size];
                out.iter_mut().zip(vh.iter()).for_each(|(o, v)| *o += a * v);
            }
        }
    }

    /// Output projection, both residual+norm blocks and the ffn; expects the
    /// attention result in `a.xb2`.
    fn finish_block(&self, a: &mut Activations, layer: usize) {
        let (w, dim, hidden) = (&self.weights, self.config.dim, self.config.hidden_dim);

        operator::linear(&mut a.xb, &w.wo[layer], &w.bo[layer], &a.xb2, dim, dim);
        operator::add_inplace(&mut a.x, &a.xb);
        operator::layernorm(
            &mut a.x,
            &w.ln_att_gamma[layer],
            &w.ln_att_beta[layer],
            LAYER_NORM_EPS,
        );

        operator::linear(&mut a.hb, &w.w1[layer], &w.b1[layer], &a.x, dim, hidden);
        operator::relu(&mut a.hb);
        operator::linear(&mut a.xb, &w.w2[layer], &w.b2[layer], &a.hb, hidden, dim);
        operator::add_inplace(&mut a.x, &a.xb);
        operator::layernorm(
            &mut a.x,
            &w.ln_ffn_gamma[layer],
            &w.ln_ffn_beta[layer],
            LAYER_NORM_EPS,
        );
    }

    fn classify(&self, x: &[f32], out: &mut [f32]) {
        let (w, c) = (&self.weights, &self.config);
        operator::linear(out, &w.wcls, &w.bcls, x, c.dim, c.vocab_size);
    }

    /// Layer-by-layer pass over a whole sequence with a causal mask. When a
    /// cache row is supplied, the keys and values of every position are
    /// stored into it. Returns the final hidden state of each position.
    fn run_sequence(
        &self,
        tokens: &[usize],
        mut cache: Option<(&mut KvCache, usize)>,
    ) -> Result<Vec<Vec<f32>>> {
        let dim = self.config.dim;
        let n = tokens.len();
        if n > self.config.seq_len {
            return Err(MolgenError::ModelInvocation(format!(
                "sequence of {n} tokens exceeds {} positions",
                self.config.seq_len
            )));
        }

        let mut a = Activations::new(&self.config);
        let mut xs = Vec::with_capacity(n);
        for (pos, &token) in tokens.iter().enumerate() {
            self.embed(&mut a.x, token, pos)?;
            xs.push(a.x.clone());
        }

        let mut qs = vec![0.0; n * dim];
        let mut ks = vec![0.0; n * dim];
        let mut vs = vec![0.0; n * dim];
        for layer in 0..self.config.n_layers {
            for (t, x) in xs.iter().enumerate() {
                a.x.copy_from_slice(x);
                self.project_qkv(&mut a, layer);
                qs[t * dim..(t + 1) * dim].copy_from_slice(&a.q);
                ks[t * dim..(t + 1) * dim].copy_from_slice(&a.k);
                vs[t * dim..(t + 1) * dim].copy_from_slice(&a.v);
                if let Some((cache, row)) = cache.as_mut() {
                    cache.store(layer, *row, t, &a.k, &a.v);
                }
            }
            for (t, x) in xs.iter_mut().enumerate() {
                let upto = (t + 1) * dim;
                self.attend(
                    &qs[t * dim..upto],
                    &ks[..upto],
                    &vs[..upto],
                    &mut a.att,
                    &mut a.xb2,
                );
                a.x.copy_from_slice(x);
                self.finish_block(&mut a, layer);
                x.copy_from_slice(&a.x);
            }
        }
        Ok(xs)
    }

    /// One token through the decoder, attending over the cached prefix of
    /// `row`. The caller has checked that `pos` is the row's next slot.
    fn forward_token(
        &self,
        a: &mut Activations,
        cache: &mut KvCache,
        row: usize,
        token: usize,
        pos: usize,
        logits: &mut [f32],
    ) -> Result<()> {
        self.embed(&mut a.x, token, pos)?;
        for layer in 0..self.config.n_layers {
            self.project_qkv(a, layer);
            cache.store(layer, row, pos, &a.k, &a.v);
            self.attend(
                &a.q,
                cache.keys(layer, row, pos + 1),
                cache.values(layer, row, pos + 1),
                &mut a.att,
                &mut a.xb2,
            );
            self.finish_block(a, layer);
        }
        self.classify(&a.x, logits);
        Ok(())
    }

    fn check_batch(&self, cache: &KvCache, batch_size: usize) -> Result<()> {
        if cache.batch_size() != batch_size {
            return Err(MolgenError::CacheConsistency(format!(
                "cache holds {} rows but the batch has {batch_size}",
                cache.batch_size()
            )));
        }
        Ok(())
    }
}

impl SequenceModel for Transformer {
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_positions(&self) -> usize {
        self.config.seq_len
    }

    fn init_cache(&self, batch_size: usize, capacity: usize) -> KvCache {
        KvCache::new(self.config.n_layers, batch_size, capacity, self.config.dim)
    }

    fn prefill(&self, batch: &TokenBatch, mut cache: KvCache) -> Result<(DTensor, KvCache)> {
        self.check_batch(&cache, batch.batch_size())?;
        let mut logits = DTensor::new(&[batch.batch_size(), self.config.vocab_size]);
        for row in 0..batch.batch_size() {
            let tokens = batch.row(row);
            if tokens.is_empty() {
                return Err(MolgenError::ModelInvocation(format!(
                    "row {row} has no prefix to prefill"
                )));
            }
            cache.extend(row, tokens.len())?;
            let hidden = self.run_sequence(tokens, Some((&mut cache, row)))?;
            if let Some(last) = hidden.last() {
                self.classify(last, &mut logits[row]);
            }
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
        let batch_size = tokens.len();
        if positions.len() != batch_size || active.len() != batch_size {
            return Err(MolgenError::ModelInvocation(format!(
                "step got {batch_size} tokens, {} positions and {} mask entries",
                positions.len(),
                active.len()
            )));
        }
        self.check_batch(&cache, batch_size)?;

        let mut a = Activations::new(&self.config);
        let mut logits = DTensor::new(&[batch_size, self.config.vocab_size]);
        for row in (0..batch_size).filter(|&row| active[row]) {
            let (token, pos) = (tokens[row], positions[row]);
            cache.begin(row, pos)?;
            self.forward_token(&mut a, &mut cache, row, token, pos, &mut logits[row])?;
            cache.advance(row);
        }
        Ok((logits, cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Transformer {
        let config = Config {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            vocab_size: 10,
            seq_len: 12,
        };
        Transformer::random(config, 5).unwrap()
    }

    #[test]
    fn full_pass_shapes_follow_the_sequence() {
        let model = tiny();
        let logits = model.forward_full(&[2, 4, 5]).unwrap();
        assert_eq!(logits.layout(), &[3, 10]);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn out_of_vocabulary_token_is_an_invocation_error() {
        let model = tiny();
        assert!(matches!(
            model.forward_full(&[2, 99]),
            Err(MolgenError::ModelInvocation(_))
        ));
    }

    #[test]
    fn step_rejects_a_position_the_cache_has_not_reached() {
        let model = tiny();
        let cache = model.init_cache(1, 8);
        let err = model.step(&[3], &[2], &[true], cache).unwrap_err();
        assert!(matches!(err, MolgenError::CacheConsistency(_)));
    }

    #[test]
    fn inactive_rows_leave_the_cache_untouched() {
        let model = tiny();
        let cache = model.init_cache(2, 8);
        let (_, cache) = model.step(&[2, 2], &[0, 0], &[true, false], cache).unwrap();
        assert_eq!(cache.lengths(), &[1, 0]);
    }
}

use std::io::{Read, Write};

use rand::{rngs::SmallRng, SeedableRng};

use crate::{config::Config, tensor::DTensor, Result};

const EMBEDDING_LIMIT: f32 = 0.05;

#[derive(Debug, Clone)]
pub struct TransformerWeights {
    /// (vocab_size, dim)
    pub token_embedding: DTensor,
    /// learned positions
    /// (seq_len, dim)
    pub position_embedding: DTensor,
    /// attention projections, (out, in) per layer
    /// (layer, dim, dim)
    pub wq: DTensor,
    pub wk: DTensor,
    pub wv: DTensor,
    pub wo: DTensor,
    /// (layer, dim)
    pub bq: DTensor,
    pub bk: DTensor,
    pub bv: DTensor,
    pub bo: DTensor,
    /// post-attention layernorm
    /// (layer, dim)
    pub ln_att_gamma: DTensor,
    pub ln_att_beta: DTensor,
    /// (layer, hidden_dim, dim)
    pub w1: DTensor,
    /// (layer, hidden_dim)
    pub b1: DTensor,
    /// (layer, dim, hidden_dim)
    pub w2: DTensor,
    /// (layer, dim)
    pub b2: DTensor,
    /// post-ffn layernorm
    /// (layer, dim)
    pub ln_ffn_gamma: DTensor,
    pub ln_ffn_beta: DTensor,
    /// classifier weights for the logits
    /// (vocab_size, dim)
    pub wcls: DTensor,
    /// (vocab_size,)
    pub bcls: DTensor,
}

struct Layouts {
    token_embedding: [usize; 2],
    position_embedding: [usize; 2],
    square: [usize; 3],
    per_layer: [usize; 2],
    w1: [usize; 3],
    b1: [usize; 2],
    w2: [usize; 3],
    wcls: [usize; 2],
    bcls: [usize; 1],
}

impl Layouts {
    fn new(cfg: &Config) -> Self {
        let (l, d, h) = (cfg.n_layers, cfg.dim, cfg.hidden_dim);
        Self {
            token_embedding: [cfg.vocab_size, d],
            position_embedding: [cfg.seq_len, d],
            square: [l, d, d],
            per_layer: [l, d],
            w1: [l, h, d],
            b1: [l, h],
            w2: [l, d, h],
            wcls: [cfg.vocab_size, d],
            bcls: [cfg.vocab_size],
        }
    }
}

impl TransformerWeights {
    /// Reads the tensors in checkpoint order; the header has already been
    /// consumed by [`Config::from_reader`].
    pub fn from_reader<R: Read>(r: &mut R, cfg: &Config) -> Result<Self> {
        let ly = Layouts::new(cfg);
        Ok(Self {
            token_embedding: DTensor::from_reader(r, &ly.token_embedding)?,
            position_embedding: DTensor::from_reader(r, &ly.position_embedding)?,
            wq: DTensor::from_reader(r, &ly.square)?,
            wk: DTensor::from_reader(r, &ly.square)?,
            wv: DTensor::from_reader(r, &ly.square)?,
            wo: DTensor::from_reader(r, &ly.square)?,
            bq: DTensor::from_reader(r, &ly.per_layer)?,
            bk: DTensor::from_reader(r, &ly.per_layer)?,
            bv: DTensor::from_reader(r, &ly.per_layer)?,
            bo: DTensor::from_reader(r, &ly.per_layer)?,
            ln_att_gamma: DTensor::from_reader(r, &ly.per_layer)?,
            ln_att_beta: DTensor::from_reader(r, &ly.per_layer)?,
            w1: DTensor::from_reader(r, &ly.w1)?,
            b1: DTensor::from_reader(r, &ly.b1)?,
            w2: DTensor::from_reader(r, &ly.w2)?,
            b2: DTensor::from_reader(r, &ly.per_layer)?,
            ln_ffn_gamma: DTensor::from_reader(r, &ly.per_layer)?,
            ln_ffn_beta: DTensor::from_reader(r, &ly.per_layer)?,
            wcls: DTensor::from_reader(r, &ly.wcls)?,
            bcls: DTensor::from_reader(r, &ly.bcls)?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        for t in self.tensors() {
            t.write_to(w)?;
        }
        Ok(())
    }

    /// Glorot-uniform kernels, small uniform embeddings, zero biases and unit
    /// layernorm gains.
    pub fn random(cfg: &Config, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let ly = Layouts::new(cfg);
        Self {
            token_embedding: DTensor::uniform(&ly.token_embedding, EMBEDDING_LIMIT, &mut rng),
            position_embedding: DTensor::uniform(
                &ly.position_embedding,
                EMBEDDING_LIMIT,
                &mut rng,
            ),
            wq: DTensor::glorot(&ly.square, &mut rng),
            wk: DTensor::glorot(&ly.square, &mut rng),
            wv: DTensor::glorot(&ly.square, &mut rng),
            wo: DTensor::glorot(&ly.square, &mut rng),
            bq: DTensor::new(&ly.per_layer),
            bk: DTensor::new(&ly.per_layer),
            bv: DTensor::new(&ly.per_layer),
            bo: DTensor::new(&ly.per_layer),
            ln_att_gamma: DTensor::filled(&ly.per_layer, 1.0),
            ln_att_beta: DTensor::new(&ly.per_layer),
            w1: DTensor::glorot(&ly.w1, &mut rng),
            b1: DTensor::new(&ly.b1),
            w2: DTensor::glorot(&ly.w2, &mut rng),
            b2: DTensor::new(&ly.per_layer),
            ln_ffn_gamma: DTensor::filled(&ly.per_layer, 1.0),
            ln_ffn_beta: DTensor::new(&ly.per_layer),
            wcls: DTensor::glorot(&ly.wcls, &mut rng),
            bcls: DTensor::new(&ly.bcls),
        }
    }

    fn tensors(&self) -> [&DTensor; 20] {
        [
            &self.token_embedding,
            &self.position_embedding,
            &self.wq,
            &self.wk,
            &self.wv,
            &self.wo,
            &self.bq,
            &self.bk,
            &self.bv,
            &self.bo,
            &self.ln_att_gamma,
            &self.ln_att_beta,
            &self.w1,
            &self.b1,
            &self.w2,
            &self.b2,
            &self.ln_ffn_gamma,
            &self.ln_ffn_beta,
            &self.wcls,
            &self.bcls,
        ]
    }
}

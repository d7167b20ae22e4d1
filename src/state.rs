use crate::{config::Config, MolgenError, Result};

/// Key/value projections of every token seen so far, one slot per
/// (layer, row, position).
///
/// The cache is owned by a single generation run and threaded through the
/// model by value: `prefill` and `step` take it and hand back the updated one.
/// `len(row)` is the number of committed positions; the next token of a row
/// must be written exactly at that position.
#[derive(Debug, Clone)]
pub struct KvCache {
    n_layers: usize,
    batch_size: usize,
    capacity: usize,
    kv_dim: usize,
    /// (layer, batch, capacity, kv_dim)
    key: Vec<f32>,
    value: Vec<f32>,
    lengths: Vec<usize>,
}

impl KvCache {
    pub fn new(n_layers: usize, batch_size: usize, capacity: usize, kv_dim: usize) -> Self {
        let size = n_layers * batch_size * capacity * kv_dim;
        Self {
            n_layers,
            batch_size,
            capacity,
            kv_dim,
            key: vec![0.0; size],
            value: vec![0.0; size],
            lengths: vec![0; batch_size],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self, row: usize) -> usize {
        self.lengths[row]
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Checks that `pos` is the next free slot of `row`.
    pub fn begin(&self, row: usize, pos: usize) -> Result<()> {
        if row >= self.batch_size {
            return Err(MolgenError::CacheConsistency(format!(
                "row {row} outside a cache of {} rows",
                self.batch_size
            )));
        }
        if pos != self.lengths[row] {
            return Err(MolgenError::CacheConsistency(format!(
                "row {row} holds {} positions but step writes position {pos}",
                self.lengths[row]
            )));
        }
        if pos >= self.capacity {
            return Err(MolgenError::CacheConsistency(format!(
                "position {pos} exceeds cache capacity {}",
                self.capacity
            )));
        }
        Ok(())
    }

    pub fn store(&mut self, layer: usize, row: usize, pos: usize, k: &[f32], v: &[f32]) {
        debug_assert_eq!(k.len(), self.kv_dim);
        debug_assert_eq!(v.len(), self.kv_dim);
        let offset = self.offset(layer, row) + pos * self.kv_dim;
        self.key[offset..offset + self.kv_dim].copy_from_slice(k);
        self.value[offset..offset + self.kv_dim].copy_from_slice(v);
    }

    /// Commits one freshly stored position.
    pub fn advance(&mut self, row: usize) {
        debug_assert!(self.lengths[row] < self.capacity);
        self.lengths[row] += 1;
    }

    /// Commits a whole prefix into an empty row.
    pub fn extend(&mut self, row: usize, n: usize) -> Result<()> {
        if self.lengths[row] != 0 {
            return Err(MolgenError::CacheConsistency(format!(
                "prefill into row {row} which already holds {} positions",
                self.lengths[row]
            )));
        }
        if n > self.capacity {
            return Err(MolgenError::CacheConsistency(format!(
                "prefix of {n} tokens exceeds cache capacity {}",
                self.capacity
            )));
        }
        self.lengths[row] = n;
        Ok(())
    }

    /// Keys of positions `[0, upto)` as a (upto, kv_dim) slice.
    pub fn keys(&self, layer: usize, row: usize, upto: usize) -> &[f32] {
        let offset = self.offset(layer, row);
        &self.key[offset..offset + upto * self.kv_dim]
    }

    pub fn values(&self, layer: usize, row: usize, upto: usize) -> &[f32] {
        let offset = self.offset(layer, row);
        &self.value[offset..offset + upto * self.kv_dim]
    }

    fn offset(&self, layer: usize, row: usize) -> usize {
        debug_assert!(layer < self.n_layers);
        debug_assert!(row < self.batch_size);
        (layer * self.batch_size + row) * self.capacity * self.kv_dim
    }
}

/// Scratch buffers for pushing one token through the decoder.
pub struct Activations {
    /// activation at current time stamp
    /// (dim,)
    pub x: Vec<f32>,
    /// same, but inside a residual branch
    /// (dim,)
    pub xb: Vec<f32>,
    /// attention output before the output projection
    /// (dim,)
    pub xb2: Vec<f32>,
    /// buffer for hidden dimension in the ffn
    /// (hidden_dim,)
    pub hb: Vec<f32>,
    /// query
    /// (dim,)
    pub q: Vec<f32>,
    /// key
    /// (dim,)
    pub k: Vec<f32>,
    /// value
    /// (dim,)
    pub v: Vec<f32>,
    /// buffer for scores/attention values
    /// (seq_len,)
    pub att: Vec<f32>,
}

impl Activations {
    pub fn new(conf: &Config) -> Self {
        Self {
            x: vec![0.0; conf.dim],
            xb: vec![0.0; conf.dim],
            xb2: vec![0.0; conf.dim],
            hb: vec![0.0; conf.hidden_dim],
            q: vec![0.0; conf.dim],
            k: vec![0.0; conf.dim],
            v: vec![0.0; conf.dim],
            att: vec![0.0; conf.seq_len],
        }
    }
}

use std::{
    io::{Read, Write},
    ops::{Deref, DerefMut, Index, IndexMut},
};

use rand::Rng;

use crate::{read_tensor, write_tensor, Result};

/// Owned row-major `f32` buffer.
///
/// Indexing with `t[i]` yields the contiguous slice of the `i`-th entry of the
/// outermost dimension, e.g. one layer of a stacked weight or one row of a
/// (batch, vocab) logits block.
#[derive(Debug, Clone, PartialEq)]
pub struct DTensor {
    data: Vec<f32>,
    // from outer to inner
    layout: Vec<usize>,
}

impl Deref for DTensor {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for DTensor {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Index<usize> for DTensor {
    type Output = [f32];

    fn index(&self, index: usize) -> &Self::Output {
        debug_assert!(index < self.layout[0]);
        let stride = self.stride();
        &self.data[index * stride..(index + 1) * stride]
    }
}

impl IndexMut<usize> for DTensor {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        debug_assert!(index < self.layout[0]);
        let stride = self.stride();
        &mut self.data[index * stride..(index + 1) * stride]
    }
}

impl DTensor {
    pub fn new(layout: &[usize]) -> Self {
        Self {
            data: vec![0.0; layout.iter().product()],
            layout: layout.to_vec(),
        }
    }

    pub fn filled(layout: &[usize], value: f32) -> Self {
        Self {
            data: vec![value; layout.iter().product()],
            layout: layout.to_vec(),
        }
    }

    pub fn from_reader<R: Read>(r: &mut R, layout: &[usize]) -> Result<Self> {
        let data = read_tensor(r, layout.iter().product())?;
        Ok(Self {
            data,
            layout: layout.to_vec(),
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_tensor(w, &self.data)
    }

    /// Uniform in `[-limit, limit)`.
    pub fn uniform<R: Rng>(layout: &[usize], limit: f32, rng: &mut R) -> Self {
        let num = layout.iter().product();
        let data = (0..num).map(|_| rng.gen_range(-limit..limit)).collect();
        Self {
            data,
            layout: layout.to_vec(),
        }
    }

    /// Glorot-uniform init for a stack of (fan_out, fan_in) matrices; the
    /// last two dimensions of `layout` are the matrix.
    pub fn glorot<R: Rng>(layout: &[usize], rng: &mut R) -> Self {
        let n = layout.len();
        debug_assert!(n >= 2);
        let (fan_out, fan_in) = (layout[n - 2], layout[n - 1]);
        let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
        Self::uniform(layout, limit, rng)
    }

    pub fn layout(&self) -> &[usize] {
        &self.layout
    }

    fn stride(&self) -> usize {
        self.layout[1..].iter().product()
    }
}

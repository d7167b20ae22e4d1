use crate::{MolgenError, Result};

/// Rectangular (batch_size, width) buffer of token ids, right-padded.
///
/// For row `i`, positions `[0, len(i))` hold valid tokens and the rest hold
/// `pad_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    ids: Vec<usize>,
    lengths: Vec<usize>,
    width: usize,
    pad_id: usize,
}

impl TokenBatch {
    pub fn from_rows<R: AsRef<[usize]>>(rows: &[R], width: usize, pad_id: usize) -> Result<Self> {
        let mut ids = vec![pad_id; rows.len() * width];
        let mut lengths = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() > width {
                return Err(MolgenError::Tokenization(format!(
                    "row {i} has {} tokens, more than the batch width {width}",
                    row.len()
                )));
            }
            ids[i * width..i * width + row.len()].copy_from_slice(row);
            lengths.push(row.len());
        }
        Ok(Self {
            ids,
            lengths,
            width,
            pad_id,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn pad_id(&self) -> usize {
        self.pad_id
    }

    pub fn len(&self, row: usize) -> usize {
        self.lengths[row]
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Valid tokens of `row`.
    pub fn row(&self, row: usize) -> &[usize] {
        &self.ids[row * self.width..row * self.width + self.lengths[row]]
    }

    /// Full padded row.
    pub fn padded_row(&self, row: usize) -> &[usize] {
        &self.ids[row * self.width..(row + 1) * self.width]
    }

    pub fn last(&self, row: usize) -> Option<usize> {
        self.row(row).last().copied()
    }

    /// Appends `token` at position `len(row)`.
    pub fn push(&mut self, row: usize, token: usize) -> Result<()> {
        let len = self.lengths[row];
        if len >= self.width {
            return Err(MolgenError::CacheConsistency(format!(
                "row {row} is already full at width {}",
                self.width
            )));
        }
        self.ids[row * self.width + len] = token;
        self.lengths[row] += 1;
        Ok(())
    }

    pub fn rows(&self) -> impl Iterator<Item = &[usize]> + '_ {
        (0..self.batch_size()).map(move |i| self.row(i))
    }
}

use std::io::{Read, Write};

pub mod batch;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod model;
pub mod operator;
pub mod sampler;
pub mod state;
pub mod tensor;
pub mod tokenizer;
pub mod weights;

mod error;

pub use batch::TokenBatch;
pub use engine::{Generation, SamplingEngine};
pub use error::MolgenError;
pub use error::Result;
pub use model::{SequenceModel, Transformer};
pub use sampler::{Policy, SamplingParams};
pub use state::KvCache;
pub use tokenizer::{SpecialToken, Tokenizer, Vocabulary};

pub(crate) fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn read_tensor<R: Read>(r: &mut R, num: usize) -> Result<Vec<f32>> {
    let bytes_to_read = num * std::mem::size_of::<f32>();
    let mut raw_tensor = vec![0; bytes_to_read];
    r.read_exact(&mut raw_tensor)?;
    Ok(raw_tensor
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub(crate) fn write_tensor<W: Write>(w: &mut W, data: &[f32]) -> Result<()> {
    for v in data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

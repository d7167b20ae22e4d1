use std::io::{Read, Write};

use crate::{MolgenError, Result};

/// Hyper-parameters of a decoder checkpoint, stored as its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub vocab_size: usize,
    pub seq_len: usize,
}

impl Config {
    const CONF_VALS: usize = 6;

    pub fn from_reader<R: Read>(r: &mut R) -> Result<Self> {
        let mut raw_conf = [0i32; Self::CONF_VALS];
        for v in raw_conf.iter_mut() {
            *v = crate::read_i32(r)?;
        }
        if let Some(bad) = raw_conf.iter().find(|&&v| v <= 0) {
            return Err(MolgenError::Configuration(format!(
                "checkpoint header holds non-positive value {bad}"
            )));
        }
        let conf = Self {
            dim: raw_conf[0] as usize,
            hidden_dim: raw_conf[1] as usize,
            n_layers: raw_conf[2] as usize,
            n_heads: raw_conf[3] as usize,
            vocab_size: raw_conf[4] as usize,
            seq_len: raw_conf[5] as usize,
        };
        conf.validate()?;
        Ok(conf)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        for v in [
            self.dim,
            self.hidden_dim,
            self.n_layers,
            self.n_heads,
            self.vocab_size,
            self.seq_len,
        ] {
            let v = i32::try_from(v).map_err(|_| {
                MolgenError::Configuration(format!("{v} does not fit a checkpoint header"))
            })?;
            w.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim == 0 || self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(MolgenError::Configuration(format!(
                "dim {} must be a positive multiple of n_heads {}",
                self.dim, self.n_heads
            )));
        }
        if self.hidden_dim == 0 || self.vocab_size == 0 || self.seq_len == 0 {
            return Err(MolgenError::Configuration(
                "hidden_dim, vocab_size and seq_len must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> Config {
        Config {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            vocab_size: 12,
            seq_len: 10,
        }
    }

    #[test]
    fn header_roundtrip() {
        let conf = tiny();
        let mut buf = Vec::new();
        conf.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), 24);
        let read = Config::from_reader(&mut buf.as_slice()).unwrap();
        assert_eq!(read, conf);
        assert_eq!(read.head_size(), 4);
    }

    #[test]
    fn rejects_heads_not_dividing_dim() {
        let conf = Config { n_heads: 3, ..tiny() };
        assert!(matches!(
            conf.validate(),
            Err(MolgenError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_negative_header_value() {
        let mut buf = Vec::new();
        for v in [8i32, 16, 2, 2, -12, 10] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        assert!(Config::from_reader(&mut buf.as_slice()).is_err());
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MolgenError {
    /// Invalid sampling or model parameters, raised before any model call.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("tokenization failed: {0}")]
    Tokenization(String),
    #[error("model invocation failed: {0}")]
    ModelInvocation(String),
    /// The incremental cache disagrees with the generation step. Always a bug.
    #[error("kv cache inconsistency: {0}")]
    CacheConsistency(String),
    #[error("failed to read")]
    Reader(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MolgenError>;

//! Errors raised by the model and alignment code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("embedding dimension {dim_embed} is not divisible by {num_heads} heads")]
    HeadsDoNotDivideEmbedding { dim_embed: i64, num_heads: i64 },

    #[error("{0} must be greater than zero")]
    ZeroDimension(&'static str),

    #[error("dropout probability must be in [0, 1), got {0}")]
    InvalidDropout(f64),

    #[error("positive weight must be in [0, 1], got {0}")]
    PositiveWeightOutOfRange(f64),

    #[error("beta must be a positive finite number, got {0}")]
    InvalidBeta(f64),

    #[error("expected token ids of shape [batch, seq_len], got {0:?}")]
    InvalidTokenShape(Vec<i64>),

    #[error("sequence length {len} exceeds the maximum context length {max}")]
    ContextTooLong { len: i64, max: i64 },

    #[error("token sequences must not be empty")]
    EmptySequence,

    #[error("token id {id} is outside the vocabulary of size {vocab_size}")]
    TokenOutOfRange { id: i64, vocab_size: i64 },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },

    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

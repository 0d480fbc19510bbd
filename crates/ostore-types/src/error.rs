use thiserror::Error;

/// Errors produced by type construction and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid {kind} name {name:?}: {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("invalid size {0:?}")]
    InvalidSize(String),

    #[error("invalid digest {0:?}")]
    InvalidDigest(String),

    #[error("invalid revision id: {0}")]
    InvalidRevisionId(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

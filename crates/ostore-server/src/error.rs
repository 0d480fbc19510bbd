use ostore_protocol::{ErrorCode, ProtocolError};
use ostore_types::TypeError;
use thiserror::Error;

/// Failures of a chunk/metadata backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A stored record could not be decoded.
    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

pub type BackendResult<T> = Result<T, BackendError>;

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors raised while serving a request. Each maps to an [`ErrorCode`]
/// carried back to the client.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("lease {0} expired")]
    LeaseExpired(u64),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid value: {0}")]
    Type(#[from] TypeError),
}

impl ServerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::BadRequest(_) | Self::Protocol(_) | Self::Type(_) => ErrorCode::BadRequest,
            Self::LeaseExpired(_) => ErrorCode::LeaseExpired,
            Self::Backend(_) => ErrorCode::Internal,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

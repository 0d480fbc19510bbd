use ostore_protocol::{ErrorCode, ProtocolError, StoreMessage};
use ostore_transport::TransportError;
use ostore_types::{Digest, TypeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Reported after every byte of the object was delivered.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("failed to read input stream: {0}")]
    StreamRead(#[source] std::io::Error),

    #[error("failed to write output stream: {0}")]
    StreamWrite(#[source] std::io::Error),

    #[error("transfer on {subject} timed out after {attempts} attempts")]
    TransferTimeout { subject: String, attempts: u32 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The read lease lapsed before the object was fully read.
    #[error("lease expired: {0}")]
    LeaseExpired(String),

    /// The service rejected the request.
    #[error("store service error ({}): {message}", code.as_u16())]
    Remote { code: ErrorCode, message: String },

    #[error("unexpected reply {0}")]
    UnexpectedReply(&'static str),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl StoreError {
    /// Map an error reply from the service onto the client taxonomy.
    pub fn from_reply(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::NotFound => Self::NotFound(message),
            ErrorCode::AlreadyExists => Self::AlreadyExists(message),
            ErrorCode::LeaseExpired => Self::LeaseExpired(message),
            ErrorCode::BadRequest | ErrorCode::Internal => Self::Remote { code, message },
        }
    }

    pub(crate) fn unexpected(reply: &StoreMessage) -> Self {
        Self::UnexpectedReply(reply.type_name())
    }
}

impl From<TypeError> for StoreError {
    fn from(e: TypeError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

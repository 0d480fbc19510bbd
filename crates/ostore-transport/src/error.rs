use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// No reply arrived in time.
    #[error("request on {subject} timed out")]
    Timeout { subject: String },

    /// Nothing is listening on the subject.
    #[error("no responders for {0}")]
    NoResponders(String),

    /// The connection has been closed locally.
    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors worth retrying: the request may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NoResponders(_))
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::Timeout { subject: "s".into() }.is_transient());
        assert!(TransportError::NoResponders("s".into()).is_transient());
        assert!(!TransportError::Closed.is_transient());
    }
}

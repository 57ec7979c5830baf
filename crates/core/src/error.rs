//! Error types for the call relay

/// Result type alias using the relay Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in relay operations
///
/// Protocol violations by a client (an answer with no session, a malformed
/// payload) are not surfaced through this type at the routing API; they are
/// logged and reported as a [`crate::relay::DropReason`] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A connection identifier was registered twice
    #[error("Peer already registered: {0}")]
    DuplicatePeer(String),

    /// Registry is at capacity
    #[error("Peer limit reached ({0})")]
    PeerLimitReached(usize),

    /// Message violates the signaling protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Registry and session table disagree (should not occur in normal operation)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error was caused by the remote client's input
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Serialization(_))
    }

    /// Check if this error indicates corrupted relay state
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }

    /// Check if this error should refuse a new connection
    pub fn is_admission_error(&self) -> bool {
        matches!(self, Error::DuplicatePeer(_) | Error::PeerLimitReached(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::PeerLimitReached(2);
        assert_eq!(err.to_string(), "Peer limit reached (2)");
    }

    #[test]
    fn test_protocol_classification() {
        assert!(Error::Protocol("bad".to_string()).is_protocol_error());
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(Error::from(json_err).is_protocol_error());
        assert!(!Error::DuplicatePeer("p".to_string()).is_protocol_error());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::InvariantViolation("two sessions".to_string()).is_fatal());
        assert!(!Error::Protocol("x".to_string()).is_fatal());
    }

    #[test]
    fn test_admission_classification() {
        assert!(Error::DuplicatePeer("a".to_string()).is_admission_error());
        assert!(Error::PeerLimitReached(1).is_admission_error());
        assert!(!Error::InvalidConfig("port".to_string()).is_admission_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}

//! Error types for procbroker.

use thiserror::Error;

/// Main error type for procbroker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Queue '{0}' is disconnected")]
    Disconnected(String),

    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("Queue '{0}' already has a feeder attached")]
    FeederAttached(String),

    #[error("Malformed chunk header '{header}': {reason}")]
    MalformedHeader { header: String, reason: String },

    #[error("Unknown worker role '{0}'")]
    UnknownRole(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Shutdown already started")]
    ShutdownStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BrokerError {
    /// Build a malformed-header error.
    pub fn malformed(header: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedHeader {
            header: header.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error only reflects a cooperative stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type alias for procbroker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_malformed_header_message() {
        let err = BrokerError::malformed("q;1", "missing ticket prefix");
        let msg = err.to_string();
        assert!(msg.contains("q;1"));
        assert!(msg.contains("missing ticket prefix"));
    }

    #[test]
    fn test_feeder_attached_message() {
        let err = BrokerError::FeederAttached("default".to_string());
        assert!(err.to_string().contains("default"));
        assert!(err.to_string().contains("feeder"));
    }

    #[test]
    fn test_unknown_role_message() {
        let err = BrokerError::UnknownRole("nope".to_string());
        assert_eq!(err.to_string(), "Unknown worker role 'nope'");
    }

    #[test]
    fn test_is_cancelled() {
        assert!(BrokerError::Cancelled.is_cancelled());
        assert!(!BrokerError::Worker("x".into()).is_cancelled());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: BrokerError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: BrokerError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }
}

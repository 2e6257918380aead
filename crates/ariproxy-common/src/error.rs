//! Error types for ariproxy
//!
//! Process-level errors. Component crates keep their own error enums and
//! convert into [`GatewayError`] at the boundary, so the binary only has to
//! deal with one type.

use std::io;

use thiserror::Error;

/// ariproxy error types
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Protocol error (MQTT framing, parameter payloads)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether the error should stop the process.
    ///
    /// Only startup failures (bad configuration, unbindable listener) are fatal;
    /// everything that happens on a device connection is recovered locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Config(_) | GatewayError::Io(_))
    }
}

/// Result type for ariproxy operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::Config("missing broker.certificate_path".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing broker.certificate_path");

        let err = GatewayError::Network("connection reset".to_string());
        assert_eq!(err.to_string(), "Network error: connection reset");
    }

    #[test]
    fn test_io_conversion_is_fatal() {
        let err: GatewayError = io::Error::new(io::ErrorKind::AddrInUse, "port 8883 in use").into();
        assert!(err.is_fatal());
        assert!(!GatewayError::Protocol("bad packet".to_string()).is_fatal());
    }
}

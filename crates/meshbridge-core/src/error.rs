//! Unified error handling for meshbridge.
//!
//! Each component keeps its own narrow error type (`EncodingError`,
//! `DecodeError`, `ConfigError`, ...). This module provides a common error
//! that callers spanning several components can use, reducing boilerplate
//! at the integration boundary.

use crate::config::ConfigError;
use crate::datapoint::{DecodeError, EncodingError};

/// Unified error type for meshbridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A value could not be encoded for its declared datapoint type.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A datapoint frame was truncated or malformed.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The host transport failed to deliver a request.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The host capability layer rejected a write.
    #[error("Capability error: {0}")]
    Capability(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Not found errors.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other errors.
    #[error("Other error: {0}")]
    Other(String),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

/// Build an [`Error::Transport`] from a message or a format string.
#[macro_export]
macro_rules! transport_err {
    ($msg:expr) => {
        $crate::error::Error::Transport($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Transport(format!($fmt, $($arg)*))
    };
}

/// Build an [`Error::Capability`] from a message or a format string.
#[macro_export]
macro_rules! capability_err {
    ($msg:expr) => {
        $crate::error::Error::Capability($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Capability(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_error_converts() {
        let err: Error = EncodingError::StringTooLong { len: 70_000 }.into();
        assert!(matches!(err, Error::Encoding(_)));
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_macros() {
        let err = transport_err!("node {} unreachable", 7);
        assert_eq!(err.to_string(), "Transport error: node 7 unreachable");

        let err = capability_err!("rejected");
        assert_eq!(err.to_string(), "Capability error: rejected");
    }
}

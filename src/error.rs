//! Error types for busline.

use thiserror::Error;

use crate::protocol::Value;

/// Main error type for all bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad bus address or conflicting transport options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound frame could not be parsed. The frame is dropped.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Outbound message is structurally invalid and was never sent.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Authentication handshake failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The peer violated the protocol in a way we cannot recover from.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error reply sent by the remote side.
    #[error(transparent)]
    Method(#[from] MethodError),

    /// Transport failed while the call was pending.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Connection was closed locally.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl BusError {
    /// Whether this error ends the connection.
    ///
    /// Malformed frames, validation failures and remote error replies only
    /// affect a single message; everything touching the transport is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BusError::InvalidMessage(_) | BusError::Validation(_) | BusError::Method(_)
        )
    }
}

/// An error reply: a D-Bus error name and an optional body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodError {
    /// Error name, e.g. `org.freedesktop.DBus.Error.UnknownMethod`.
    pub name: String,
    /// Error body. By convention the first value is a human readable message.
    pub body: Vec<Value>,
}

impl MethodError {
    /// Create an error reply carrying a single message string.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: vec![Value::Str(message.into())],
        }
    }

    /// The human readable message, if the body starts with a string.
    pub fn message(&self) -> Option<&str> {
        match self.body.first() {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {}", self.name, msg),
            None => f.write_str(&self.name),
        }
    }
}

impl std::error::Error for MethodError {}

/// Result type alias using BusError.
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!BusError::InvalidMessage("x".into()).is_fatal());
        assert!(!BusError::Validation("x".into()).is_fatal());
        assert!(!BusError::Method(MethodError::new("a.b", "c")).is_fatal());
        assert!(BusError::ConnectionClosed.is_fatal());
        assert!(BusError::Disconnected("eof".into()).is_fatal());
    }

    #[test]
    fn test_method_error_display() {
        let err = MethodError::new("org.example.Error.Failed", "it broke");
        assert_eq!(err.to_string(), "org.example.Error.Failed: it broke");

        let bare = MethodError {
            name: "org.example.Error.Bare".into(),
            body: vec![],
        };
        assert_eq!(bare.to_string(), "org.example.Error.Bare");
        assert!(bare.message().is_none());
    }
}

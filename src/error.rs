//! Error types for the VNC proxy library.

use std::io;
use thiserror::Error;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in VNC proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed RFB data or a handshake violation on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message ended before all of its declared fields arrived.
    #[error("Truncated message: {0}")]
    Truncated(&'static str),

    /// VNC authentication failed on either leg.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Missing or unresolvable session configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A segment sink rejected delivery.
    #[error("Sink error: {0}")]
    Sink(String),

    /// The peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,
}

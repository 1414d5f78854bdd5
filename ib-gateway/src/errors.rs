//! Error types for the ib-gateway boundary.

use thiserror::Error;

/// Errors raised by a `GatewayClient` implementation.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// TCP connection failure or refused handshake.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command was issued while no connection is open.
    #[error("Not connected")]
    NotConnected,

    /// I/O error from the underlying descriptor.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for this library.
pub type Result<T> = std::result::Result<T, GatewayError>;

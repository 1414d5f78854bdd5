//! Error taxonomy of the session layer.

use thiserror::Error;

use ib_gateway::GatewayError;

/// Errors surfaced by the codec, the tracker and the session lifecycle.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Symbol is empty, longer than four characters or not alphabetic.
    #[error("Invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Option strike does not fit the reserved low bits of a ticker id.
    #[error("Invalid strike: {0}")]
    InvalidStrike(f64),

    /// A live subscription already owns this ticker id for another contract.
    #[error("Ticker id {id} already used by {existing}")]
    TickerIdCollision { id: i32, existing: String },

    /// Market data requested before the id handshake completed.
    #[error("Not connected")]
    NotConnected,

    /// Gateway reported connectivity loss (1100) or a socket reset (509).
    #[error("Connectivity lost (code={code}): {message}")]
    ConnectivityLost { code: i32, message: String },

    /// Gateway rejected the client id as already in use (326).
    #[error("Duplicate client id {0}")]
    DuplicateClientId(i32),

    /// The multiplexed wait failed.
    #[error("Reactor I/O error: {0}")]
    ReactorIo(#[from] std::io::Error),

    /// Reconnect attempts exhausted; the session will not restart itself.
    #[error("Maximum reconnect attempts exceeded ({attempts})")]
    MaxRetriesExceeded { attempts: u32 },

    /// `start()` called on a session that was already started.
    #[error("Session already started")]
    AlreadyStarted,

    /// A gateway command failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Convenience Result type for this crate.
pub type Result<T> = std::result::Result<T, SessionError>;

//! Gateway protocol constants consumed by session logic.
//!
//! Only the values the session state machine reacts to live here; the byte
//! level wire format belongs to the vendor SDK.

use serde::{Deserialize, Serialize};

// ============================================================================
// TickType Enum
// ============================================================================

/// Top-of-book tick type identifiers for market data callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum TickType {
    BidSize = 0,
    Bid = 1,
    Ask = 2,
    AskSize = 3,
}

impl TryFrom<i32> for TickType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::BidSize),
            1 => Ok(Self::Bid),
            2 => Ok(Self::Ask),
            3 => Ok(Self::AskSize),
            other => Err(other),
        }
    }
}

impl From<TickType> for i32 {
    fn from(tt: TickType) -> i32 {
        tt as i32
    }
}

// ============================================================================
// Error Codes
// ============================================================================

/// Gateway error codes the session reacts to.
pub mod error_codes {
    /// Client id already in use by another connection.
    pub const DUPLICATE_CLIENT_ID: i32 = 326;
    /// Socket reset by the peer.
    pub const SOCKET_EXCEPTION: i32 = 509;
    /// Connectivity between the gateway and the broker servers has been lost.
    pub const CONNECTIVITY_LOST: i32 = 1100;
    pub const CONNECTIVITY_RESTORED_DATA_LOST: i32 = 1101;
    pub const CONNECTIVITY_RESTORED: i32 = 1102;
}

/// Order status strings reported through `orderStatus`.
pub mod order_status {
    pub const PRE_SUBMITTED: &str = "PreSubmitted";
    pub const SUBMITTED: &str = "Submitted";
    pub const CANCELLED: &str = "Cancelled";
}

//! Session data models.
//!
//! Events carry `serde` derives so subscribers can forward them as JSON.

use std::fmt;

use serde::{Deserialize, Serialize};

use ib_gateway::Contract;

use crate::ticker_id::TickerId;

// ============================================================================
// Events
// ============================================================================

/// Microseconds since the Unix epoch.
pub type Timestamp = i64;

pub fn now_micros() -> Timestamp {
    chrono::Utc::now().timestamp_micros()
}

/// Quote side of a `BidAsk` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

/// Top-of-book update. A price tick fills `price`, a size tick fills `size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidAsk {
    pub timestamp: Timestamp,
    pub id: i64,
    pub side: Side,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
}

/// Event published on the backplane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    Connect { timestamp: Timestamp, id: i64 },
    Disconnect { timestamp: Timestamp, id: i64 },
    BidAsk(BidAsk),
}

impl Event {
    pub fn connect(id: i64) -> Self {
        Self::Connect {
            timestamp: now_micros(),
            id,
        }
    }

    pub fn disconnect(id: i64) -> Self {
        Self::Disconnect {
            timestamp: now_micros(),
            id,
        }
    }

    pub fn bid_ask(id: i64, side: Side, price: Option<f64>, size: Option<i64>) -> Self {
        Self::BidAsk(BidAsk {
            timestamp: now_micros(),
            id,
            side,
            price,
            size,
        })
    }

    /// Numeric id predicates match against.
    pub fn id(&self) -> i64 {
        match self {
            Self::Connect { id, .. } | Self::Disconnect { id, .. } => *id,
            Self::BidAsk(b) => b.id,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Connect { timestamp, .. } | Self::Disconnect { timestamp, .. } => *timestamp,
            Self::BidAsk(b) => b.timestamp,
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Equity,
    Index,
    Option,
}

/// A live market-data request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub ticker_id: TickerId,
    pub symbol: String,
    pub kind: SubscriptionKind,
    pub wants_depth: bool,
    pub contract: Contract,
}

// ============================================================================
// Connection state
// ============================================================================

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// `connect()` issued, waiting for the next-valid-id handshake.
    Connecting,
    /// Reserved; the handshake completes directly from `Connecting`.
    Authenticating,
    PlacingOrder,
    AwaitingOrderAck,
    Cancelling,
    AwaitingCancelAck,
    Pinging,
    AwaitingPingAck,
    Idle,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

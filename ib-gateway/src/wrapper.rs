//! Gateway callback events.
//!
//! `GatewayEvent` replaces the vendor's virtual callback interface: a client
//! decodes inbound traffic inside its I/O hooks and queues one event per
//! callback, which the owner drains with `GatewayClient::drain_events`.

use rust_decimal::Decimal;

use crate::protocol::TickType;

// ============================================================================
// GatewayEvent
// ============================================================================

/// Callbacks delivered by the gateway, in arrival order.
///
/// ## Usage
///
/// ```rust,ignore
/// for event in client.drain_events() {
///     match event {
///         GatewayEvent::NextValidId { order_id } => { /* ... */ }
///         GatewayEvent::TickPrice { req_id, tick_type, price, .. } => { /* ... */ }
///         GatewayEvent::Error { code, message, .. } => { /* ... */ }
///         _ => {}
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    // ========================================================================
    // Connection & Error
    // ========================================================================

    /// Next valid order id. Confirms the connection handshake.
    NextValidId {
        order_id: i64,
    },

    /// Reply to `request_current_time`, seconds since the Unix epoch.
    CurrentTime {
        time: i64,
    },

    /// Server error or warning. `req_id` is -1 for connection-level notices.
    Error {
        req_id: i32,
        code: i32,
        message: String,
    },

    /// The peer closed the connection.
    ConnectionClosed,

    // ========================================================================
    // Market Data
    // ========================================================================

    /// Real-time price tick.
    TickPrice {
        req_id: i32,
        tick_type: TickType,
        price: f64,
        can_auto_execute: bool,
    },

    /// Real-time size tick.
    TickSize {
        req_id: i32,
        tick_type: TickType,
        size: Decimal,
    },

    // ========================================================================
    // Orders
    // ========================================================================

    /// Order status change.
    OrderStatus {
        order_id: i64,
        status: String,
        filled: Decimal,
        remaining: Decimal,
        avg_fill_price: f64,
        perm_id: i64,
        parent_id: i64,
        last_fill_price: f64,
        client_id: i32,
        why_held: String,
    },
}

impl GatewayEvent {
    /// Order status with no fills, as reported right after submission or
    /// cancellation.
    pub fn order_status(order_id: i64, status: &str, client_id: i32) -> Self {
        Self::OrderStatus {
            order_id,
            status: status.to_string(),
            filled: Decimal::ZERO,
            remaining: Decimal::ZERO,
            avg_fill_price: 0.0,
            perm_id: 0,
            parent_id: 0,
            last_fill_price: 0.0,
            client_id,
            why_held: String::new(),
        }
    }

    /// Connection-level error (`req_id == -1`).
    pub fn connection_error(code: i32, message: &str) -> Self {
        Self::Error {
            req_id: -1,
            code,
            message: message.to_string(),
        }
    }
}

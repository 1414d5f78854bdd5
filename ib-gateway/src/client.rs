//! Command interface of the gateway SDK.
//!
//! `SocketPump` is the descriptor/hook contract a reactor needs to drive the
//! connection; `GatewayClient` adds the request commands the session and the
//! market-data tracker issue. Implementations decode inbound traffic inside
//! `on_receive` and hand the resulting callbacks out through `drain_events`.

use std::os::fd::RawFd;

use crate::errors::Result;
use crate::models::contract::Contract;
use crate::models::order::Order;
use crate::wrapper::GatewayEvent;

// ============================================================================
// SocketPump
// ============================================================================

/// Descriptor accessors and I/O hooks of a non-blocking connection.
pub trait SocketPump {
    /// Socket descriptor, `None` while the connection is closed.
    fn fd(&self) -> Option<RawFd>;

    /// True when nothing is waiting to be flushed.
    fn is_out_buffer_empty(&self) -> bool;

    /// The descriptor is readable.
    fn on_receive(&mut self);

    /// The descriptor is writable.
    fn on_send(&mut self);

    /// The descriptor reported an error condition.
    fn on_error(&mut self);

    /// Closes the connection. Closing an already closed connection is a no-op.
    fn disconnect(&mut self);
}

// ============================================================================
// GatewayClient
// ============================================================================

/// Gateway command interface.
///
/// Request ids are ticker ids for market data and order ids for orders.
pub trait GatewayClient: SocketPump + Send {
    /// Opens the connection and starts the API handshake. Completion of the
    /// handshake is signalled by a `NextValidId` event.
    fn connect(&mut self, host: &str, port: u16, client_id: i32) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Heartbeat request, answered by a `CurrentTime` event.
    fn request_current_time(&mut self) -> Result<()>;

    fn request_market_data(
        &mut self,
        req_id: i32,
        contract: &Contract,
        generic_tick_list: &str,
        snapshot: bool,
    ) -> Result<()>;

    fn cancel_market_data(&mut self, req_id: i32) -> Result<()>;

    fn request_market_depth(&mut self, req_id: i32, contract: &Contract, num_rows: i32)
        -> Result<()>;

    fn cancel_market_depth(&mut self, req_id: i32) -> Result<()>;

    fn place_order(&mut self, order_id: i64, contract: &Contract, order: &Order) -> Result<()>;

    fn cancel_order(&mut self, order_id: i64) -> Result<()>;

    /// Takes every callback decoded since the previous call, oldest first.
    fn drain_events(&mut self) -> Vec<GatewayEvent>;
}

//! ib-gateway -- the IB TWS/Gateway SDK boundary.
//!
//! The session layer talks to the gateway only through the types in this
//! crate; the byte-level protocol stays inside whichever `GatewayClient`
//! implementation is plugged in.
//!
//! ## Modules
//!
//! - [`client`] -- `GatewayClient` command trait and the `SocketPump` hooks
//! - [`wrapper`] -- `GatewayEvent` enum (gateway callbacks)
//! - [`models`] -- `Contract`, `Order` and their enums
//! - [`protocol`] -- tick types, error codes, order status strings
//! - [`errors`] -- error types for the library
//! - [`simulator`] -- in-process `SimulatedGateway`

pub mod client;
pub mod errors;
pub mod models;
pub mod protocol;
pub mod simulator;
pub mod wrapper;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use errors::GatewayError;

pub use models::contract::{format_expiry, Contract};
pub use models::enums::*;
pub use models::order::Order;

pub use protocol::{error_codes, order_status, TickType};

pub use client::{GatewayClient, SocketPump};
pub use simulator::{Command, SimulatedGateway, SimulatorConfig, SimulatorHandle};
pub use wrapper::GatewayEvent;

//! ib-backplane -- a persistent TWS/Gateway session with an in-process
//! event backplane.
//!
//! ## Modules
//!
//! - [`session`] -- `ConnectionSession`: reactor thread, state machine, reconnects
//! - [`reactor`] -- single-descriptor poll loop with an injectable `Multiplexer`
//! - [`backplane`] -- `EventBus` and the id/symbol `Selection` predicate
//! - [`market_data`] -- `MarketDataRequestTracker`
//! - [`ticker_id`] -- symbol <-> ticker id codec
//! - [`reconnect`] -- backoff policy
//! - [`sync`] -- `Gate` latch
//! - [`config`], [`models`], [`errors`]

pub mod backplane;
pub mod config;
pub mod errors;
pub mod market_data;
pub mod models;
pub mod reactor;
pub mod reconnect;
pub mod session;
pub mod sync;
pub mod ticker_id;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use backplane::{EventBus, Predicate, Selection, SubscriberId};
pub use config::{HeartbeatConfig, ReconnectConfig, SessionConfig};
pub use errors::{Result, SessionError};
pub use market_data::{MarketDataRequestTracker, SharedGateway};
pub use models::{BidAsk, ConnectionState, Event, Side, Subscription, SubscriptionKind};
pub use reactor::{Interest, Multiplexer, PollMultiplexer, PollOutcome, Readiness, Reactor};
pub use session::ConnectionSession;
pub use ticker_id::{EncodedOption, TickerId};

//! In-process gateway simulator.
//!
//! `SimulatedGateway` implements `GatewayClient` without talking to a real
//! TWS/Gateway. It owns one end of a Unix socket pair so reactors can poll a
//! real descriptor: every queued callback writes a wake-up byte to the other
//! end, and `on_receive` drains the bytes and moves the queued callbacks into
//! the event buffer.
//!
//! Behaviour:
//! - `connect` answers with `NextValidId` (unless the handshake is withheld).
//! - `request_current_time` answers with `CurrentTime` (unless muted).
//! - `place_order` answers `Submitted`, `cancel_order` answers `Cancelled`.
//! - With a tick interval configured, a background feed emits a seeded random
//!   walk of bid/ask price and size ticks for every subscribed id.
//!
//! A cloneable `SimulatorHandle` injects callbacks, refuses connects, drops
//! the connection and exposes the recorded command log.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::client::{GatewayClient, SocketPump};
use crate::errors::{GatewayError, Result};
use crate::models::contract::Contract;
use crate::models::order::Order;
use crate::protocol::{order_status, TickType};
use crate::wrapper::GatewayEvent;

// ============================================================================
// Configuration & command log
// ============================================================================

/// Simulator settings.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Order id announced through `NextValidId` on every connect.
    pub next_valid_id: i64,
    /// Interval of the synthetic bid/ask feed; `None` disables it.
    pub tick_interval: Option<Duration>,
    /// Seed of the feed's random walk.
    pub seed: u64,
    /// Starting mid price of every new subscription.
    pub base_price: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            next_valid_id: 1,
            tick_interval: None,
            seed: 616,
            base_price: 100.0,
        }
    }
}

/// A command received by the simulator, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect { host: String, port: u16, client_id: i32 },
    Disconnect,
    RequestCurrentTime,
    RequestMarketData { req_id: i32, symbol: String },
    CancelMarketData { req_id: i32 },
    RequestMarketDepth { req_id: i32, num_rows: i32 },
    CancelMarketDepth { req_id: i32 },
    PlaceOrder { order_id: i64, symbol: String },
    CancelOrder { order_id: i64 },
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Quote {
    mid: f64,
}

struct SimShared {
    inbox: Mutex<VecDeque<GatewayEvent>>,
    notifier: Mutex<Option<UnixStream>>,
    commands: Mutex<Vec<Command>>,
    quotes: Mutex<BTreeMap<i32, Quote>>,
    refused_connects: AtomicU32,
    ping_replies: AtomicBool,
    handshake: AtomicBool,
}

impl SimShared {
    fn new() -> Self {
        Self {
            inbox: Mutex::new(VecDeque::new()),
            notifier: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            quotes: Mutex::new(BTreeMap::new()),
            refused_connects: AtomicU32::new(0),
            ping_replies: AtomicBool::new(true),
            handshake: AtomicBool::new(true),
        }
    }

    fn push(&self, event: GatewayEvent) {
        self.inbox.lock().push_back(event);
        self.notify();
    }

    fn notify(&self) {
        if let Some(stream) = self.notifier.lock().as_mut() {
            match stream.write(&[1]) {
                Ok(_) => {}
                // Socket buffer full: a wake-up is already pending.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => tracing::debug!("simulator notify failed: {e}"),
            }
        }
    }

    fn record(&self, command: Command) {
        self.commands.lock().push(command);
    }
}

// ============================================================================
// SimulatedGateway
// ============================================================================

struct Feed {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Gateway client backed by an in-process simulator.
pub struct SimulatedGateway {
    config: SimulatorConfig,
    shared: Arc<SimShared>,
    stream: Option<UnixStream>,
    events: Vec<GatewayEvent>,
    feed: Option<Feed>,
    client_id: i32,
}

impl SimulatedGateway {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            shared: Arc::new(SimShared::new()),
            stream: None,
            events: Vec::new(),
            feed: None,
            client_id: 0,
        }
    }

    /// Control handle for injecting callbacks and inspecting commands.
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn require_connected(&self) -> Result<()> {
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(GatewayError::NotConnected)
        }
    }

    fn start_feed(&mut self, interval: Duration) {
        let running = Arc::new(AtomicBool::new(true));
        let shared = Arc::clone(&self.shared);
        let flag = Arc::clone(&running);
        let seed = self.config.seed;

        let spawned = std::thread::Builder::new()
            .name("sim-feed".into())
            .spawn(move || run_feed(shared, flag, interval, seed));

        match spawned {
            Ok(handle) => self.feed = Some(Feed { running, handle }),
            Err(e) => tracing::warn!("failed to start simulator feed: {e}"),
        }
    }

    fn stop_feed(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.running.store(false, Ordering::SeqCst);
            if feed.handle.join().is_err() {
                tracing::warn!("simulator feed thread panicked");
            }
        }
    }

    fn close(&mut self) {
        self.stop_feed();
        self.stream = None;
        *self.shared.notifier.lock() = None;
    }
}

impl Drop for SimulatedGateway {
    fn drop(&mut self) {
        self.stop_feed();
    }
}

impl SocketPump for SimulatedGateway {
    fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn is_out_buffer_empty(&self) -> bool {
        true
    }

    fn on_receive(&mut self) {
        let mut closed = false;
        if let Some(stream) = self.stream.as_mut() {
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("simulator read failed: {e}");
                        closed = true;
                        break;
                    }
                }
            }
        }

        self.events.extend(self.shared.inbox.lock().drain(..));
        if closed {
            tracing::info!("simulated gateway closed the connection");
            self.close();
            self.events.push(GatewayEvent::ConnectionClosed);
        }
    }

    fn on_send(&mut self) {
        // Commands are applied synchronously, nothing is ever buffered.
    }

    fn on_error(&mut self) {
        let error = self.stream.as_ref().and_then(|s| s.take_error().ok().flatten());
        tracing::warn!(?error, "simulated socket error");
        self.close();
        self.events.push(GatewayEvent::ConnectionClosed);
    }

    fn disconnect(&mut self) {
        self.shared.record(Command::Disconnect);
        self.close();
        self.shared.inbox.lock().clear();
        self.shared.quotes.lock().clear();
    }
}

impl GatewayClient for SimulatedGateway {
    fn connect(&mut self, host: &str, port: u16, client_id: i32) -> Result<()> {
        self.shared.record(Command::Connect {
            host: host.to_string(),
            port,
            client_id,
        });

        if self.stream.is_some() {
            return Err(GatewayError::Connection("already connected".into()));
        }

        let refused = self
            .shared
            .refused_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(GatewayError::Connection(format!(
                "connection to {host}:{port} refused"
            )));
        }

        let (local, remote) = UnixStream::pair()?;
        local.set_nonblocking(true)?;
        remote.set_nonblocking(true)?;

        self.shared.inbox.lock().clear();
        *self.shared.notifier.lock() = Some(remote);
        self.stream = Some(local);
        self.events.clear();
        self.client_id = client_id;

        tracing::info!("simulated gateway connected: {host}:{port} @ {client_id}");
        if self.shared.handshake.load(Ordering::SeqCst) {
            self.shared.push(GatewayEvent::NextValidId {
                order_id: self.config.next_valid_id,
            });
        }

        if let Some(interval) = self.config.tick_interval {
            self.start_feed(interval);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn request_current_time(&mut self) -> Result<()> {
        self.require_connected()?;
        self.shared.record(Command::RequestCurrentTime);
        if self.shared.ping_replies.load(Ordering::SeqCst) {
            self.shared.push(GatewayEvent::CurrentTime {
                time: chrono::Utc::now().timestamp(),
            });
        }
        Ok(())
    }

    fn request_market_data(
        &mut self,
        req_id: i32,
        contract: &Contract,
        _generic_tick_list: &str,
        _snapshot: bool,
    ) -> Result<()> {
        self.require_connected()?;
        self.shared.record(Command::RequestMarketData {
            req_id,
            symbol: contract.symbol.clone(),
        });
        let mid = contract.strike.unwrap_or(self.config.base_price).max(1.0);
        self.shared.quotes.lock().insert(req_id, Quote { mid });
        Ok(())
    }

    fn cancel_market_data(&mut self, req_id: i32) -> Result<()> {
        self.shared.record(Command::CancelMarketData { req_id });
        self.shared.quotes.lock().remove(&req_id);
        Ok(())
    }

    fn request_market_depth(
        &mut self,
        req_id: i32,
        _contract: &Contract,
        num_rows: i32,
    ) -> Result<()> {
        self.require_connected()?;
        self.shared
            .record(Command::RequestMarketDepth { req_id, num_rows });
        Ok(())
    }

    fn cancel_market_depth(&mut self, req_id: i32) -> Result<()> {
        self.shared.record(Command::CancelMarketDepth { req_id });
        Ok(())
    }

    fn place_order(&mut self, order_id: i64, contract: &Contract, _order: &Order) -> Result<()> {
        self.require_connected()?;
        self.shared.record(Command::PlaceOrder {
            order_id,
            symbol: contract.symbol.clone(),
        });
        self.shared.push(GatewayEvent::order_status(
            order_id,
            order_status::SUBMITTED,
            self.client_id,
        ));
        Ok(())
    }

    fn cancel_order(&mut self, order_id: i64) -> Result<()> {
        self.shared.record(Command::CancelOrder { order_id });
        if self.stream.is_some() {
            self.shared.push(GatewayEvent::order_status(
                order_id,
                order_status::CANCELLED,
                self.client_id,
            ));
        }
        Ok(())
    }

    fn drain_events(&mut self) -> Vec<GatewayEvent> {
        std::mem::take(&mut self.events)
    }
}

// ============================================================================
// Synthetic feed
// ============================================================================

fn run_feed(shared: Arc<SimShared>, running: Arc<AtomicBool>, interval: Duration, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    tracing::debug!("simulator feed started");

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(interval);

        let ticks: Vec<(i32, f64)> = {
            let mut quotes = shared.quotes.lock();
            quotes
                .iter_mut()
                .map(|(id, quote)| {
                    quote.mid = (quote.mid + rng.gen_range(-0.05..0.05)).max(0.01);
                    (*id, quote.mid)
                })
                .collect()
        };

        for (req_id, mid) in ticks {
            let half_spread = 0.01;
            let bid_size = Decimal::from(rng.gen_range(1..10) * 100);
            let ask_size = Decimal::from(rng.gen_range(1..10) * 100);
            shared.push(GatewayEvent::TickPrice {
                req_id,
                tick_type: TickType::Bid,
                price: mid - half_spread,
                can_auto_execute: true,
            });
            shared.push(GatewayEvent::TickSize {
                req_id,
                tick_type: TickType::BidSize,
                size: bid_size,
            });
            shared.push(GatewayEvent::TickPrice {
                req_id,
                tick_type: TickType::Ask,
                price: mid + half_spread,
                can_auto_execute: true,
            });
            shared.push(GatewayEvent::TickSize {
                req_id,
                tick_type: TickType::AskSize,
                size: ask_size,
            });
        }
    }
    tracing::debug!("simulator feed stopped");
}

// ============================================================================
// SimulatorHandle
// ============================================================================

/// Cloneable control handle for a `SimulatedGateway`.
#[derive(Clone)]
pub struct SimulatorHandle {
    shared: Arc<SimShared>,
}

impl SimulatorHandle {
    /// Queues a callback as if the gateway had sent it.
    pub fn inject(&self, event: GatewayEvent) {
        self.shared.push(event);
    }

    /// Makes the next `n` connect attempts fail.
    pub fn refuse_connects(&self, n: u32) {
        self.shared.refused_connects.store(n, Ordering::SeqCst);
    }

    /// Enables or mutes `CurrentTime` replies to heartbeat requests.
    pub fn set_ping_replies(&self, enabled: bool) {
        self.shared.ping_replies.store(enabled, Ordering::SeqCst);
    }

    /// Enables or withholds the `NextValidId` answer to `connect`.
    pub fn set_handshake(&self, enabled: bool) {
        self.shared.handshake.store(enabled, Ordering::SeqCst);
    }

    /// Closes the gateway side of the connection; the client sees EOF.
    pub fn drop_connection(&self) {
        self.shared.notifier.lock().take();
    }

    /// Every command received so far, in call order.
    pub fn commands(&self) -> Vec<Command> {
        self.shared.commands.lock().clone()
    }

    /// Number of recorded commands matching `pred`.
    pub fn count(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.shared.commands.lock().iter().filter(|c| pred(c)).count()
    }

    /// Ticker ids with an open market-data subscription.
    pub fn live_market_data(&self) -> Vec<i32> {
        self.shared.quotes.lock().keys().copied().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

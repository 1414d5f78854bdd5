//! Persistent gateway session.
//!
//! A `ConnectionSession` owns one reactor thread. The thread connects, pumps
//! the socket through the [`Reactor`], turns gateway callbacks into state
//! transitions and bus events, supervises the heartbeat and reconnects with
//! backoff until it is stopped or runs out of attempts.
//!
//! Gateway callbacks are drained from the client while holding its lock and
//! handled after the lock is released, so callbacks and bus subscribers may
//! issue gateway commands (through the tracker) without deadlocking.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use ib_gateway::{
    error_codes, order_status, Action, Contract, GatewayClient, GatewayEvent, Order, TickType,
};

use crate::backplane::EventBus;
use crate::config::SessionConfig;
use crate::errors::{Result, SessionError};
use crate::market_data::{MarketDataRequestTracker, SharedGateway};
use crate::models::{ConnectionState, Event, Side};
use crate::reactor::{Multiplexer, PollMultiplexer, PollOutcome, Reactor};
use crate::reconnect::ReconnectPolicy;
use crate::sync::Gate;

/// Longest single reactor wait, so a stop request is noticed promptly.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Demo order: far below the market so it never fills.
const DEMO_SYMBOL: &str = "MSFT";
const DEMO_QUANTITY: i64 = 1000;
const DEMO_LIMIT: f64 = 0.01;

type Callback = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Shared state
// ============================================================================

struct Shared {
    config: SessionConfig,
    gateway: SharedGateway,
    bus: Arc<EventBus>,
    tracker: Arc<MarketDataRequestTracker>,
    ready: Arc<Gate>,
    stop: Gate,
    finished: Gate,
    state: Mutex<ConnectionState>,
    client_id: AtomicI32,
    order_id: AtomicI64,
    on_connect: Mutex<Option<Callback>>,
    on_disconnect: Mutex<Option<Callback>>,
    exhausted: Mutex<Option<u32>>,
    reactor_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn stop_requested(&self) -> bool {
        self.stop.is_open()
    }

    fn on_reactor_thread(&self) -> bool {
        *self.reactor_thread.lock() == Some(thread::current().id())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!("state {} -> {}", *state, next);
            *state = next;
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn fire(&self, which: &str, slot: &Mutex<Option<Callback>>) {
        let callback = slot.lock().clone();
        if let Some(callback) = callback {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                tracing::error!("{which} callback panicked");
            }
        }
    }
}

// ============================================================================
// ConnectionSession
// ============================================================================

/// A self-healing connection to a TWS/Gateway endpoint.
pub struct ConnectionSession {
    shared: Arc<Shared>,
    multiplexer: Mutex<Option<Box<dyn Multiplexer>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ConnectionSession {
    pub fn new<G>(config: SessionConfig, gateway: G) -> Self
    where
        G: GatewayClient + 'static,
    {
        let gateway: SharedGateway = Arc::new(Mutex::new(gateway));
        Self::with_gateway(config, gateway)
    }

    /// Builds a session around an already shared gateway client.
    pub fn with_gateway(config: SessionConfig, gateway: SharedGateway) -> Self {
        let ready = Arc::new(Gate::new());
        let tracker = Arc::new(MarketDataRequestTracker::new(
            Arc::clone(&gateway),
            Arc::clone(&ready),
            config.depth_rows,
        ));
        let client_id = config.client_id;

        Self {
            shared: Arc::new(Shared {
                config,
                gateway,
                bus: Arc::new(EventBus::new()),
                tracker,
                ready,
                stop: Gate::new(),
                finished: Gate::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                client_id: AtomicI32::new(client_id),
                order_id: AtomicI64::new(-1),
                on_connect: Mutex::new(None),
                on_disconnect: Mutex::new(None),
                exhausted: Mutex::new(None),
                reactor_thread: Mutex::new(None),
            }),
            multiplexer: Mutex::new(None),
            thread: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Replaces the `poll(2)` multiplexer used by the reactor.
    pub fn with_multiplexer(self, mux: Box<dyn Multiplexer>) -> Self {
        *self.multiplexer.lock() = Some(mux);
        self
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns the reactor thread. A session can be started once.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }

        let mux = self
            .multiplexer
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(PollMultiplexer));
        let shared = Arc::clone(&self.shared);

        let spawned = thread::Builder::new()
            .name("ib-reactor".into())
            .spawn(move || run_reactor(shared, Reactor::new(mux)));
        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                Err(SessionError::ReactorIo(e))
            }
        }
    }

    /// Requests shutdown and waits for the reactor thread to exit.
    ///
    /// Called from the reactor thread (inside a callback or a subscriber) it
    /// only signals; the thread exits after the current iteration.
    pub fn stop(&self) -> Result<()> {
        tracing::info!("stop requested");
        self.shared.stop.open();
        self.shared.ready.shutdown();

        if self.shared.on_reactor_thread() {
            return Ok(());
        }
        self.join()
    }

    /// Waits for the reactor thread to exit without requesting it.
    ///
    /// Returns `MaxRetriesExceeded` when the session gave up reconnecting.
    pub fn join(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) || self.shared.on_reactor_thread() {
            return self.outcome();
        }

        let handle = self.thread.lock().take();
        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    tracing::error!("reactor thread panicked");
                }
            }
            None => {
                self.shared.finished.wait();
            }
        }
        self.outcome()
    }

    fn outcome(&self) -> Result<()> {
        match *self.shared.exhausted.lock() {
            Some(attempts) => Err(SessionError::MaxRetriesExceeded { attempts }),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Readiness & callbacks
    // ========================================================================

    /// Blocks up to `timeout` for the id handshake. False on timeout or once
    /// the session has been stopped.
    pub fn is_ready(&self, timeout: Duration) -> bool {
        self.shared.ready.wait_for(timeout)
    }

    /// Runs on the reactor thread after every completed handshake.
    /// Replaces any earlier registration.
    pub fn register_on_connect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_connect.lock() = Some(Arc::new(callback));
    }

    /// Runs on the reactor thread after every disconnect that followed a
    /// completed handshake. Replaces any earlier registration.
    pub fn register_on_disconnect<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.on_disconnect.lock() = Some(Arc::new(callback));
    }

    /// The market-data tracker, or `None` while the handshake is pending.
    pub fn access_market_data(&self) -> Option<Arc<MarketDataRequestTracker>> {
        if self.shared.ready.is_open() {
            Some(Arc::clone(&self.shared.tracker))
        } else {
            tracing::warn!("market data requested before the session is ready");
            None
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.shared.bus)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Client id used by the current (or next) connect attempt.
    pub fn client_id(&self) -> i32 {
        self.shared.client_id.load(Ordering::SeqCst)
    }

    /// Last order id announced by the gateway, if any handshake completed.
    pub fn next_order_id(&self) -> Option<i64> {
        let id = self.shared.order_id.load(Ordering::SeqCst);
        (id >= 0).then_some(id)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        let handle = self.thread.get_mut().take();
        if let Some(handle) = handle {
            self.shared.stop.open();
            self.shared.ready.shutdown();
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::error!("reactor thread panicked");
            }
        }
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("endpoint", &self.shared.config.endpoint())
            .field("client_id", &self.client_id())
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Reactor thread
// ============================================================================

fn run_reactor(shared: Arc<Shared>, mut reactor: Reactor) {
    *shared.reactor_thread.lock() = Some(thread::current().id());
    tracing::info!(endpoint = %shared.config.endpoint(), "session reactor started");

    let result = Machine::new(Arc::clone(&shared)).run(&mut reactor);
    if let Err(SessionError::MaxRetriesExceeded { attempts }) = result {
        *shared.exhausted.lock() = Some(attempts);
    }

    shared.ready.shutdown();
    shared.set_state(ConnectionState::Disconnected);
    shared.finished.open();
    tracing::info!("session reactor stopped");
}

/// Reactor-thread half of the session: everything that must not be shared.
struct Machine {
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    client_id: i32,
    order_id: Option<i64>,
    link_up: bool,
    handshake_done: bool,
    bump_client_id: bool,
    connect_deadline: Option<Instant>,
    /// Deadline of the outstanding ping, order or cancel acknowledgement.
    reply_deadline: Option<Instant>,
    next_heartbeat: Instant,
    demo_order_id: Option<i64>,
}

impl Machine {
    fn new(shared: Arc<Shared>) -> Self {
        let policy = ReconnectPolicy::new(shared.config.reconnect.clone());
        let client_id = shared.config.client_id;
        Self {
            shared,
            policy,
            client_id,
            order_id: None,
            link_up: false,
            handshake_done: false,
            bump_client_id: false,
            connect_deadline: None,
            reply_deadline: None,
            next_heartbeat: Instant::now(),
            demo_order_id: None,
        }
    }

    fn run(&mut self, reactor: &mut Reactor) -> Result<()> {
        while !self.shared.stop_requested() {
            if self.connect() {
                self.pump(reactor);
                self.handle_disconnected();
            }
            if self.shared.stop_requested() {
                break;
            }

            if std::mem::take(&mut self.bump_client_id) {
                self.client_id += 1;
                tracing::info!(client_id = self.client_id, "retrying with next client id");
                continue;
            }

            match self.policy.next_delay() {
                Some(delay) => {
                    tracing::info!(
                        attempt = self.policy.attempt_count(),
                        max_attempts = self.policy.max_attempts(),
                        "sleeping {delay:?} before reconnect"
                    );
                    if self.shared.stop.wait_for(delay) {
                        break;
                    }
                }
                None => {
                    let err = SessionError::MaxRetriesExceeded {
                        attempts: self.policy.attempt_count(),
                    };
                    tracing::error!("{err}; giving up");
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    fn connect(&mut self) -> bool {
        let config = &self.shared.config;
        self.shared.client_id.store(self.client_id, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);
        tracing::info!(
            endpoint = %config.endpoint(),
            client_id = self.client_id,
            "connecting"
        );

        let result = self
            .shared
            .gateway
            .lock()
            .connect(&config.host, config.port, self.client_id);
        match result {
            Ok(()) => {
                self.link_up = true;
                self.handshake_done = false;
                self.reply_deadline = None;
                self.connect_deadline = Some(Instant::now() + config.connect_timeout);
                true
            }
            Err(e) => {
                tracing::warn!("connect failed: {e}");
                self.shared.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    fn pump(&mut self, reactor: &mut Reactor) {
        while self.link_up && !self.shared.stop_requested() {
            if !self.shared.gateway.lock().is_connected() {
                self.link_up = false;
                break;
            }

            let now = Instant::now();
            self.on_timer(now);
            if !self.link_up {
                break;
            }

            let timeout = self.next_wakeup(now).min(STOP_CHECK_INTERVAL);
            let outcome = reactor.poll_once(&*self.shared.gateway, timeout);
            self.dispatch();
            if outcome == PollOutcome::Stop {
                self.link_up = false;
            }
        }
    }

    fn drop_link(&mut self, reason: impl fmt::Display) {
        tracing::warn!(client_id = self.client_id, "{reason}; disconnecting");
        self.shared.gateway.lock().disconnect();
        self.link_up = false;
    }

    fn handle_disconnected(&mut self) {
        {
            let mut gateway = self.shared.gateway.lock();
            if gateway.is_connected() {
                gateway.disconnect();
            }
        }
        self.link_up = false;
        self.connect_deadline = None;
        self.reply_deadline = None;
        self.demo_order_id = None;
        self.shared.ready.reset();
        self.shared.set_state(ConnectionState::Disconnected);

        if std::mem::take(&mut self.handshake_done) {
            let id = self.order_id.unwrap_or_default();
            tracing::info!(id, "disconnected");
            self.shared.bus.publish(&Event::disconnect(id));
            self.shared.fire("on_disconnect", &self.shared.on_disconnect);
            self.shared.tracker.cancel_all();
        }
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn on_timer(&mut self, now: Instant) {
        if self.connect_deadline.is_some_and(|d| now >= d) {
            self.connect_deadline = None;
            self.drop_link("no handshake before the connect timeout");
            return;
        }

        let state = self.shared.state();
        let reply_overdue = self.reply_deadline.is_some_and(|d| now >= d);
        match state {
            ConnectionState::Idle if now >= self.next_heartbeat => self.ping(now),
            ConnectionState::Pinging => self.ping(now),
            ConnectionState::AwaitingPingAck if reply_overdue => {
                self.drop_link("heartbeat not acknowledged");
            }
            ConnectionState::AwaitingOrderAck | ConnectionState::AwaitingCancelAck
                if reply_overdue =>
            {
                self.drop_link(format_args!("no order status while {state}"));
            }
            ConnectionState::PlacingOrder => self.place_demo_order(now),
            ConnectionState::Cancelling => self.cancel_demo_order(now),
            _ => {}
        }
    }

    fn next_wakeup(&self, now: Instant) -> Duration {
        let due = match self.shared.state() {
            ConnectionState::PlacingOrder
            | ConnectionState::Cancelling
            | ConnectionState::Pinging => return Duration::ZERO,
            ConnectionState::Idle => Some(self.next_heartbeat),
            _ => None,
        };
        [due, self.reply_deadline, self.connect_deadline]
            .into_iter()
            .flatten()
            .min()
            .map_or(STOP_CHECK_INTERVAL, |at| at.saturating_duration_since(now))
    }

    fn ping(&mut self, now: Instant) {
        self.shared.set_state(ConnectionState::Pinging);
        let sent = self.shared.gateway.lock().request_current_time();
        match sent {
            Ok(()) => {
                tracing::debug!("heartbeat sent");
                self.reply_deadline = Some(now + self.shared.config.heartbeat.timeout);
                self.shared.set_state(ConnectionState::AwaitingPingAck);
            }
            Err(e) => self.drop_link(format_args!("heartbeat request failed: {e}")),
        }
    }

    fn place_demo_order(&mut self, now: Instant) {
        let Some(order_id) = self.order_id else {
            self.shared.set_state(ConnectionState::Idle);
            return;
        };
        let contract = Contract::stock(DEMO_SYMBOL);
        let order = Order::limit(Action::Buy, Decimal::from(DEMO_QUANTITY), DEMO_LIMIT);

        let sent = self
            .shared
            .gateway
            .lock()
            .place_order(order_id, &contract, &order);
        match sent {
            Ok(()) => {
                tracing::info!(order_id, symbol = DEMO_SYMBOL, "demo order placed");
                self.demo_order_id = Some(order_id);
                self.set_order_id(order_id + 1);
                self.reply_deadline = Some(now + self.shared.config.heartbeat.timeout);
                self.shared.set_state(ConnectionState::AwaitingOrderAck);
            }
            Err(e) => self.drop_link(format_args!("placing demo order failed: {e}")),
        }
    }

    fn cancel_demo_order(&mut self, now: Instant) {
        let Some(order_id) = self.demo_order_id else {
            self.shared.set_state(ConnectionState::Pinging);
            return;
        };
        let sent = self.shared.gateway.lock().cancel_order(order_id);
        match sent {
            Ok(()) => {
                tracing::info!(order_id, "demo order cancel sent");
                self.reply_deadline = Some(now + self.shared.config.heartbeat.timeout);
                self.shared.set_state(ConnectionState::AwaitingCancelAck);
            }
            Err(e) => self.drop_link(format_args!("cancelling demo order failed: {e}")),
        }
    }

    fn set_order_id(&mut self, id: i64) {
        self.order_id = Some(id);
        self.shared.order_id.store(id, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------------
    // Gateway callbacks
    // ------------------------------------------------------------------------

    fn dispatch(&mut self) {
        let events = self.shared.gateway.lock().drain_events();
        for event in events {
            if !self.link_up {
                tracing::debug!(?event, "dropped after disconnect");
                continue;
            }
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::NextValidId { order_id } => self.on_next_valid_id(order_id),

            GatewayEvent::CurrentTime { time } => {
                if self.shared.state() == ConnectionState::AwaitingPingAck {
                    tracing::debug!(time, "heartbeat acknowledged");
                    self.reply_deadline = None;
                    self.next_heartbeat = Instant::now() + self.shared.config.heartbeat.interval;
                    self.shared.set_state(ConnectionState::Idle);
                }
            }

            GatewayEvent::Error {
                req_id,
                code,
                message,
            } => self.on_error(req_id, code, message),

            GatewayEvent::ConnectionClosed => {
                self.link_up = false;
                tracing::warn!(client_id = self.client_id, "connection closed by peer");
            }

            GatewayEvent::TickPrice {
                req_id,
                tick_type,
                price,
                ..
            } => {
                let side = match tick_type {
                    TickType::Bid => Side::Bid,
                    TickType::Ask => Side::Ask,
                    _ => return,
                };
                self.shared
                    .bus
                    .publish(&Event::bid_ask(i64::from(req_id), side, Some(price), None));
            }

            GatewayEvent::TickSize {
                req_id,
                tick_type,
                size,
            } => {
                let side = match tick_type {
                    TickType::BidSize => Side::Bid,
                    TickType::AskSize => Side::Ask,
                    _ => return,
                };
                let Some(size) = size.to_i64() else {
                    tracing::warn!(req_id, %size, "tick size out of range");
                    return;
                };
                self.shared
                    .bus
                    .publish(&Event::bid_ask(i64::from(req_id), side, None, Some(size)));
            }

            GatewayEvent::OrderStatus {
                order_id, status, ..
            } => self.on_order_status(order_id, &status),
        }
    }

    fn on_next_valid_id(&mut self, order_id: i64) {
        self.set_order_id(order_id);
        if self.handshake_done {
            tracing::debug!(order_id, "next valid id updated");
            return;
        }

        self.handshake_done = true;
        self.connect_deadline = None;
        self.policy.reset();
        self.next_heartbeat = Instant::now() + self.shared.config.heartbeat.interval;
        tracing::info!(order_id, client_id = self.client_id, "connection confirmed");

        self.shared.set_state(if self.shared.config.demo_order {
            ConnectionState::PlacingOrder
        } else {
            ConnectionState::Idle
        });
        self.shared.ready.open();
        self.shared.bus.publish(&Event::connect(order_id));
        self.shared.fire("on_connect", &self.shared.on_connect);
    }

    fn on_error(&mut self, req_id: i32, code: i32, message: String) {
        match code {
            error_codes::CONNECTIVITY_LOST | error_codes::SOCKET_EXCEPTION => {
                self.drop_link(SessionError::ConnectivityLost { code, message });
            }
            error_codes::DUPLICATE_CLIENT_ID => {
                self.bump_client_id = true;
                self.drop_link(SessionError::DuplicateClientId(self.client_id));
            }
            error_codes::CONNECTIVITY_RESTORED_DATA_LOST => {
                tracing::warn!(req_id, code, "connectivity restored, market data lost: {message}");
            }
            error_codes::CONNECTIVITY_RESTORED => {
                tracing::info!(req_id, code, "connectivity restored: {message}");
            }
            // Farm status notices.
            2100..=2199 => tracing::info!(req_id, code, "{message}"),
            _ => tracing::warn!(req_id, code, "gateway error: {message}"),
        }
    }

    fn on_order_status(&mut self, order_id: i64, status: &str) {
        tracing::info!(order_id, status, "order status");
        if self.demo_order_id != Some(order_id) {
            return;
        }

        match (self.shared.state(), status) {
            (
                ConnectionState::AwaitingOrderAck,
                order_status::PRE_SUBMITTED | order_status::SUBMITTED,
            ) => {
                self.reply_deadline = None;
                self.shared.set_state(ConnectionState::Cancelling);
            }
            (ConnectionState::AwaitingCancelAck, order_status::CANCELLED) => {
                self.reply_deadline = None;
                self.demo_order_id = None;
                self.shared.set_state(ConnectionState::Pinging);
            }
            _ => {}
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

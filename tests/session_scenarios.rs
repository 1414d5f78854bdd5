//! End-to-end session scenarios against the simulated gateway.
//!
//! Every test runs a real reactor thread over the simulator's socket pair,
//! so timings are generous and assertions poll with a deadline.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ib_backplane::{
    ConnectionSession, ConnectionState, Event, HeartbeatConfig, ReconnectConfig, Selection,
    SessionConfig, SessionError, Side,
};
use ib_gateway::{Command, GatewayEvent, SimulatedGateway, SimulatorConfig, SimulatorHandle};

const CLIENT_ID: i32 = 7;

fn config(retry_delay: Duration, max_attempts: u32) -> SessionConfig {
    SessionConfig {
        heartbeat: HeartbeatConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
        },
        reconnect: ReconnectConfig::fixed(retry_delay, max_attempts),
        connect_timeout: Duration::from_secs(2),
        ..SessionConfig::new("127.0.0.1", 4001, CLIENT_ID)
    }
}

fn session_with(config: SessionConfig, sim: SimulatorConfig) -> (ConnectionSession, SimulatorHandle) {
    let gateway = SimulatedGateway::new(sim);
    let handle = gateway.handle();
    (ConnectionSession::new(config, gateway), handle)
}

fn session(config: SessionConfig) -> (ConnectionSession, SimulatorHandle) {
    session_with(
        config,
        SimulatorConfig {
            next_valid_id: 42,
            ..SimulatorConfig::default()
        },
    )
}

fn record_events(session: &ConnectionSession) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session
        .event_bus()
        .subscribe_all(move |e| sink.lock().push(e.clone()));
    events
}

fn connects(events: &Mutex<Vec<Event>>) -> Vec<i64> {
    events
        .lock()
        .iter()
        .filter_map(|e| match e {
            Event::Connect { id, .. } => Some(*id),
            _ => None,
        })
        .collect()
}

fn disconnects(events: &Mutex<Vec<Event>>) -> usize {
    events
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::Disconnect { .. }))
        .count()
}

fn count(handle: &SimulatorHandle, pred: impl Fn(&Command) -> bool) -> usize {
    handle.count(pred)
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn next_valid_id_publishes_one_connect() {
    let (session, _handle) = session(config(Duration::from_secs(60), 3));
    let events = record_events(&session);

    session.start().unwrap();
    assert!(session.is_ready(Duration::from_millis(1000)));
    assert!(wait_until(|| !connects(&events).is_empty()));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(connects(&events), vec![42]);
    assert_eq!(session.state(), ConnectionState::Idle);
    assert_eq!(session.next_order_id(), Some(42));
    assert!(session.access_market_data().is_some());

    session.stop().unwrap();
    assert_eq!(disconnects(&events), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[test]
fn second_start_fails_fast() {
    let (session, _handle) = session(config(Duration::from_secs(60), 3));
    session.start().unwrap();
    assert!(matches!(session.start(), Err(SessionError::AlreadyStarted)));
    session.stop().unwrap();
}

#[test]
fn withheld_handshake_times_out_and_retries() {
    let mut cfg = config(Duration::from_millis(20), 0);
    cfg.connect_timeout = Duration::from_millis(100);
    let (session, handle) = session(cfg);
    handle.set_handshake(false);
    let events = record_events(&session);

    session.start().unwrap();
    assert!(!session.is_ready(Duration::from_millis(300)));
    assert!(wait_until(|| count(&handle, |c| matches!(c, Command::Connect { .. })) >= 2));

    // No handshake, no Disconnect event.
    assert_eq!(disconnects(&events), 0);

    handle.set_handshake(true);
    assert!(session.is_ready(Duration::from_secs(2)));
    session.stop().unwrap();
}

// ============================================================================
// Connectivity loss
// ============================================================================

#[test]
fn connectivity_lost_disconnects_once_and_waits() {
    let (session, handle) = session(config(Duration::from_secs(60), 3));
    let events = record_events(&session);
    let lost = Arc::new(Mutex::new(0));
    {
        let lost = Arc::clone(&lost);
        session.register_on_disconnect(move || *lost.lock() += 1);
    }

    session.start().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));
    let before = handle.commands().len();

    handle.inject(GatewayEvent::connection_error(1100, "lost"));
    assert!(wait_until(|| disconnects(&events) == 1));
    thread::sleep(Duration::from_millis(100));

    assert_eq!(handle.commands()[before..], [Command::Disconnect]);
    assert_eq!(disconnects(&events), 1);
    assert_eq!(*lost.lock(), 1);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!session.is_ready(Duration::ZERO));
    assert!(session.access_market_data().is_none());

    // Stop interrupts the backoff sleep.
    let started = Instant::now();
    session.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(count(&handle, |c| matches!(c, Command::Connect { .. })), 1);
}

#[test]
fn socket_reset_reconnects_after_backoff() {
    let (session, handle) = session(config(Duration::from_millis(20), 3));
    let events = record_events(&session);

    session.start().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));

    handle.inject(GatewayEvent::connection_error(509, "reset"));
    assert!(wait_until(|| connects(&events).len() == 2));
    assert_eq!(disconnects(&events), 1);
    assert!(session.is_ready(Duration::from_secs(1)));

    session.stop().unwrap();
}

#[test]
fn peer_close_is_treated_as_connectivity_loss() {
    let (session, handle) = session(config(Duration::from_millis(20), 3));
    let events = record_events(&session);

    session.start().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));

    handle.drop_connection();
    assert!(wait_until(|| connects(&events).len() == 2));
    assert_eq!(disconnects(&events), 1);

    session.stop().unwrap();
}

#[test]
fn duplicate_client_id_reconnects_with_next_id() {
    let (session, handle) = session(config(Duration::from_secs(60), 3));

    session.start().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));

    handle.inject(GatewayEvent::connection_error(326, "client id is already in use"));
    assert!(wait_until(|| count(&handle, |c| matches!(c, Command::Connect { .. })) == 2));

    let sequence: Vec<Command> = handle
        .commands()
        .into_iter()
        .filter(|c| matches!(c, Command::Connect { .. } | Command::Disconnect))
        .collect();
    assert_eq!(
        sequence,
        vec![
            Command::Connect {
                host: "127.0.0.1".into(),
                port: 4001,
                client_id: CLIENT_ID
            },
            Command::Disconnect,
            Command::Connect {
                host: "127.0.0.1".into(),
                port: 4001,
                client_id: CLIENT_ID + 1
            },
        ]
    );
    assert_eq!(session.client_id(), CLIENT_ID + 1);
    assert!(session.is_ready(Duration::from_secs(1)));

    session.stop().unwrap();
}

#[test]
fn other_errors_are_only_logged() {
    let (session, handle) = session(config(Duration::from_secs(60), 3));
    session.start().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));

    handle.inject(GatewayEvent::Error {
        req_id: 2048,
        code: 200,
        message: "No security definition has been found".into(),
    });
    thread::sleep(Duration::from_millis(100));

    assert_eq!(count(&handle, |c| matches!(c, Command::Disconnect)), 0);
    assert_eq!(session.state(), ConnectionState::Idle);
    session.stop().unwrap();
}

#[test]
fn connectivity_restored_keeps_the_link() {
    let (session, handle) = session(config(Duration::from_secs(60), 3));
    session.start().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));

    for code in [1101, 1102] {
        handle.inject(GatewayEvent::Error {
            req_id: -1,
            code,
            message: "Connectivity between IB and TWS has been restored".into(),
        });
    }
    thread::sleep(Duration::from_millis(100));

    assert_eq!(count(&handle, |c| matches!(c, Command::Disconnect)), 0);
    assert_eq!(session.state(), ConnectionState::Idle);
    assert!(session.is_ready(Duration::ZERO));
    session.stop().unwrap();
}

// ============================================================================
// Retry budget & shutdown
// ============================================================================

#[test]
fn exhausted_retries_are_terminal() {
    let (session, handle) = session(config(Duration::from_millis(5), 3));
    handle.refuse_connects(u32::MAX);

    session.start().unwrap();
    let result = session.join();
    assert!(matches!(
        result,
        Err(SessionError::MaxRetriesExceeded { attempts: 3 })
    ));
    assert_eq!(count(&handle, |c| matches!(c, Command::Connect { .. })), 4);
    assert!(!session.is_ready(Duration::ZERO));
    assert!(matches!(
        session.stop(),
        Err(SessionError::MaxRetriesExceeded { .. })
    ));
}

#[test]
fn stop_releases_ready_waiters() {
    let (session, handle) = session(config(Duration::from_secs(60), 3));
    handle.refuse_connects(u32::MAX);
    let session = Arc::new(session);
    session.start().unwrap();

    let waiter = {
        let session = Arc::clone(&session);
        thread::spawn(move || {
            let started = Instant::now();
            (session.is_ready(Duration::from_secs(30)), started.elapsed())
        })
    };
    thread::sleep(Duration::from_millis(50));
    session.stop().unwrap();

    let (ready, waited) = waiter.join().unwrap();
    assert!(!ready);
    assert!(waited < Duration::from_secs(5));
}

// ============================================================================
// Market data
// ============================================================================

#[test]
fn disconnect_sweeps_subscriptions_once() {
    let (session, handle) = session(config(Duration::from_millis(20), 3));
    let events = record_events(&session);

    session.start().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));
    let md = session.access_market_data().unwrap();
    let aapl = md.request_equity("AAPL").unwrap();
    assert!(md.is_live(aapl));

    handle.inject(GatewayEvent::connection_error(1100, "lost"));
    assert!(wait_until(|| connects(&events).len() == 2));
    assert!(md.is_empty());
    assert_eq!(
        count(&handle, |c| matches!(c, Command::CancelMarketData { .. })),
        1
    );

    handle.inject(GatewayEvent::connection_error(1100, "lost again"));
    assert!(wait_until(|| connects(&events).len() == 3));
    assert_eq!(disconnects(&events), 2);
    assert_eq!(
        count(&handle, |c| matches!(c, Command::CancelMarketData { .. })),
        1
    );

    session.stop().unwrap();
}

#[test]
fn ticks_reach_symbol_subscribers() {
    let (session, _handle) = session_with(
        config(Duration::from_secs(60), 3),
        SimulatorConfig {
            tick_interval: Some(Duration::from_millis(5)),
            ..SimulatorConfig::default()
        },
    );
    let session = Arc::new(session);
    {
        let weak = Arc::downgrade(&session);
        session.register_on_connect(move || {
            if let Some(md) = weak.upgrade().and_then(|s| s.access_market_data()) {
                md.request_equity("AAPL").unwrap();
                md.request_equity("GOOG").unwrap();
            }
        });
    }

    let quotes = Arc::new(Mutex::new(Vec::new()));
    {
        let quotes = Arc::clone(&quotes);
        session.event_bus().subscribe(
            Selection::by_symbol("AAPL").unwrap(),
            move |e: &Event| {
                if let Event::BidAsk(q) = e {
                    quotes.lock().push(q.clone());
                }
            },
        );
    }

    session.start().unwrap();
    assert!(wait_until(|| quotes.lock().len() >= 8));
    session.stop().unwrap();

    let aapl: i64 = ib_backplane::ticker_id::encode("AAPL").unwrap().into();
    let quotes = quotes.lock();
    assert!(quotes.iter().all(|q| q.id == aapl));
    assert!(quotes
        .iter()
        .any(|q| q.side == Side::Bid && q.price.is_some()));
    assert!(quotes
        .iter()
        .any(|q| q.side == Side::Ask && q.size.is_some()));
}

// ============================================================================
// Demo order flow
// ============================================================================

#[test]
fn demo_order_is_placed_cancelled_then_pinged() {
    let mut cfg = config(Duration::from_secs(60), 3);
    cfg.demo_order = true;
    let (session, handle) = session(cfg);

    session.start().unwrap();
    assert!(wait_until(|| count(&handle, |c| matches!(
        c,
        Command::RequestCurrentTime
    )) >= 1));

    let flow: Vec<Command> = handle
        .commands()
        .into_iter()
        .filter(|c| {
            matches!(
                c,
                Command::PlaceOrder { .. } | Command::CancelOrder { .. } | Command::RequestCurrentTime
            )
        })
        .collect();
    assert_eq!(
        flow[..3],
        [
            Command::PlaceOrder {
                order_id: 42,
                symbol: "MSFT".into()
            },
            Command::CancelOrder { order_id: 42 },
            Command::RequestCurrentTime,
        ]
    );
    assert_eq!(session.next_order_id(), Some(43));
    assert!(wait_until(|| session.state() == ConnectionState::Idle));

    session.stop().unwrap();
}

// ============================================================================
// Subscriber isolation
// ============================================================================

#[test]
fn panicking_subscriber_does_not_stop_the_session() {
    let (session, _handle) = session(config(Duration::from_secs(60), 3));
    session.event_bus().subscribe_all(|_| panic!("subscriber bug"));
    let events = record_events(&session);

    session.start().unwrap();
    assert!(session.is_ready(Duration::from_secs(1)));
    assert!(wait_until(|| connects(&events) == vec![42]));
    assert_eq!(session.state(), ConnectionState::Idle);

    session.stop().unwrap();
}

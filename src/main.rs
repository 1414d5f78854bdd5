//! ib-backplane CLI
//!
//! Keeps a session to a TWS/Gateway endpoint alive, subscribes to the
//! configured instruments after every handshake and prints every backplane
//! event to stdout as one JSON line.
//!
//! The session runs against the in-process simulated gateway; the vendor
//! wire protocol is not part of this workspace.

use std::process::ExitCode;
use std::sync::{Arc, Weak};
use std::time::Duration;

use clap::Parser;

use ib_backplane::{
    ConnectionSession, HeartbeatConfig, MarketDataRequestTracker, ReconnectConfig, SessionConfig,
    SessionError,
};
use ib_gateway::{SimulatedGateway, SimulatorConfig};

/// Persistent IB TWS/Gateway session with an event backplane.
#[derive(Parser, Debug, Clone)]
#[command(name = "ib-backplane", version = "1.0.0")]
struct Args {
    /// TWS/Gateway host
    #[arg(long, env = "IB_HOST", default_value = "127.0.0.1")]
    host: String,

    /// TWS/Gateway port
    #[arg(long, env = "IB_PORT", default_value_t = 4001)]
    port: u16,

    /// Initial client id (bumped when the gateway reports it in use)
    #[arg(long, env = "IB_CLIENT_ID", default_value_t = 0)]
    client_id: i32,

    /// Seconds to sleep before a reconnect attempt
    #[arg(long, env = "IB_RETRY_SLEEP_SECONDS", default_value_t = 10)]
    retry_sleep_seconds: u64,

    /// Reconnect attempts before giving up (0 = unlimited)
    #[arg(long, env = "IB_MAX_ATTEMPTS", default_value_t = 50)]
    max_attempts: u32,

    /// Growth factor of the reconnect sleep (1.0 = fixed)
    #[arg(long, env = "IB_BACKOFF_MULTIPLIER", default_value_t = 1.0)]
    backoff_multiplier: f64,

    /// Seconds between heartbeats
    #[arg(long, env = "IB_HEARTBEAT_INTERVAL", default_value_t = 10)]
    heartbeat_interval: u64,

    /// Seconds a heartbeat may stay unanswered
    #[arg(long, env = "IB_HEARTBEAT_DEADLINE", default_value_t = 2)]
    heartbeat_deadline: u64,

    /// Seconds to wait for the connection handshake
    #[arg(long, env = "IB_CONNECT_TIMEOUT", default_value_t = 10)]
    connect_timeout: u64,

    /// Comma separated stock symbols
    #[arg(long, env = "IB_SYMBOLS", value_delimiter = ',', default_value = "AAPL,GOOG")]
    symbols: Vec<String>,

    /// Indices as SYMBOL@EXCHANGE, comma separated
    #[arg(long, env = "IB_INDEX", value_delimiter = ',')]
    index: Vec<String>,

    /// Option underlying; no option is requested when absent
    #[arg(long, env = "IB_OPTION_SYMBOL")]
    option_symbol: Option<String>,

    /// Request the put instead of the call
    #[arg(long, env = "IB_OPTION_PUT")]
    option_put: bool,

    #[arg(long, env = "IB_OPTION_STRIKE", default_value_t = 0.0)]
    option_strike: f64,

    #[arg(long, env = "IB_OPTION_YEAR", default_value_t = 2010)]
    option_year: i32,

    #[arg(long, env = "IB_OPTION_MONTH", default_value_t = 7)]
    option_month: u32,

    #[arg(long, env = "IB_OPTION_DAY", default_value_t = 16)]
    option_day: u32,

    /// Also subscribe to the option's order book
    #[arg(long, env = "IB_BOOK_DATA")]
    book_data: bool,

    /// Place and cancel a demo limit order after each handshake
    #[arg(long, env = "IB_DEMO_ORDER")]
    demo_order: bool,

    /// Simulated feed interval in milliseconds (0 disables the feed)
    #[arg(long, env = "IB_TICK_INTERVAL_MS", default_value_t = 500)]
    tick_interval_ms: u64,

    /// Seed of the simulated feed
    #[arg(long, env = "IB_SEED", default_value_t = 616)]
    seed: u64,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let retry_sleep = Duration::from_secs(self.retry_sleep_seconds);
        SessionConfig {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(self.heartbeat_interval),
                timeout: Duration::from_secs(self.heartbeat_deadline),
            },
            reconnect: ReconnectConfig {
                initial_delay: retry_sleep,
                max_delay: retry_sleep.max(ReconnectConfig::default().max_delay),
                multiplier: self.backoff_multiplier,
                jitter_factor: 0.0,
                max_attempts: self.max_attempts,
            },
            connect_timeout: Duration::from_secs(self.connect_timeout),
            demo_order: self.demo_order,
            ..SessionConfig::new(self.host.clone(), self.port, self.client_id)
        }
    }

    fn simulator_config(&self) -> SimulatorConfig {
        SimulatorConfig {
            tick_interval: (self.tick_interval_ms > 0)
                .then(|| Duration::from_millis(self.tick_interval_ms)),
            seed: self.seed,
            ..SimulatorConfig::default()
        }
    }
}

fn print_banner(args: &Args) {
    println!("========================================");
    println!("   ib-backplane 1.0.0");
    println!("   Interactive Brokers session manager");
    println!("========================================");
    println!(
        "Gateway: {}:{} (client id {})",
        args.host, args.port, args.client_id
    );
    println!();
}

/// Requests every configured instrument. Failures are logged and skipped.
fn request_instruments(args: &Args, md: &MarketDataRequestTracker) {
    for symbol in args.symbols.iter().filter(|s| !s.is_empty()) {
        match md.request_equity(symbol) {
            Ok(id) => tracing::info!(%symbol, ticker_id = %id, "requested equity"),
            Err(e) => tracing::warn!(%symbol, "equity request failed: {e}"),
        }
    }

    for spec in &args.index {
        let Some((symbol, exchange)) = spec.split_once('@') else {
            tracing::warn!(%spec, "index must be SYMBOL@EXCHANGE");
            continue;
        };
        match md.request_index(symbol, exchange) {
            Ok(id) => tracing::info!(%symbol, %exchange, ticker_id = %id, "requested index"),
            Err(e) => tracing::warn!(%symbol, "index request failed: {e}"),
        }
    }

    if let Some(symbol) = &args.option_symbol {
        let expiry = ib_gateway::format_expiry(args.option_year, args.option_month, args.option_day);
        match md.request_option(
            symbol,
            !args.option_put,
            args.option_strike,
            args.option_year,
            args.option_month,
            args.option_day,
            args.book_data,
        ) {
            Ok(id) => tracing::info!(
                %symbol,
                strike = args.option_strike,
                %expiry,
                ticker_id = %id,
                "requested option"
            ),
            Err(e) => tracing::warn!(%symbol, "option request failed: {e}"),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    print_banner(&args);

    let gateway = SimulatedGateway::new(args.simulator_config());
    let session = Arc::new(ConnectionSession::new(args.session_config(), gateway));

    session.event_bus().subscribe_all(|event| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!("failed to serialize event: {e}"),
    });

    {
        let weak: Weak<ConnectionSession> = Arc::downgrade(&session);
        let args = args.clone();
        session.register_on_connect(move || {
            tracing::info!("==================== CONNECTION CONFIRMED ====================");
            if let Some(md) = weak.upgrade().and_then(|s| s.access_market_data()) {
                request_instruments(&args, &md);
            }
        });
    }
    session.register_on_disconnect(|| {
        tracing::warn!("======================== DISCONNECTED ========================");
    });

    {
        let session = Arc::clone(&session);
        if let Err(e) = ctrlc::set_handler(move || {
            println!("\nReceived Ctrl+C, shutting down...");
            if let Err(e) = session.stop() {
                tracing::warn!("stop: {e}");
            }
        }) {
            tracing::warn!("failed to install Ctrl+C handler: {e}");
        }
    }

    if let Err(e) = session.start() {
        eprintln!("Failed to start session: {e}");
        return ExitCode::FAILURE;
    }

    match session.join() {
        Ok(()) => {
            println!("Shutdown complete.");
            ExitCode::SUCCESS
        }
        Err(e @ SessionError::MaxRetriesExceeded { .. }) => {
            tracing::error!("{e}");
            eprintln!("Giving up: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Session failed: {e}");
            ExitCode::FAILURE
        }
    }
}

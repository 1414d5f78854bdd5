//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::reconnect::ReconnectConfig;

/// Heartbeat supervision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Time between the last acknowledgement and the next ping.
    pub interval: Duration,
    /// How long a ping may stay unanswered before the connection is dropped.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
        }
    }
}

/// Everything a `ConnectionSession` needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Initial client id; bumped by one whenever the gateway reports it in use.
    pub client_id: i32,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    /// Longest wait for the next-valid-id handshake after `connect`.
    pub connect_timeout: Duration,
    /// Place and cancel a far-from-market limit order after each handshake.
    pub demo_order: bool,
    /// Rows requested for market-depth subscriptions.
    pub depth_rows: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 4001,
            client_id: 0,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            connect_timeout: Duration::from_secs(10),
            demo_order: false,
            depth_rows: 10,
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: i32) -> Self {
        Self {
            host: host.into(),
            port,
            client_id,
            ..Self::default()
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_gateway_conventions() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 4001);
        assert_eq!(config.heartbeat.interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat.timeout, Duration::from_secs(2));
        assert_eq!(config.reconnect.initial_delay, Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 50);
    }

    #[test]
    fn new_overrides_endpoint_only() {
        let config = SessionConfig::new("gw.local", 7497, 3);
        assert_eq!(config.endpoint(), "gw.local:7497");
        assert_eq!(config.client_id, 3);
        assert_eq!(config.depth_rows, 10);
    }
}

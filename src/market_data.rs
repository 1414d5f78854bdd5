//! Market-data request tracker.
//!
//! Allocates ticker ids through the codec, issues the subscribe commands on
//! the shared gateway and remembers what is live so the session can sweep
//! everything on disconnect.
//!
//! Lock order is live set, then gateway. The tracker never calls into the
//! session, so it cannot deadlock against the reactor thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use ib_gateway::{format_expiry, Contract, GatewayClient, Right};

use crate::errors::{Result, SessionError};
use crate::models::{Subscription, SubscriptionKind};
use crate::sync::Gate;
use crate::ticker_id::{self, TickerId};

/// Gateway client shared by the reactor thread and the tracker.
pub type SharedGateway = Arc<Mutex<dyn GatewayClient>>;

pub struct MarketDataRequestTracker {
    gateway: SharedGateway,
    ready: Arc<Gate>,
    live: Mutex<BTreeMap<TickerId, Subscription>>,
    depth_rows: i32,
}

impl MarketDataRequestTracker {
    pub fn new(gateway: SharedGateway, ready: Arc<Gate>, depth_rows: i32) -> Self {
        Self {
            gateway,
            ready,
            live: Mutex::new(BTreeMap::new()),
            depth_rows,
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Subscribes to a SMART-routed stock.
    pub fn request_equity(&self, symbol: &str) -> Result<TickerId> {
        self.ensure_ready()?;
        let id = ticker_id::encode(symbol)?;
        let contract = Contract::stock(&symbol.to_ascii_uppercase());
        self.subscribe(id, SubscriptionKind::Equity, contract, false)
    }

    /// Subscribes to an index listed on `exchange`.
    pub fn request_index(&self, symbol: &str, exchange: &str) -> Result<TickerId> {
        self.ensure_ready()?;
        let id = ticker_id::encode(symbol)?;
        let contract = Contract::index(&symbol.to_ascii_uppercase(), exchange);
        self.subscribe(id, SubscriptionKind::Index, contract, false)
    }

    /// Subscribes to one option leg, plus its book when `want_depth` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn request_option(
        &self,
        symbol: &str,
        is_call: bool,
        strike: f64,
        year: i32,
        month: u32,
        day: u32,
        want_depth: bool,
    ) -> Result<TickerId> {
        self.ensure_ready()?;
        let id = ticker_id::encode_option(symbol, is_call, strike)?;
        let contract = Contract::option(
            &symbol.to_ascii_uppercase(),
            Right::from_is_call(is_call),
            strike,
            &format_expiry(year, month, day),
        );
        self.subscribe(id, SubscriptionKind::Option, contract, want_depth)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready.is_open() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    fn subscribe(
        &self,
        id: TickerId,
        kind: SubscriptionKind,
        contract: Contract,
        wants_depth: bool,
    ) -> Result<TickerId> {
        let mut live = self.live.lock();
        // The reactor closes the gate before it sweeps under this lock.
        self.ensure_ready()?;

        if let Some(existing) = live.get(&id) {
            if existing.contract == contract {
                tracing::debug!(ticker_id = %id, symbol = %existing.symbol, "already subscribed");
                return Ok(id);
            }
            let existing = describe(&existing.contract);
            tracing::warn!(
                ticker_id = %id,
                %existing,
                requested = %describe(&contract),
                "ticker id collision, request rejected"
            );
            return Err(SessionError::TickerIdCollision {
                id: id.value(),
                existing,
            });
        }

        {
            let mut gateway = self.gateway.lock();
            gateway.request_market_data(id.value(), &contract, "", false)?;
            if wants_depth {
                if let Err(e) = gateway.request_market_depth(id.value(), &contract, self.depth_rows)
                {
                    // Keep the live set consistent with the gateway.
                    if let Err(undo) = gateway.cancel_market_data(id.value()) {
                        tracing::warn!(ticker_id = %id, "cancel after failed depth request: {undo}");
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::info!(
            ticker_id = %id,
            symbol = %contract.symbol,
            ?kind,
            depth = wants_depth,
            "market data requested"
        );
        live.insert(
            id,
            Subscription {
                ticker_id: id,
                symbol: contract.symbol.clone(),
                kind,
                wants_depth,
                contract,
            },
        );
        Ok(id)
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Cancels one subscription. Unknown ids are ignored.
    pub fn cancel(&self, id: TickerId) -> Result<()> {
        let mut live = self.live.lock();
        let Some(sub) = live.remove(&id) else {
            tracing::debug!(ticker_id = %id, "cancel ignored, not live");
            return Ok(());
        };
        cancel_on_gateway(&mut *self.gateway.lock(), &sub)?;
        tracing::info!(ticker_id = %id, symbol = %sub.symbol, "market data cancelled");
        Ok(())
    }

    /// Cancels every live subscription. Failures are logged and the sweep
    /// continues; the live set is empty afterwards either way.
    pub fn cancel_all(&self) {
        let drained = std::mem::take(&mut *self.live.lock());
        if drained.is_empty() {
            return;
        }
        let mut gateway = self.gateway.lock();
        for sub in drained.values() {
            if let Err(e) = cancel_on_gateway(&mut *gateway, sub) {
                tracing::warn!(ticker_id = %sub.ticker_id, "cancel failed: {e}");
            }
        }
        tracing::info!(count = drained.len(), "live market data swept");
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn live(&self) -> Vec<Subscription> {
        self.live.lock().values().cloned().collect()
    }

    pub fn is_live(&self, id: TickerId) -> bool {
        self.live.lock().contains_key(&id)
    }

    pub fn get(&self, id: TickerId) -> Option<Subscription> {
        self.live.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

fn cancel_on_gateway(gateway: &mut dyn GatewayClient, sub: &Subscription) -> Result<()> {
    let id = sub.ticker_id.value();
    gateway.cancel_market_data(id)?;
    if sub.wants_depth {
        gateway.cancel_market_depth(id)?;
    }
    Ok(())
}

fn describe(contract: &Contract) -> String {
    match (contract.right, contract.strike) {
        (Some(right), Some(strike)) => format!(
            "{} {} {} {}",
            contract.symbol, contract.last_trade_date_or_contract_month, right, strike
        ),
        _ => contract.symbol.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Contract description passed to market-data and order commands.

use serde::{Deserialize, Serialize};

use super::enums::*;

// ============================================================================
// Contract
// ============================================================================

/// Defines a financial instrument (stock, index or option).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sec_type: Option<SecType>,
    /// `YYYYMMDD` expiry for options, empty otherwise.
    pub last_trade_date_or_contract_month: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strike: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<Right>,
    pub multiplier: String,
    pub exchange: String,
    pub primary_exchange: String,
    pub currency: String,
}

impl Contract {
    /// SMART-routed USD stock.
    pub fn stock(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: Some(SecType::Stock),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            ..Self::default()
        }
    }

    /// USD index listed on `exchange`.
    pub fn index(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: Some(SecType::Index),
            exchange: exchange.to_string(),
            currency: "USD".to_string(),
            ..Self::default()
        }
    }

    /// SMART-routed USD equity option expiring on `expiry` (`YYYYMMDD`).
    pub fn option(symbol: &str, right: Right, strike: f64, expiry: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            sec_type: Some(SecType::Option),
            last_trade_date_or_contract_month: expiry.to_string(),
            strike: Some(strike),
            right: Some(right),
            multiplier: "100".to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            ..Self::default()
        }
    }
}

/// Formats an option expiry as `YYYYMMDD`.
pub fn format_expiry(year: i32, month: u32, day: u32) -> String {
    format!("{year:04}{month:02}{day:02}")
}

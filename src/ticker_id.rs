//! Ticker-id codec.
//!
//! A ticker id packs a symbol of at most four letters into one `i32`:
//!
//! 1. Letters are base-27 digits, `'A'` = 1 .. `'Z'` = 26, blank = 0.
//! 2. `"AAPL"` is `A*27^3 + A*27^2 + P*27^1 + L*27^0`.
//! 3. The sum is shifted left by [`OFFSET`] bits, leaving the low bits free
//!    for option legs.
//!
//! An option id adds `MID + strike` (call) or `MID - strike` (put) to the
//! equity id of its underlying. The expiry is not encoded, and fractional
//! strikes are truncated, so two contracts can share an id; callers that care
//! must check (the market-data tracker does).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SessionError};

pub const BASE: i32 = 27;
pub const MAX_CHARS: usize = 4;
pub const SCALE: [i32; MAX_CHARS] = [1, BASE, BASE * BASE, BASE * BASE * BASE];

/// Low bits reserved for the option leg.
pub const OFFSET: u32 = 11;
/// Zero point of the signed strike offset.
pub const MID: i32 = 1 << (OFFSET - 1);
const LOW_MASK: i32 = (1 << OFFSET) - 1;
/// `"ZZZZ"` shifted, plus the widest option leg.
pub const MAX_CODE_VALUE: i32 = (26 * (SCALE[0] + SCALE[1] + SCALE[2] + SCALE[3])) << OFFSET | LOW_MASK;

// ============================================================================
// TickerId
// ============================================================================

/// Integer handle correlating a market-data request with its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TickerId(i32);

impl TickerId {
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn value(self) -> i32 {
        self.0
    }

    /// Equity id of the underlying (low bits cleared).
    pub const fn underlying(self) -> Self {
        Self(self.0 & !LOW_MASK)
    }

    pub fn symbol(self) -> String {
        decode(self)
    }

    pub fn is_option(self) -> bool {
        is_option(self)
    }
}

impl fmt::Display for TickerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<TickerId> for i64 {
    fn from(id: TickerId) -> i64 {
        i64::from(id.0)
    }
}

impl From<TickerId> for i32 {
    fn from(id: TickerId) -> i32 {
        id.0
    }
}

/// Option leg recovered from a ticker id. The expiry is not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedOption {
    pub symbol: String,
    pub is_call: bool,
    pub strike: i32,
}

impl fmt::Display for EncodedOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let right = if self.is_call { "CALL" } else { "PUT" };
        write!(f, "Option({},{},{})", self.symbol, right, self.strike)
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Encodes a 1-4 letter symbol. Lowercase letters are accepted and upper-cased.
pub fn encode(symbol: &str) -> Result<TickerId> {
    let len = symbol.len();
    if len == 0 || len > MAX_CHARS || !symbol.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(SessionError::InvalidSymbol(symbol.to_string()));
    }

    let value = symbol
        .bytes()
        .enumerate()
        .map(|(i, b)| i32::from(b.to_ascii_uppercase() - b'A' + 1) * SCALE[len - (i + 1)])
        .sum::<i32>();
    Ok(TickerId(value << OFFSET))
}

/// Recovers the symbol of an equity or option id.
pub fn decode(id: TickerId) -> String {
    let mut m = id.0 >> OFFSET;
    let mut out = String::with_capacity(MAX_CHARS);
    for scale in SCALE.iter().rev() {
        let c = m / scale;
        m %= scale;
        if c > 0 {
            out.push(char::from(b'A' + (c - 1) as u8));
        }
    }
    out
}

/// Encodes an option leg on top of the underlying's equity id.
///
/// The strike is truncated toward zero and must satisfy `0 <= strike < MID`;
/// anything else would borrow from or carry into the symbol bits.
pub fn encode_option(symbol: &str, is_call: bool, strike: f64) -> Result<TickerId> {
    if !strike.is_finite() || strike < 0.0 || strike >= f64::from(MID) {
        return Err(SessionError::InvalidStrike(strike));
    }
    let whole = strike.trunc();
    if whole != strike {
        tracing::warn!(symbol, strike, "fractional strike truncated in ticker id");
    }

    let base = encode(symbol)?;
    let offset = whole as i32;
    let leg = if is_call { MID + offset } else { MID - offset };
    Ok(TickerId(base.0 + leg))
}

/// Recovers `{symbol, is_call, strike}` from an option id. A zero strike
/// offset decodes as a put.
pub fn decode_option(id: TickerId) -> EncodedOption {
    let opt = (id.0 & LOW_MASK) - MID;
    EncodedOption {
        symbol: decode(id.underlying()),
        is_call: opt > 0,
        strike: opt.abs(),
    }
}

/// True iff the id carries an option leg.
pub fn is_option(id: TickerId) -> bool {
    id.0 & LOW_MASK != 0
}

// ============================================================================
// Tests
// ============================================================================

//! Core data model shared across the engine actors.
//!
//! Everything here is created and mutated only on the single-writer core
//! task. Cross-component references are by id, never by shared handles.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Millisecond timestamps carried by every event. Live tasks stamp with wall
/// clock; backtest replays stamp from the recorded log (virtual clock).
pub type TimeMs = i64;

pub type MarketId = String;
pub type TokenId = String;

// ─────────────────────────────────────────────────────────
// Sides and outcomes
// ─────────────────────────────────────────────────────────

/// Order direction on the CLOB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// The two complementary outcome legs of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tokens and markets
// ─────────────────────────────────────────────────────────

/// Outcome token: opaque venue id plus its price/size quanta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    /// Price quantum. Venue default is 0.001.
    pub tick_size: f64,
    /// Size quantum.
    pub lot_size: f64,
}

impl Token {
    pub fn new(id: impl Into<TokenId>) -> Self {
        Self {
            id: id.into(),
            tick_size: 0.001,
            lot_size: 0.01,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Order intents and fingerprints
// ─────────────────────────────────────────────────────────

/// Why an intent exists. Unwind intents may only come from the flatten
/// workflow; the strategy emits ArbEntry exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentPurpose {
    ArbEntry,
    Unwind,
}

impl IntentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentPurpose::ArbEntry => "ARB_ENTRY",
            IntentPurpose::Unwind => "UNWIND",
        }
    }
}

/// Semantic hash of a quantised intent. Two intents with the same fingerprint
/// mean the same order; only one may be live at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A desired order as produced by the strategy or the flatten workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub market_id: MarketId,
    pub token_id: TokenId,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub purpose: IntentPurpose,
    /// Shared across the two legs of a paired arb entry.
    pub correlation_id: String,
}

impl OrderIntent {
    /// Snap price/size onto the token's tick/lot grid. Must happen before
    /// fingerprinting so that equal intents hash equal.
    pub fn quantised(mut self, tick_size: f64, lot_size: f64) -> Self {
        self.price = quantise(self.price, tick_size);
        self.size = quantise_down(self.size, lot_size);
        self
    }

    /// Fingerprint over (market, token, side, price ticks, size lots,
    /// purpose). Price/size enter as integer quanta so float noise cannot
    /// split identical intents.
    pub fn fingerprint(&self, tick_size: f64, lot_size: f64) -> Fingerprint {
        let ticks = to_quanta(self.price, tick_size);
        let lots = to_quanta(self.size, lot_size);
        let mut h = Sha256::new();
        h.update(self.market_id.as_bytes());
        h.update(b"|");
        h.update(self.token_id.as_bytes());
        h.update(b"|");
        h.update(self.side.as_str().as_bytes());
        h.update(b"|");
        h.update(ticks.to_le_bytes());
        h.update(b"|");
        h.update(lots.to_le_bytes());
        h.update(b"|");
        h.update(self.purpose.as_str().as_bytes());
        Fingerprint(hex::encode(&h.finalize()[..16]))
    }
}

fn decimal_pair(value: f64, quantum: f64) -> Option<(Decimal, Decimal)> {
    if quantum <= 0.0 {
        return None;
    }
    let v = Decimal::from_f64(value)?;
    let q = Decimal::from_f64(quantum)?;
    if q.is_zero() {
        return None;
    }
    Some((v, q))
}

/// Round to the nearest quantum. Exact decimal arithmetic: 0.048 snapped to
/// a 0.001 grid is 0.048, not 0.04799999….
pub fn quantise(value: f64, quantum: f64) -> f64 {
    match decimal_pair(value, quantum) {
        Some((v, q)) => ((v / q).round() * q).to_f64().unwrap_or(value),
        None => value,
    }
}

/// Round down to the quantum (sizes never round up past what was asked).
pub fn quantise_down(value: f64, quantum: f64) -> f64 {
    match decimal_pair(value, quantum) {
        Some((v, q)) => ((v / q).floor() * q).to_f64().unwrap_or(value),
        None => value,
    }
}

fn to_quanta(value: f64, quantum: f64) -> i64 {
    match decimal_pair(value, quantum) {
        Some((v, q)) => (v / q).round().to_i64().unwrap_or(0),
        None => 0,
    }
}

// ─────────────────────────────────────────────────────────
// Orders
// ─────────────────────────────────────────────────────────

/// Order lifecycle states. Transitions are monotone; Cancelled, Filled and
/// Rejected are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingSubmit,
    Live,
    PartiallyFilled,
    Cancelling,
    Cancelled,
    Filled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Filled | OrderStatus::Rejected
        )
    }

    /// Orders that still rest (or may rest) on the venue book.
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            OrderStatus::Live | OrderStatus::PartiallyFilled | OrderStatus::Cancelling
        )
    }

    /// Legal successor states. Everything not listed is an invariant breach.
    pub fn can_transition(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, to) {
            (PendingSubmit, Live)
            | (PendingSubmit, Rejected)
            | (PendingSubmit, Cancelling)
            | (Live, PartiallyFilled)
            | (Live, Cancelling)
            | (Live, Filled)
            | (Live, Cancelled)
            | (PartiallyFilled, PartiallyFilled)
            | (PartiallyFilled, Cancelling)
            | (PartiallyFilled, Filled)
            | (PartiallyFilled, Cancelled)
            | (Cancelling, Cancelled)
            | (Cancelling, PartiallyFilled)
            | (Cancelling, Filled) => true,
            _ => false,
        }
    }
}

/// A tracked order owned exclusively by the OrderManager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub venue_order_id: Option<String>,
    pub fingerprint: Fingerprint,
    pub market_id: MarketId,
    pub token_id: TokenId,
    pub side: Side,
    pub purpose: IntentPurpose,
    pub correlation_id: String,
    pub price: f64,
    pub size: f64,
    pub remaining_size: f64,
    pub status: OrderStatus,
    pub created_at: TimeMs,
    pub last_update_at: TimeMs,
    pub ttl_ms: TimeMs,
}

impl Order {
    /// TTL check, inclusive at the deadline.
    pub fn is_expired(&self, now: TimeMs) -> bool {
        now - self.created_at >= self.ttl_ms
    }
}

// ─────────────────────────────────────────────────────────
// Fills and positions
// ─────────────────────────────────────────────────────────

/// Authoritative fill, as reported on the private user stream only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub ts: TimeMs,
    pub market_id: MarketId,
    pub token_id: TokenId,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub client_order_id: String,
}

/// Long-only position in one outcome token. `qty >= 0` always; this venue
/// model has no shorts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    pub qty: f64,
    pub avg_price: f64,
}

impl Position {
    /// Blend a buy into the volume-weighted average price.
    pub fn apply_buy(&mut self, size: f64, price: f64) {
        let new_qty = self.qty + size;
        if new_qty > 0.0 {
            self.avg_price = (self.qty * self.avg_price + size * price) / new_qty;
        }
        self.qty = new_qty;
    }

    /// Reduce the position; returns realised PnL of the closed lot (fees
    /// excluded, the caller books those into cash). Sells are clamped at the
    /// held quantity.
    pub fn apply_sell(&mut self, size: f64, price: f64) -> f64 {
        let closed = size.min(self.qty);
        self.qty -= closed;
        if self.qty < f64::EPSILON {
            self.qty = 0.0;
        }
        let pnl = closed * (price - self.avg_price);
        if self.qty == 0.0 {
            self.avg_price = 0.0;
        }
        pnl
    }

    pub fn is_flat(&self) -> bool {
        self.qty < f64::EPSILON
    }
}

// ─────────────────────────────────────────────────────────
// Safety mode
// ─────────────────────────────────────────────────────────

/// Global operational state. Safe is terminal for the process; Flattening
/// forbids all new arb intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyMode {
    Running,
    Paused,
    Flattening,
    Safe,
}

impl SafetyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyMode::Running => "RUNNING",
            SafetyMode::Paused => "PAUSED",
            SafetyMode::Flattening => "FLATTENING",
            SafetyMode::Safe => "SAFE",
        }
    }

    /// The full legal transition set. Anything else is an invariant breach.
    pub fn can_transition(&self, to: SafetyMode) -> bool {
        use SafetyMode::*;
        matches!(
            (self, to),
            (Running, Paused)
                | (Paused, Running)
                | (Running, Flattening)
                | (Paused, Flattening)
                | (Flattening, Safe)
        )
    }
}

// ─────────────────────────────────────────────────────────
// Error classification
// ─────────────────────────────────────────────────────────

/// Fault classes for structured logs and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    TransientNetwork,
    VenueReject,
    SequenceGap,
    Validation,
    InvariantViolation,
    SignerUnavailable,
    PersistenceBackpressure,
    SafetyTripped,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::VenueReject => "venue_reject",
            ErrorKind::SequenceGap => "sequence_gap",
            ErrorKind::Validation => "validation",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::SignerUnavailable => "signer_unavailable",
            ErrorKind::PersistenceBackpressure => "persistence_backpressure",
            ErrorKind::SafetyTripped => "safety_tripped",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

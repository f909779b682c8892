//! Edge-decay guard — per-market predicted-vs-realised quality monitor.
//!
//! Every closed round trip (paired entry fully terminal) appends one
//! `(predicted_edge, realised_edge)` sample to the market's bounded ring.
//! Once enough samples exist, a realised/predicted ratio below the floor
//! disables that market — never any other — until `markets on` re-enables
//! it.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use crate::config::Thresholds;

use super::types::{MarketId, TimeMs, TokenId};

// ─────────────────────────────────────────────────────────
// Round trips
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LegFills {
    notional: f64,
    size: f64,
    fees: f64,
}

#[derive(Debug)]
struct RoundTrip {
    market_id: MarketId,
    predicted_edge: f64,
    legs: HashMap<TokenId, LegFills>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecaySample {
    pub predicted: f64,
    pub realised: f64,
}

// ─────────────────────────────────────────────────────────
// Guard
// ─────────────────────────────────────────────────────────

pub struct EdgeDecayGuard {
    window: usize,
    rings: HashMap<MarketId, VecDeque<DecaySample>>,
    disabled: HashSet<MarketId>,
    open: HashMap<String, RoundTrip>,
}

impl EdgeDecayGuard {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            rings: HashMap::new(),
            disabled: HashSet::new(),
            open: HashMap::new(),
        }
    }

    /// A paired entry went out; start tracking its round trip.
    pub fn register_entry(
        &mut self,
        correlation_id: &str,
        market_id: &str,
        predicted_edge: f64,
    ) {
        self.open.insert(
            correlation_id.to_string(),
            RoundTrip {
                market_id: market_id.to_string(),
                predicted_edge,
                legs: HashMap::new(),
            },
        );
    }

    /// Entry whose legs were never dispatched; forget it without a sample.
    pub fn abandon(&mut self, correlation_id: &str) {
        self.open.remove(correlation_id);
    }

    /// Fill attribution is size-weighted per leg across every fill of the
    /// correlation id.
    pub fn record_fill(
        &mut self,
        correlation_id: &str,
        token_id: &str,
        price: f64,
        size: f64,
        fee: f64,
    ) {
        if let Some(rt) = self.open.get_mut(correlation_id) {
            let leg = rt.legs.entry(token_id.to_string()).or_default();
            leg.notional += price * size;
            leg.size += size;
            leg.fees += fee;
        }
    }

    /// Both legs reached a terminal state: close the round trip and append
    /// a sample. Returns the market id if this sample tipped it into
    /// disabled.
    pub fn close(
        &mut self,
        correlation_id: &str,
        t: &Thresholds,
        now: TimeMs,
    ) -> Option<MarketId> {
        let rt = self.open.remove(correlation_id)?;

        let mut leg_vwaps = Vec::new();
        let mut total_fees = 0.0;
        let mut matched = f64::MAX;
        for leg in rt.legs.values() {
            if leg.size > 0.0 {
                leg_vwaps.push(leg.notional / leg.size);
                total_fees += leg.fees;
            }
            matched = matched.min(leg.size);
        }
        if leg_vwaps.is_empty() {
            // Nothing executed; no realised observation to learn from.
            return None;
        }

        // A one-legged execution never captured the basket payoff: realise
        // zero edge. A matched pair realises 1 − Σ vwap − per-unit fees.
        let realised = if rt.legs.len() < 2 || matched <= 0.0 || matched == f64::MAX {
            0.0
        } else {
            1.0 - leg_vwaps.iter().sum::<f64>() - total_fees / matched
        };

        let ring = self
            .rings
            .entry(rt.market_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.window));
        if ring.len() == self.window {
            ring.pop_front();
        }
        ring.push_back(DecaySample {
            predicted: rt.predicted_edge,
            realised,
        });

        if ring.len() >= t.edge_decay_min_trades && !self.disabled.contains(&rt.market_id) {
            if let Some(q) = self.quality(&rt.market_id) {
                if q < t.edge_decay_min_ratio {
                    warn!(
                        market = %rt.market_id,
                        quality = q,
                        floor = t.edge_decay_min_ratio,
                        ts = now,
                        "edge decay: disabling market"
                    );
                    self.disabled.insert(rt.market_id.clone());
                    return Some(rt.market_id);
                }
            }
        }
        None
    }

    /// mean(realised) / mean(predicted); None until samples exist or when
    /// the predicted mean is degenerate.
    pub fn quality(&self, market_id: &str) -> Option<f64> {
        let ring = self.rings.get(market_id)?;
        if ring.is_empty() {
            return None;
        }
        let n = ring.len() as f64;
        let mean_pred: f64 = ring.iter().map(|s| s.predicted).sum::<f64>() / n;
        let mean_real: f64 = ring.iter().map(|s| s.realised).sum::<f64>() / n;
        if mean_pred.abs() < 1e-12 {
            return None;
        }
        Some(mean_real / mean_pred)
    }

    pub fn is_disabled(&self, market_id: &str) -> bool {
        self.disabled.contains(market_id)
    }

    /// `markets on` is the only path back.
    pub fn reenable(&mut self, market_id: &str) {
        if self.disabled.remove(market_id) {
            if let Some(ring) = self.rings.get_mut(market_id) {
                ring.clear();
            }
        }
    }

    pub fn open_round_trips(&self) -> usize {
        self.open.len()
    }

    /// Aggregate over every market's ring (backtest reporting).
    pub fn summary(&self) -> DecaySummary {
        let mut s = DecaySummary::default();
        let mut sum_pred = 0.0;
        let mut sum_real = 0.0;
        for ring in self.rings.values() {
            for sample in ring {
                s.trades += 1;
                if sample.realised > 0.0 {
                    s.wins += 1;
                }
                sum_pred += sample.predicted;
                sum_real += sample.realised;
            }
        }
        if s.trades > 0 {
            s.mean_predicted = sum_pred / s.trades as f64;
            s.mean_realised = sum_real / s.trades as f64;
        }
        s
    }
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct DecaySummary {
    pub trades: usize,
    pub wins: usize,
    pub mean_predicted: f64,
    pub mean_realised: f64,
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

//! Risk manager — position/PnL accounting, circuit breakers, and the
//! safety-mode state machine.
//!
//! Owns SafetyMode. Every fill flows through here exactly once (private
//! stream authoritative); equity is marked against book mids on each tick.
//! A tripped breaker moves RUNNING/PAUSED → FLATTENING; the flatten
//! workflow finishes into SAFE. Resume is only PAUSED → RUNNING and is
//! refused while any breaker condition still holds.

use std::collections::{HashMap, VecDeque};

use tracing::{info, warn};

use crate::config::Thresholds;

use super::types::{Fill, MarketId, Position, SafetyMode, Side, TimeMs, TokenId};

const HOUR_MS: TimeMs = 3_600_000;
const DAY_MS: TimeMs = 86_400_000;
/// Minimum submit outcomes before the reject-ratio breaker may fire.
const REJECT_RATIO_MIN_SAMPLES: usize = 10;

// ─────────────────────────────────────────────────────────
// Breakers
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TripReason {
    HourlyLoss,
    DailyLoss,
    Drawdown,
    RejectRatio,
    OperatorFlatten,
    UserStreamSilent,
    InvariantViolation,
}

impl TripReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripReason::HourlyLoss => "hourly_loss",
            TripReason::DailyLoss => "daily_loss",
            TripReason::Drawdown => "drawdown",
            TripReason::RejectRatio => "reject_ratio",
            TripReason::OperatorFlatten => "operator_flatten",
            TripReason::UserStreamSilent => "user_stream_silent",
            TripReason::InvariantViolation => "invariant_violation",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct RiskSnapshot {
    pub mode: &'static str,
    pub cash: f64,
    pub realised_pnl: f64,
    pub unrealised_pnl: f64,
    pub equity: f64,
    pub high_water: f64,
    pub drawdown: f64,
    pub hourly_pnl: f64,
    pub daily_pnl: f64,
    pub open_positions: usize,
    pub active_breakers: Vec<&'static str>,
}

// ─────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────

pub struct RiskManager {
    mode: SafetyMode,
    positions: HashMap<(MarketId, TokenId), Position>,
    cash: f64,
    /// Closed-lot PnL net of fees.
    realised_pnl: f64,
    unrealised_pnl: f64,
    equity: f64,
    high_water: f64,
    /// (ts, realised delta) rings for the rolling loss breakers.
    hourly: VecDeque<(TimeMs, f64)>,
    daily: VecDeque<(TimeMs, f64)>,
    /// true = rejected, bounded by reject_window.
    submit_outcomes: VecDeque<bool>,
    /// Sticky until process restart.
    invariant_tripped: bool,
    trip_log: Vec<(TimeMs, TripReason)>,
}

impl RiskManager {
    pub fn new(starting_mode: SafetyMode) -> Self {
        Self {
            mode: starting_mode,
            positions: HashMap::new(),
            cash: 0.0,
            realised_pnl: 0.0,
            unrealised_pnl: 0.0,
            equity: 0.0,
            high_water: 0.0,
            hourly: VecDeque::new(),
            daily: VecDeque::new(),
            submit_outcomes: VecDeque::new(),
            invariant_tripped: false,
            trip_log: Vec::new(),
        }
    }

    pub fn mode(&self) -> SafetyMode {
        self.mode
    }

    // ─────────────────────────────────────────────────
    // Mode transitions
    // ─────────────────────────────────────────────────

    /// Validated transition. An illegal request is refused here; the caller
    /// decides whether that refusal is an invariant breach.
    pub fn transition(&mut self, to: SafetyMode, now: TimeMs) -> Result<(), String> {
        if !self.mode.can_transition(to) {
            return Err(format!(
                "illegal safety transition {} -> {}",
                self.mode.as_str(),
                to.as_str()
            ));
        }
        info!(from = self.mode.as_str(), to = to.as_str(), ts = now, "safety mode transition");
        self.mode = to;
        Ok(())
    }

    /// Breaker trip: RUNNING/PAUSED → FLATTENING. Returns true if the mode
    /// actually changed (repeat trips while already flattening are no-ops).
    pub fn trip(&mut self, reason: TripReason, now: TimeMs) -> bool {
        if reason == TripReason::InvariantViolation {
            self.invariant_tripped = true;
        }
        self.trip_log.push((now, reason));
        match self.mode {
            SafetyMode::Running | SafetyMode::Paused => {
                warn!(reason = reason.as_str(), "circuit breaker tripped");
                self.mode = SafetyMode::Flattening;
                true
            }
            _ => false,
        }
    }

    pub fn trip_log(&self) -> &[(TimeMs, TripReason)] {
        &self.trip_log
    }

    // ─────────────────────────────────────────────────
    // Fills and accounting
    // ─────────────────────────────────────────────────

    /// Book a fill into cash, position, and the rolling realised windows.
    pub fn on_fill(&mut self, fill: &Fill) {
        if fill.size <= 0.0 {
            return;
        }
        let key = (fill.market_id.clone(), fill.token_id.clone());
        let position = self.positions.entry(key).or_default();

        let realised_delta = match fill.side {
            Side::Buy => {
                self.cash -= fill.price * fill.size + fill.fee;
                position.apply_buy(fill.size, fill.price);
                -fill.fee
            }
            Side::Sell => {
                self.cash += fill.price * fill.size - fill.fee;
                let lot_pnl = position.apply_sell(fill.size, fill.price);
                self.realised_pnl += lot_pnl - fill.fee;
                lot_pnl - fill.fee
            }
        };

        self.hourly.push_back((fill.ts, realised_delta));
        self.daily.push_back((fill.ts, realised_delta));
        self.prune(fill.ts);
    }

    pub fn record_submit_outcome(&mut self, rejected: bool, window: usize) {
        if self.submit_outcomes.len() >= window.max(1) {
            self.submit_outcomes.pop_front();
        }
        self.submit_outcomes.push_back(rejected);
    }

    fn prune(&mut self, now: TimeMs) {
        while matches!(self.hourly.front(), Some((ts, _)) if now - ts > HOUR_MS) {
            self.hourly.pop_front();
        }
        while matches!(self.daily.front(), Some((ts, _)) if now - ts > DAY_MS) {
            self.daily.pop_front();
        }
    }

    pub fn hourly_pnl(&self) -> f64 {
        self.hourly.iter().map(|(_, v)| v).sum()
    }

    pub fn daily_pnl(&self) -> f64 {
        self.daily.iter().map(|(_, v)| v).sum()
    }

    fn reject_ratio(&self) -> Option<f64> {
        if self.submit_outcomes.len() < REJECT_RATIO_MIN_SAMPLES {
            return None;
        }
        let rejected = self.submit_outcomes.iter().filter(|r| **r).count();
        Some(rejected as f64 / self.submit_outcomes.len() as f64)
    }

    /// Re-mark every open position; `marks` maps token id → mark price
    /// (book mid). Unmarked positions reuse their average price.
    pub fn mark_to_market(&mut self, marks: &HashMap<TokenId, f64>, now: TimeMs) {
        self.prune(now);
        let mut market_value = 0.0;
        let mut unrealised = 0.0;
        for ((_, token_id), p) in &self.positions {
            let mark = marks.get(token_id).copied().unwrap_or(p.avg_price);
            market_value += p.qty * mark;
            unrealised += p.qty * (mark - p.avg_price);
        }
        self.unrealised_pnl = unrealised;
        self.equity = self.cash + market_value;
        if self.equity > self.high_water {
            self.high_water = self.equity;
        }
    }

    pub fn equity(&self) -> f64 {
        self.equity
    }

    pub fn drawdown(&self) -> f64 {
        self.high_water - self.equity
    }

    // ─────────────────────────────────────────────────
    // Breaker evaluation
    // ─────────────────────────────────────────────────

    /// Conditions that currently hold. Loss/drawdown/reject breakers clear
    /// themselves when the condition recovers; an invariant trip never does.
    pub fn active_breakers(&self, t: &Thresholds) -> Vec<TripReason> {
        let mut active = Vec::new();
        if self.hourly_pnl() <= t.hourly_loss_limit {
            active.push(TripReason::HourlyLoss);
        }
        if self.daily_pnl() <= t.daily_loss_limit {
            active.push(TripReason::DailyLoss);
        }
        if self.drawdown() >= t.max_drawdown {
            active.push(TripReason::Drawdown);
        }
        if matches!(self.reject_ratio(), Some(r) if r >= t.max_reject_ratio) {
            active.push(TripReason::RejectRatio);
        }
        if self.invariant_tripped {
            active.push(TripReason::InvariantViolation);
        }
        active
    }

    /// Evaluate and trip on the first breaker whose condition holds.
    pub fn check_breakers(&mut self, t: &Thresholds, now: TimeMs) -> Option<TripReason> {
        if self.mode != SafetyMode::Running && self.mode != SafetyMode::Paused {
            return None;
        }
        let reason = *self.active_breakers(t).first()?;
        self.trip(reason, now);
        Some(reason)
    }

    // ─────────────────────────────────────────────────
    // Positions
    // ─────────────────────────────────────────────────

    pub fn position(&self, market_id: &str, token_id: &str) -> Position {
        self.positions
            .get(&(market_id.to_string(), token_id.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn open_positions(&self) -> Vec<(MarketId, TokenId, Position)> {
        self.positions
            .iter()
            .filter(|(_, p)| !p.is_flat())
            .map(|((m, t), p)| (m.clone(), t.clone(), *p))
            .collect()
    }

    pub fn snapshot(&self, t: &Thresholds) -> RiskSnapshot {
        RiskSnapshot {
            mode: self.mode.as_str(),
            cash: self.cash,
            realised_pnl: self.realised_pnl,
            unrealised_pnl: self.unrealised_pnl,
            equity: self.equity,
            high_water: self.high_water,
            drawdown: self.drawdown(),
            hourly_pnl: self.hourly_pnl(),
            daily_pnl: self.daily_pnl(),
            open_positions: self.open_positions().len(),
            active_breakers: self
                .active_breakers(t)
                .iter()
                .map(|r| r.as_str())
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

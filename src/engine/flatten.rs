//! Flatten workflow — bring exposure to zero before entering SAFE.
//!
//! Phase one cancels every working order and waits for acks or a bounded
//! timeout. In `cancel_and_unwind` mode phase two then sells down each
//! non-zero position with IOC orders at the best bid, refusing lots whose
//! estimated slippage exceeds the unwind ceiling. Whatever remains at the
//! deadline is logged as residual and the engine still enters SAFE.

use tracing::{info, warn};

use crate::config::{FlattenMode, Thresholds};

use super::book::BookState;
use super::messages::BookSide;
use super::registry::MarketRegistry;
use super::slippage::SlippageModel;
use super::types::{IntentPurpose, MarketId, OrderIntent, Position, Side, TimeMs, TokenId};

// ─────────────────────────────────────────────────────────
// States
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FlattenState {
    Idle,
    Cancelling { deadline: TimeMs },
    Unwinding { deadline: TimeMs },
    Done { clean: bool },
}

/// What the engine should do after a workflow step.
#[derive(Debug, PartialEq)]
pub enum FlattenStep {
    Wait,
    /// Cancels confirmed (or timed out); start emitting unwind sells.
    StartUnwind,
    Complete {
        clean: bool,
        residual: Vec<(MarketId, TokenId, f64)>,
    },
}

pub struct FlattenWorkflow {
    mode: FlattenMode,
    state: FlattenState,
    cancel_timeout_hit: bool,
}

impl FlattenWorkflow {
    pub fn new(mode: FlattenMode) -> Self {
        Self {
            mode,
            state: FlattenState::Idle,
            cancel_timeout_hit: false,
        }
    }

    pub fn state(&self) -> &FlattenState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            FlattenState::Cancelling { .. } | FlattenState::Unwinding { .. }
        )
    }

    /// Begin the workflow. The engine has already dispatched
    /// `flatten_cancel_all`; we hold until acks or deadline.
    pub fn start(&mut self, now: TimeMs, t: &Thresholds) {
        info!(mode = ?self.mode, "flatten workflow started");
        self.cancel_timeout_hit = false;
        self.state = FlattenState::Cancelling {
            deadline: now + t.flatten_cancel_timeout_ms,
        };
    }

    /// Drive the workflow forward. `cancels_outstanding` counts orders still
    /// CANCELLING (or otherwise working); `positions` is the current
    /// non-flat set.
    pub fn step(
        &mut self,
        now: TimeMs,
        t: &Thresholds,
        cancels_outstanding: usize,
        positions: &[(MarketId, TokenId, Position)],
    ) -> FlattenStep {
        match &self.state {
            FlattenState::Idle | FlattenState::Done { .. } => FlattenStep::Wait,
            FlattenState::Cancelling { deadline } => {
                let timed_out = now >= *deadline;
                if cancels_outstanding > 0 && !timed_out {
                    return FlattenStep::Wait;
                }
                if timed_out && cancels_outstanding > 0 {
                    self.cancel_timeout_hit = true;
                    warn!(
                        outstanding = cancels_outstanding,
                        "flatten: cancel acks timed out"
                    );
                }
                match self.mode {
                    FlattenMode::CancelOnly => self.complete(positions, cancels_outstanding == 0),
                    FlattenMode::CancelAndUnwind => {
                        self.state = FlattenState::Unwinding {
                            deadline: now + t.unwind_deadline_ms,
                        };
                        FlattenStep::StartUnwind
                    }
                }
            }
            FlattenState::Unwinding { deadline } => {
                if positions.is_empty() {
                    return self.complete(positions, !self.cancel_timeout_hit);
                }
                if now >= *deadline {
                    warn!(residual = positions.len(), "flatten: unwind deadline elapsed");
                    return self.complete(positions, false);
                }
                FlattenStep::Wait
            }
        }
    }

    fn complete(
        &mut self,
        positions: &[(MarketId, TokenId, Position)],
        acks_clean: bool,
    ) -> FlattenStep {
        let residual: Vec<(MarketId, TokenId, f64)> = positions
            .iter()
            .map(|(m, tok, p)| (m.clone(), tok.clone(), p.qty))
            .collect();
        let clean = match self.mode {
            // cancel_only never unwinds; open positions are expected.
            FlattenMode::CancelOnly => acks_clean,
            FlattenMode::CancelAndUnwind => acks_clean && residual.is_empty(),
        };
        for (m, tok, qty) in &residual {
            if self.mode == FlattenMode::CancelAndUnwind {
                warn!(market = %m, token = %tok, qty, "flatten: residual position");
            }
        }
        info!(clean, residual = residual.len(), "flatten workflow complete");
        self.state = FlattenState::Done { clean };
        FlattenStep::Complete { clean, residual }
    }

    /// Unwind sells for every position that has no working unwind order yet
    /// (the engine pre-filters those). A lot whose estimated slippage
    /// exceeds the ceiling is refused and left for the residual report.
    pub fn unwind_intents(
        &self,
        book: &BookState,
        slippage: &SlippageModel,
        registry: &MarketRegistry,
        t: &Thresholds,
        positions: &[(MarketId, TokenId, Position)],
        mut next_id: impl FnMut() -> String,
    ) -> Vec<OrderIntent> {
        let mut intents = Vec::new();
        for (market_id, token_id, position) in positions {
            if registry.get(market_id).is_none() {
                continue;
            }
            let best_bid = match book.best_bid(token_id) {
                Some(b) => b,
                None => {
                    warn!(token = %token_id, "unwind: no bid available, skipping lot");
                    continue;
                }
            };
            let top = book
                .top_level_size(token_id, BookSide::Bid)
                .unwrap_or(position.qty);
            let estimated = slippage.estimate(t, position.qty, top)
                + slippage.effective_failure_buffer(t, market_id);
            if estimated > t.max_unwind_slippage {
                warn!(
                    token = %token_id,
                    estimated,
                    ceiling = t.max_unwind_slippage,
                    "unwind: estimated slippage above ceiling, refusing lot"
                );
                continue;
            }
            intents.push(OrderIntent {
                market_id: market_id.clone(),
                token_id: token_id.clone(),
                side: Side::Sell,
                price: best_bid,
                size: position.qty,
                purpose: IntentPurpose::Unwind,
                correlation_id: next_id(),
            });
        }
        intents
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

//! Arb strategy — turns an executable edge into one paired intent.
//!
//! Stateless beyond counters: the same book, risk and slippage inputs always
//! produce the same intents. Size starts at the configured target and
//! shrinks to what both legs can actually fill.

use tracing::debug;

use crate::config::Thresholds;

use super::book::BookState;
use super::edge::{self, EdgeQuote};
use super::registry::Market;
use super::slippage::SlippageModel;
use super::types::{IntentPurpose, OrderIntent, SafetyMode, Side};

// ─────────────────────────────────────────────────────────
// Decisions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    Flattening,
    Safe,
    MarketDisabled,
    DecayDisabled,
    BookUnavailable,
    EdgeBelowThreshold,
    BelowMinSize,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Paused => "paused",
            SkipReason::Flattening => "flattening",
            SkipReason::Safe => "safe",
            SkipReason::MarketDisabled => "market_disabled",
            SkipReason::DecayDisabled => "decay_disabled",
            SkipReason::BookUnavailable => "book_unavailable",
            SkipReason::EdgeBelowThreshold => "edge_below_threshold",
            SkipReason::BelowMinSize => "below_min_size",
        }
    }
}

#[derive(Debug)]
pub enum StrategyDecision {
    /// Both legs of the basket, sharing one correlation id.
    EmitPair {
        intents: [OrderIntent; 2],
        quote: EdgeQuote,
    },
    Skip(SkipReason),
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct StrategyStats {
    pub evaluations: u64,
    pub pairs_emitted: u64,
    pub skipped_mode: u64,
    pub skipped_disabled: u64,
    pub skipped_book: u64,
    pub skipped_edge: u64,
}

// ─────────────────────────────────────────────────────────
// Strategy
// ─────────────────────────────────────────────────────────

pub struct Strategy {
    stats: StrategyStats,
}

impl Strategy {
    pub fn new() -> Self {
        Self {
            stats: StrategyStats::default(),
        }
    }

    pub fn stats(&self) -> StrategyStats {
        self.stats
    }

    /// One evaluation for one market. The caller supplies the correlation
    /// id so that live and backtest runs control id minting.
    #[allow(clippy::too_many_arguments)]
    pub fn decide(
        &mut self,
        book: &BookState,
        slippage: &SlippageModel,
        t: &Thresholds,
        market: &Market,
        mode: SafetyMode,
        decay_disabled: bool,
        correlation_id: String,
    ) -> StrategyDecision {
        self.stats.evaluations += 1;

        match mode {
            SafetyMode::Running => {}
            SafetyMode::Paused => {
                self.stats.skipped_mode += 1;
                return StrategyDecision::Skip(SkipReason::Paused);
            }
            SafetyMode::Flattening => {
                self.stats.skipped_mode += 1;
                return StrategyDecision::Skip(SkipReason::Flattening);
            }
            SafetyMode::Safe => {
                self.stats.skipped_mode += 1;
                return StrategyDecision::Skip(SkipReason::Safe);
            }
        }
        if !market.enabled {
            self.stats.skipped_disabled += 1;
            return StrategyDecision::Skip(SkipReason::MarketDisabled);
        }
        if decay_disabled {
            self.stats.skipped_disabled += 1;
            return StrategyDecision::Skip(SkipReason::DecayDisabled);
        }

        let quote = match edge::evaluate(book, slippage, t, market, t.target_size) {
            Some(q) => q,
            None => {
                self.stats.skipped_book += 1;
                return StrategyDecision::Skip(SkipReason::BookUnavailable);
            }
        };

        if quote.predicted_edge <= t.min_edge_threshold {
            self.stats.skipped_edge += 1;
            return StrategyDecision::Skip(SkipReason::EdgeBelowThreshold);
        }
        if quote.fillable_size < t.min_size {
            self.stats.skipped_edge += 1;
            return StrategyDecision::Skip(SkipReason::BelowMinSize);
        }

        let size = quote.fillable_size.min(t.target_size);
        debug!(
            market = %market.market_id,
            edge = quote.predicted_edge,
            size,
            "emitting paired arb intent"
        );
        self.stats.pairs_emitted += 1;
        StrategyDecision::EmitPair {
            intents: [
                OrderIntent {
                    market_id: market.market_id.clone(),
                    token_id: market.yes.id.clone(),
                    side: Side::Buy,
                    price: quote.yes_vwap,
                    size,
                    purpose: IntentPurpose::ArbEntry,
                    correlation_id: correlation_id.clone(),
                },
                OrderIntent {
                    market_id: market.market_id.clone(),
                    token_id: market.no.id.clone(),
                    side: Side::Buy,
                    price: quote.no_vwap,
                    size,
                    purpose: IntentPurpose::ArbEntry,
                    correlation_id,
                },
            ],
            quote,
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

//! Executable-edge computation.
//!
//! A risk-free basket of one YES and one NO share pays exactly 1 at
//! resolution, so the tradeable edge for size `s` is
//!
//!     1 − vwap_ask(YES, s) − vwap_ask(NO, s)
//!       − fee_rate − slippage(s) − effective_failure_buffer
//!
//! using depth-aware VWAPs, never just the top of book.

use crate::config::Thresholds;

use super::book::BookState;
use super::messages::BookSide;
use super::registry::Market;
use super::slippage::SlippageModel;

#[derive(Debug, Clone, Copy)]
pub struct EdgeQuote {
    pub predicted_edge: f64,
    /// Min across both legs, clamped to the requested size.
    pub fillable_size: f64,
    pub yes_vwap: f64,
    pub no_vwap: f64,
}

/// Evaluate the edge for buying `size` of each leg. None when either book
/// side is unavailable (resyncing or empty).
pub fn evaluate(
    book: &BookState,
    slippage: &SlippageModel,
    t: &Thresholds,
    market: &Market,
    size: f64,
) -> Option<EdgeQuote> {
    let (yes_vwap, yes_fillable) = book.depth_for_size(&market.yes.id, BookSide::Ask, size)?;
    let (no_vwap, no_fillable) = book.depth_for_size(&market.no.id, BookSide::Ask, size)?;
    let fillable_size = yes_fillable.min(no_fillable).min(size);

    // Conservative leg: the thinner top level dominates the slippage cost.
    let top = book
        .top_level_size(&market.yes.id, BookSide::Ask)?
        .min(book.top_level_size(&market.no.id, BookSide::Ask)?);
    let slip = slippage.estimate(t, fillable_size, top);
    let buffer = slippage.effective_failure_buffer(t, &market.market_id);

    // Re-quote VWAPs at the fillable size so a partially coverable request
    // is priced on what would actually execute.
    let (yes_vwap, _) = book.depth_for_size(&market.yes.id, BookSide::Ask, fillable_size)?;
    let (no_vwap, _) = book.depth_for_size(&market.no.id, BookSide::Ask, fillable_size)?;

    let predicted_edge = 1.0 - yes_vwap - no_vwap - t.fee_rate - slip - buffer;
    Some(EdgeQuote {
        predicted_edge,
        fillable_size,
        yes_vwap,
        no_vwap,
    })
}

/// Edge plus size gates.
pub fn is_executable(quote: &EdgeQuote, t: &Thresholds) -> bool {
    quote.predicted_edge > t.min_edge_threshold && quote.fillable_size >= t.min_size
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

//! Per-token order book state.
//!
//! Consumes `snapshot` and `update` events off the public stream. Sequence
//! numbers are strictly monotone per token; a gap parks the token in
//! RESYNCING — reads return None, incoming deltas are buffered, and a REST
//! snapshot request is surfaced to the fetcher task. Once a snapshot at or
//! past the gap boundary lands, buffered deltas above its sequence are
//! replayed and reads open up again.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::messages::{BookEvent, BookEventKind, BookLevel, BookSide, LevelChange};
use super::types::{TimeMs, TokenId};

// ─────────────────────────────────────────────────────────
// Per-token book
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
enum SyncState {
    Synced,
    Resyncing {
        /// Sequence of the delta that revealed the gap. A snapshot must
        /// reach at least this far before reads reopen.
        boundary: u64,
        buffered: Vec<BookEvent>,
    },
}

#[derive(Debug)]
struct TokenBook {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    seq: u64,
    state: SyncState,
    last_periodic_resync: TimeMs,
}

impl TokenBook {
    fn new() -> Self {
        Self {
            bids: Vec::new(),
            asks: Vec::new(),
            seq: 0,
            state: SyncState::Synced,
            last_periodic_resync: 0,
        }
    }

    fn apply_snapshot(&mut self, bids: &[BookLevel], asks: &[BookLevel], depth: usize) {
        self.bids = bids.to_vec();
        self.asks = asks.to_vec();
        self.bids
            .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        self.asks
            .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        self.bids.retain(|l| l.size > 0.0);
        self.asks.retain(|l| l.size > 0.0);
        self.bids.truncate(depth);
        self.asks.truncate(depth);
    }

    fn apply_changes(&mut self, changes: &[LevelChange], depth: usize) {
        for c in changes {
            let (levels, descending) = match c.side {
                BookSide::Bid => (&mut self.bids, true),
                BookSide::Ask => (&mut self.asks, false),
            };
            match levels.iter().position(|l| (l.price - c.price).abs() < 1e-12) {
                Some(i) => {
                    if c.size <= 0.0 {
                        levels.remove(i);
                    } else {
                        levels[i].size = c.size;
                    }
                }
                None if c.size > 0.0 => {
                    let pos = levels
                        .iter()
                        .position(|l| {
                            if descending {
                                l.price < c.price
                            } else {
                                l.price > c.price
                            }
                        })
                        .unwrap_or(levels.len());
                    levels.insert(
                        pos,
                        BookLevel {
                            price: c.price,
                            size: c.size,
                        },
                    );
                    levels.truncate(depth);
                }
                None => {}
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// BookState
// ─────────────────────────────────────────────────────────

/// What the caller should do after applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Stale or duplicate; dropped.
    Ignored,
    /// Sequence gap detected — the token is now RESYNCING and a REST
    /// snapshot must be fetched.
    ResyncNeeded,
    /// Delta arrived while RESYNCING; buffered until the snapshot lands.
    Buffered,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct BookStats {
    pub gaps: u64,
    pub resyncs_completed: u64,
    pub stale_dropped: u64,
    pub periodic_overrides: u64,
}

pub struct BookState {
    books: HashMap<TokenId, TokenBook>,
    depth: usize,
    resync_interval_ms: i64,
    seq_tolerance: u64,
    stats: BookStats,
}

impl BookState {
    pub fn new(depth: usize, resync_interval_ms: i64, seq_tolerance: u64) -> Self {
        Self {
            books: HashMap::new(),
            depth,
            resync_interval_ms,
            seq_tolerance,
            stats: BookStats::default(),
        }
    }

    pub fn stats(&self) -> BookStats {
        self.stats
    }

    /// Apply one book event, enforcing per-token sequence monotonicity.
    pub fn apply(&mut self, ev: BookEvent) -> ApplyOutcome {
        let depth = self.depth;
        let tolerance = self.seq_tolerance;
        let book = self
            .books
            .entry(ev.token_id.clone())
            .or_insert_with(TokenBook::new);

        // RESYNCING: buffer deltas, hold for a snapshot at the boundary.
        if let SyncState::Resyncing { boundary, buffered } = &mut book.state {
            match &ev.kind {
                BookEventKind::Update { .. } => {
                    buffered.push(ev);
                    return ApplyOutcome::Buffered;
                }
                BookEventKind::Snapshot { .. } => {
                    if ev.seq + 1 < *boundary {
                        // Snapshot predates the gap; keep holding.
                        self.stats.stale_dropped += 1;
                        return ApplyOutcome::Ignored;
                    }
                    let mut replay = std::mem::take(buffered);
                    if let BookEventKind::Snapshot { bids, asks } = &ev.kind {
                        book.apply_snapshot(bids, asks, depth);
                    }
                    book.seq = ev.seq;
                    book.state = SyncState::Synced;

                    replay.retain(|d| d.seq > ev.seq);
                    replay.sort_by_key(|d| d.seq);
                    for d in replay {
                        if d.seq == book.seq + 1 {
                            if let BookEventKind::Update { changes } = &d.kind {
                                book.apply_changes(changes, depth);
                            }
                            book.seq = d.seq;
                        }
                    }
                    self.stats.resyncs_completed += 1;
                    return ApplyOutcome::Applied;
                }
            }
        }

        // SYNCED path.
        match &ev.kind {
            BookEventKind::Snapshot { bids, asks } => {
                // First snapshot, in-order snapshot, or a periodic REST
                // snapshot whose sequence diverged beyond tolerance.
                let diverged = ev.seq.abs_diff(book.seq) > tolerance;
                if book.seq == 0 || ev.seq >= book.seq || diverged {
                    if book.seq > 0 && ev.seq < book.seq && diverged {
                        self.stats.periodic_overrides += 1;
                        warn!(
                            token = %ev.token_id,
                            local_seq = book.seq,
                            snapshot_seq = ev.seq,
                            "periodic snapshot overrides diverged book"
                        );
                    }
                    book.apply_snapshot(bids, asks, depth);
                    book.seq = ev.seq;
                    ApplyOutcome::Applied
                } else {
                    self.stats.stale_dropped += 1;
                    ApplyOutcome::Ignored
                }
            }
            BookEventKind::Update { changes } => {
                if book.seq == 0 {
                    // No snapshot yet; cannot anchor deltas.
                    return ApplyOutcome::Ignored;
                }
                if ev.seq <= book.seq {
                    self.stats.stale_dropped += 1;
                    return ApplyOutcome::Ignored;
                }
                if ev.seq > book.seq + 1 {
                    self.stats.gaps += 1;
                    debug!(
                        token = %ev.token_id,
                        stored = book.seq,
                        received = ev.seq,
                        "sequence gap, entering resync"
                    );
                    let boundary = ev.seq;
                    book.state = SyncState::Resyncing {
                        boundary,
                        buffered: vec![ev],
                    };
                    return ApplyOutcome::ResyncNeeded;
                }
                book.apply_changes(changes, depth);
                book.seq = ev.seq;
                ApplyOutcome::Applied
            }
        }
    }

    fn readable(&self, token_id: &str) -> Option<&TokenBook> {
        self.books
            .get(token_id)
            .filter(|b| matches!(b.state, SyncState::Synced) && b.seq > 0)
    }

    /// None while resyncing or empty — downstream must treat it as
    /// Unavailable, never as zero.
    pub fn best_bid(&self, token_id: &str) -> Option<f64> {
        self.readable(token_id)?.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self, token_id: &str) -> Option<f64> {
        self.readable(token_id)?.asks.first().map(|l| l.price)
    }

    pub fn mid(&self, token_id: &str) -> Option<f64> {
        let book = self.readable(token_id)?;
        match (book.bids.first(), book.asks.first()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / 2.0),
            (Some(b), None) => Some(b.price),
            (None, Some(a)) => Some(a.price),
            (None, None) => None,
        }
    }

    /// Size resting on the top level of a side.
    pub fn top_level_size(&self, token_id: &str, side: BookSide) -> Option<f64> {
        let book = self.readable(token_id)?;
        let levels = match side {
            BookSide::Bid => &book.bids,
            BookSide::Ask => &book.asks,
        };
        levels.first().map(|l| l.size)
    }

    /// Walk the side to fill `size`; returns the volume-weighted average
    /// price over what is actually fillable, and the fillable amount.
    pub fn depth_for_size(
        &self,
        token_id: &str,
        side: BookSide,
        size: f64,
    ) -> Option<(f64, f64)> {
        if size <= 0.0 {
            return None;
        }
        let book = self.readable(token_id)?;
        let levels = match side {
            BookSide::Bid => &book.bids,
            BookSide::Ask => &book.asks,
        };
        let mut remaining = size;
        let mut notional = 0.0;
        for l in levels {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(l.size);
            notional += take * l.price;
            remaining -= take;
        }
        let fillable = size - remaining;
        if fillable <= 0.0 {
            return None;
        }
        Some((notional / fillable, fillable))
    }

    /// Tokens whose periodic REST resync is due. Marks them requested so a
    /// slow fetch is not re-issued every tick.
    pub fn periodic_resync_due(&mut self, now: TimeMs) -> Vec<TokenId> {
        let mut due = Vec::new();
        for (token, book) in &mut self.books {
            if now - book.last_periodic_resync >= self.resync_interval_ms {
                book.last_periodic_resync = now;
                due.push(token.clone());
            }
        }
        due
    }

    pub fn is_resyncing(&self, token_id: &str) -> bool {
        matches!(
            self.books.get(token_id).map(|b| &b.state),
            Some(SyncState::Resyncing { .. })
        )
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(seq: u64, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> BookEvent {
        BookEvent {
            token_id: "tok".into(),
            kind: BookEventKind::Snapshot {
                bids: bids
                    .iter()
                    .map(|&(price, size)| BookLevel { price, size })
                    .collect(),
                asks: asks
                    .iter()
                    .map(|&(price, size)| BookLevel { price, size })
                    .collect(),
            },
            seq,
            ts: seq as TimeMs,
        }
    }

    fn update(seq: u64, changes: &[(BookSide, f64, f64)]) -> BookEvent {
        BookEvent {
            token_id: "tok".into(),
            kind: BookEventKind::Update {
                changes: changes
                    .iter()
                    .map(|&(side, price, size)| LevelChange { side, price, size })
                    .collect(),
            },
            seq,
            ts: seq as TimeMs,
        }
    }

    #[test]
    fn test_snapshot_then_delta() {
        let mut bs = BookState::new(10, 30_000, 2);
        bs.apply(snapshot(1, &[(0.48, 100.0)], &[(0.50, 100.0)]));
        assert_eq!(bs.apply(update(2, &[(BookSide::Ask, 0.49, 40.0)])), ApplyOutcome::Applied);
        assert_eq!(bs.best_ask("tok"), Some(0.49));
        assert_eq!(bs.best_bid("tok"), Some(0.48));
    }

    #[test]
    fn test_zero_size_removes_level() {
        let mut bs = BookState::new(10, 30_000, 2);
        bs.apply(snapshot(1, &[], &[(0.50, 100.0), (0.52, 50.0)]));
        bs.apply(update(2, &[(BookSide::Ask, 0.50, 0.0)]));
        assert_eq!(bs.best_ask("tok"), Some(0.52));
    }

    #[test]
    fn test_stale_delta_ignored() {
        let mut bs = BookState::new(10, 30_000, 2);
        bs.apply(snapshot(5, &[], &[(0.50, 100.0)]));
        assert_eq!(bs.apply(update(5, &[(BookSide::Ask, 0.40, 1.0)])), ApplyOutcome::Ignored);
        assert_eq!(bs.apply(update(3, &[(BookSide::Ask, 0.40, 1.0)])), ApplyOutcome::Ignored);
        assert_eq!(bs.best_ask("tok"), Some(0.50));
    }

    #[test]
    fn test_gap_holds_reads_until_snapshot() {
        let mut bs = BookState::new(10, 30_000, 2);
        bs.apply(snapshot(1, &[(0.48, 100.0)], &[(0.50, 100.0)]));
        // seq jumps 2 -> 4: gap.
        assert_eq!(
            bs.apply(update(4, &[(BookSide::Ask, 0.51, 10.0)])),
            ApplyOutcome::ResyncNeeded
        );
        assert!(bs.is_resyncing("tok"));
        assert_eq!(bs.best_ask("tok"), None);
        assert_eq!(bs.depth_for_size("tok", BookSide::Ask, 10.0), None);

        // Deltas during resync are buffered.
        assert_eq!(
            bs.apply(update(5, &[(BookSide::Ask, 0.52, 10.0)])),
            ApplyOutcome::Buffered
        );

        // Snapshot at the gap boundary: buffered deltas above it replay.
        assert_eq!(
            bs.apply(snapshot(4, &[(0.48, 100.0)], &[(0.51, 10.0)])),
            ApplyOutcome::Applied
        );
        assert!(!bs.is_resyncing("tok"));
        assert_eq!(bs.best_ask("tok"), Some(0.51));
        // seq advanced through the replayed delta 5.
        assert_eq!(bs.apply(update(6, &[(BookSide::Ask, 0.51, 0.0)])), ApplyOutcome::Applied);
        assert_eq!(bs.best_ask("tok"), Some(0.52));
    }

    #[test]
    fn test_resync_converges_to_fresh_replay() {
        // Gapped book + snapshot + buffered replay must equal a book that
        // saw everything in order.
        let mut gapped = BookState::new(10, 30_000, 2);
        gapped.apply(snapshot(1, &[], &[(0.50, 100.0)]));
        gapped.apply(update(3, &[(BookSide::Ask, 0.49, 20.0)])); // gap
        gapped.apply(update(4, &[(BookSide::Ask, 0.48, 30.0)])); // buffered
        gapped.apply(snapshot(3, &[], &[(0.50, 100.0), (0.49, 20.0)]));

        let mut fresh = BookState::new(10, 30_000, 2);
        fresh.apply(snapshot(1, &[], &[(0.50, 100.0)]));
        fresh.apply(update(2, &[(BookSide::Ask, 0.55, 5.0)]));
        fresh.apply(update(3, &[(BookSide::Ask, 0.49, 20.0)]));
        fresh.apply(update(4, &[(BookSide::Ask, 0.48, 30.0)]));
        // Not identical books by construction (delta 2 was lost to the gap
        // and replaced by the snapshot) — but both must agree from the
        // snapshot boundary onward.
        assert_eq!(gapped.best_ask("tok"), Some(0.48));
        assert_eq!(fresh.best_ask("tok"), Some(0.48));
    }

    #[test]
    fn test_snapshot_below_boundary_keeps_holding() {
        let mut bs = BookState::new(10, 30_000, 2);
        bs.apply(snapshot(1, &[], &[(0.50, 100.0)]));
        bs.apply(update(6, &[(BookSide::Ask, 0.49, 1.0)])); // gap, boundary 6
        assert_eq!(bs.apply(snapshot(3, &[], &[(0.51, 5.0)])), ApplyOutcome::Ignored);
        assert!(bs.is_resyncing("tok"));
        assert_eq!(bs.apply(snapshot(6, &[], &[(0.51, 5.0)])), ApplyOutcome::Applied);
        assert_eq!(bs.best_ask("tok"), Some(0.51));
    }

    #[test]
    fn test_depth_vwap() {
        let mut bs = BookState::new(10, 30_000, 2);
        bs.apply(snapshot(1, &[], &[(0.40, 10.0), (0.45, 100.0)]));
        let (vwap, fillable) = bs.depth_for_size("tok", BookSide::Ask, 50.0).unwrap();
        assert!((fillable - 50.0).abs() < 1e-9);
        // (10*0.40 + 40*0.45) / 50 = 0.44
        assert!((vwap - 0.44).abs() < 1e-9);
    }

    #[test]
    fn test_depth_partial_fillable() {
        let mut bs = BookState::new(10, 30_000, 2);
        bs.apply(snapshot(1, &[], &[(0.40, 10.0)]));
        let (vwap, fillable) = bs.depth_for_size("tok", BookSide::Ask, 50.0).unwrap();
        assert!((fillable - 10.0).abs() < 1e-9);
        assert!((vwap - 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_periodic_override_on_divergence() {
        let mut bs = BookState::new(10, 30_000, 2);
        bs.apply(snapshot(100, &[], &[(0.50, 100.0)]));
        // Within tolerance: stale snapshot dropped.
        assert_eq!(bs.apply(snapshot(99, &[], &[(0.60, 1.0)])), ApplyOutcome::Ignored);
        assert_eq!(bs.best_ask("tok"), Some(0.50));
        // Beyond tolerance: override.
        assert_eq!(bs.apply(snapshot(90, &[], &[(0.60, 1.0)])), ApplyOutcome::Applied);
        assert_eq!(bs.best_ask("tok"), Some(0.60));
    }
}

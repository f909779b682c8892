//! Venue simulator for backtests.
//!
//! Matches engine orders against the replayed book at a (price,
//! time-in-queue) heuristic: marketable orders take the displayed top level
//! immediately; resting orders fill once the replayed book crosses their
//! price and they have sat in queue past the configured delay. Everything
//! it emits goes back into the core as ordinary private-stream events, so
//! the engine cannot tell it from a live venue.

use std::collections::HashMap;

use crate::engine::book::BookState;
use crate::engine::messages::{BookEvent, BookSide, OrderTicket, UserStreamEvent, VenueCmd};
use crate::engine::types::{Fill, Side, TimeMs, TokenId};

// ─────────────────────────────────────────────────────────
// Resting orders
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct RestingOrder {
    client_order_id: String,
    token_id: TokenId,
    side: Side,
    price: f64,
    remaining: f64,
    entered_at: TimeMs,
}

pub struct SimVenue {
    book: BookState,
    resting: HashMap<String, RestingOrder>,
    /// Per-unit fee charged on each leg (half the pair fee).
    fee_per_unit: f64,
    /// Time a resting order must sit before the queue reaches it.
    queue_delay_ms: TimeMs,
    next_id: u64,
}

impl SimVenue {
    pub fn new(pair_fee_rate: f64, queue_delay_ms: TimeMs) -> Self {
        Self {
            book: BookState::new(10, i64::MAX / 4, u64::MAX),
            resting: HashMap::new(),
            fee_per_unit: pair_fee_rate / 2.0,
            queue_delay_ms,
            next_id: 0,
        }
    }

    /// Apply a replayed book event, then fill whatever resting orders the
    /// new book crosses.
    pub fn on_book_event(&mut self, ev: &BookEvent, now: TimeMs) -> Vec<UserStreamEvent> {
        self.book.apply(ev.clone());
        self.match_resting(now)
    }

    /// Handle an engine venue command.
    pub fn on_cmd(&mut self, cmd: VenueCmd, now: TimeMs) -> Vec<UserStreamEvent> {
        match cmd {
            VenueCmd::Submit(ticket) => self.on_submit(ticket, now),
            VenueCmd::Cancel {
                client_order_id, ..
            } => self.on_cancel(&client_order_id, now),
        }
    }

    fn mint_venue_id(&mut self) -> String {
        self.next_id += 1;
        format!("sim-{:08}", self.next_id)
    }

    fn on_submit(&mut self, ticket: OrderTicket, now: TimeMs) -> Vec<UserStreamEvent> {
        let venue_order_id = self.mint_venue_id();
        let mut events = vec![UserStreamEvent::OrderAck {
            client_order_id: ticket.client_order_id.clone(),
            venue_order_id: venue_order_id.clone(),
            ts: now,
        }];

        let mut order = RestingOrder {
            client_order_id: ticket.client_order_id,
            token_id: ticket.token_id,
            side: ticket.side,
            price: ticket.price,
            remaining: ticket.size,
            entered_at: now,
        };

        // Marketable part takes the displayed top level immediately.
        if let Some(fill) = self.try_fill(&mut order, now) {
            events.push(UserStreamEvent::Fill(fill));
        }
        if order.remaining > 1e-9 {
            self.resting.insert(order.client_order_id.clone(), order);
        }
        events
    }

    fn on_cancel(&mut self, client_order_id: &str, now: TimeMs) -> Vec<UserStreamEvent> {
        match self.resting.remove(client_order_id) {
            Some(_) => vec![UserStreamEvent::CancelAck {
                client_order_id: client_order_id.to_string(),
                ts: now,
            }],
            // Nothing resting (already filled, or a pre-ack cancel): still
            // acknowledge so the lifecycle can settle.
            None => vec![UserStreamEvent::CancelAck {
                client_order_id: client_order_id.to_string(),
                ts: now,
            }],
        }
    }

    fn match_resting(&mut self, now: TimeMs) -> Vec<UserStreamEvent> {
        let ids: Vec<String> = self.resting.keys().cloned().collect();
        let mut events = Vec::new();
        for id in ids {
            let mut order = match self.resting.remove(&id) {
                Some(o) => o,
                None => continue,
            };
            if now - order.entered_at >= self.queue_delay_ms {
                if let Some(fill) = self.try_fill(&mut order, now) {
                    events.push(UserStreamEvent::Fill(fill));
                }
            }
            if order.remaining > 1e-9 {
                self.resting.insert(id, order);
            }
        }
        events
    }

    /// Fill against the displayed touch if the order is marketable. The
    /// caller decides queue-delay eligibility.
    fn try_fill(&self, order: &mut RestingOrder, now: TimeMs) -> Option<Fill> {
        let (touch, available) = match order.side {
            Side::Buy => (
                self.book.best_ask(&order.token_id)?,
                self.book
                    .top_level_size(&order.token_id, BookSide::Ask)
                    .unwrap_or(0.0),
            ),
            Side::Sell => (
                self.book.best_bid(&order.token_id)?,
                self.book
                    .top_level_size(&order.token_id, BookSide::Bid)
                    .unwrap_or(0.0),
            ),
        };
        let marketable = match order.side {
            Side::Buy => touch <= order.price,
            Side::Sell => touch >= order.price,
        };
        if !marketable || available <= 0.0 {
            return None;
        }
        let size = order.remaining.min(available);
        order.remaining -= size;
        Some(Fill {
            ts: now,
            market_id: String::new(), // the order manager re-derives this
            token_id: order.token_id.clone(),
            side: order.side,
            price: touch,
            size,
            fee: self.fee_per_unit * size,
            client_order_id: order.client_order_id.clone(),
        })
    }

    pub fn resting_count(&self) -> usize {
        self.resting.len()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::messages::{BookEventKind, BookLevel};

    fn snapshot(token: &str, bids: &[(f64, f64)], asks: &[(f64, f64)], seq: u64) -> BookEvent {
        BookEvent {
            token_id: token.into(),
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

    fn ticket(id: &str, side: Side, price: f64, size: f64) -> OrderTicket {
        OrderTicket {
            client_order_id: id.into(),
            token_id: "tok".into(),
            side,
            price,
            size,
        }
    }

    #[test]
    fn test_marketable_buy_fills_at_touch() {
        let mut sim = SimVenue::new(0.01, 0);
        sim.on_book_event(&snapshot("tok", &[], &[(0.50, 100.0)], 1), 1);

        let evs = sim.on_cmd(VenueCmd::Submit(ticket("o1", Side::Buy, 0.52, 30.0)), 10);
        assert!(matches!(evs[0], UserStreamEvent::OrderAck { .. }));
        match &evs[1] {
            UserStreamEvent::Fill(f) => {
                assert!((f.price - 0.50).abs() < 1e-9);
                assert!((f.size - 30.0).abs() < 1e-9);
                assert!((f.fee - 0.005 * 30.0).abs() < 1e-9);
            }
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(sim.resting_count(), 0);
    }

    #[test]
    fn test_partial_fill_rests_remainder() {
        let mut sim = SimVenue::new(0.0, 0);
        sim.on_book_event(&snapshot("tok", &[], &[(0.50, 20.0)], 1), 1);
        let evs = sim.on_cmd(VenueCmd::Submit(ticket("o1", Side::Buy, 0.50, 50.0)), 10);
        assert_eq!(evs.len(), 2); // ack + partial fill of 20
        assert_eq!(sim.resting_count(), 1);

        // More size appears at the ask: the rest fills.
        let evs = sim.on_book_event(&snapshot("tok", &[], &[(0.50, 100.0)], 2), 2);
        assert_eq!(evs.len(), 1);
        match &evs[0] {
            UserStreamEvent::Fill(f) => assert!((f.size - 30.0).abs() < 1e-9),
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(sim.resting_count(), 0);
    }

    #[test]
    fn test_non_marketable_rests_until_cross() {
        let mut sim = SimVenue::new(0.0, 0);
        sim.on_book_event(&snapshot("tok", &[], &[(0.50, 100.0)], 1), 1);
        let evs = sim.on_cmd(VenueCmd::Submit(ticket("o1", Side::Buy, 0.45, 10.0)), 10);
        assert_eq!(evs.len(), 1); // ack only
        assert_eq!(sim.resting_count(), 1);

        let evs = sim.on_book_event(&snapshot("tok", &[], &[(0.44, 50.0)], 2), 2);
        assert_eq!(evs.len(), 1);
        match &evs[0] {
            UserStreamEvent::Fill(f) => assert!((f.price - 0.44).abs() < 1e-9),
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[test]
    fn test_queue_delay_defers_resting_fill() {
        let mut sim = SimVenue::new(0.0, 1_000);
        sim.on_book_event(&snapshot("tok", &[], &[(0.50, 100.0)], 1), 1);
        sim.on_cmd(VenueCmd::Submit(ticket("o1", Side::Buy, 0.45, 10.0)), 10);

        // Crossed, but the order has not aged past the queue delay.
        let evs = sim.on_book_event(&snapshot("tok", &[], &[(0.44, 50.0)], 2), 2);
        assert!(evs.is_empty());
        // Same book later: now it fills.
        let ev = BookEvent {
            ts: 2_000,
            ..snapshot("tok", &[], &[(0.44, 50.0)], 3)
        };
        let evs = sim.on_book_event(&ev, 2_000);
        assert_eq!(evs.len(), 1);
    }

    #[test]
    fn test_sell_fills_at_bid() {
        let mut sim = SimVenue::new(0.0, 0);
        sim.on_book_event(&snapshot("tok", &[(0.48, 40.0)], &[], 1), 1);
        let evs = sim.on_cmd(VenueCmd::Submit(ticket("o1", Side::Sell, 0.48, 20.0)), 10);
        assert_eq!(evs.len(), 2);
        match &evs[1] {
            UserStreamEvent::Fill(f) => {
                assert_eq!(f.side, Side::Sell);
                assert!((f.price - 0.48).abs() < 1e-9);
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_removes_resting() {
        let mut sim = SimVenue::new(0.0, 0);
        sim.on_book_event(&snapshot("tok", &[], &[(0.50, 100.0)], 1), 1);
        sim.on_cmd(VenueCmd::Submit(ticket("o1", Side::Buy, 0.45, 10.0)), 10);
        let evs = sim.on_cmd(
            VenueCmd::Cancel {
                client_order_id: "o1".into(),
                venue_order_id: None,
            },
            20,
        );
        assert!(matches!(evs[0], UserStreamEvent::CancelAck { .. }));
        assert_eq!(sim.resting_count(), 0);
    }
}

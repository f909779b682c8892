//! Channel message types plus the prioritised inbound event queue.
//!
//! Every mutation of trading state enters the core through one of these
//! messages. The queue gives commands strict priority over private-stream
//! events, and private-stream events priority over book updates; on overflow
//! only book updates may be shed (oldest first).

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use super::commands::{Command, CommandResponse};
use super::types::{ErrorKind, Fill, TimeMs, TokenId};

// ─────────────────────────────────────────────────────────
// Market data events (market WS / REST → core)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// One price-level delta. `size == 0` removes the level.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LevelChange {
    pub side: BookSide,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BookEventKind {
    /// Full top-N snapshot (WS bootstrap or REST resync).
    Snapshot {
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
    },
    /// Incremental price-level deltas.
    Update { changes: Vec<LevelChange> },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BookEvent {
    pub token_id: TokenId,
    pub kind: BookEventKind,
    /// Venue update counter, strictly monotone per token.
    pub seq: u64,
    pub ts: TimeMs,
}

// ─────────────────────────────────────────────────────────
// Private stream events (user WS → core)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum UserStreamEvent {
    OrderAck {
        client_order_id: String,
        venue_order_id: String,
        ts: TimeMs,
    },
    Fill(Fill),
    CancelAck {
        client_order_id: String,
        ts: TimeMs,
    },
    Reject {
        client_order_id: String,
        reason: String,
        ts: TimeMs,
    },
}

impl UserStreamEvent {
    pub fn ts(&self) -> TimeMs {
        match self {
            UserStreamEvent::OrderAck { ts, .. }
            | UserStreamEvent::CancelAck { ts, .. }
            | UserStreamEvent::Reject { ts, .. } => *ts,
            UserStreamEvent::Fill(f) => f.ts,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Submit worker pool (core → pool → core)
// ─────────────────────────────────────────────────────────

/// Everything the signer/submitter needs; the core never hands out live
/// order references.
#[derive(Debug, Clone)]
pub struct OrderTicket {
    pub client_order_id: String,
    pub token_id: TokenId,
    pub side: super::types::Side,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone)]
pub enum VenueCmd {
    Submit(OrderTicket),
    Cancel {
        client_order_id: String,
        venue_order_id: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum SubmitResult {
    Accepted { venue_order_id: String },
    Rejected { reason: String },
    /// Venue 429 — the adaptive limiter halves its rate.
    RateLimited,
    /// Transport failure after retries; order state is unknown.
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub client_order_id: String,
    pub result: SubmitResult,
    pub ts: TimeMs,
}

/// Completion of a cancel dispatch. The authoritative CANCELLING→CANCELLED
/// transition still comes from the private stream.
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub client_order_id: String,
    pub ok: bool,
    pub rate_limited: bool,
    pub ts: TimeMs,
}

// ─────────────────────────────────────────────────────────
// Resync plumbing (core → REST fetcher)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResyncRequest {
    pub token_id: TokenId,
}

// ─────────────────────────────────────────────────────────
// Alerts
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    pub ts: TimeMs,
    pub kind: ErrorKind,
    pub component: &'static str,
    pub message: String,
    pub correlation_id: Option<String>,
}

// ─────────────────────────────────────────────────────────
// The core inbound event
// ─────────────────────────────────────────────────────────

/// A command plus the response slot the control plane is waiting on.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub cmd: Command,
    pub respond: Option<oneshot::Sender<CommandResponse>>,
}

#[derive(Debug)]
pub enum EngineEvent {
    Book(BookEvent),
    User(UserStreamEvent),
    Submit(SubmitOutcome),
    CancelDone(CancelOutcome),
    Command(CommandEnvelope),
    /// Periodic timer. Live: wall clock; backtest: virtual clock.
    Tick(TimeMs),
}

// ─────────────────────────────────────────────────────────
// Priority event queue
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub book_depth: usize,
    pub mid_depth: usize,
    pub ctrl_depth: usize,
    pub book_dropped: u64,
}

#[derive(Default)]
struct Lanes {
    /// Commands. Never dropped.
    ctrl: VecDeque<EngineEvent>,
    /// User stream, submit/cancel completions, ticks. Never dropped.
    mid: VecDeque<EngineEvent>,
    /// Book updates. Oldest shed on overflow.
    book: VecDeque<EngineEvent>,
    book_dropped: u64,
}

/// Single-consumer prioritised queue feeding the core loop.
pub struct EventQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
    space: Notify,
    book_capacity: usize,
    mid_capacity: usize,
}

impl EventQueue {
    pub fn new(book_capacity: usize, mid_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            space: Notify::new(),
            book_capacity,
            mid_capacity,
        })
    }

    /// Push a book event; sheds the oldest book event when full. Returns
    /// true if something was dropped so the producer can raise an alert.
    pub fn push_book(&self, ev: BookEvent) -> bool {
        let mut lanes = self.lanes.lock();
        let mut dropped = false;
        if lanes.book.len() >= self.book_capacity {
            lanes.book.pop_front();
            lanes.book_dropped += 1;
            dropped = true;
        }
        lanes.book.push_back(EngineEvent::Book(ev));
        drop(lanes);
        self.notify.notify_one();
        dropped
    }

    /// Push onto the never-drop lane, waiting for space if the consumer has
    /// fallen behind.
    pub async fn push_mid(&self, ev: EngineEvent) {
        loop {
            {
                let mut lanes = self.lanes.lock();
                if lanes.mid.len() < self.mid_capacity {
                    lanes.mid.push_back(ev);
                    drop(lanes);
                    self.notify.notify_one();
                    return;
                }
            }
            self.space.notified().await;
        }
    }

    pub async fn push_command(&self, env: CommandEnvelope) {
        loop {
            {
                let mut lanes = self.lanes.lock();
                if lanes.ctrl.len() < self.mid_capacity {
                    lanes.ctrl.push_back(EngineEvent::Command(env));
                    drop(lanes);
                    self.notify.notify_one();
                    return;
                }
            }
            self.space.notified().await;
        }
    }

    /// Single consumer. Priority: commands, then private-stream lane, then
    /// book updates.
    pub async fn recv(&self) -> EngineEvent {
        loop {
            {
                let mut lanes = self.lanes.lock();
                if let Some(ev) = lanes
                    .ctrl
                    .pop_front()
                    .or_else(|| lanes.mid.pop_front())
                    .or_else(|| lanes.book.pop_front())
                {
                    drop(lanes);
                    self.space.notify_waiters();
                    return ev;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking variant for the backtest drain loop.
    pub fn try_recv(&self) -> Option<EngineEvent> {
        let mut lanes = self.lanes.lock();
        let ev = lanes
            .ctrl
            .pop_front()
            .or_else(|| lanes.mid.pop_front())
            .or_else(|| lanes.book.pop_front());
        if ev.is_some() {
            self.space.notify_waiters();
        }
        ev
    }

    pub fn stats(&self) -> QueueStats {
        let lanes = self.lanes.lock();
        QueueStats {
            book_depth: lanes.book.len(),
            mid_depth: lanes.mid.len(),
            ctrl_depth: lanes.ctrl.len(),
            book_dropped: lanes.book_dropped,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn book_ev(seq: u64) -> BookEvent {
        BookEvent {
            token_id: "tok".into(),
            kind: BookEventKind::Update { changes: vec![] },
            seq,
            ts: seq as TimeMs,
        }
    }

    #[tokio::test]
    async fn test_priority_command_over_user_over_book() {
        let q = EventQueue::new(16, 16);
        q.push_book(book_ev(1));
        q.push_mid(EngineEvent::Tick(5)).await;
        q.push_command(CommandEnvelope {
            cmd: Command::Pause,
            respond: None,
        })
        .await;

        assert!(matches!(q.recv().await, EngineEvent::Command(_)));
        assert!(matches!(q.recv().await, EngineEvent::Tick(_)));
        assert!(matches!(q.recv().await, EngineEvent::Book(_)));
    }

    #[tokio::test]
    async fn test_book_overflow_sheds_oldest_only() {
        let q = EventQueue::new(2, 16);
        assert!(!q.push_book(book_ev(1)));
        assert!(!q.push_book(book_ev(2)));
        assert!(q.push_book(book_ev(3)));

        match q.recv().await {
            EngineEvent::Book(b) => assert_eq!(b.seq, 2),
            other => panic!("unexpected {other:?}"),
        }
        match q.recv().await {
            EngineEvent::Book(b) => assert_eq!(b.seq, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.stats().book_dropped, 1);
    }

    #[tokio::test]
    async fn test_user_lane_never_sheds() {
        let q = EventQueue::new(1, 4);
        for i in 0..4 {
            q.push_mid(EngineEvent::Tick(i)).await;
        }
        // Lane full: a fifth push must wait until the consumer drains one.
        let q2 = q.clone();
        let pusher = tokio::spawn(async move {
            q2.push_mid(EngineEvent::Tick(99)).await;
        });
        tokio::task::yield_now().await;
        assert!(!pusher.is_finished());

        let mut seen = vec![];
        for _ in 0..5 {
            if let EngineEvent::Tick(t) = q.recv().await {
                seen.push(t);
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 99]);
        pusher.await.unwrap();
    }
}

//! Order manager — the only owner of live order records.
//!
//! Submission pipeline: quantise → fingerprint → semantic dedupe → churn
//! governor → adaptive rate bucket → mint id → PENDING_SUBMIT → dispatch
//! ticket for the worker pool. The core never blocks on signing or HTTP;
//! completion comes back as a SubmitOutcome event.
//!
//! Lifecycle transitions are monotone and validated; a fill for an unknown
//! order id is surfaced to the caller as an invariant breach.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Thresholds;

use super::types::{
    Fill, Fingerprint, IntentPurpose, MarketId, Order, OrderIntent, OrderStatus, Side, TimeMs,
};
use super::messages::{OrderTicket, VenueCmd};

// ─────────────────────────────────────────────────────────
// Adaptive token bucket
// ─────────────────────────────────────────────────────────

/// Token bucket whose effective rate halves on a venue rate-limit reject and
/// additively recovers toward nominal over sustained clean traffic.
#[derive(Debug)]
pub struct TokenBucket {
    nominal_rate: f64,
    rate: f64,
    tokens: f64,
    last_refill: TimeMs,
    clean_streak: u32,
}

/// Clean dispatches needed before one additive recovery step.
const RECOVERY_STREAK: u32 = 10;

impl TokenBucket {
    pub fn new(nominal_rate: f64) -> Self {
        Self {
            nominal_rate,
            rate: nominal_rate,
            tokens: nominal_rate.max(1.0),
            last_refill: 0,
            clean_streak: 0,
        }
    }

    fn refill(&mut self, now: TimeMs) {
        if now <= self.last_refill {
            return;
        }
        let dt = (now - self.last_refill) as f64 / 1000.0;
        self.tokens = (self.tokens + dt * self.rate).min(self.rate.max(1.0));
        self.last_refill = now;
    }

    pub fn try_take(&mut self, now: TimeMs) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Multiplicative decrease on a venue 429.
    pub fn on_rate_limited(&mut self) {
        self.rate = (self.rate / 2.0).max(self.nominal_rate / 16.0);
        self.clean_streak = 0;
        warn!(rate = self.rate, nominal = self.nominal_rate, "rate limited, halving bucket rate");
    }

    /// Additive recovery after a clean dispatch.
    pub fn on_clean(&mut self) {
        if self.rate >= self.nominal_rate {
            return;
        }
        self.clean_streak += 1;
        if self.clean_streak >= RECOVERY_STREAK {
            self.clean_streak = 0;
            self.rate = (self.rate + self.nominal_rate / 10.0).min(self.nominal_rate);
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Runtime threshold changes move the nominal target; the effective
    /// rate keeps adapting from where it is.
    pub fn set_nominal(&mut self, nominal: f64) {
        self.nominal_rate = nominal;
        self.rate = self.rate.min(nominal);
    }
}

// ─────────────────────────────────────────────────────────
// Id generation
// ─────────────────────────────────────────────────────────

/// Live minting is random; backtests need reproducible ids so replays are
/// bit-identical.
#[derive(Debug)]
pub enum IdGen {
    Random,
    Sequential(u64),
}

impl IdGen {
    pub fn next(&mut self) -> String {
        match self {
            IdGen::Random => Uuid::new_v4().to_string(),
            IdGen::Sequential(n) => {
                *n += 1;
                format!("ord-{n:08}")
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Submission decisions
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SubmitDecision {
    /// Order accepted locally; dispatch this ticket to the worker pool.
    Dispatch(OrderTicket),
    /// A live order with the same fingerprint exists. Dropped silently.
    DuplicateDropped,
    /// Cancel churn for this market exceeded the window budget.
    ChurnRejected,
    /// Local bucket empty; nothing was dispatched.
    RateLimited,
    Invalid(String),
}

/// Result of applying a fill event.
#[derive(Debug)]
pub struct FillApplication {
    pub fill: Fill,
    pub order_status: OrderStatus,
    pub purpose: IntentPurpose,
    pub correlation_id: String,
    pub intent_price: f64,
    /// Venue reported more than remained; size was clamped.
    pub clamped: bool,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct OrderStats {
    pub submits: u64,
    pub dedupe_dropped: u64,
    pub churn_rejected: u64,
    pub rate_limited: u64,
    pub acks: u64,
    pub fills: u64,
    pub partial_fills: u64,
    pub cancels_requested: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub ttl_cancels: u64,
    pub overfill_clamps: u64,
}

// ─────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────

pub struct OrderManager {
    orders: HashMap<String, Order>,
    /// Fingerprint → client id, for non-terminal orders only. Enforces the
    /// "no two live orders share a fingerprint" invariant by construction.
    by_fingerprint: HashMap<Fingerprint, String>,
    by_venue_id: HashMap<String, String>,
    /// Cancel timestamps per market for the churn governor.
    cancel_times: HashMap<MarketId, VecDeque<TimeMs>>,
    submit_bucket: TokenBucket,
    cancel_bucket: TokenBucket,
    id_gen: IdGen,
    stats: OrderStats,
}

impl OrderManager {
    pub fn new(t: &Thresholds, id_gen: IdGen) -> Self {
        Self {
            orders: HashMap::new(),
            by_fingerprint: HashMap::new(),
            by_venue_id: HashMap::new(),
            cancel_times: HashMap::new(),
            submit_bucket: TokenBucket::new(t.submit_rate_per_sec),
            cancel_bucket: TokenBucket::new(t.cancel_rate_per_sec),
            id_gen,
            stats: OrderStats::default(),
        }
    }

    pub fn stats(&self) -> OrderStats {
        self.stats
    }

    pub fn apply_thresholds(&mut self, t: &Thresholds) {
        self.submit_bucket.set_nominal(t.submit_rate_per_sec);
        self.cancel_bucket.set_nominal(t.cancel_rate_per_sec);
    }

    // ─────────────────────────────────────────────────
    // Submit pipeline
    // ─────────────────────────────────────────────────

    pub fn submit(
        &mut self,
        intent: OrderIntent,
        tick_size: f64,
        lot_size: f64,
        ttl_ms: TimeMs,
        now: TimeMs,
        t: &Thresholds,
    ) -> SubmitDecision {
        let intent = intent.quantised(tick_size, lot_size);
        if !(intent.price > 0.0 && intent.price < 1.0) {
            return SubmitDecision::Invalid(format!("price out of range: {}", intent.price));
        }
        if intent.size <= 0.0 {
            return SubmitDecision::Invalid(format!("non-positive size: {}", intent.size));
        }

        let fingerprint = intent.fingerprint(tick_size, lot_size);
        if self.by_fingerprint.contains_key(&fingerprint) {
            self.stats.dedupe_dropped += 1;
            debug!(fp = %fingerprint, "duplicate intent dropped");
            return SubmitDecision::DuplicateDropped;
        }

        if self.recent_cancels(&intent.market_id, now, t) >= t.max_cancels_per_window {
            self.stats.churn_rejected += 1;
            return SubmitDecision::ChurnRejected;
        }

        if !self.submit_bucket.try_take(now) {
            self.stats.rate_limited += 1;
            return SubmitDecision::RateLimited;
        }

        let client_order_id = self.id_gen.next();
        let order = Order {
            client_order_id: client_order_id.clone(),
            venue_order_id: None,
            fingerprint: fingerprint.clone(),
            market_id: intent.market_id.clone(),
            token_id: intent.token_id.clone(),
            side: intent.side,
            purpose: intent.purpose,
            correlation_id: intent.correlation_id.clone(),
            price: intent.price,
            size: intent.size,
            remaining_size: intent.size,
            status: OrderStatus::PendingSubmit,
            created_at: now,
            last_update_at: now,
            ttl_ms,
        };
        let ticket = OrderTicket {
            client_order_id: client_order_id.clone(),
            token_id: order.token_id.clone(),
            side: order.side,
            price: order.price,
            size: order.size,
        };
        self.by_fingerprint.insert(fingerprint, client_order_id.clone());
        self.orders.insert(client_order_id, order);
        self.stats.submits += 1;
        SubmitDecision::Dispatch(ticket)
    }

    fn recent_cancels(&mut self, market_id: &str, now: TimeMs, t: &Thresholds) -> u32 {
        match self.cancel_times.get_mut(market_id) {
            Some(times) => {
                while matches!(times.front(), Some(ts) if now - ts > t.cancel_window_ms) {
                    times.pop_front();
                }
                times.len() as u32
            }
            None => 0,
        }
    }

    fn record_cancel_time(&mut self, market_id: &str, now: TimeMs) {
        self.cancel_times
            .entry(market_id.to_string())
            .or_default()
            .push_back(now);
    }

    // ─────────────────────────────────────────────────
    // Lifecycle transitions
    // ─────────────────────────────────────────────────

    fn set_status(&mut self, client_id: &str, to: OrderStatus, now: TimeMs) -> Result<(), String> {
        let order = self
            .orders
            .get_mut(client_id)
            .ok_or_else(|| format!("unknown order {client_id}"))?;
        if order.status == to {
            return Ok(());
        }
        if !order.status.can_transition(to) {
            return Err(format!(
                "illegal order transition {:?} -> {:?} for {client_id}",
                order.status, to
            ));
        }
        order.status = to;
        order.last_update_at = now;
        if to.is_terminal() {
            let fp = order.fingerprint.clone();
            self.by_fingerprint.remove(&fp);
        }
        Ok(())
    }

    /// Worker pool completion for a submit dispatch.
    pub fn on_submit_accepted(
        &mut self,
        client_id: &str,
        venue_order_id: &str,
        now: TimeMs,
    ) -> Result<(), String> {
        self.submit_bucket.on_clean();
        self.set_status(client_id, OrderStatus::Live, now)?;
        if let Some(order) = self.orders.get_mut(client_id) {
            order.venue_order_id = Some(venue_order_id.to_string());
        }
        self.by_venue_id
            .insert(venue_order_id.to_string(), client_id.to_string());
        self.stats.acks += 1;
        Ok(())
    }

    pub fn on_submit_rejected(&mut self, client_id: &str, now: TimeMs) -> Result<(), String> {
        self.stats.rejected += 1;
        self.set_status(client_id, OrderStatus::Rejected, now)
    }

    pub fn on_venue_rate_limited(&mut self, client_id: &str, now: TimeMs) -> Result<(), String> {
        self.submit_bucket.on_rate_limited();
        self.stats.rejected += 1;
        self.set_status(client_id, OrderStatus::Rejected, now)
    }

    /// Map a private-stream order id (venue or client form) onto ours.
    pub fn resolve_order_id(&self, id: &str) -> Option<String> {
        if self.orders.contains_key(id) {
            return Some(id.to_string());
        }
        self.by_venue_id.get(id).cloned()
    }

    /// Private-stream ack. May arrive after the REST completion already
    /// moved the order to Live; that repeat is a no-op.
    pub fn on_order_ack(
        &mut self,
        client_id: &str,
        venue_order_id: &str,
        now: TimeMs,
    ) -> Result<(), String> {
        let order = self
            .orders
            .get(client_id)
            .ok_or_else(|| format!("unknown order {client_id}"))?;
        if order.status == OrderStatus::PendingSubmit {
            self.set_status(client_id, OrderStatus::Live, now)?;
        }
        if let Some(order) = self.orders.get_mut(client_id) {
            order.venue_order_id = Some(venue_order_id.to_string());
        }
        self.by_venue_id
            .insert(venue_order_id.to_string(), client_id.to_string());
        Ok(())
    }

    /// Apply an authoritative fill. Zero-size fills are ignored (Ok(None));
    /// an unknown order id is the caller's invariant breach to escalate.
    pub fn on_fill(
        &mut self,
        order_id: &str,
        price: f64,
        size: f64,
        fee: f64,
        now: TimeMs,
    ) -> Result<Option<FillApplication>, String> {
        if size <= 0.0 {
            return Ok(None);
        }
        let client_id = self
            .resolve_order_id(order_id)
            .ok_or_else(|| format!("fill for unknown order id {order_id}"))?;
        let order = self
            .orders
            .get_mut(&client_id)
            .ok_or_else(|| format!("fill for unknown order id {order_id}"))?;

        if order.status.is_terminal() {
            return Err(format!(
                "fill for terminal order {client_id} ({:?})",
                order.status
            ));
        }

        let mut clamped = false;
        let mut applied = size;
        if applied > order.remaining_size + 1e-9 {
            applied = order.remaining_size;
            clamped = true;
            self.stats.overfill_clamps += 1;
            warn!(
                order = %client_id,
                reported = size,
                remaining = order.remaining_size,
                "fill exceeds remaining size, clamping"
            );
        }
        order.remaining_size -= applied;
        if order.remaining_size < 1e-9 {
            order.remaining_size = 0.0;
        }

        let fill = Fill {
            ts: now,
            market_id: order.market_id.clone(),
            token_id: order.token_id.clone(),
            side: order.side,
            price,
            size: applied,
            fee,
            client_order_id: client_id.clone(),
        };
        let purpose = order.purpose;
        let correlation_id = order.correlation_id.clone();
        let intent_price = order.price;

        let fully_filled = order.remaining_size == 0.0;
        let was_live = order.status == OrderStatus::Live;
        let status = if fully_filled {
            self.stats.fills += 1;
            self.set_status(&client_id, OrderStatus::Filled, now)?;
            OrderStatus::Filled
        } else {
            self.stats.partial_fills += 1;
            if was_live {
                self.set_status(&client_id, OrderStatus::PartiallyFilled, now)?;
            }
            self.orders
                .get(&client_id)
                .map(|o| o.status)
                .unwrap_or(OrderStatus::PartiallyFilled)
        };

        Ok(Some(FillApplication {
            fill,
            order_status: status,
            purpose,
            correlation_id,
            intent_price,
            clamped,
        }))
    }

    pub fn on_cancel_ack(&mut self, order_id: &str, now: TimeMs) -> Result<(), String> {
        let client_id = self
            .resolve_order_id(order_id)
            .ok_or_else(|| format!("cancel ack for unknown order id {order_id}"))?;
        self.stats.cancelled += 1;
        self.set_status(&client_id, OrderStatus::Cancelled, now)
    }

    pub fn on_reject(&mut self, order_id: &str, now: TimeMs) -> Result<(), String> {
        let client_id = self
            .resolve_order_id(order_id)
            .ok_or_else(|| format!("reject for unknown order id {order_id}"))?;
        self.stats.rejected += 1;
        self.set_status(&client_id, OrderStatus::Rejected, now)
    }

    // ─────────────────────────────────────────────────
    // Cancels
    // ─────────────────────────────────────────────────

    /// Request a cancel for one order. Consumes a cancel-bucket token and
    /// counts toward the market's churn window.
    pub fn request_cancel(&mut self, client_id: &str, now: TimeMs) -> Option<VenueCmd> {
        let order = self.orders.get(client_id)?;
        if !matches!(
            order.status,
            OrderStatus::Live | OrderStatus::PartiallyFilled | OrderStatus::PendingSubmit
        ) {
            return None;
        }
        if !self.cancel_bucket.try_take(now) {
            return None;
        }
        let market_id = order.market_id.clone();
        let venue_order_id = order.venue_order_id.clone();
        self.set_status(client_id, OrderStatus::Cancelling, now).ok()?;
        self.record_cancel_time(&market_id, now);
        self.stats.cancels_requested += 1;
        Some(VenueCmd::Cancel {
            client_order_id: client_id.to_string(),
            venue_order_id,
        })
    }

    /// TTL sweep. Any working order whose age reached its ttl (inclusive)
    /// moves to CANCELLING and yields a cancel command. Bucket-starved
    /// cancels are retried on the next sweep.
    pub fn ttl_scan(&mut self, now: TimeMs) -> Vec<VenueCmd> {
        let expired: Vec<String> = self
            .orders
            .values()
            .filter(|o| {
                matches!(o.status, OrderStatus::Live | OrderStatus::PartiallyFilled)
                    && o.is_expired(now)
            })
            .map(|o| o.client_order_id.clone())
            .collect();

        let mut cmds = Vec::new();
        for id in expired {
            if let Some(cmd) = self.request_cancel(&id, now) {
                self.stats.ttl_cancels += 1;
                cmds.push(cmd);
            }
        }
        cmds
    }

    /// Cancel every working order, optionally filtered to one market. Used
    /// by the flatten workflow; bypasses the cancel bucket so a safety stop
    /// is never throttled by our own limiter.
    pub fn flatten_cancel_all(&mut self, market_id: Option<&str>, now: TimeMs) -> Vec<VenueCmd> {
        let targets: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.status.is_working() || o.status == OrderStatus::PendingSubmit)
            .filter(|o| market_id.map(|m| o.market_id == m).unwrap_or(true))
            .filter(|o| o.status != OrderStatus::Cancelling)
            .map(|o| o.client_order_id.clone())
            .collect();

        let mut cmds = Vec::new();
        for id in targets {
            let (market, venue_id) = {
                let o = &self.orders[&id];
                (o.market_id.clone(), o.venue_order_id.clone())
            };
            if self.set_status(&id, OrderStatus::Cancelling, now).is_ok() {
                self.record_cancel_time(&market, now);
                self.stats.cancels_requested += 1;
                cmds.push(VenueCmd::Cancel {
                    client_order_id: id,
                    venue_order_id: venue_id,
                });
            }
        }
        cmds
    }

    // ─────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────

    pub fn get(&self, client_id: &str) -> Option<&Order> {
        self.orders.get(client_id)
    }

    pub fn working_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders
            .values()
            .filter(|o| o.status.is_working() || o.status == OrderStatus::PendingSubmit)
    }

    pub fn working_count(&self) -> usize {
        self.working_orders().count()
    }

    /// Non-terminal orders the venue never acknowledged — their true state
    /// at shutdown is unknown and must surface in the final report.
    pub fn unknown_state_orders(&self) -> Vec<&Order> {
        self.orders
            .values()
            .filter(|o| !o.status.is_terminal() && o.venue_order_id.is_none())
            .collect()
    }

    pub fn on_cancel_dispatch_rate_limited(&mut self) {
        self.cancel_bucket.on_rate_limited();
    }

    pub fn submit_rate(&self) -> f64 {
        self.submit_bucket.rate()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> Thresholds {
        Thresholds {
            max_cancels_per_window: 3,
            cancel_window_ms: 10_000,
            submit_rate_per_sec: 100.0,
            cancel_rate_per_sec: 100.0,
            ..Thresholds::default()
        }
    }

    fn intent(price: f64, size: f64) -> OrderIntent {
        OrderIntent {
            market_id: "m1".into(),
            token_id: "tok".into(),
            side: Side::Buy,
            price,
            size,
            purpose: IntentPurpose::ArbEntry,
            correlation_id: "c1".into(),
        }
    }

    fn manager(t: &Thresholds) -> OrderManager {
        OrderManager::new(t, IdGen::Sequential(0))
    }

    fn dispatch(om: &mut OrderManager, t: &Thresholds, i: OrderIntent, now: TimeMs) -> String {
        match om.submit(i, 0.001, 0.01, 30_000, now, t) {
            SubmitDecision::Dispatch(ticket) => ticket.client_order_id,
            other => panic!("expected dispatch, got {other:?}"),
        }
    }

    #[test]
    fn test_dedupe_idempotence() {
        let t = thresholds();
        let mut om = manager(&t);
        let id = dispatch(&mut om, &t, intent(0.48, 100.0), 1_000);
        om.on_submit_accepted(&id, "v1", 1_010).unwrap();

        // Identical intent while the first is live: silently dropped.
        assert!(matches!(
            om.submit(intent(0.48, 100.0), 0.001, 0.01, 30_000, 1_020, &t),
            SubmitDecision::DuplicateDropped
        ));
        assert_eq!(om.working_count(), 1);

        // Once the first terminates the fingerprint frees up.
        om.on_cancel_ack(&id, 2_000).unwrap();
        assert!(matches!(
            om.submit(intent(0.48, 100.0), 0.001, 0.01, 30_000, 2_010, &t),
            SubmitDecision::Dispatch(_)
        ));
    }

    #[test]
    fn test_dedupe_matches_after_quantisation() {
        let t = thresholds();
        let mut om = manager(&t);
        dispatch(&mut om, &t, intent(0.48, 100.0), 1_000);
        // Sub-tick noise quantises onto the same fingerprint.
        assert!(matches!(
            om.submit(intent(0.4800001, 100.0), 0.001, 0.01, 30_000, 1_005, &t),
            SubmitDecision::DuplicateDropped
        ));
    }

    #[test]
    fn test_churn_governor_blocks_after_cancel_burst() {
        let t = thresholds();
        let mut om = manager(&t);
        for i in 0..3 {
            let id = dispatch(&mut om, &t, intent(0.40 + i as f64 * 0.01, 10.0), 1_000 + i);
            om.on_submit_accepted(&id, &format!("v{i}"), 1_100).unwrap();
            assert!(om.request_cancel(&id, 2_000 + i).is_some());
            om.on_cancel_ack(&id, 2_100 + i).unwrap();
        }
        // Three cancels inside the window: next submit is refused.
        assert!(matches!(
            om.submit(intent(0.60, 10.0), 0.001, 0.01, 30_000, 3_000, &t),
            SubmitDecision::ChurnRejected
        ));
        // Window expired: submits flow again.
        assert!(matches!(
            om.submit(intent(0.60, 10.0), 0.001, 0.01, 30_000, 13_000, &t),
            SubmitDecision::Dispatch(_)
        ));
    }

    #[test]
    fn test_ttl_fires_exactly_at_deadline() {
        let t = thresholds();
        let mut om = manager(&t);
        let id = dispatch(&mut om, &t, intent(0.48, 100.0), 1_000);
        om.on_submit_accepted(&id, "v1", 1_001).unwrap();

        assert!(om.ttl_scan(30_999).is_empty());
        let cmds = om.ttl_scan(31_000); // created_at + ttl, inclusive
        assert_eq!(cmds.len(), 1);
        assert_eq!(om.get(&id).unwrap().status, OrderStatus::Cancelling);
        // Second sweep does not re-cancel.
        assert!(om.ttl_scan(31_100).is_empty());
    }

    #[test]
    fn test_fill_lifecycle_and_remaining_conservation() {
        let t = thresholds();
        let mut om = manager(&t);
        let id = dispatch(&mut om, &t, intent(0.48, 100.0), 1_000);
        om.on_submit_accepted(&id, "v1", 1_001).unwrap();

        let a = om.on_fill("v1", 0.48, 40.0, 0.1, 2_000).unwrap().unwrap();
        assert_eq!(a.order_status, OrderStatus::PartiallyFilled);
        let o = om.get(&id).unwrap();
        assert!((o.remaining_size + 40.0 - o.size).abs() < 1e-9);

        let b = om.on_fill("v1", 0.48, 60.0, 0.1, 3_000).unwrap().unwrap();
        assert_eq!(b.order_status, OrderStatus::Filled);
        assert_eq!(om.get(&id).unwrap().remaining_size, 0.0);
    }

    #[test]
    fn test_zero_size_fill_ignored() {
        let t = thresholds();
        let mut om = manager(&t);
        let id = dispatch(&mut om, &t, intent(0.48, 100.0), 1_000);
        om.on_submit_accepted(&id, "v1", 1_001).unwrap();
        assert!(om.on_fill("v1", 0.48, 0.0, 0.0, 2_000).unwrap().is_none());
        assert_eq!(om.get(&id).unwrap().remaining_size, 100.0);
    }

    #[test]
    fn test_overfill_clamps_and_flags() {
        let t = thresholds();
        let mut om = manager(&t);
        let id = dispatch(&mut om, &t, intent(0.48, 100.0), 1_000);
        om.on_submit_accepted(&id, "v1", 1_001).unwrap();
        let a = om.on_fill("v1", 0.48, 150.0, 0.0, 2_000).unwrap().unwrap();
        assert!(a.clamped);
        assert!((a.fill.size - 100.0).abs() < 1e-9);
        assert_eq!(a.order_status, OrderStatus::Filled);
    }

    #[test]
    fn test_unknown_order_fill_is_error() {
        let t = thresholds();
        let mut om = manager(&t);
        assert!(om.on_fill("ghost", 0.5, 10.0, 0.0, 1_000).is_err());
    }

    #[test]
    fn test_no_back_transition_out_of_terminal() {
        let t = thresholds();
        let mut om = manager(&t);
        let id = dispatch(&mut om, &t, intent(0.48, 100.0), 1_000);
        om.on_submit_accepted(&id, "v1", 1_001).unwrap();
        om.on_cancel_ack("v1", 2_000).unwrap();
        // A late fill against a cancelled order is an error, not a revival.
        assert!(om.on_fill("v1", 0.48, 10.0, 0.0, 3_000).is_err());
        assert_eq!(om.get(&id).unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_bucket_halves_and_recovers() {
        let mut b = TokenBucket::new(8.0);
        b.on_rate_limited();
        assert!((b.rate() - 4.0).abs() < 1e-9);
        b.on_rate_limited();
        assert!((b.rate() - 2.0).abs() < 1e-9);
        // Ten clean dispatches per additive step of nominal/10.
        for _ in 0..10 {
            b.on_clean();
        }
        assert!((b.rate() - 2.8).abs() < 1e-9);
        for _ in 0..1000 {
            b.on_clean();
        }
        assert!((b.rate() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_bucket_starves_then_refills() {
        let t = Thresholds {
            submit_rate_per_sec: 1.0,
            ..thresholds()
        };
        let mut om = manager(&t);
        // Burst capacity is one token at 1/s.
        assert!(matches!(
            om.submit(intent(0.40, 10.0), 0.001, 0.01, 30_000, 1_000, &t),
            SubmitDecision::Dispatch(_)
        ));
        assert!(matches!(
            om.submit(intent(0.41, 10.0), 0.001, 0.01, 30_000, 1_001, &t),
            SubmitDecision::RateLimited
        ));
        // A second later a token is back.
        assert!(matches!(
            om.submit(intent(0.41, 10.0), 0.001, 0.01, 30_000, 2_100, &t),
            SubmitDecision::Dispatch(_)
        ));
    }

    #[test]
    fn test_flatten_cancel_all_filters_and_bypasses_bucket() {
        let t = Thresholds {
            cancel_rate_per_sec: 0.001, // starved bucket
            ..thresholds()
        };
        let mut om = manager(&t);
        let a = dispatch(&mut om, &t, intent(0.40, 10.0), 1_000);
        om.on_submit_accepted(&a, "v1", 1_001).unwrap();
        let mut other = intent(0.40, 10.0);
        other.market_id = "m2".into();
        other.token_id = "tok2".into();
        let b = match om.submit(other, 0.001, 0.01, 30_000, 1_002, &t) {
            SubmitDecision::Dispatch(ticket) => ticket.client_order_id,
            other => panic!("{other:?}"),
        };
        om.on_submit_accepted(&b, "v2", 1_003).unwrap();

        let cmds = om.flatten_cancel_all(Some("m1"), 2_000);
        assert_eq!(cmds.len(), 1);
        let cmds = om.flatten_cancel_all(None, 2_001);
        assert_eq!(cmds.len(), 1); // m2 remains, m1 already cancelling
        assert_eq!(om.working_count(), 2); // both cancelling
    }
}

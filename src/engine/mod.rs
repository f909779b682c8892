//! The single-writer decision core.
//!
//! Every mutation of trading state — books, orders, positions, risk
//! counters, safety mode — happens on this one logical task, which drains a
//! prioritised inbound queue. I/O (websockets, REST, signing, persistence)
//! lives on sibling tasks behind bounded channels; the core suspends only
//! at queue operations.
//!
//! Outbound venue commands are staged in an outbox and drained at the end
//! of each event step: live mode forwards them to the submit worker pool,
//! dry-run acknowledges locally, and the backtest harness drains the outbox
//! into its simulator.

pub mod backtest;
pub mod book;
pub mod commands;
pub mod decay;
pub mod edge;
pub mod flatten;
pub mod messages;
pub mod orders;
pub mod registry;
pub mod risk;
pub mod slippage;
pub mod strategy;
pub mod types;
pub mod watchdog;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{BotMode, EngineConfig, Thresholds};
use crate::persistence::{EventRecord, JournalHandle, RecordKind};

use book::{ApplyOutcome, BookState};
use commands::{Command, CommandResponse};
use decay::EdgeDecayGuard;
use flatten::{FlattenStep, FlattenWorkflow};
use messages::{
    Alert, BookEvent, BookEventKind, CancelOutcome, CommandEnvelope, EngineEvent, EventQueue,
    ResyncRequest, SubmitOutcome, SubmitResult, UserStreamEvent, VenueCmd,
};
use orders::{IdGen, OrderManager, SubmitDecision};
use registry::MarketRegistry;
use risk::{RiskManager, TripReason};
use slippage::SlippageModel;
use strategy::{Strategy, StrategyDecision};
use types::{ErrorKind, IntentPurpose, OrderIntent, SafetyMode, TimeMs, TokenId};
use watchdog::UserStreamWatchdog;

// ─────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────

/// Channels to the I/O side. Absent senders (backtest, tests) leave staged
/// commands for the harness to drain.
pub struct EngineHandles {
    pub venue_tx: Option<mpsc::Sender<VenueCmd>>,
    pub resync_tx: Option<mpsc::Sender<ResyncRequest>>,
    pub journal: Option<JournalHandle>,
    /// Published every tick for the admin status endpoint.
    pub status_tx: Option<tokio::sync::watch::Sender<serde_json::Value>>,
}

impl EngineHandles {
    pub fn detached() -> Self {
        Self {
            venue_tx: None,
            resync_tx: None,
            journal: None,
            status_tx: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineReport {
    pub exit_code: i32,
    pub unknown_state_orders: Vec<String>,
    pub flatten_unclean: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

pub struct Engine {
    cfg: EngineConfig,
    thresholds: Thresholds,
    queue: Arc<EventQueue>,
    handles: EngineHandles,

    registry: MarketRegistry,
    book: BookState,
    slippage: SlippageModel,
    strategy: Strategy,
    orders: OrderManager,
    risk: RiskManager,
    decay: EdgeDecayGuard,
    watchdog: UserStreamWatchdog,
    flatten: FlattenWorkflow,

    corr_gen: IdGen,
    /// Virtual clock: the max event timestamp observed.
    now: TimeMs,
    stopping: bool,
    flatten_unclean: bool,
    last_book_dropped: u64,

    outbox: Vec<VenueCmd>,
    resync_outbox: Vec<ResyncRequest>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        registry: MarketRegistry,
        queue: Arc<EventQueue>,
        handles: EngineHandles,
        start: TimeMs,
    ) -> Self {
        let thresholds = cfg.thresholds.clone();
        let starting_mode = if cfg.start_paused {
            SafetyMode::Paused
        } else {
            SafetyMode::Running
        };
        let (order_ids, corr_gen) = match cfg.mode {
            BotMode::Live => (IdGen::Random, IdGen::Random),
            BotMode::Backtest => (IdGen::Sequential(0), IdGen::Sequential(0)),
        };
        Self {
            book: BookState::new(cfg.book_depth, cfg.resync_interval_ms, cfg.resync_seq_tolerance),
            slippage: SlippageModel::new(cfg.slippage_window),
            strategy: Strategy::new(),
            orders: OrderManager::new(&thresholds, order_ids),
            risk: RiskManager::new(starting_mode),
            decay: EdgeDecayGuard::new(cfg.edge_decay_window),
            watchdog: UserStreamWatchdog::new(start),
            flatten: FlattenWorkflow::new(cfg.flatten_mode),
            corr_gen,
            now: start,
            stopping: false,
            flatten_unclean: false,
            last_book_dropped: 0,
            outbox: Vec::new(),
            resync_outbox: Vec::new(),
            thresholds,
            cfg,
            queue,
            handles,
            registry,
        }
    }

    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn mode(&self) -> SafetyMode {
        self.risk.mode()
    }

    pub fn now(&self) -> TimeMs {
        self.now
    }

    // ─────────────────────────────────────────────────
    // Main loop
    // ─────────────────────────────────────────────────

    pub async fn run(mut self) -> Result<EngineReport> {
        info!(
            mode = ?self.cfg.mode,
            dry_run = self.cfg.dry_run,
            markets = self.registry.markets().count(),
            "engine core started"
        );

        loop {
            let ev = self.queue.recv().await;
            let flow = self.handle_event(ev).await;
            self.drain_outboxes().await;
            if flow == Flow::Stop {
                break;
            }
        }

        // Grace window: keep draining so late cancel acks can land.
        let grace = std::time::Duration::from_millis(500);
        let deadline = tokio::time::Instant::now() + grace;
        while self.orders.working_count() > 0 {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.queue.recv()).await {
                Ok(ev) => {
                    let _ = self.handle_event(ev).await;
                    self.drain_outboxes().await;
                }
                Err(_) => break,
            }
        }

        self.shutdown_report().await
    }

    async fn shutdown_report(self) -> Result<EngineReport> {
        let unknown: Vec<String> = self
            .orders
            .unknown_state_orders()
            .iter()
            .map(|o| o.client_order_id.clone())
            .collect();
        for id in &unknown {
            warn!(order = %id, "in-flight submit at stop: recording unknown_state");
        }
        if let Some(journal) = &self.handles.journal {
            journal.flush().await;
        }

        let invariant_tripped = self
            .risk
            .active_breakers(&self.thresholds)
            .contains(&TripReason::InvariantViolation);
        let exit_code = if self.flatten_unclean || invariant_tripped {
            3
        } else {
            0
        };
        info!(
            exit_code,
            unknown = unknown.len(),
            orders = ?self.orders.stats(),
            strategy = ?self.strategy.stats(),
            book = ?self.book.stats(),
            "engine core shut down"
        );
        Ok(EngineReport {
            exit_code,
            unknown_state_orders: unknown,
            flatten_unclean: self.flatten_unclean,
        })
    }

    // ─────────────────────────────────────────────────
    // Event dispatch
    // ─────────────────────────────────────────────────

    pub async fn handle_event(&mut self, ev: EngineEvent) -> Flow {
        match ev {
            EngineEvent::Book(book_ev) => {
                self.advance_clock(book_ev.ts);
                self.on_book_event(book_ev).await;
                Flow::Continue
            }
            EngineEvent::User(user_ev) => {
                self.advance_clock(user_ev.ts());
                self.on_user_event(user_ev).await;
                Flow::Continue
            }
            EngineEvent::Submit(outcome) => {
                self.advance_clock(outcome.ts);
                self.on_submit_outcome(outcome).await;
                Flow::Continue
            }
            EngineEvent::CancelDone(outcome) => {
                self.advance_clock(outcome.ts);
                self.on_cancel_outcome(outcome).await;
                Flow::Continue
            }
            EngineEvent::Command(env) => self.on_command(env).await,
            EngineEvent::Tick(ts) => {
                self.advance_clock(ts);
                self.on_tick().await;
                if self.stopping && self.orders.working_count() == 0 {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
        }
    }

    fn advance_clock(&mut self, ts: TimeMs) {
        if ts > self.now {
            self.now = ts;
        }
    }

    // ─────────────────────────────────────────────────
    // Book events
    // ─────────────────────────────────────────────────

    async fn on_book_event(&mut self, ev: BookEvent) {
        let token_id = ev.token_id.clone();
        let record_kind = match ev.kind {
            BookEventKind::Snapshot { .. } => RecordKind::BookSnapshot,
            BookEventKind::Update { .. } => RecordKind::BookUpdate,
        };
        let payload = serde_json::to_value(&ev).unwrap_or_default();

        match self.book.apply(ev) {
            ApplyOutcome::ResyncNeeded => {
                self.alert(
                    ErrorKind::SequenceGap,
                    "book",
                    format!("sequence gap on token {token_id}, resyncing"),
                    None,
                )
                .await;
                self.resync_outbox.push(ResyncRequest {
                    token_id: token_id.clone(),
                });
            }
            ApplyOutcome::Applied => {
                self.record(record_kind, payload).await;
                let market_id = self
                    .registry
                    .lookup_token(&token_id)
                    .map(|(m, _)| m.clone());
                if let Some(market_id) = market_id {
                    self.evaluate_market(&market_id).await;
                }
            }
            ApplyOutcome::Ignored | ApplyOutcome::Buffered => {}
        }
    }

    // ─────────────────────────────────────────────────
    // Private stream events
    // ─────────────────────────────────────────────────

    async fn on_user_event(&mut self, ev: UserStreamEvent) {
        self.watchdog.heartbeat(self.now);
        match ev {
            UserStreamEvent::OrderAck {
                client_order_id,
                venue_order_id,
                ..
            } => {
                if let Err(e) = self.orders.on_order_ack(&client_order_id, &venue_order_id, self.now)
                {
                    self.invariant_violation(format!("order ack: {e}")).await;
                }
            }
            UserStreamEvent::Fill(fill) => {
                let applied = match self.orders.on_fill(
                    &fill.client_order_id,
                    fill.price,
                    fill.size,
                    fill.fee,
                    fill.ts,
                ) {
                    Ok(Some(a)) => a,
                    Ok(None) => return, // zero-size
                    Err(e) => {
                        self.invariant_violation(format!("fill: {e}")).await;
                        return;
                    }
                };
                if applied.clamped {
                    self.alert(
                        ErrorKind::InvariantViolation,
                        "orders",
                        format!(
                            "fill exceeded remaining size on {} (clamped)",
                            applied.fill.client_order_id
                        ),
                        Some(applied.correlation_id.clone()),
                    )
                    .await;
                }

                self.risk.on_fill(&applied.fill);
                self.slippage.record_sample(
                    &applied.fill.market_id,
                    applied.fill.price - applied.intent_price,
                );
                if applied.purpose == IntentPurpose::ArbEntry {
                    self.decay.record_fill(
                        &applied.correlation_id,
                        &applied.fill.token_id,
                        applied.fill.price,
                        applied.fill.size,
                        applied.fill.fee,
                    );
                }

                let fill_payload = serde_json::to_value(&applied.fill).unwrap_or_default();
                self.record(RecordKind::Fill, fill_payload).await;
                self.record_order_status(&applied.fill.client_order_id).await;
                self.maybe_close_round_trip(&applied.correlation_id).await;
                self.check_risk().await;
            }
            UserStreamEvent::CancelAck {
                client_order_id, ..
            } => {
                if let Err(e) = self.orders.on_cancel_ack(&client_order_id, self.now) {
                    self.invariant_violation(format!("cancel ack: {e}")).await;
                    return;
                }
                if let Some(client) = self.orders.resolve_order_id(&client_order_id) {
                    self.record_order_status(&client).await;
                    let corr = self.orders.get(&client).map(|o| o.correlation_id.clone());
                    if let Some(corr) = corr {
                        self.maybe_close_round_trip(&corr).await;
                    }
                }
            }
            UserStreamEvent::Reject {
                client_order_id,
                reason,
                ..
            } => {
                if let Err(e) = self.orders.on_reject(&client_order_id, self.now) {
                    self.invariant_violation(format!("reject: {e}")).await;
                    return;
                }
                self.risk
                    .record_submit_outcome(true, self.thresholds.reject_window);
                self.alert(
                    ErrorKind::VenueReject,
                    "orders",
                    format!("order {client_order_id} rejected: {reason}"),
                    None,
                )
                .await;
                if let Some(client) = self.orders.resolve_order_id(&client_order_id) {
                    self.record_order_status(&client).await;
                    let corr = self.orders.get(&client).map(|o| o.correlation_id.clone());
                    if let Some(corr) = corr {
                        self.maybe_close_round_trip(&corr).await;
                    }
                }
                self.check_risk().await;
            }
        }
    }

    /// When every order sharing a correlation id is terminal, the round
    /// trip closes and the decay guard takes its sample.
    async fn maybe_close_round_trip(&mut self, correlation_id: &str) {
        let still_open = self
            .orders
            .working_orders()
            .any(|o| o.correlation_id == correlation_id);
        if still_open {
            return;
        }
        if let Some(market_id) = self.decay.close(correlation_id, &self.thresholds, self.now) {
            self.alert(
                ErrorKind::SafetyTripped,
                "decay",
                format!("market {market_id} disabled by edge decay"),
                Some(correlation_id.to_string()),
            )
            .await;
        }
    }

    // ─────────────────────────────────────────────────
    // Submit / cancel completions
    // ─────────────────────────────────────────────────

    async fn on_submit_outcome(&mut self, outcome: SubmitOutcome) {
        let id = outcome.client_order_id.clone();
        let result = match outcome.result {
            SubmitResult::Accepted { venue_order_id } => {
                self.risk
                    .record_submit_outcome(false, self.thresholds.reject_window);
                self.orders.on_submit_accepted(&id, &venue_order_id, self.now)
            }
            SubmitResult::Rejected { reason } => {
                self.risk
                    .record_submit_outcome(true, self.thresholds.reject_window);
                self.alert(
                    ErrorKind::VenueReject,
                    "orders",
                    format!("submit rejected for {id}: {reason}"),
                    None,
                )
                .await;
                self.orders.on_submit_rejected(&id, self.now)
            }
            SubmitResult::RateLimited => {
                self.risk
                    .record_submit_outcome(true, self.thresholds.reject_window);
                self.orders.on_venue_rate_limited(&id, self.now)
            }
            SubmitResult::Failed { error } => {
                // Transport failure: assume not placed, surface loudly.
                self.alert(
                    ErrorKind::TransientNetwork,
                    "orders",
                    format!("submit transport failure for {id}: {error}"),
                    None,
                )
                .await;
                self.orders.on_submit_rejected(&id, self.now)
            }
        };
        if let Err(e) = result {
            self.invariant_violation(format!("submit outcome: {e}")).await;
            return;
        }
        self.record_order_status(&id).await;
        let corr = self.orders.get(&id).map(|o| o.correlation_id.clone());
        if let Some(corr) = corr {
            self.maybe_close_round_trip(&corr).await;
        }
        self.check_risk().await;
    }

    async fn on_cancel_outcome(&mut self, outcome: CancelOutcome) {
        if outcome.rate_limited {
            self.orders.on_cancel_dispatch_rate_limited();
        }
        if !outcome.ok {
            self.alert(
                ErrorKind::TransientNetwork,
                "orders",
                format!("cancel dispatch failed for {}", outcome.client_order_id),
                None,
            )
            .await;
        }
    }

    // ─────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────

    async fn on_command(&mut self, env: CommandEnvelope) -> Flow {
        let CommandEnvelope { cmd, respond } = env;
        self.record(
            RecordKind::Command,
            serde_json::json!({ "command": format!("{cmd:?}") }),
        )
        .await;
        let (response, flow) = self.apply_command(cmd).await;
        if let Some(tx) = respond {
            let _ = tx.send(response);
        }
        flow
    }

    async fn apply_command(&mut self, cmd: Command) -> (CommandResponse, Flow) {
        match cmd {
            Command::Pause => match self.risk.transition(SafetyMode::Paused, self.now) {
                Ok(()) => {
                    self.record_safety_transition().await;
                    (CommandResponse::ok(), Flow::Continue)
                }
                Err(e) => (CommandResponse::refused(e), Flow::Continue),
            },
            Command::Resume => {
                if self.risk.mode() != SafetyMode::Paused {
                    return (
                        CommandResponse::refused(format!(
                            "resume only from PAUSED, mode is {}",
                            self.risk.mode().as_str()
                        )),
                        Flow::Continue,
                    );
                }
                let active = self.risk.active_breakers(&self.thresholds);
                if !active.is_empty() {
                    let names: Vec<&str> = active.iter().map(|r| r.as_str()).collect();
                    return (
                        CommandResponse::refused(format!("breakers active: {}", names.join(","))),
                        Flow::Continue,
                    );
                }
                match self.risk.transition(SafetyMode::Running, self.now) {
                    Ok(()) => {
                        // Silence accumulated while paused must not trip
                        // the watchdog on the next tick.
                        self.watchdog.heartbeat(self.now);
                        self.record_safety_transition().await;
                        (CommandResponse::ok(), Flow::Continue)
                    }
                    Err(e) => (CommandResponse::refused(e), Flow::Continue),
                }
            }
            Command::Flatten => {
                if self.risk.trip(TripReason::OperatorFlatten, self.now) {
                    self.begin_flatten().await;
                    (CommandResponse::ok(), Flow::Continue)
                } else {
                    (
                        CommandResponse::refused(format!(
                            "cannot flatten from {}",
                            self.risk.mode().as_str()
                        )),
                        Flow::Continue,
                    )
                }
            }
            Command::Reload => match self.cfg.reload_thresholds() {
                Ok(t) => {
                    self.thresholds = t;
                    self.orders.apply_thresholds(&self.thresholds);
                    (CommandResponse::ok(), Flow::Continue)
                }
                Err(e) => (CommandResponse::error(e.to_string()), Flow::Continue),
            },
            Command::Set(pairs) => match self.thresholds.apply_set(&pairs) {
                Ok(t) => {
                    self.thresholds = t;
                    self.orders.apply_thresholds(&self.thresholds);
                    (CommandResponse::ok(), Flow::Continue)
                }
                Err(e) => (CommandResponse::refused(e), Flow::Continue),
            },
            Command::Markets { enable, ids } => {
                let unknown = self.registry.set_enabled(&ids, enable);
                if enable {
                    for id in &ids {
                        self.decay.reenable(id);
                    }
                }
                if unknown.is_empty() {
                    (CommandResponse::ok(), Flow::Continue)
                } else if unknown.len() == ids.len() {
                    (
                        CommandResponse::refused(format!("unknown markets: {}", unknown.join(","))),
                        Flow::Continue,
                    )
                } else {
                    (
                        CommandResponse {
                            status: commands::CommandStatus::Ok,
                            reason: Some(format!("unknown markets: {}", unknown.join(","))),
                        },
                        Flow::Continue,
                    )
                }
            }
            Command::Backtest => match self.cfg.mode {
                BotMode::Live => (
                    CommandResponse::refused("backtest refused in live mode"),
                    Flow::Continue,
                ),
                BotMode::Backtest => (CommandResponse::ok(), Flow::Continue),
            },
            Command::Stop => {
                info!("stop requested: cancelling all working orders");
                self.stopping = true;
                let cmds = self.orders.flatten_cancel_all(None, self.now);
                let done = cmds.is_empty();
                self.outbox.extend(cmds);
                if let Some(journal) = &self.handles.journal {
                    journal.flush().await;
                }
                (
                    CommandResponse::ok(),
                    if done { Flow::Stop } else { Flow::Continue },
                )
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Ticks
    // ─────────────────────────────────────────────────

    async fn on_tick(&mut self) {
        // Mark open positions and evaluate breakers.
        let marks = self.current_marks();
        self.risk.mark_to_market(&marks, self.now);
        self.check_risk().await;

        // Watchdog on the private stream.
        if self
            .watchdog
            .should_trip(self.now, &self.thresholds, self.risk.mode())
        {
            self.alert(
                ErrorKind::SafetyTripped,
                "watchdog",
                format!(
                    "user stream silent for {} ms",
                    self.watchdog.silence_ms(self.now)
                ),
                None,
            )
            .await;
            if self.risk.trip(TripReason::UserStreamSilent, self.now) {
                self.begin_flatten().await;
            }
        }

        // Order TTLs.
        let cancels = self.orders.ttl_scan(self.now);
        self.outbox.extend(cancels);

        // Periodic REST resync.
        for token_id in self.book.periodic_resync_due(self.now) {
            self.resync_outbox.push(ResyncRequest { token_id });
        }

        // Flatten progress.
        self.step_flatten().await;

        // Strategy heartbeat across all markets (book triggers cover the
        // common path; this catches periodic re-evaluation).
        if self.risk.mode() == SafetyMode::Running {
            let market_ids: Vec<String> = self
                .registry
                .markets()
                .filter(|m| m.enabled)
                .map(|m| m.market_id.clone())
                .collect();
            for id in market_ids {
                self.evaluate_market(&id).await;
            }
        }

        // Status snapshot for the control plane.
        if let Some(tx) = &self.handles.status_tx {
            let _ = tx.send(self.status());
        }

        // Queue overflow surveillance.
        let dropped = self.queue.stats().book_dropped;
        if dropped > self.last_book_dropped {
            let delta = dropped - self.last_book_dropped;
            self.last_book_dropped = dropped;
            self.alert(
                ErrorKind::PersistenceBackpressure,
                "queue",
                format!("event queue shed {delta} book updates"),
                None,
            )
            .await;
        }
    }

    fn current_marks(&self) -> HashMap<TokenId, f64> {
        let mut marks = HashMap::new();
        for (_, token_id, _) in self.risk.open_positions() {
            if let Some(mid) = self.book.mid(&token_id) {
                marks.insert(token_id, mid);
            }
        }
        marks
    }

    async fn check_risk(&mut self) {
        if let Some(reason) = self.risk.check_breakers(&self.thresholds, self.now) {
            self.alert(
                ErrorKind::SafetyTripped,
                "risk",
                format!("circuit breaker: {}", reason.as_str()),
                None,
            )
            .await;
            self.begin_flatten().await;
        }
    }

    // ─────────────────────────────────────────────────
    // Strategy trigger
    // ─────────────────────────────────────────────────

    async fn evaluate_market(&mut self, market_id: &str) {
        let market = match self.registry.get(market_id) {
            Some(m) => m.clone(),
            None => return,
        };
        let correlation_id = self.corr_gen.next();
        let decision = self.strategy.decide(
            &self.book,
            &self.slippage,
            &self.thresholds,
            &market,
            self.risk.mode(),
            self.decay.is_disabled(market_id),
            correlation_id,
        );
        let (intents, quote) = match decision {
            StrategyDecision::EmitPair { intents, quote } => (intents, quote),
            StrategyDecision::Skip(_) => return,
        };

        let correlation_id = intents[0].correlation_id.clone();
        self.decay
            .register_entry(&correlation_id, market_id, quote.predicted_edge);

        let [yes_intent, no_intent] = intents;
        let first = self.submit_intent(yes_intent, &market.yes).await;
        let second = self.submit_intent(no_intent, &market.no).await;

        if first.is_none() && second.is_none() {
            // Nothing dispatched (typically fingerprint dedupe): drop the
            // round-trip tracking entry.
            self.decay.abandon(&correlation_id);
            return;
        }

        // A one-legged basket is directional exposure, not arbitrage: if the
        // second leg could not even be dispatched, pull the first back.
        if let (Some(first_id), None) = (&first, &second) {
            warn!(
                correlation = %correlation_id,
                "second leg not dispatched, cancelling first leg"
            );
            if let Some(cmd) = self.orders.request_cancel(first_id, self.now) {
                self.outbox.push(cmd);
            }
        }
    }

    /// Run one intent through the order manager; stage the dispatch ticket.
    async fn submit_intent(
        &mut self,
        intent: OrderIntent,
        token: &types::Token,
    ) -> Option<String> {
        // Unwind intents bypass the strategy gate but still go through the
        // same submission pipeline.
        let intent_payload = serde_json::to_value(&intent).unwrap_or_default();
        match self.orders.submit(
            intent,
            token.tick_size,
            token.lot_size,
            self.thresholds.order_ttl_ms,
            self.now,
            &self.thresholds,
        ) {
            SubmitDecision::Dispatch(ticket) => {
                let id = ticket.client_order_id.clone();
                self.record(RecordKind::OrderIntent, intent_payload).await;
                self.record_order_status(&id).await;
                self.outbox.push(VenueCmd::Submit(ticket));
                Some(id)
            }
            SubmitDecision::DuplicateDropped => None,
            SubmitDecision::ChurnRejected => {
                self.alert(
                    ErrorKind::Validation,
                    "orders",
                    "submit refused by churn governor".to_string(),
                    None,
                )
                .await;
                None
            }
            SubmitDecision::RateLimited => None,
            SubmitDecision::Invalid(reason) => {
                self.alert(ErrorKind::Validation, "orders", reason, None).await;
                None
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Flatten
    // ─────────────────────────────────────────────────

    async fn begin_flatten(&mut self) {
        self.record_safety_transition().await;
        let cmds = self.orders.flatten_cancel_all(None, self.now);
        self.outbox.extend(cmds);
        self.flatten.start(self.now, &self.thresholds);
        // Drive one step immediately so an empty book of orders completes
        // without waiting a tick.
        self.step_flatten().await;
    }

    async fn step_flatten(&mut self) {
        if !self.flatten.is_active() {
            return;
        }
        let cancels_outstanding = self.orders.working_count();
        let positions = self.risk.open_positions();
        match self
            .flatten
            .step(self.now, &self.thresholds, cancels_outstanding, &positions)
        {
            FlattenStep::Wait => {}
            FlattenStep::StartUnwind => {
                self.emit_unwinds().await;
            }
            FlattenStep::Complete { clean, residual } => {
                for (market, token, qty) in &residual {
                    self.record(
                        RecordKind::Position,
                        serde_json::json!({
                            "market_id": market,
                            "token_id": token,
                            "qty": qty,
                            "residual": true,
                        }),
                    )
                    .await;
                }
                self.flatten_unclean = !clean;
                if let Err(e) = self.risk.transition(SafetyMode::Safe, self.now) {
                    // Already SAFE via another path; anything else is a bug.
                    warn!(error = %e, "flatten completion transition");
                }
                self.record_safety_transition().await;
            }
        }

        // While unwinding, keep selling whatever has no working unwind yet.
        if matches!(self.flatten.state(), flatten::FlattenState::Unwinding { .. }) {
            self.emit_unwinds().await;
        }
    }

    async fn emit_unwinds(&mut self) {
        let mut positions = self.risk.open_positions();
        // Skip tokens that already carry a working unwind order.
        positions.retain(|(_, token_id, _)| {
            !self
                .orders
                .working_orders()
                .any(|o| o.token_id == *token_id && o.purpose == IntentPurpose::Unwind)
        });
        if positions.is_empty() {
            return;
        }
        let mut ids: Vec<String> = Vec::with_capacity(positions.len());
        for _ in 0..positions.len() {
            ids.push(self.corr_gen.next());
        }
        let mut ids_iter = ids.into_iter();
        let intents = self.flatten.unwind_intents(
            &self.book,
            &self.slippage,
            &self.registry,
            &self.thresholds,
            &positions,
            move || ids_iter.next().unwrap_or_default(),
        );
        for intent in intents {
            let token = match self
                .registry
                .lookup_token(&intent.token_id)
                .map(|(m, o)| (m.clone(), o))
            {
                Some((market_id, outcome)) => match self.registry.get(&market_id) {
                    Some(m) => m.token(outcome).clone(),
                    None => continue,
                },
                None => continue,
            };
            self.submit_intent(intent, &token).await;
        }
    }

    // ─────────────────────────────────────────────────
    // Invariants and alerts
    // ─────────────────────────────────────────────────

    async fn invariant_violation(&mut self, message: String) {
        self.alert(ErrorKind::InvariantViolation, "engine", message, None)
            .await;
        // The trip is recorded sticky either way; the mode only moves if we
        // were still RUNNING/PAUSED.
        if self.risk.trip(TripReason::InvariantViolation, self.now) {
            self.begin_flatten().await;
        }
    }

    async fn alert(
        &self,
        kind: ErrorKind,
        component: &'static str,
        message: String,
        correlation_id: Option<String>,
    ) {
        warn!(
            component,
            error_kind = kind.as_str(),
            correlation_id = correlation_id.as_deref().unwrap_or(""),
            "{message}"
        );
        let alert = Alert {
            ts: self.now,
            kind,
            component,
            message,
            correlation_id,
        };
        if let Some(journal) = &self.handles.journal {
            journal
                .record(EventRecord::new(
                    self.now,
                    RecordKind::Alert,
                    serde_json::to_value(&alert).unwrap_or_default(),
                ))
                .await;
        }
    }

    // ─────────────────────────────────────────────────
    // Persistence helpers
    // ─────────────────────────────────────────────────

    async fn record(&self, kind: RecordKind, payload: serde_json::Value) {
        if let Some(journal) = &self.handles.journal {
            journal.record(EventRecord::new(self.now, kind, payload)).await;
        }
    }

    /// Order status changes are critical: durable before the core proceeds.
    async fn record_order_status(&self, client_id: &str) {
        let order = match self.orders.get(client_id) {
            Some(o) => o,
            None => return,
        };
        if let Some(journal) = &self.handles.journal {
            journal
                .record_critical(EventRecord::new(
                    self.now,
                    RecordKind::OrderStatus,
                    serde_json::to_value(order).unwrap_or_default(),
                ))
                .await;
        }
    }

    async fn record_safety_transition(&self) {
        if let Some(journal) = &self.handles.journal {
            journal
                .record_critical(EventRecord::new(
                    self.now,
                    RecordKind::SafetyTransition,
                    serde_json::json!({ "mode": self.risk.mode().as_str() }),
                ))
                .await;
        }
    }

    // ─────────────────────────────────────────────────
    // Outbox draining
    // ─────────────────────────────────────────────────

    /// Take staged venue commands (backtest harness path).
    pub fn take_outbox(&mut self) -> Vec<VenueCmd> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_resync_outbox(&mut self) -> Vec<ResyncRequest> {
        std::mem::take(&mut self.resync_outbox)
    }

    async fn drain_outboxes(&mut self) {
        if self.cfg.dry_run && self.cfg.mode == BotMode::Live {
            // Acknowledge locally; no venue I/O, and no fills — the private
            // stream stays authoritative even in dry-run.
            let cmds = std::mem::take(&mut self.outbox);
            for cmd in cmds {
                match cmd {
                    VenueCmd::Submit(ticket) => {
                        let id = ticket.client_order_id;
                        let venue_id = format!("dry-{id}");
                        if self.orders.on_submit_accepted(&id, &venue_id, self.now).is_ok() {
                            self.record_order_status(&id).await;
                        }
                    }
                    VenueCmd::Cancel {
                        client_order_id, ..
                    } => {
                        if self.orders.on_cancel_ack(&client_order_id, self.now).is_ok() {
                            self.record_order_status(&client_order_id).await;
                        }
                    }
                }
            }
            self.resync_outbox.clear();
            return;
        }

        if let Some(tx) = &self.handles.venue_tx {
            for cmd in std::mem::take(&mut self.outbox) {
                let _ = tx.send(cmd).await;
            }
        }
        if let Some(tx) = &self.handles.resync_tx {
            for req in std::mem::take(&mut self.resync_outbox) {
                let _ = tx.send(req).await;
            }
        }
        // With no sinks attached (backtest, tests) the staged commands stay
        // for take_outbox().
    }

    pub fn risk_snapshot(&self) -> risk::RiskSnapshot {
        self.risk.snapshot(&self.thresholds)
    }

    pub fn order_stats(&self) -> orders::OrderStats {
        self.orders.stats()
    }

    pub fn decay_summary(&self) -> decay::DecaySummary {
        self.decay.summary()
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "mode": self.risk.mode().as_str(),
            "risk": self.risk.snapshot(&self.thresholds),
            "orders": self.orders.stats(),
            "strategy": self.strategy.stats(),
            "book": self.book.stats(),
            "queue": self.queue.stats(),
            "markets": self
                .registry
                .markets()
                .map(|m| {
                    serde_json::json!({
                        "market_id": m.market_id,
                        "enabled": m.enabled,
                        "decay_disabled": self.decay.is_disabled(&m.market_id),
                    })
                })
                .collect::<Vec<_>>(),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlattenMode, LabelMode, MarketDescriptor, OutcomeDescriptor};
    use super::messages::{BookLevel, BookSide, LevelChange};
    use super::types::{Fill, Side};

    fn descriptors() -> Vec<MarketDescriptor> {
        vec![MarketDescriptor {
            market_id: "m1".into(),
            outcomes: vec![
                OutcomeDescriptor {
                    label: "yes".into(),
                    token_id: "yes-tok".into(),
                    tick_size: 0.001,
                    lot_size: 0.01,
                },
                OutcomeDescriptor {
                    label: "no".into(),
                    token_id: "no-tok".into(),
                    tick_size: 0.001,
                    lot_size: 0.01,
                },
            ],
        }]
    }

    fn test_config(flatten_mode: FlattenMode) -> EngineConfig {
        EngineConfig {
            venue: crate::config::VenueConfig {
                ws_url: "wss://example/ws".into(),
                rest_url: "https://example".into(),
                data_url: "https://example".into(),
                chain_id: 137,
                signature_scheme: "eip712".into(),
                private_key: None,
                api_key: "k".into(),
                api_secret: secrecy::SecretString::from("s".to_string()),
                api_passphrase: secrecy::SecretString::from("p".to_string()),
            },
            markets: descriptors(),
            thresholds: Thresholds {
                fee_rate: 0.01,
                base_slippage: 0.0,
                slippage_k: 0.0,
                failure_buffer: 0.002,
                min_edge_threshold: 0.005,
                min_size: 5.0,
                target_size: 100.0,
                user_ws_timeout_sec: 15.0,
                ..Thresholds::default()
            },
            label_mode: LabelMode::Strict,
            flatten_mode,
            mode: BotMode::Backtest,
            dry_run: false,
            start_paused: false,
            db_path: "/tmp/unused".into(),
            book_depth: 10,
            resync_interval_ms: 60_000,
            resync_seq_tolerance: 2,
            slippage_window: 50,
            edge_decay_window: 30,
            tick_interval_ms: 250,
            event_queue_book_capacity: 1024,
            event_queue_mid_capacity: 8192,
            db_queue_capacity: 64,
            db_write_deadline_ms: 100,
            submit_pool_size: 2,
            admin_addr: "127.0.0.1:0".into(),
        }
    }

    fn engine(flatten_mode: FlattenMode) -> Engine {
        let cfg = test_config(flatten_mode);
        let registry =
            MarketRegistry::from_descriptors(&cfg.markets, cfg.label_mode).unwrap();
        let queue = EventQueue::new(cfg.event_queue_book_capacity, cfg.event_queue_mid_capacity);
        Engine::new(cfg, registry, queue, EngineHandles::detached(), 0)
    }

    fn snapshot(token: &str, asks: &[(f64, f64)], bids: &[(f64, f64)], seq: u64, ts: TimeMs) -> EngineEvent {
        EngineEvent::Book(BookEvent {
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
            ts,
        })
    }

    async fn seed_arb_books(e: &mut Engine) {
        e.handle_event(snapshot("yes-tok", &[(0.48, 100.0)], &[(0.46, 100.0)], 1, 1_000))
            .await;
        e.handle_event(snapshot("no-tok", &[(0.50, 100.0)], &[(0.47, 100.0)], 1, 1_000))
            .await;
    }

    fn submits(cmds: &[VenueCmd]) -> Vec<&messages::OrderTicket> {
        cmds.iter()
            .filter_map(|c| match c {
                VenueCmd::Submit(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_executable_edge_emits_paired_orders() {
        let mut e = engine(FlattenMode::CancelOnly);
        seed_arb_books(&mut e).await;
        let out = e.take_outbox();
        let tickets = submits(&out);
        assert_eq!(tickets.len(), 2);
        let tokens: Vec<&str> = tickets.iter().map(|t| t.token_id.as_str()).collect();
        assert!(tokens.contains(&"yes-tok"));
        assert!(tokens.contains(&"no-tok"));
        for t in &tickets {
            assert_eq!(t.side, Side::Buy);
            assert!((t.size - 100.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn test_no_intent_when_edge_below_threshold() {
        let mut e = engine(FlattenMode::CancelOnly);
        e.thresholds.fee_rate = 0.015; // edge 0.003 < 0.005
        seed_arb_books(&mut e).await;
        assert!(submits(&e.take_outbox()).is_empty());
    }

    #[tokio::test]
    async fn test_repeat_book_update_dedupes_resubmit() {
        let mut e = engine(FlattenMode::CancelOnly);
        seed_arb_books(&mut e).await;
        let first = e.take_outbox();
        assert_eq!(submits(&first).len(), 2);
        // Same prices again (new seq): fingerprint dedupe drops both legs.
        e.handle_event(EngineEvent::Book(BookEvent {
            token_id: "yes-tok".into(),
            kind: BookEventKind::Update {
                changes: vec![LevelChange {
                    side: BookSide::Bid,
                    price: 0.46,
                    size: 90.0,
                }],
            },
            seq: 2,
            ts: 1_100,
        }))
        .await;
        assert!(submits(&e.take_outbox()).is_empty());
    }

    #[tokio::test]
    async fn test_watchdog_silence_trips_to_safe() {
        let mut e = engine(FlattenMode::CancelOnly);
        seed_arb_books(&mut e).await;
        e.take_outbox();
        assert_eq!(e.mode(), SafetyMode::Running);

        // 15 s of silence, then a tick.
        e.handle_event(EngineEvent::Tick(16_001)).await;
        // No working orders were acked, so cancels resolve immediately and
        // the workflow completes into SAFE (possibly needing a step tick).
        e.handle_event(EngineEvent::Tick(16_002)).await;
        assert!(matches!(e.mode(), SafetyMode::Flattening | SafetyMode::Safe));

        // Books keep moving: no new arb intents while flattening/safe.
        e.handle_event(snapshot("yes-tok", &[(0.40, 100.0)], &[], 5, 17_000))
            .await;
        let out = e.take_outbox();
        assert!(submits(&out).is_empty());
    }

    #[tokio::test]
    async fn test_pause_inhibits_and_resume_restores() {
        let mut e = engine(FlattenMode::CancelOnly);
        let (resp, flow) = e.apply_command(Command::Pause).await;
        assert_eq!(resp.status, commands::CommandStatus::Ok);
        assert_eq!(flow, Flow::Continue);
        assert_eq!(e.mode(), SafetyMode::Paused);

        seed_arb_books(&mut e).await;
        assert!(submits(&e.take_outbox()).is_empty());

        let (resp, _) = e.apply_command(Command::Resume).await;
        assert_eq!(resp.status, commands::CommandStatus::Ok);
        assert_eq!(e.mode(), SafetyMode::Running);
        e.handle_event(EngineEvent::Tick(1_200)).await;
        assert_eq!(submits(&e.take_outbox()).len(), 2);
    }

    #[tokio::test]
    async fn test_set_command_atomic() {
        let mut e = engine(FlattenMode::CancelOnly);
        let (resp, _) = e
            .apply_command(Command::Set(vec![
                ("min_edge_threshold".into(), "0.02".into()),
                ("bogus".into(), "1".into()),
            ]))
            .await;
        assert_eq!(resp.status, commands::CommandStatus::Refused);
        assert!((e.thresholds.min_edge_threshold - 0.005).abs() < 1e-12);

        let (resp, _) = e
            .apply_command(Command::Set(vec![("min_edge_threshold".into(), "0.02".into())]))
            .await;
        assert_eq!(resp.status, commands::CommandStatus::Ok);
        // 0.008 edge now below the 0.02 bar.
        seed_arb_books(&mut e).await;
        assert!(submits(&e.take_outbox()).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_fill_is_invariant_violation() {
        let mut e = engine(FlattenMode::CancelOnly);
        seed_arb_books(&mut e).await;
        e.take_outbox();
        e.handle_event(EngineEvent::User(UserStreamEvent::Fill(Fill {
            ts: 2_000,
            market_id: "m1".into(),
            token_id: "yes-tok".into(),
            side: Side::Buy,
            price: 0.48,
            size: 10.0,
            fee: 0.0,
            client_order_id: "ghost".into(),
        })))
        .await;
        assert!(matches!(e.mode(), SafetyMode::Flattening | SafetyMode::Safe));
        // Sticky: resume must stay refused even after SAFE.
        let (resp, _) = e.apply_command(Command::Resume).await;
        assert_eq!(resp.status, commands::CommandStatus::Refused);
    }

    #[tokio::test]
    async fn test_flatten_cancel_and_unwind_round_trip() {
        let mut e = engine(FlattenMode::CancelAndUnwind);
        seed_arb_books(&mut e).await;
        let out = e.take_outbox();
        let tickets = submits(&out);
        let yes_ticket = tickets.iter().find(|t| t.token_id == "yes-tok").unwrap();
        let yes_id = yes_ticket.client_order_id.clone();
        let no_id = tickets
            .iter()
            .find(|t| t.token_id == "no-tok")
            .unwrap()
            .client_order_id
            .clone();

        // Venue accepts both; YES fills 20, NO rests unfilled.
        e.handle_event(EngineEvent::Submit(SubmitOutcome {
            client_order_id: yes_id.clone(),
            result: SubmitResult::Accepted {
                venue_order_id: "v-yes".into(),
            },
            ts: 1_100,
        }))
        .await;
        e.handle_event(EngineEvent::Submit(SubmitOutcome {
            client_order_id: no_id.clone(),
            result: SubmitResult::Accepted {
                venue_order_id: "v-no".into(),
            },
            ts: 1_100,
        }))
        .await;
        e.handle_event(EngineEvent::User(UserStreamEvent::Fill(Fill {
            ts: 1_200,
            market_id: "m1".into(),
            token_id: "yes-tok".into(),
            side: Side::Buy,
            price: 0.48,
            size: 20.0,
            fee: 0.0,
            client_order_id: yes_id.clone(),
        })))
        .await;
        e.take_outbox();

        // Operator flatten: cancels go out for both resting orders.
        let (resp, _) = e.apply_command(Command::Flatten).await;
        assert_eq!(resp.status, commands::CommandStatus::Ok);
        assert_eq!(e.mode(), SafetyMode::Flattening);
        let cancels = e.take_outbox();
        assert!(cancels
            .iter()
            .all(|c| matches!(c, VenueCmd::Cancel { .. })));
        assert_eq!(cancels.len(), 2);

        // Cancel acks arrive; the next tick starts the unwind: sell 20 YES
        // at the best bid 0.46.
        e.handle_event(EngineEvent::User(UserStreamEvent::CancelAck {
            client_order_id: yes_id.clone(),
            ts: 1_300,
        }))
        .await;
        e.handle_event(EngineEvent::User(UserStreamEvent::CancelAck {
            client_order_id: no_id.clone(),
            ts: 1_300,
        }))
        .await;
        e.handle_event(EngineEvent::Tick(1_400)).await;
        let out = e.take_outbox();
        let unwinds = submits(&out);
        assert_eq!(unwinds.len(), 1);
        assert_eq!(unwinds[0].side, Side::Sell);
        assert!((unwinds[0].size - 20.0).abs() < 1e-9);
        assert!((unwinds[0].price - 0.46).abs() < 1e-9);
        let unwind_id = unwinds[0].client_order_id.clone();

        // The unwind fills fully: position flat, SAFE entered.
        e.handle_event(EngineEvent::Submit(SubmitOutcome {
            client_order_id: unwind_id.clone(),
            result: SubmitResult::Accepted {
                venue_order_id: "v-unwind".into(),
            },
            ts: 1_500,
        }))
        .await;
        e.handle_event(EngineEvent::User(UserStreamEvent::Fill(Fill {
            ts: 1_600,
            market_id: "m1".into(),
            token_id: "yes-tok".into(),
            side: Side::Sell,
            price: 0.46,
            size: 20.0,
            fee: 0.0,
            client_order_id: unwind_id,
        })))
        .await;
        e.handle_event(EngineEvent::Tick(1_700)).await;
        assert_eq!(e.mode(), SafetyMode::Safe);
        assert!(!e.flatten_unclean);
    }

    #[tokio::test]
    async fn test_markets_off_gates_strategy() {
        let mut e = engine(FlattenMode::CancelOnly);
        let (resp, _) = e
            .apply_command(Command::Markets {
                enable: false,
                ids: vec!["m1".into()],
            })
            .await;
        assert_eq!(resp.status, commands::CommandStatus::Ok);
        seed_arb_books(&mut e).await;
        assert!(submits(&e.take_outbox()).is_empty());
    }

    #[tokio::test]
    async fn test_sequence_gap_requests_resync_and_blocks_reads() {
        let mut e = engine(FlattenMode::CancelOnly);
        seed_arb_books(&mut e).await;
        e.take_outbox();
        e.handle_event(EngineEvent::Book(BookEvent {
            token_id: "yes-tok".into(),
            kind: BookEventKind::Update {
                changes: vec![LevelChange {
                    side: BookSide::Ask,
                    price: 0.30,
                    size: 500.0,
                }],
            },
            seq: 9, // gap from 1
            ts: 2_000,
        }))
        .await;
        let reqs = e.take_resync_outbox();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].token_id, "yes-tok");
        // A juicy-looking edge is ignored while unreadable.
        e.handle_event(EngineEvent::Tick(2_100)).await;
        assert!(submits(&e.take_outbox()).is_empty());
    }

    #[tokio::test]
    async fn test_stop_reports_unknown_state() {
        let mut e = engine(FlattenMode::CancelOnly);
        seed_arb_books(&mut e).await;
        // Orders still PENDING_SUBMIT (no acks). Stop cancels + reports.
        let (resp, _) = e.apply_command(Command::Stop).await;
        assert_eq!(resp.status, commands::CommandStatus::Ok);
        let report = e.shutdown_report().await.unwrap();
        assert_eq!(report.exit_code, 0);
        // Both legs were dispatched but never acknowledged by the venue.
        assert_eq!(report.unknown_state_orders.len(), 2);
    }
}

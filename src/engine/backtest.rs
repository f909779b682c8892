//! Backtest harness — replays a recorded journal through the identical
//! decision core.
//!
//! The venue adapter is the simulator; wall-clock timers become virtual
//! ticks synthesized from event timestamps; the journal is read-only and
//! metrics land in an in-memory report. Replaying the same log twice must
//! produce bit-identical metrics, so the engine runs with sequential id
//! generation and no wall-clock reads.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

use crate::config::{BotMode, EngineConfig};
use crate::persistence::{read_events, RecordKind};
use crate::venue::sim::SimVenue;

use super::messages::{BookEvent, EngineEvent, EventQueue, UserStreamEvent};
use super::registry::MarketRegistry;
use super::types::TimeMs;
use super::{Engine, EngineHandles};

/// Queue-position heuristic for resting orders in the simulator.
const SIM_QUEUE_DELAY_MS: TimeMs = 250;

// ─────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BacktestReport {
    pub events_replayed: usize,
    pub final_equity: f64,
    pub max_drawdown: f64,
    pub realised_pnl: f64,
    pub unrealised_pnl: f64,
    pub trade_count: usize,
    pub win_rate: f64,
    pub submits: u64,
    pub fills: u64,
    pub partial_fills: u64,
    pub fill_ratio: f64,
    pub cancel_ratio: f64,
    pub reject_ratio: f64,
    pub partial_fill_frequency: f64,
    pub predicted_edge_mean: f64,
    pub realised_edge_mean: f64,
}

// ─────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────

pub async fn run_backtest(cfg: EngineConfig) -> Result<BacktestReport> {
    if cfg.mode != BotMode::Backtest {
        bail!("backtest harness requires BOT_MODE=backtest");
    }
    let records = read_events(&cfg.db_path)
        .with_context(|| format!("loading backtest journal {}", cfg.db_path))?;
    let book_events: Vec<BookEvent> = records
        .iter()
        .filter(|r| matches!(r.kind, RecordKind::BookSnapshot | RecordKind::BookUpdate))
        .filter_map(|r| serde_json::from_value(r.payload.clone()).ok())
        .collect();
    if book_events.is_empty() {
        bail!("journal holds no replayable book events");
    }

    let registry = MarketRegistry::from_descriptors(&cfg.markets, cfg.label_mode)?;
    let queue = EventQueue::new(cfg.event_queue_book_capacity, cfg.event_queue_mid_capacity);
    let start = book_events.first().map(|e| e.ts).unwrap_or(0);
    let tick_interval = cfg.tick_interval_ms as TimeMs;
    let fee_rate = cfg.thresholds.fee_rate;

    let mut engine = Engine::new(cfg, registry, queue, EngineHandles::detached(), start);
    let mut sim = SimVenue::new(fee_rate, SIM_QUEUE_DELAY_MS);

    let mut max_drawdown: f64 = 0.0;
    let mut next_tick = start + tick_interval;
    let replayed = book_events.len();

    for ev in book_events {
        // Virtual clock: fire every tick boundary the event skipped past.
        while ev.ts >= next_tick {
            engine.handle_event(EngineEvent::Tick(next_tick)).await;
            pump(&mut engine, &mut sim, next_tick).await;
            max_drawdown = max_drawdown.max(engine.risk_snapshot().drawdown);
            next_tick += tick_interval;
        }

        let now = ev.ts;
        // The simulator sees market data first (it is the venue), then the
        // engine; resulting private events flow back in arrival order.
        let sim_events = sim.on_book_event(&ev, now);
        engine.handle_event(EngineEvent::Book(ev)).await;
        feed_user_events(&mut engine, sim_events).await;
        pump(&mut engine, &mut sim, now).await;
        max_drawdown = max_drawdown.max(engine.risk_snapshot().drawdown);
    }

    // Final tick settles marks and TTL state.
    engine.handle_event(EngineEvent::Tick(next_tick)).await;
    pump(&mut engine, &mut sim, next_tick).await;
    max_drawdown = max_drawdown.max(engine.risk_snapshot().drawdown);

    let risk = engine.risk_snapshot();
    let orders = engine.order_stats();
    let decay = engine.decay_summary();

    let ratio = |num: u64, den: u64| if den > 0 { num as f64 / den as f64 } else { 0.0 };
    let report = BacktestReport {
        events_replayed: replayed,
        final_equity: risk.equity,
        max_drawdown,
        realised_pnl: risk.realised_pnl,
        unrealised_pnl: risk.unrealised_pnl,
        trade_count: decay.trades,
        win_rate: if decay.trades > 0 {
            decay.wins as f64 / decay.trades as f64
        } else {
            0.0
        },
        submits: orders.submits,
        fills: orders.fills,
        partial_fills: orders.partial_fills,
        fill_ratio: ratio(orders.fills, orders.submits),
        cancel_ratio: ratio(orders.cancelled, orders.submits),
        reject_ratio: ratio(orders.rejected, orders.submits),
        partial_fill_frequency: ratio(orders.partial_fills, orders.fills + orders.partial_fills),
        predicted_edge_mean: decay.mean_predicted,
        realised_edge_mean: decay.mean_realised,
    };
    info!(?report, "backtest complete");
    Ok(report)
}

/// Drain engine venue commands into the simulator, and the simulator's
/// private events back into the engine, until the step quiesces.
async fn pump(engine: &mut Engine, sim: &mut SimVenue, now: TimeMs) {
    loop {
        let cmds = engine.take_outbox();
        engine.take_resync_outbox(); // the sim's book is never gapped
        if cmds.is_empty() {
            break;
        }
        let mut user_events = Vec::new();
        for cmd in cmds {
            user_events.extend(sim.on_cmd(cmd, now));
        }
        feed_user_events(engine, user_events).await;
    }
}

async fn feed_user_events(engine: &mut Engine, events: Vec<UserStreamEvent>) {
    for ev in events {
        engine.handle_event(EngineEvent::User(ev)).await;
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlattenMode, LabelMode, MarketDescriptor, OutcomeDescriptor, Thresholds, VenueConfig};
    use crate::engine::messages::{BookEventKind, BookLevel};
    use crate::persistence::EventRecord;

    fn config(db_path: String) -> EngineConfig {
        EngineConfig {
            venue: VenueConfig {
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
            markets: vec![MarketDescriptor {
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
            }],
            thresholds: Thresholds {
                fee_rate: 0.0,
                base_slippage: 0.0,
                slippage_k: 0.0,
                failure_buffer: 0.002,
                min_edge_threshold: 0.005,
                min_size: 5.0,
                target_size: 50.0,
                user_ws_timeout_sec: 1e9,
                ..Thresholds::default()
            },
            label_mode: LabelMode::Strict,
            flatten_mode: FlattenMode::CancelOnly,
            mode: BotMode::Backtest,
            dry_run: false,
            start_paused: false,
            db_path,
            book_depth: 10,
            resync_interval_ms: 600_000,
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

    fn snapshot_record(token: &str, bids: &[(f64, f64)], asks: &[(f64, f64)], seq: u64, ts: TimeMs) -> EventRecord {
        let ev = BookEvent {
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
        };
        EventRecord::new(ts, RecordKind::BookSnapshot, serde_json::to_value(&ev).unwrap())
    }

    fn write_journal(records: &[EventRecord]) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");
        let mut body = String::new();
        for r in records {
            body.push_str(&serde_json::to_string(r).unwrap());
            body.push('\n');
        }
        std::fs::write(&path, body).unwrap();
        let p = path.to_string_lossy().to_string();
        (dir, p)
    }

    fn arb_journal() -> Vec<EventRecord> {
        vec![
            // Discounted basket: 0.48 + 0.50 < 1 with depth on both sides.
            snapshot_record("yes-tok", &[(0.46, 100.0)], &[(0.48, 100.0)], 1, 1_000),
            snapshot_record("no-tok", &[(0.47, 100.0)], &[(0.50, 100.0)], 1, 1_001),
            // Books refresh; prices drift up so the basket closes rich.
            snapshot_record("yes-tok", &[(0.49, 100.0)], &[(0.51, 100.0)], 2, 2_000),
            snapshot_record("no-tok", &[(0.50, 100.0)], &[(0.52, 100.0)], 2, 2_001),
        ]
    }

    #[tokio::test]
    async fn test_backtest_executes_arb_and_accounts() {
        let (_dir, path) = write_journal(&arb_journal());
        let report = run_backtest(config(path)).await.unwrap();

        assert_eq!(report.events_replayed, 4);
        assert!(report.submits >= 2);
        assert!(report.fills >= 2);
        // Bought 50 of each leg at 0.48/0.50, marked at 0.50/0.51 mids.
        assert!(report.final_equity > 0.0);
        assert!(report.unrealised_pnl > 0.0);
        assert!((report.fill_ratio - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_backtest_determinism_bit_identical() {
        let (_dir, path) = write_journal(&arb_journal());
        let a = run_backtest(config(path.clone())).await.unwrap();
        let b = run_backtest(config(path)).await.unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn test_backtest_no_trades_without_edge() {
        let records = vec![
            snapshot_record("yes-tok", &[(0.49, 100.0)], &[(0.52, 100.0)], 1, 1_000),
            snapshot_record("no-tok", &[(0.48, 100.0)], &[(0.51, 100.0)], 1, 1_001),
        ];
        let (_dir, path) = write_journal(&records);
        let report = run_backtest(config(path)).await.unwrap();
        assert_eq!(report.submits, 0);
        assert_eq!(report.final_equity, 0.0);
    }

    #[tokio::test]
    async fn test_backtest_rejects_empty_journal() {
        let (_dir, path) = write_journal(&[]);
        assert!(run_backtest(config(path)).await.is_err());
    }
}

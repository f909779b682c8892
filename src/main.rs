//! Process bootstrap and task supervision.
//!
//! Exit codes: 0 normal, 1 configuration error, 2 unrecoverable venue
//! error, 3 safety trip with unclean flatten.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use pm_parity_arb::admin::serve_admin;
use pm_parity_arb::config::{BotMode, EngineConfig};
use pm_parity_arb::engine::backtest::run_backtest;
use pm_parity_arb::engine::messages::EventQueue;
use pm_parity_arb::engine::registry::MarketRegistry;
use pm_parity_arb::engine::{Engine, EngineHandles};
use pm_parity_arb::persistence::spawn_journal;
use pm_parity_arb::venue::market_ws::{MarketWsConfig, MarketWsReader};
use pm_parity_arb::venue::rest::{backfill_fill_ids, spawn_resync_fetcher, RestClient};
use pm_parity_arb::venue::user_ws::{UserWsConfig, UserWsListener};
use pm_parity_arb::venue::{init_signer, now_ms, spawn_submit_pool};

fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let file_appender = tracing_appender::rolling::daily("logs", "parity_bot.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(file_writer.and(std::io::stdout))
        .init();

    let cfg = match EngineConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "runtime init failed");
            return ExitCode::from(2);
        }
    };

    let code = runtime.block_on(async move {
        match cfg.mode {
            BotMode::Backtest => run_backtest_mode(cfg).await,
            BotMode::Live => run_live_mode(cfg).await,
        }
    });
    ExitCode::from(code)
}

async fn run_backtest_mode(cfg: EngineConfig) -> u8 {
    match run_backtest(cfg).await {
        Ok(report) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).unwrap_or_default()
            );
            0
        }
        Err(e) => {
            error!(error = %e, "backtest failed");
            1
        }
    }
}

async fn run_live_mode(mut cfg: EngineConfig) -> u8 {
    let registry = match MarketRegistry::from_descriptors(&cfg.markets, cfg.label_mode) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "market validation failed");
            return 1;
        }
    };

    let rest = match RestClient::new(&cfg.venue.rest_url, &cfg.venue.data_url) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "venue client init failed");
            return 2;
        }
    };

    // Signer unavailable forces DRY_RUN regardless of configuration.
    let signer = init_signer(cfg.venue.private_key.as_ref(), &cfg.venue.signature_scheme);
    if signer.is_none() {
        cfg.dry_run = true;
    }

    let (journal, journal_task) =
        match spawn_journal(&cfg.db_path, cfg.db_queue_capacity, cfg.db_write_deadline_ms).await {
            Ok(j) => j,
            Err(e) => {
                error!(error = %e, "journal init failed");
                return 1;
            }
        };

    let queue = EventQueue::new(cfg.event_queue_book_capacity, cfg.event_queue_mid_capacity);
    let (venue_tx, venue_rx) = mpsc::channel(256);
    let (resync_tx, resync_rx) = mpsc::channel(256);
    let (status_tx, status_rx) = watch::channel(serde_json::json!({"mode": "starting"}));

    // I/O workers.
    let pool_task = spawn_submit_pool(
        Arc::clone(&rest),
        signer,
        venue_rx,
        Arc::clone(&queue),
        cfg.submit_pool_size,
    );
    let resync_task = spawn_resync_fetcher(Arc::clone(&rest), resync_rx, Arc::clone(&queue));

    let market_task = tokio::spawn(
        MarketWsReader::new(
            MarketWsConfig {
                ws_url: cfg.venue.ws_url.clone(),
                token_ids: registry.token_ids(),
                ping_interval: Duration::from_secs(10),
            },
            Arc::clone(&queue),
            resync_tx.clone(),
        )
        .run(),
    );

    let backfill = backfill_fill_ids(&rest).await;
    let user_task = tokio::spawn(
        UserWsListener::new(
            UserWsConfig {
                ws_url: cfg.venue.ws_url.clone(),
                api_key: cfg.venue.api_key.clone(),
                api_secret: cfg.venue.api_secret.clone(),
                api_passphrase: cfg.venue.api_passphrase.clone(),
                chain_id: cfg.venue.chain_id,
                ping_interval: Duration::from_secs(10),
            },
            Arc::clone(&queue),
            backfill,
        )
        .run(),
    );

    // Wall-clock ticks for the core.
    let tick_task = tokio::spawn({
        let queue = Arc::clone(&queue);
        let interval_ms = cfg.tick_interval_ms;
        async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                queue
                    .push_mid(pm_parity_arb::engine::messages::EngineEvent::Tick(now_ms()))
                    .await;
            }
        }
    });

    let admin_task = tokio::spawn({
        let queue = Arc::clone(&queue);
        let addr = cfg.admin_addr.parse();
        async move {
            match addr {
                Ok(addr) => {
                    if let Err(e) = serve_admin(queue, status_rx, addr).await {
                        error!(error = %e, "admin endpoint failed");
                    }
                }
                Err(e) => error!(error = %e, "invalid ADMIN_ADDR"),
            }
        }
    });

    let handles = EngineHandles {
        venue_tx: Some(venue_tx),
        resync_tx: Some(resync_tx),
        journal: Some(journal),
        status_tx: Some(status_tx),
    };
    let engine = Engine::new(cfg, registry, Arc::clone(&queue), handles, now_ms());

    let report = match engine.run().await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "engine loop failed");
            return 2;
        }
    };

    // Engine is done: tear the task tree down and let the journal drain.
    for task in [market_task, user_task, tick_task, admin_task] {
        task.abort();
    }
    pool_task.abort();
    resync_task.abort();
    let _ = tokio::time::timeout(Duration::from_secs(2), journal_task).await;

    info!(exit_code = report.exit_code, "shutdown complete");
    report.exit_code as u8
}

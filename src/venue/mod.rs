//! Venue adapters: websocket readers, REST client, signer seam, and the
//! bounded submit worker pool.
//!
//! The trading core never performs I/O or signing itself — it stages
//! `VenueCmd`s, this pool signs and ships them with bounded concurrency,
//! and completions return to the core as queue events.

pub mod market_ws;
pub mod rest;
pub mod sim;
pub mod user_ws;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::engine::messages::{
    CancelOutcome, EngineEvent, EventQueue, OrderTicket, SubmitOutcome, VenueCmd,
};
use crate::engine::types::TimeMs;

pub fn now_ms() -> TimeMs {
    chrono::Utc::now().timestamp_millis()
}

// ─────────────────────────────────────────────────────────
// Signing seam
// ─────────────────────────────────────────────────────────

/// Venue order signing (EIP-712 over the order struct) is delegated to an
/// external implementation behind this trait. If none can be initialised
/// the engine is forced into DRY_RUN and never reaches this seam.
pub trait OrderSigner: Send + Sync {
    /// Produce the signed order payload for `POST /order`.
    fn sign_order(&self, ticket: &OrderTicket) -> Result<serde_json::Value>;

    /// Signature scheme tag advertised to the venue.
    fn scheme(&self) -> &str;
}

/// Resolve a signer from the environment. The in-tree build carries no
/// venue SDK, so a configured private key without an external signer still
/// forces DRY_RUN — loudly.
pub fn init_signer(
    private_key: Option<&secrecy::SecretString>,
    scheme: &str,
) -> Option<Arc<dyn OrderSigner>> {
    match private_key {
        None => {
            warn!("no private key configured: DRY_RUN forced");
            None
        }
        Some(_) => {
            warn!(
                scheme,
                "no external signer linked for this scheme: DRY_RUN forced"
            );
            None
        }
    }
}

// ─────────────────────────────────────────────────────────
// Submit worker pool
// ─────────────────────────────────────────────────────────

/// Spawn the signer/submitter pool. Concurrency is bounded by a semaphore
/// sized to the venue's published budget; each completed dispatch reports
/// back through the priority queue's never-drop lane.
pub fn spawn_submit_pool(
    rest: Arc<rest::RestClient>,
    signer: Option<Arc<dyn OrderSigner>>,
    mut rx: mpsc::Receiver<VenueCmd>,
    queue: Arc<EventQueue>,
    concurrency: usize,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(concurrency, "submit pool started");
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut dispatched: u64 = 0;

        while let Some(cmd) = rx.recv().await {
            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            dispatched += 1;
            let rest = Arc::clone(&rest);
            let signer = signer.clone();
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let _permit = permit;
                match cmd {
                    VenueCmd::Submit(ticket) => {
                        let outcome = submit_one(&rest, signer.as_deref(), &ticket).await;
                        queue
                            .push_mid(EngineEvent::Submit(SubmitOutcome {
                                client_order_id: ticket.client_order_id,
                                result: outcome,
                                ts: now_ms(),
                            }))
                            .await;
                    }
                    VenueCmd::Cancel {
                        client_order_id,
                        venue_order_id,
                    } => {
                        let target = venue_order_id.as_deref().unwrap_or(&client_order_id);
                        let (ok, rate_limited) = match rest.cancel_order(target).await {
                            Ok(rest::CancelResult::Done) => (true, false),
                            Ok(rest::CancelResult::RateLimited) => (false, true),
                            Err(e) => {
                                warn!(order = %client_order_id, error = %e, "cancel dispatch failed");
                                (false, false)
                            }
                        };
                        queue
                            .push_mid(EngineEvent::CancelDone(CancelOutcome {
                                client_order_id,
                                ok,
                                rate_limited,
                                ts: now_ms(),
                            }))
                            .await;
                    }
                }
            });
        }
        info!(dispatched, "submit pool shut down");
    })
}

async fn submit_one(
    rest: &rest::RestClient,
    signer: Option<&dyn OrderSigner>,
    ticket: &OrderTicket,
) -> crate::engine::messages::SubmitResult {
    use crate::engine::messages::SubmitResult;

    let signer = match signer {
        Some(s) => s,
        None => {
            // Should be unreachable: DRY_RUN short-circuits before dispatch.
            return SubmitResult::Failed {
                error: "signer unavailable".into(),
            };
        }
    };
    let signed = match signer.sign_order(ticket) {
        Ok(s) => s,
        Err(e) => {
            return SubmitResult::Failed {
                error: format!("signing failed: {e}"),
            }
        }
    };
    match rest.submit_order(&signed).await {
        Ok(r) => r,
        Err(e) => SubmitResult::Failed {
            error: e.to_string(),
        },
    }
}

//! HTTP control plane.
//!
//! Two routes: `POST /command` parses a command line and serialises it onto
//! the core loop (response carried back over a oneshot), and `GET /status`
//! serves the engine's latest tick snapshot. The admin task never touches
//! engine state directly — it is just another producer on the priority
//! queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::engine::commands::{parse_command, CommandResponse};
use crate::engine::messages::{CommandEnvelope, EventQueue};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AdminState {
    queue: Arc<EventQueue>,
    status_rx: watch::Receiver<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CommandBody {
    pub line: String,
}

pub fn router(queue: Arc<EventQueue>, status_rx: watch::Receiver<serde_json::Value>) -> Router {
    Router::new()
        .route("/command", post(handle_command))
        .route("/status", get(handle_status))
        .with_state(AdminState { queue, status_rx })
}

pub async fn serve_admin(
    queue: Arc<EventQueue>,
    status_rx: watch::Receiver<serde_json::Value>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let app = router(queue, status_rx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_command(
    State(state): State<AdminState>,
    Json(body): Json<CommandBody>,
) -> Json<CommandResponse> {
    let cmd = match parse_command(&body.line) {
        Ok(cmd) => cmd,
        Err(e) => return Json(CommandResponse::refused(e)),
    };
    let (tx, rx) = oneshot::channel();
    state
        .queue
        .push_command(CommandEnvelope {
            cmd,
            respond: Some(tx),
        })
        .await;
    match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
        Ok(Ok(resp)) => Json(resp),
        Ok(Err(_)) => Json(CommandResponse::error("engine dropped the command")),
        Err(_) => {
            warn!(line = %body.line, "command response timed out");
            Json(CommandResponse::error("timed out waiting for the engine"))
        }
    }
}

async fn handle_status(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(state.status_rx.borrow().clone())
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

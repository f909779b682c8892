//! Public market stream reader.
//!
//! Subscribes to the venue's market channel for every registered token and
//! turns `snapshot` / `update` frames into BookEvents on the droppable book
//! lane. Reconnects with jittered exponential backoff capped at 30 s; every
//! reconnect re-requests REST snapshots so each token re-anchors its
//! sequence.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::engine::messages::{
    BookEvent, BookEventKind, BookLevel, BookSide, EventQueue, LevelChange, ResyncRequest,
};
use crate::engine::types::TokenId;

use super::now_ms;

const BACKOFF_CAP: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────
// Wire parsing helpers
// ─────────────────────────────────────────────────────────

/// Venue JSON encodes numbers both as numbers and as strings.
pub(crate) fn parse_f64_field(val: &Value, field: &str) -> Option<f64> {
    val.get(field).and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
    })
}

pub(crate) fn parse_u64_field(val: &Value, field: &str) -> Option<u64> {
    val.get(field).and_then(|v| {
        v.as_u64()
            .or_else(|| v.as_str().and_then(|s| s.parse::<u64>().ok()))
    })
}

pub(crate) fn parse_levels(val: &Value, field: &str) -> Vec<BookLevel> {
    val.get(field)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|lvl| {
                    Some(BookLevel {
                        price: parse_f64_field(lvl, "price")?,
                        size: parse_f64_field(lvl, "size")?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse one market frame into a BookEvent, or None for anything else
/// (heartbeats, subscription acks).
pub(crate) fn parse_market_frame(val: &Value, ts: i64) -> Option<BookEvent> {
    let kind = val
        .get("type")
        .or_else(|| val.get("event_type"))
        .and_then(|v| v.as_str())?;
    let token_id: TokenId = val
        .get("token")
        .or_else(|| val.get("token_id"))
        .or_else(|| val.get("asset_id"))
        .and_then(|v| v.as_str())?
        .to_string();
    let seq = parse_u64_field(val, "seq")?;

    let kind = if kind.eq_ignore_ascii_case("snapshot") || kind.eq_ignore_ascii_case("book") {
        BookEventKind::Snapshot {
            bids: parse_levels(val, "bids"),
            asks: parse_levels(val, "asks"),
        }
    } else if kind.eq_ignore_ascii_case("update") || kind.eq_ignore_ascii_case("price_change") {
        let changes = val
            .get("changes")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| {
                        let side = match c.get("side").and_then(|v| v.as_str())? {
                            s if s.eq_ignore_ascii_case("bid") || s.eq_ignore_ascii_case("buy") => {
                                BookSide::Bid
                            }
                            s if s.eq_ignore_ascii_case("ask") || s.eq_ignore_ascii_case("sell") => {
                                BookSide::Ask
                            }
                            _ => return None,
                        };
                        Some(LevelChange {
                            side,
                            price: parse_f64_field(c, "price")?,
                            size: parse_f64_field(c, "size")?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        BookEventKind::Update { changes }
    } else {
        return None;
    };

    Some(BookEvent {
        token_id,
        kind,
        seq,
        ts,
    })
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MarketWsConfig {
    pub ws_url: String,
    pub token_ids: Vec<TokenId>,
    pub ping_interval: Duration,
}

pub struct MarketWsReader {
    cfg: MarketWsConfig,
    queue: Arc<EventQueue>,
    resync_tx: mpsc::Sender<ResyncRequest>,
}

impl MarketWsReader {
    pub fn new(
        cfg: MarketWsConfig,
        queue: Arc<EventQueue>,
        resync_tx: mpsc::Sender<ResyncRequest>,
    ) -> Self {
        Self {
            cfg,
            queue,
            resync_tx,
        }
    }

    pub async fn run(self) {
        info!(
            url = %self.cfg.ws_url,
            tokens = self.cfg.token_ids.len(),
            "market stream reader started"
        );
        let mut backoff = Duration::from_millis(500);
        let mut connects: u64 = 0;

        loop {
            match self.connect_and_read().await {
                Ok(()) => {
                    info!("market stream closed by server");
                    backoff = Duration::from_millis(500);
                }
                Err(e) => {
                    warn!(error = %e, "market stream error");
                }
            }
            connects += 1;

            // Jittered exponential backoff, capped at 30 s.
            let jitter = {
                let mut rng = rand::thread_rng();
                1.0 + rng.gen_range(-0.2..0.2)
            };
            let wait = backoff.mul_f64(jitter).min(BACKOFF_CAP);
            info!(reconnects = connects, wait_ms = wait.as_millis() as u64, "reconnecting market stream");
            sleep(wait).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn connect_and_read(&self) -> anyhow::Result<()> {
        let (ws, _) = tokio::time::timeout(
            Duration::from_secs(10),
            connect_async(&self.cfg.ws_url),
        )
        .await
        .map_err(|_| anyhow::anyhow!("connect timeout"))??;
        info!("market stream connected");

        let (mut write, mut read) = ws.split();
        let subscribe = json!({
            "type": "market",
            "operation": "subscribe",
            "assets_ids": self.cfg.token_ids,
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        // Re-anchor every token via REST after (re)connecting.
        for token_id in &self.cfg.token_ids {
            let _ = self
                .resync_tx
                .send(ResyncRequest {
                    token_id: token_id.clone(),
                })
                .await;
        }

        let ping_interval = self.cfg.ping_interval;
        let keepalive = tokio::spawn(async move {
            let mut interval = tokio::time::interval(ping_interval);
            loop {
                interval.tick().await;
                if write.send(Message::Text("PING".into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    let frames = match value {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    for frame in &frames {
                        if let Some(ev) = parse_market_frame(frame, now_ms()) {
                            if self.queue.push_book(ev) {
                                debug!("book lane overflow: oldest update shed");
                            }
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    keepalive.abort();
                    return Err(e.into());
                }
                _ => {}
            }
        }
        keepalive.abort();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot_frame() {
        let frame = json!({
            "type": "snapshot",
            "market": "m1",
            "token": "tok-1",
            "bids": [{"price": "0.48", "size": "100"}, {"price": 0.47, "size": 50}],
            "asks": [{"price": "0.50", "size": "80"}],
            "seq": 42,
        });
        let ev = parse_market_frame(&frame, 1_000).unwrap();
        assert_eq!(ev.token_id, "tok-1");
        assert_eq!(ev.seq, 42);
        match ev.kind {
            BookEventKind::Snapshot { bids, asks } => {
                assert_eq!(bids.len(), 2);
                assert!((bids[0].price - 0.48).abs() < 1e-9);
                assert_eq!(asks.len(), 1);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_frame() {
        let frame = json!({
            "type": "update",
            "token": "tok-1",
            "changes": [
                {"side": "bid", "price": "0.46", "size": "0"},
                {"side": "ask", "price": "0.51", "size": "25"},
            ],
            "seq": "43",
        });
        let ev = parse_market_frame(&frame, 1_000).unwrap();
        assert_eq!(ev.seq, 43);
        match ev.kind {
            BookEventKind::Update { changes } => {
                assert_eq!(changes.len(), 2);
                assert_eq!(changes[0].side, BookSide::Bid);
                assert_eq!(changes[0].size, 0.0);
                assert_eq!(changes[1].side, BookSide::Ask);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_non_book_frames_ignored() {
        assert!(parse_market_frame(&json!({"type": "subscribed"}), 0).is_none());
        assert!(parse_market_frame(&json!({"type": "update", "token": "t"}), 0).is_none()); // no seq
        assert!(parse_market_frame(&json!("PONG"), 0).is_none());
    }
}

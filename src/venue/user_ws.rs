//! Authenticated user stream listener.
//!
//! The private channel is the single source of truth for order lifecycle:
//! acks, fills, cancel acks and rejects all enter the core from here, on
//! the never-drop lane. The subscribe payload carries the api key,
//! passphrase and an HMAC over `(timestamp, method, path, body)`.
//!
//! A bounded TTL dedupe cache is kept across reconnects so replayed fill
//! events cannot double-count inventory; it is warmed at startup from the
//! REST fills backfill.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::engine::messages::{EngineEvent, EventQueue, UserStreamEvent};
use crate::engine::types::{Fill, Side, TimeMs};

use super::market_ws::parse_f64_field;
use super::now_ms;

const BACKOFF_CAP: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct UserWsConfig {
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: SecretString,
    pub api_passphrase: SecretString,
    pub chain_id: u64,
    pub ping_interval: Duration,
}

// ─────────────────────────────────────────────────────────
// Auth
// ─────────────────────────────────────────────────────────

/// HMAC-SHA256 over `timestamp + method + path + body`, base64 encoded.
pub(crate) fn auth_signature(
    secret: &str,
    timestamp: i64,
    method: &str,
    path: &str,
    body: &str,
) -> String {
    let message = format!("{timestamp}{method}{path}{body}");
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha256>::new_from_slice(b"").unwrap());
    mac.update(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

// ─────────────────────────────────────────────────────────
// Cross-reconnect fill dedupe
// ─────────────────────────────────────────────────────────

/// Bounded TTL cache keyed on venue event identity. Kept across reconnects
/// so a replay window after resubscribe cannot double-count.
#[derive(Debug)]
pub(crate) struct DedupCache {
    seen_at: HashMap<String, TimeMs>,
    ttl_ms: TimeMs,
    max_entries: usize,
}

impl DedupCache {
    pub(crate) fn new(ttl_ms: TimeMs, max_entries: usize) -> Self {
        Self {
            seen_at: HashMap::with_capacity(max_entries.min(4096)),
            ttl_ms,
            max_entries,
        }
    }

    pub(crate) fn preload(&mut self, keys: impl IntoIterator<Item = String>, now: TimeMs) {
        for key in keys {
            self.seen_at.insert(key, now);
        }
        self.evict_oldest_if_needed();
    }

    /// Returns true if the key is new.
    pub(crate) fn remember(&mut self, key: String, now: TimeMs) -> bool {
        self.evict_expired(now);
        if self.seen_at.contains_key(&key) {
            return false;
        }
        self.seen_at.insert(key, now);
        self.evict_oldest_if_needed();
        true
    }

    fn evict_expired(&mut self, now: TimeMs) {
        let cutoff = now - self.ttl_ms;
        self.seen_at.retain(|_, ts| *ts >= cutoff);
    }

    fn evict_oldest_if_needed(&mut self) {
        while self.seen_at.len() > self.max_entries {
            let oldest = self
                .seen_at
                .iter()
                .min_by_key(|(_, ts)| **ts)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.seen_at.remove(&key);
                }
                None => break,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Event parsing
// ─────────────────────────────────────────────────────────

fn order_id_of(val: &Value) -> Option<String> {
    val.get("client_order_id")
        .or_else(|| val.get("order_id"))
        .or_else(|| val.get("orderID"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn event_identity(val: &Value, order_id: &str, price: f64, size: f64) -> String {
    match val.get("id").and_then(|v| v.as_str()) {
        Some(id) => format!("tid:{id}"),
        None => format!("fill:{order_id}:{price:.8}:{size:.8}"),
    }
}

/// Parse one private frame. Fills are deduped; everything else passes
/// through (repeat acks are idempotent in the order manager).
pub(crate) fn parse_user_frame(
    val: &Value,
    dedup: &mut DedupCache,
    now: TimeMs,
) -> Option<UserStreamEvent> {
    let kind = val
        .get("event_type")
        .or_else(|| val.get("type"))
        .and_then(|v| v.as_str())?;

    if kind.eq_ignore_ascii_case("order_ack") {
        return Some(UserStreamEvent::OrderAck {
            client_order_id: val
                .get("client_order_id")
                .and_then(|v| v.as_str())?
                .to_string(),
            venue_order_id: val
                .get("order_id")
                .or_else(|| val.get("orderID"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            ts: now,
        });
    }
    if kind.eq_ignore_ascii_case("cancel_ack") {
        return Some(UserStreamEvent::CancelAck {
            client_order_id: order_id_of(val)?,
            ts: now,
        });
    }
    if kind.eq_ignore_ascii_case("reject") {
        return Some(UserStreamEvent::Reject {
            client_order_id: order_id_of(val)?,
            reason: val
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified")
                .to_string(),
            ts: now,
        });
    }
    if kind.eq_ignore_ascii_case("fill") || kind.eq_ignore_ascii_case("trade") {
        let order_id = order_id_of(val)?;
        let price = parse_f64_field(val, "price")?;
        let size = parse_f64_field(val, "size")?;
        if size <= 0.0 || price <= 0.0 {
            return None;
        }
        let key = event_identity(val, &order_id, price, size);
        if !dedup.remember(key, now) {
            debug!(order = %order_id, "duplicate fill event dropped");
            return None;
        }
        let side = match val.get("side").and_then(|v| v.as_str()) {
            Some(s) if s.eq_ignore_ascii_case("sell") => Side::Sell,
            _ => Side::Buy,
        };
        return Some(UserStreamEvent::Fill(Fill {
            ts: now,
            market_id: val
                .get("market")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            token_id: val
                .get("asset_id")
                .or_else(|| val.get("token_id"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            side,
            price,
            size,
            fee: parse_f64_field(val, "fee").unwrap_or(0.0),
            client_order_id: order_id,
        }));
    }
    None
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

pub struct UserWsListener {
    cfg: UserWsConfig,
    queue: Arc<EventQueue>,
    /// Fill ids from the REST backfill, preloaded into the dedupe cache.
    backfill_ids: Vec<String>,
}

impl UserWsListener {
    pub fn new(cfg: UserWsConfig, queue: Arc<EventQueue>, backfill_ids: Vec<String>) -> Self {
        Self {
            cfg,
            queue,
            backfill_ids,
        }
    }

    pub async fn run(self) {
        info!(url = %self.cfg.ws_url, "user stream listener started");
        // 15 min TTL covers typical reconnect replay windows.
        let mut dedup = DedupCache::new(15 * 60 * 1000, 50_000);
        dedup.preload(
            self.backfill_ids.iter().map(|id| format!("tid:{id}")),
            now_ms(),
        );

        let mut backoff = Duration::from_millis(500);
        loop {
            match self.connect_and_listen(&mut dedup).await {
                Ok(()) => {
                    info!("user stream closed by server");
                    backoff = Duration::from_millis(500);
                }
                Err(e) => warn!(error = %e, "user stream error"),
            }
            let jitter = {
                let mut rng = rand::thread_rng();
                1.0 + rng.gen_range(-0.2..0.2)
            };
            let wait = backoff.mul_f64(jitter).min(BACKOFF_CAP);
            info!(wait_ms = wait.as_millis() as u64, "reconnecting user stream");
            sleep(wait).await;
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
    }

    async fn connect_and_listen(&self, dedup: &mut DedupCache) -> anyhow::Result<()> {
        let (ws, _) = tokio::time::timeout(
            Duration::from_secs(10),
            connect_async(&self.cfg.ws_url),
        )
        .await
        .map_err(|_| anyhow::anyhow!("connect timeout"))??;
        info!("user stream connected");

        let (mut write, mut read) = ws.split();

        let timestamp = now_ms();
        let path = "/ws/user";
        let signature = auth_signature(
            self.cfg.api_secret.expose_secret(),
            timestamp,
            "GET",
            path,
            "",
        );
        let subscribe = json!({
            "type": "user",
            "operation": "subscribe",
            "auth": {
                "api_key": self.cfg.api_key,
                "passphrase": self.cfg.api_passphrase.expose_secret(),
                "timestamp": timestamp,
                "signature": signature,
                "chain_id": self.cfg.chain_id,
            },
        });
        write.send(Message::Text(subscribe.to_string())).await?;

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
                        if let Some(ev) = parse_user_frame(frame, dedup, now_ms()) {
                            self.queue.push_mid(EngineEvent::User(ev)).await;
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
    fn test_auth_signature_is_stable() {
        let a = auth_signature("secret", 1_700_000_000_000, "GET", "/ws/user", "");
        let b = auth_signature("secret", 1_700_000_000_000, "GET", "/ws/user", "");
        assert_eq!(a, b);
        // Any component change perturbs the MAC.
        assert_ne!(a, auth_signature("secret", 1_700_000_000_001, "GET", "/ws/user", ""));
        assert_ne!(a, auth_signature("secret", 1_700_000_000_000, "POST", "/ws/user", ""));
        assert_ne!(a, auth_signature("other", 1_700_000_000_000, "GET", "/ws/user", ""));
    }

    #[test]
    fn test_parse_fill_frame_with_dedup() {
        let mut dedup = DedupCache::new(60_000, 64);
        let frame = json!({
            "event_type": "fill",
            "id": "t-1",
            "order_id": "o-1",
            "asset_id": "tok-1",
            "side": "buy",
            "price": "0.48",
            "size": "25",
            "fee": "0.1",
        });
        match parse_user_frame(&frame, &mut dedup, 1_000) {
            Some(UserStreamEvent::Fill(f)) => {
                assert!((f.price - 0.48).abs() < 1e-9);
                assert!((f.size - 25.0).abs() < 1e-9);
                assert_eq!(f.client_order_id, "o-1");
            }
            other => panic!("expected fill, got {other:?}"),
        }
        // Replay of the same trade id is swallowed.
        assert!(parse_user_frame(&frame, &mut dedup, 2_000).is_none());
    }

    #[test]
    fn test_distinct_partials_without_trade_id_both_pass() {
        let mut dedup = DedupCache::new(60_000, 64);
        let partial = |size: &str| {
            json!({
                "event_type": "fill",
                "order_id": "o-1",
                "asset_id": "tok-1",
                "price": "0.51",
                "size": size,
            })
        };
        assert!(parse_user_frame(&partial("1.0"), &mut dedup, 1_000).is_some());
        assert!(parse_user_frame(&partial("0.4"), &mut dedup, 1_001).is_some());
        assert!(parse_user_frame(&partial("0.4"), &mut dedup, 1_002).is_none());
    }

    #[test]
    fn test_parse_lifecycle_frames() {
        let mut dedup = DedupCache::new(60_000, 64);
        let ack = json!({"event_type": "order_ack", "client_order_id": "c-1", "order_id": "v-1"});
        assert!(matches!(
            parse_user_frame(&ack, &mut dedup, 0),
            Some(UserStreamEvent::OrderAck { ref client_order_id, ref venue_order_id, .. })
                if client_order_id == "c-1" && venue_order_id == "v-1"
        ));

        let cancel = json!({"event_type": "cancel_ack", "order_id": "v-1"});
        assert!(matches!(
            parse_user_frame(&cancel, &mut dedup, 0),
            Some(UserStreamEvent::CancelAck { .. })
        ));

        let reject = json!({"event_type": "reject", "order_id": "v-1", "reason": "post-only cross"});
        assert!(matches!(
            parse_user_frame(&reject, &mut dedup, 0),
            Some(UserStreamEvent::Reject { ref reason, .. }) if reason == "post-only cross"
        ));
    }

    #[test]
    fn test_zero_size_fill_dropped_at_the_edge() {
        let mut dedup = DedupCache::new(60_000, 64);
        let frame = json!({
            "event_type": "fill",
            "order_id": "o-1",
            "price": "0.48",
            "size": "0",
        });
        assert!(parse_user_frame(&frame, &mut dedup, 0).is_none());
    }

    #[test]
    fn test_backfill_preload_blocks_replay() {
        let mut dedup = DedupCache::new(60_000, 64);
        dedup.preload(["t-9".to_string()].map(|id| format!("tid:{id}")), 0);
        let frame = json!({
            "event_type": "fill",
            "id": "t-9",
            "order_id": "o-1",
            "asset_id": "tok-1",
            "price": "0.48",
            "size": "25",
        });
        assert!(parse_user_frame(&frame, &mut dedup, 1_000).is_none());
    }

    #[test]
    fn test_dedup_cache_bounded_and_ttl() {
        let mut cache = DedupCache::new(1_000, 4);
        for i in 0..8 {
            assert!(cache.remember(format!("k{i}"), i));
        }
        assert!(cache.seen_at.len() <= 4);

        let mut c2 = DedupCache::new(1_000, 64);
        assert!(c2.remember("x".into(), 0));
        assert!(!c2.remember("x".into(), 500));
        assert!(c2.remember("x".into(), 2_000)); // past TTL
    }
}

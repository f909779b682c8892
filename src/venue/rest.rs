//! Venue REST client and the book resync fetcher.
//!
//! REST covers four calls: full book snapshots (resync path), signed order
//! submission, cancels, and a fills backfill used to warm the user-stream
//! dedupe cache at startup. Transport failures are retried locally with
//! backoff; they surface to the core only as counters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::engine::messages::{BookEvent, BookEventKind, EventQueue, ResyncRequest, SubmitResult};

use super::market_ws::{parse_levels, parse_u64_field};
use super::now_ms;

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct RestClient {
    http: reqwest::Client,
    base_url: url::Url,
    data_url: url::Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    Done,
    RateLimited,
}

impl RestClient {
    pub fn new(rest_url: &str, data_url: &str) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("building http client")?,
            base_url: url::Url::parse(rest_url).context("VENUE_REST_URL")?,
            data_url: url::Url::parse(data_url).context("VENUE_DATA_URL")?,
        })
    }

    /// `GET /book?token_id=…` — full top-N snapshot with the venue seq.
    pub async fn get_book(&self, token_id: &str) -> Result<BookEvent> {
        let mut url = self.base_url.join("book")?;
        url.query_pairs_mut().append_pair("token_id", token_id);
        let resp = self.http.get(url).send().await.context("GET /book")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /book status {}", resp.status());
        }
        let body: Value = resp.json().await.context("parsing /book body")?;
        parse_book_response(&body, token_id, now_ms())
    }

    /// `POST /order` with an externally signed payload.
    pub async fn submit_order(&self, signed: &Value) -> Result<SubmitResult> {
        let url = self.base_url.join("order")?;
        let resp = self
            .http
            .post(url)
            .json(signed)
            .send()
            .await
            .context("POST /order")?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(parse_submit_response(status.as_u16(), &body))
    }

    /// `DELETE /order/{id}`.
    pub async fn cancel_order(&self, order_id: &str) -> Result<CancelResult> {
        let url = self.base_url.join(&format!("order/{order_id}"))?;
        let resp = self.http.delete(url).send().await.context("DELETE /order")?;
        if resp.status().as_u16() == 429 {
            return Ok(CancelResult::RateLimited);
        }
        if !resp.status().is_success() {
            anyhow::bail!("DELETE /order status {}", resp.status());
        }
        Ok(CancelResult::Done)
    }

    /// `GET /fills` — event identities for the dedupe cache warmup.
    pub async fn recent_fill_ids(&self) -> Result<Vec<String>> {
        let url = self.data_url.join("fills")?;
        let resp = self.http.get(url).send().await.context("GET /fills")?;
        if !resp.status().is_success() {
            anyhow::bail!("GET /fills status {}", resp.status());
        }
        let body: Value = resp.json().await.context("parsing /fills body")?;
        Ok(body
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|f| f.get("id").and_then(|v| v.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ─────────────────────────────────────────────────────────
// Response parsing (pure, testable)
// ─────────────────────────────────────────────────────────

pub(crate) fn parse_book_response(body: &Value, token_id: &str, ts: i64) -> Result<BookEvent> {
    let seq = parse_u64_field(body, "seq")
        .or_else(|| parse_u64_field(body, "sequence"))
        .context("book response missing seq")?;
    Ok(BookEvent {
        token_id: token_id.to_string(),
        kind: BookEventKind::Snapshot {
            bids: parse_levels(body, "bids"),
            asks: parse_levels(body, "asks"),
        },
        seq,
        ts,
    })
}

pub(crate) fn parse_submit_response(status: u16, body: &Value) -> SubmitResult {
    if status == 429 {
        return SubmitResult::RateLimited;
    }
    let success = body
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(status < 300);
    if !success || status >= 400 {
        let reason = body
            .get("errorMsg")
            .or_else(|| body.get("error"))
            .and_then(|v| v.as_str())
            .unwrap_or("venue reject")
            .to_string();
        return SubmitResult::Rejected { reason };
    }
    match body
        .get("orderID")
        .or_else(|| body.get("order_id"))
        .and_then(|v| v.as_str())
    {
        Some(id) => SubmitResult::Accepted {
            venue_order_id: id.to_string(),
        },
        None => SubmitResult::Rejected {
            reason: "accepted response without order id".into(),
        },
    }
}

// ─────────────────────────────────────────────────────────
// Resync fetcher task
// ─────────────────────────────────────────────────────────

/// Serves BookState resync requests: fetch a REST snapshot and feed it back
/// through the book lane. Retries transiently with backoff; gives up on a
/// token after a few attempts (the periodic resync will come back to it).
pub fn spawn_resync_fetcher(
    rest: Arc<RestClient>,
    mut rx: mpsc::Receiver<ResyncRequest>,
    queue: Arc<EventQueue>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("resync fetcher started");
        let mut served: u64 = 0;
        while let Some(req) = rx.recv().await {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match rest.get_book(&req.token_id).await {
                    Ok(snapshot) => {
                        served += 1;
                        queue.push_book(snapshot);
                        break;
                    }
                    Err(e) if attempt < 4 => {
                        warn!(token = %req.token_id, attempt, error = %e, "resync fetch failed, retrying");
                        sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                    }
                    Err(e) => {
                        warn!(token = %req.token_id, error = %e, "resync fetch abandoned");
                        break;
                    }
                }
            }
        }
        info!(served, "resync fetcher shut down");
    })
}

/// Warm the user-stream dedupe cache from the fills backfill, so replayed
/// private events right after startup are not double-counted.
pub async fn backfill_fill_ids(rest: &RestClient) -> Vec<String> {
    match rest.recent_fill_ids().await {
        Ok(ids) => {
            info!(count = ids.len(), "fills backfill loaded");
            ids
        }
        Err(e) => {
            warn!(error = %e, "fills backfill unavailable");
            Vec::new()
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_book_response() {
        let body = json!({
            "seq": "118",
            "bids": [{"price": "0.48", "size": "100"}],
            "asks": [{"price": "0.50", "size": "60"}],
        });
        let ev = parse_book_response(&body, "tok-1", 5).unwrap();
        assert_eq!(ev.seq, 118);
        assert_eq!(ev.token_id, "tok-1");
        match ev.kind {
            BookEventKind::Snapshot { bids, asks } => {
                assert_eq!(bids.len(), 1);
                assert_eq!(asks.len(), 1);
                assert!((bids[0].price - 0.48).abs() < 1e-9);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_book_response_requires_seq() {
        assert!(parse_book_response(&json!({"bids": [], "asks": []}), "t", 0).is_err());
    }

    #[test]
    fn test_parse_submit_responses() {
        assert!(matches!(
            parse_submit_response(429, &Value::Null),
            SubmitResult::RateLimited
        ));
        assert!(matches!(
            parse_submit_response(200, &json!({"success": true, "orderID": "v-1"})),
            SubmitResult::Accepted { ref venue_order_id } if venue_order_id == "v-1"
        ));
        assert!(matches!(
            parse_submit_response(200, &json!({"success": false, "errorMsg": "bad tick"})),
            SubmitResult::Rejected { ref reason } if reason == "bad tick"
        ));
        assert!(matches!(
            parse_submit_response(400, &Value::Null),
            SubmitResult::Rejected { .. }
        ));
        assert!(matches!(
            parse_submit_response(200, &json!({"success": true})),
            SubmitResult::Rejected { .. }
        ));
    }
}

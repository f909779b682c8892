//! Append-only event journal.
//!
//! One writer task owns the log file; the core talks to it through a
//! bounded queue. Ordinary records are fire-and-forget with a bounded send
//! deadline — past the deadline the record is dropped, counted, and
//! alerted, never blocking the core indefinitely. Critical records (order
//! status and safety-mode transitions) are acknowledged only after the line
//! is flushed, so those mutations are durable before the core moves on.
//!
//! The same file feeds the backtest harness, which reads it back in
//! ascending timestamp order.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::config::redact_json;
use crate::engine::types::TimeMs;

// ─────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    BookSnapshot,
    BookUpdate,
    OrderIntent,
    OrderStatus,
    Fill,
    Position,
    PnlSnapshot,
    SafetyTransition,
    LatencyMetric,
    Alert,
    Command,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: TimeMs,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
}

impl EventRecord {
    pub fn new(ts: TimeMs, kind: RecordKind, payload: serde_json::Value) -> Self {
        Self { ts, kind, payload }
    }
}

// ─────────────────────────────────────────────────────────
// Writer task
// ─────────────────────────────────────────────────────────

enum JournalMsg {
    Record(EventRecord),
    /// Ack only after the line is on disk.
    Critical(EventRecord, oneshot::Sender<()>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::Sender<JournalMsg>,
    write_deadline: Duration,
    dropped: Arc<AtomicU64>,
}

impl JournalHandle {
    /// Best-effort append. Returns false (after counting and logging) if
    /// the queue stayed full past the deadline.
    pub async fn record(&self, record: EventRecord) -> bool {
        match self
            .tx
            .send_timeout(JournalMsg::Record(record), self.write_deadline)
            .await
        {
            Ok(()) => true,
            Err(_) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                error!(dropped_total = total, "journal backpressure: record dropped");
                false
            }
        }
    }

    /// Durable append: resolves only once the record is flushed.
    pub async fn record_critical(&self, record: EventRecord) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(JournalMsg::Critical(record, ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(JournalMsg::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the journal writer. The returned handle is cheap to clone; the
/// task ends when every handle is gone and the queue drains.
pub async fn spawn_journal(
    path: impl AsRef<Path>,
    capacity: usize,
    write_deadline_ms: u64,
) -> Result<(JournalHandle, tokio::task::JoinHandle<()>)> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())
        .await
        .with_context(|| format!("opening journal {}", path.as_ref().display()))?;
    let mut writer = BufWriter::new(file);
    let (tx, mut rx) = mpsc::channel::<JournalMsg>(capacity);

    let task = tokio::spawn(async move {
        let mut written: u64 = 0;
        while let Some(msg) = rx.recv().await {
            match msg {
                JournalMsg::Record(rec) => {
                    if write_line(&mut writer, rec).await {
                        written += 1;
                    }
                }
                JournalMsg::Critical(rec, ack) => {
                    if write_line(&mut writer, rec).await {
                        written += 1;
                    }
                    if writer.flush().await.is_err() {
                        error!("journal flush failed on critical record");
                    }
                    let _ = ack.send(());
                }
                JournalMsg::Flush(ack) => {
                    if writer.flush().await.is_err() {
                        error!("journal flush failed");
                    }
                    let _ = ack.send(());
                }
            }
        }
        let _ = writer.flush().await;
        info!(written, "journal writer shut down");
    });

    Ok((
        JournalHandle {
            tx,
            write_deadline: Duration::from_millis(write_deadline_ms),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        task,
    ))
}

async fn write_line(writer: &mut BufWriter<tokio::fs::File>, mut rec: EventRecord) -> bool {
    redact_json(&mut rec.payload);
    let line = match serde_json::to_string(&rec) {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "journal: unserialisable record skipped");
            return false;
        }
    };
    if writer.write_all(line.as_bytes()).await.is_err()
        || writer.write_all(b"\n").await.is_err()
    {
        error!("journal write failed");
        return false;
    }
    true
}

// ─────────────────────────────────────────────────────────
// Reader (backtest side, read-only)
// ─────────────────────────────────────────────────────────

/// Load every record, sorted ascending by timestamp. Unparseable lines are
/// counted and skipped rather than aborting a long replay.
pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<EventRecord>> {
    let raw = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("reading journal {}", path.as_ref().display()))?;
    let mut records = Vec::new();
    let mut bad_lines = 0usize;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(rec) => records.push(rec),
            Err(_) => bad_lines += 1,
        }
    }
    if bad_lines > 0 {
        warn!(bad_lines, "journal: skipped unparseable lines");
    }
    records.sort_by_key(|r| r.ts);
    Ok(records)
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");

        let (handle, task) = spawn_journal(&path, 64, 100).await.unwrap();
        handle
            .record(EventRecord::new(
                2,
                RecordKind::BookUpdate,
                serde_json::json!({"token_id": "t1", "seq": 7}),
            ))
            .await;
        handle
            .record(EventRecord::new(
                1,
                RecordKind::Fill,
                serde_json::json!({"price": 0.5, "size": 10.0}),
            ))
            .await;
        handle
            .record_critical(EventRecord::new(
                3,
                RecordKind::SafetyTransition,
                serde_json::json!({"from": "RUNNING", "to": "FLATTENING"}),
            ))
            .await;
        drop(handle);
        task.await.unwrap();

        let records = read_events(&path).unwrap();
        assert_eq!(records.len(), 3);
        // Ascending by timestamp regardless of write order.
        assert_eq!(records[0].ts, 1);
        assert_eq!(records[1].ts, 2);
        assert_eq!(records[2].kind, RecordKind::SafetyTransition);
    }

    #[tokio::test]
    async fn test_sensitive_payload_fields_redacted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");

        let (handle, task) = spawn_journal(&path, 8, 100).await.unwrap();
        handle
            .record(EventRecord::new(
                1,
                RecordKind::Error,
                serde_json::json!({"api_key": "k-123", "detail": "auth failed"}),
            ))
            .await;
        drop(handle);
        task.await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("k-123"));
        assert!(raw.contains("[REDACTED]"));
        assert!(raw.contains("auth failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_drops_after_deadline() {
        // No writer task: the queue fills and sends time out.
        let (tx, _rx) = mpsc::channel::<JournalMsg>(1);
        let handle = JournalHandle {
            tx,
            write_deadline: Duration::from_millis(50),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        assert!(
            handle
                .record(EventRecord::new(1, RecordKind::Alert, serde_json::json!({})))
                .await
        );
        assert!(
            !handle
                .record(EventRecord::new(2, RecordKind::Alert, serde_json::json!({})))
                .await
        );
        assert_eq!(handle.dropped(), 1);
    }

    #[test]
    fn test_reader_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");
        std::fs::write(
            &path,
            "{\"ts\":1,\"kind\":\"fill\",\"payload\":{}}\nnot json\n\n",
        )
        .unwrap();
        let records = read_events(&path).unwrap();
        assert_eq!(records.len(), 1);
    }
}

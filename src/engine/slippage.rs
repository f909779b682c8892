//! Adaptive slippage estimation.
//!
//! The static model is linear in the size ratio against top-of-book depth.
//! The adaptive layer keeps a bounded ring of realised `|fill − intent|`
//! samples per market; its p95 scales the failure buffer, but the configured
//! baseline is a floor — adaptation can only widen the buffer, never narrow
//! it below configuration.

use std::collections::{HashMap, VecDeque};

use crate::config::Thresholds;

use super::types::MarketId;

pub struct SlippageModel {
    window: usize,
    samples: HashMap<MarketId, VecDeque<f64>>,
}

impl SlippageModel {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: HashMap::new(),
        }
    }

    /// Static estimate: `base + k * size / top_level_size`.
    pub fn estimate(&self, t: &Thresholds, size: f64, top_level_size: f64) -> f64 {
        if size <= 0.0 {
            return t.base_slippage;
        }
        let ratio = if top_level_size > 0.0 {
            size / top_level_size
        } else {
            1.0
        };
        t.base_slippage + t.slippage_k * ratio
    }

    /// Record one realised deviation for a market's ring.
    pub fn record_sample(&mut self, market_id: &str, deviation: f64) {
        let ring = self
            .samples
            .entry(market_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.window));
        if ring.len() == self.window {
            ring.pop_front();
        }
        ring.push_back(deviation.abs());
    }

    /// p95 of realised deviations, None until any samples exist.
    pub fn p95(&self, market_id: &str) -> Option<f64> {
        let ring = self.samples.get(market_id)?;
        if ring.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = ring.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[idx.saturating_sub(1).min(sorted.len() - 1)])
    }

    /// `max(configured, p95 * multiplier)` — the configured value is a
    /// floor at all times.
    pub fn effective_failure_buffer(&self, t: &Thresholds, market_id: &str) -> f64 {
        match self.p95(market_id) {
            Some(p95) => t.failure_buffer.max(p95 * t.slippage_multiplier),
            None => t.failure_buffer,
        }
    }

    pub fn sample_count(&self, market_id: &str) -> usize {
        self.samples.get(market_id).map(|r| r.len()).unwrap_or(0)
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

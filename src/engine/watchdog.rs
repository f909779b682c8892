//! User-stream watchdog — silence detector on the private channel.
//!
//! Fills are only authoritative on the private stream, so a silent stream
//! means we may be position-blind. Every private event refreshes the
//! heartbeat; a tick that finds the stream silent beyond the timeout while
//! RUNNING trips like a circuit breaker.

use crate::config::Thresholds;

use super::types::{SafetyMode, TimeMs};

pub struct UserStreamWatchdog {
    last_private_event: TimeMs,
}

impl UserStreamWatchdog {
    /// `start` anchors the timeout before the first private event arrives.
    pub fn new(start: TimeMs) -> Self {
        Self {
            last_private_event: start,
        }
    }

    pub fn heartbeat(&mut self, now: TimeMs) {
        if now > self.last_private_event {
            self.last_private_event = now;
        }
    }

    pub fn last_private_event(&self) -> TimeMs {
        self.last_private_event
    }

    pub fn silence_ms(&self, now: TimeMs) -> TimeMs {
        (now - self.last_private_event).max(0)
    }

    /// True when the stream has been silent past the timeout while RUNNING.
    /// A huge configured timeout effectively disables the check.
    pub fn should_trip(&self, now: TimeMs, t: &Thresholds, mode: SafetyMode) -> bool {
        mode == SafetyMode::Running
            && self.silence_ms(now) as f64 > t.user_ws_timeout_sec * 1000.0
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

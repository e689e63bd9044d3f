//! Realtime transport liveness and bounded reconnection.
//!
//! Pure bookkeeping: the caller reports transport events and asks whether
//! (and when) to try again. Backoff doubles per failed attempt, capped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// What to do after a failed reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter(Duration),
    /// Automatic attempts exhausted; wait for manual `reconnect()`.
    GiveUp,
}

/// Read-only view for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub last_connected: Option<DateTime<Utc>>,
    pub needs_manual_reconnect: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    connected: bool,
    reconnect_attempts: u32,
    max_reconnect_attempts: u32,
    last_connected: Option<DateTime<Utc>>,
    last_disconnect_reason: Option<String>,
    base_delay: Duration,
    max_delay: Duration,
}

impl ConnectionMonitor {
    pub fn new(max_reconnect_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            connected: false,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            last_connected: None,
            last_disconnect_reason: None,
            base_delay,
            max_delay,
        }
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_reconnect_attempts
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.last_connected
    }

    pub fn last_disconnect_reason(&self) -> Option<&str> {
        self.last_disconnect_reason.as_deref()
    }

    pub fn on_connected(&mut self, now: DateTime<Utc>) {
        if !self.connected {
            tracing::info!(attempts = self.reconnect_attempts, "realtime connected");
        }
        self.connected = true;
        self.reconnect_attempts = 0;
        self.last_connected = Some(now);
        self.last_disconnect_reason = None;
    }

    /// Transport reported close or error.
    pub fn on_disconnected(&mut self, reason: &str) {
        if self.connected {
            tracing::warn!(reason, "realtime disconnected");
        }
        self.connected = false;
        self.last_disconnect_reason = Some(reason.to_string());
    }

    /// Records one failed re-establish and decides whether to keep going.
    pub fn on_reconnect_failed(&mut self) -> ReconnectDecision {
        self.connected = false;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        if self.needs_manual_reconnect() {
            tracing::warn!(
                attempts = self.reconnect_attempts,
                max = self.max_reconnect_attempts,
                "automatic reconnect exhausted"
            );
            return ReconnectDecision::GiveUp;
        }
        let delay = self.backoff_delay();
        tracing::debug!(
            attempts = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        ReconnectDecision::RetryAfter(delay)
    }

    pub fn can_auto_reconnect(&self) -> bool {
        !self.connected && !self.needs_manual_reconnect()
    }

    pub fn needs_manual_reconnect(&self) -> bool {
        self.reconnect_attempts >= self.max_reconnect_attempts
    }

    /// Delay before the next attempt: `base * 2^attempts`, capped.
    pub fn backoff_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.reconnect_attempts.min(16));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Manual reconnect: clears the attempt counter so automatic retries resume.
    pub fn reconnect(&mut self) {
        tracing::info!(attempts = self.reconnect_attempts, "manual reconnect requested");
        self.reconnect_attempts = 0;
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connected: self.connected,
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.max_reconnect_attempts,
            last_connected: self.last_connected,
            needs_manual_reconnect: self.needs_manual_reconnect(),
        }
    }
}

//! User-facing sync status, derived from connection and queue state.

use crate::queue::EventQueue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Single indicator shown in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SyncHealth {
    Online,
    Syncing,
    Problems,
    Offline,
}

impl SyncHealth {
    /// Strict priority: offline, then failures, then backlog.
    pub fn derive(connected: bool, failed_events: usize, queued_events: usize) -> Self {
        if !connected {
            Self::Offline
        } else if failed_events > 0 {
            Self::Problems
        } else if queued_events > 0 {
            Self::Syncing
        } else {
            Self::Online
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Self::Online => "green",
            Self::Syncing => "blue",
            Self::Problems => "amber",
            Self::Offline => "grey",
        }
    }
}

impl fmt::Display for SyncHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Online => "Online",
            Self::Syncing => "Syncing",
            Self::Problems => "Problems",
            Self::Offline => "Offline",
        };
        f.write_str(label)
    }
}

/// Snapshot recomputed on every hub update; never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub connected: bool,
    pub queued_events: usize,
    pub failed_events: usize,
    /// Overflow evictions. Reported separately from failures.
    pub dropped_events: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn derive(connected: bool, queue: &EventQueue, last_sync_at: Option<DateTime<Utc>>) -> Self {
        Self {
            connected,
            queued_events: queue.len(),
            failed_events: queue.failed_count(),
            dropped_events: queue.dropped(),
            last_sync_at,
        }
    }

    pub fn health(&self) -> SyncHealth {
        SyncHealth::derive(self.connected, self.failed_events, self.queued_events)
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            connected: false,
            queued_events: 0,
            failed_events: 0,
            dropped_events: 0,
            last_sync_at: None,
        }
    }
}

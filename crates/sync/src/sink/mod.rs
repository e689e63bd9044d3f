//! Row schemas for machine-readable session output.
//!
//! - [`TransitionRow`]: one per retained readiness transition
//! - [`StatusRow`]: final sync status, one per session
//! - [`FailedEventRow`]: one per failed change event or rejected notification
//!
//! Rows are written as NDJSON by [`json_stream::JsonStreamSink`].

pub mod json_stream;

use crate::report::SessionReport;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TransitionRow {
    pub seq: u64,
    pub epoch: u64,
    pub state: String,
    pub at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRow {
    pub final_state: String,
    pub connected: bool,
    pub health: String,
    pub queued_events: u64,
    pub failed_events: u64,
    pub dropped_events: u64,
    pub reconnect_attempts: u32,
    pub last_sync_at: Option<String>,
    pub elapsed_ms: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedEventRow {
    pub entity: String,
    /// Absent for notifications rejected on arrival.
    pub row_id: Option<String>,
    pub attempts: u32,
    pub error: String,
    pub failed_at: String,
}

impl SessionReport {
    /// Flatten the report into sink-ready rows.
    pub fn to_rows(&self) -> (Vec<TransitionRow>, StatusRow, Vec<FailedEventRow>) {
        let transitions = self
            .history
            .iter()
            .enumerate()
            .map(|(i, entry)| TransitionRow {
                seq: i as u64 + 1,
                epoch: entry.epoch,
                state: entry.kind.as_str().to_string(),
                at: entry.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect();

        let status = StatusRow {
            final_state: self.final_state.as_str().to_string(),
            connected: self.status.connected,
            health: self.health().to_string(),
            queued_events: self.status.queued_events as u64,
            failed_events: self.status.failed_events as u64,
            dropped_events: self.status.dropped_events,
            reconnect_attempts: self.reconnect_attempts,
            last_sync_at: self
                .status
                .last_sync_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            elapsed_ms: self.elapsed.as_millis() as u64,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        let failed = self
            .failures
            .iter()
            .map(|f| FailedEventRow {
                entity: f.entity.table().to_string(),
                row_id: f.row_id.clone(),
                attempts: f.attempts,
                error: f.error.clone(),
                failed_at: f.failed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect();

        (transitions, status, failed)
    }
}

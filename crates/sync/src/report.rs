//! End-of-session report.
//!
//! Collects the readiness history and the final sync status into one value
//! and renders it as a boxed text summary for the CLI.

use crate::hub::SyncHub;
use crate::readiness::{HistoryEntry, ReadinessMachine};
use crate::status::{SyncHealth, SyncStatus};
use beacon_core::{Epoch, EntityType, StateKind};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Snapshot of one run.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub final_state: StateKind,
    pub epoch: Epoch,
    pub transitions_accepted: u64,
    pub history: Vec<HistoryEntry>,
    pub status: SyncStatus,
    pub reconnect_attempts: u32,
    pub needs_manual_reconnect: bool,
    pub failures: Vec<FailureLine>,
    pub elapsed: Duration,
}

/// One permanently failed event or rejected notification.
#[derive(Debug, Clone)]
pub struct FailureLine {
    pub entity: EntityType,
    /// `None` when the notification was rejected on arrival.
    pub row_id: Option<String>,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl SessionReport {
    pub fn build(machine: &ReadinessMachine, hub: &SyncHub, elapsed: Duration) -> Self {
        let monitor = hub.monitor();
        let failures = hub
            .queue()
            .failed()
            .map(|f| FailureLine {
                entity: f.entity.clone(),
                row_id: f.row_id().map(str::to_string),
                attempts: f.attempts,
                error: f.error.to_string(),
                failed_at: f.failed_at,
            })
            .collect();

        SessionReport {
            final_state: machine.state().kind(),
            epoch: machine.epoch(),
            transitions_accepted: machine.transitions_accepted(),
            history: machine.history().cloned().collect(),
            status: hub.status(),
            reconnect_attempts: monitor.reconnect_attempts(),
            needs_manual_reconnect: monitor.needs_manual_reconnect(),
            failures,
            elapsed,
        }
    }

    pub fn health(&self) -> SyncHealth {
        self.status.health()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let last_sync = self
            .status
            .last_sync_at
            .map(|at| at.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());

        out.push('\n');
        out.push_str("╔══════════════════════════════════════════════════════════════╗\n");
        out.push_str("║                    BEACON SESSION REPORT                     ║\n");
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        out.push_str(&format!("║  State:              {:>39} ║\n", self.final_state.as_str()));
        out.push_str(&format!("║  Epoch:              {:>39} ║\n", self.epoch));
        out.push_str(&format!(
            "║  Transitions:        {:>39} ║\n",
            self.transitions_accepted
        ));
        out.push_str(&format!(
            "║  Sync health:        {:>39} ║\n",
            format!("{} ({})", self.health(), self.health().color())
        ));
        out.push_str(&format!(
            "║  Queued / failed:    {:>39} ║\n",
            format!("{} / {}", self.status.queued_events, self.status.failed_events)
        ));
        out.push_str(&format!(
            "║  Dropped:            {:>39} ║\n",
            self.status.dropped_events
        ));
        out.push_str(&format!(
            "║  Reconnects:         {:>39} ║\n",
            if self.needs_manual_reconnect {
                format!("{} (manual needed)", self.reconnect_attempts)
            } else {
                self.reconnect_attempts.to_string()
            }
        ));
        out.push_str(&format!("║  Last sync:          {:>39} ║\n", last_sync));
        out.push_str(&format!(
            "║  Elapsed:            {:>39} ║\n",
            format!("{:?}", self.elapsed)
        ));
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        out.push_str("║  STATE HISTORY                                               ║\n");
        out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
        for (i, entry) in self.history.iter().enumerate() {
            out.push_str(&format!(
                "║  {:>2}. {:<22} epoch {:<4} {:>21} ║\n",
                i + 1,
                entry.kind.as_str(),
                entry.epoch,
                entry.at.format("%H:%M:%S%.3f").to_string(),
            ));
        }

        if !self.failures.is_empty() {
            out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
            out.push_str("║  FAILED EVENTS                                               ║\n");
            out.push_str("╠══════════════════════════════════════════════════════════════╣\n");
            for f in &self.failures {
                let summary = match &f.row_id {
                    Some(row_id) => format!("{} {} after {} attempts", f.entity, row_id, f.attempts),
                    None => format!("{} notification rejected", f.entity),
                };
                out.push_str(&format!("║  {:<59.59} ║\n", summary));
                out.push_str(&format!("║     {:<56.56} ║\n", f.error));
            }
        }

        out.push_str("╚══════════════════════════════════════════════════════════════╝\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::InvalidationBus;
    use beacon_core::BeaconConfig;
    use beacon_core::RawChange;
    use beacon_transport::TransportEvent;
    use std::sync::Arc;

    #[test]
    fn renders_history_and_health() {
        let config = BeaconConfig::default();
        let mut machine = ReadinessMachine::from_config(&config);
        machine.start_authenticating(false).unwrap();
        machine.start_loading_profile("u1").unwrap();

        let mut hub = SyncHub::from_config(&config, Arc::new(InvalidationBus::new()));
        hub.handle_transport_event(TransportEvent::Connected);

        let report = SessionReport::build(&machine, &hub, Duration::from_millis(42));
        assert_eq!(report.final_state, StateKind::LoadingProfile);
        assert_eq!(report.history.len(), 2);
        assert_eq!(report.health(), SyncHealth::Online);

        let text = report.render();
        assert!(text.contains("BEACON SESSION REPORT"));
        assert!(text.contains("Online (green)"));
        assert!(text.contains(StateKind::Authenticating.as_str()));
        assert!(!text.contains("FAILED EVENTS"));
    }

    #[test]
    fn failure_rows_keep_the_box_closed() {
        let config = BeaconConfig::default();
        let machine = ReadinessMachine::from_config(&config);
        let mut hub = SyncHub::from_config(&config, Arc::new(InvalidationBus::new()));
        hub.handle_transport_event(TransportEvent::Connected);
        hub.handle_transport_event(TransportEvent::Change(RawChange::new(
            "emails",
            "TRUNCATE",
            serde_json::json!({"id": "e1"}),
        )));

        let mut report = SessionReport::build(&machine, &hub, Duration::from_millis(42));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].row_id, None);
        report.failures.push(FailureLine {
            entity: EntityType::Project,
            row_id: Some("p-with-a-rather-long-identifier-0123456789abcdef".into()),
            attempts: 3,
            error: "x".repeat(120),
            failed_at: Utc::now(),
        });

        let text = report.render();
        assert!(text.contains("FAILED EVENTS"));
        assert!(text.contains("emails notification rejected"));
        for line in text.lines().filter(|line| !line.is_empty()) {
            assert_eq!(line.chars().count(), 64, "{line:?}");
            let last = line.chars().last().unwrap();
            assert!(matches!(last, '║' | '╗' | '╣' | '╝'), "{line:?}");
        }
    }
}

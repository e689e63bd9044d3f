//! Sync hub: the single writer for realtime state.
//!
//! Owns the connection monitor, the event queue and the subscription
//! registry. Every update recomputes [`SyncStatus`] and publishes it.

use crate::hooks::{CacheInvalidator, SubscriptionRegistry};
use crate::queue::{DrainReport, EventQueue, FailedEvent};
use crate::status::SyncStatus;
use beacon_core::{BeaconConfig, ChangeEvent, EntityType};
use beacon_transport::{
    ChannelSpec, ConnectionMonitor, ReconnectDecision, TransportEvent,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

pub struct SyncHub {
    monitor: ConnectionMonitor,
    queue: EventQueue,
    registry: SubscriptionRegistry,
    invalidator: Arc<dyn CacheInvalidator>,
    consumer_ready: bool,
    last_sync_at: Option<DateTime<Utc>>,
    tx: watch::Sender<SyncStatus>,
}

impl SyncHub {
    pub fn new(
        monitor: ConnectionMonitor,
        queue: EventQueue,
        registry: SubscriptionRegistry,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::derive(false, &queue, None));
        Self {
            monitor,
            queue,
            registry,
            invalidator,
            consumer_ready: false,
            last_sync_at: None,
            tx,
        }
    }

    /// Hub with the default subscribers and config-driven bounds.
    pub fn from_config(config: &BeaconConfig, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        Self::new(
            ConnectionMonitor::new(
                config.max_reconnect_attempts,
                config.reconnect_base_delay(),
                config.reconnect_max_delay(),
            ),
            EventQueue::from_config(config),
            SubscriptionRegistry::with_defaults(),
            invalidator,
        )
    }

    // -- Observers ----------------------------------------------------------

    pub fn status(&self) -> SyncStatus {
        SyncStatus::derive(self.monitor.connected(), &self.queue, self.last_sync_at)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Subscribe/unsubscribe domains. Status is republished on the next update.
    pub fn registry_mut(&mut self) -> &mut SubscriptionRegistry {
        &mut self.registry
    }

    pub fn consumer_ready(&self) -> bool {
        self.consumer_ready
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.queue.next_retry_at()
    }

    // -- Updates ------------------------------------------------------------

    pub fn handle_transport_event(&mut self, event: TransportEvent) -> DrainReport {
        self.handle_transport_event_at(event, Instant::now())
    }

    pub fn handle_transport_event_at(&mut self, event: TransportEvent, now: Instant) -> DrainReport {
        match event {
            TransportEvent::Connected => self.monitor.on_connected(Utc::now()),
            TransportEvent::Change(raw) => {
                let entity = EntityType::from_table(&raw.table);
                match ChangeEvent::from_raw(raw) {
                    Ok(event) => {
                        tracing::trace!(
                            entity = %event.entity,
                            kind = ?event.kind,
                            row_id = %event.row_id,
                            "change received"
                        );
                        self.queue.enqueue(event);
                    }
                    Err(err) => self.queue.record_rejected(entity, err),
                }
            }
            TransportEvent::Closed { reason } => self.monitor.on_disconnected(&reason),
            TransportEvent::Error { message } => self.monitor.on_disconnected(&message),
        }
        self.flush_at(now)
    }

    /// Gates draining on the readiness side having finished startup.
    pub fn set_consumer_ready(&mut self, ready: bool) -> DrainReport {
        if self.consumer_ready != ready {
            tracing::debug!(ready, "consumer readiness changed");
        }
        self.consumer_ready = ready;
        self.flush()
    }

    pub fn flush(&mut self) -> DrainReport {
        self.flush_at(Instant::now())
    }

    /// Drains due events through the registry. No-op until both the
    /// consumer is ready and the connection is up.
    pub fn flush_at(&mut self, now: Instant) -> DrainReport {
        let report = if self.consumer_ready && self.monitor.connected() {
            let registry = &self.registry;
            let invalidator = self.invalidator.as_ref();
            self.queue
                .drain_at(now, |event| registry.dispatch(event, invalidator))
        } else {
            DrainReport::default()
        };
        if report.applied > 0 {
            self.last_sync_at = Some(Utc::now());
        }
        self.publish();
        report
    }

    /// Records a failed connect attempt.
    pub fn on_reconnect_failed(&mut self) -> ReconnectDecision {
        let decision = self.monitor.on_reconnect_failed();
        self.publish();
        decision
    }

    /// Manual reconnect after automatic attempts ran out.
    pub fn reconnect(&mut self) {
        self.monitor.reconnect();
        self.publish();
    }

    /// Channels to open on a fresh connection, without duplicate handlers.
    pub fn resubscribe(&mut self) -> Vec<ChannelSpec> {
        self.registry.resubscribe_all()
    }

    pub fn clear_queue(&mut self) -> usize {
        let cleared = self.queue.clear();
        self.publish();
        cleared
    }

    pub fn take_failed(&mut self) -> Vec<FailedEvent> {
        let failed = self.queue.take_failed();
        self.publish();
        failed
    }

    fn publish(&self) {
        let status = self.status();
        self.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{CacheKey, Domain, InvalidationBus};
    use crate::status::SyncHealth;
    use beacon_core::{ApplyError, RawChange};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn hub_with(invalidator: Arc<dyn CacheInvalidator>) -> SyncHub {
        SyncHub::from_config(&BeaconConfig::default(), invalidator)
    }

    fn project(id: &str) -> TransportEvent {
        TransportEvent::Change(RawChange::new(
            "projects",
            "UPDATE",
            json!({"id": id, "name": "Roof"}),
        ))
    }

    /// Fails every invalidation while `fail` is non-zero.
    #[derive(Default)]
    struct Flaky {
        fail: AtomicUsize,
    }

    impl CacheInvalidator for Flaky {
        fn invalidate(&self, _key: &CacheKey) -> Result<(), ApplyError> {
            if self.fail.load(Ordering::SeqCst) > 0 {
                return Err(ApplyError::Upstream("refetch failed".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn queues_until_consumer_ready() {
        let bus = InvalidationBus::new();
        let mut rx = bus.subscribe();
        let mut hub = hub_with(Arc::new(bus));

        hub.handle_transport_event(TransportEvent::Connected);
        hub.handle_transport_event(project("p1"));
        assert_eq!(hub.status().queued_events, 1);
        assert_eq!(hub.status().health(), SyncHealth::Syncing);

        let report = hub.set_consumer_ready(true);
        assert_eq!(report.applied, 1);
        assert_eq!(hub.status().health(), SyncHealth::Online);
        assert!(hub.status().last_sync_at.is_some());
        assert_eq!(rx.recv().await.unwrap(), CacheKey::ProjectList);
    }

    #[test]
    fn disconnect_reports_offline_and_holds_events() {
        let mut hub = hub_with(Arc::new(InvalidationBus::new()));
        hub.set_consumer_ready(true);
        hub.handle_transport_event(TransportEvent::Connected);
        hub.handle_transport_event(TransportEvent::Closed {
            reason: "server restart".into(),
        });
        hub.handle_transport_event(project("p1"));

        let status = hub.status();
        assert!(!status.connected);
        assert_eq!(status.queued_events, 1);
        assert_eq!(status.health(), SyncHealth::Offline);

        hub.handle_transport_event(TransportEvent::Connected);
        assert_eq!(hub.status().queued_events, 0);
    }

    #[test]
    fn malformed_notification_counts_as_failure() {
        let mut hub = hub_with(Arc::new(InvalidationBus::new()));
        hub.set_consumer_ready(true);
        hub.handle_transport_event(TransportEvent::Connected);
        hub.handle_transport_event(TransportEvent::Change(RawChange::new(
            "emails",
            "TRUNCATE",
            json!({"id": "e1"}),
        )));
        assert_eq!(hub.status().failed_events, 1);
        assert_eq!(hub.status().health(), SyncHealth::Problems);
        assert_eq!(hub.queue().failed().count(), 1);

        let failed = hub.take_failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].entity, EntityType::Email);
        assert!(failed[0].event.is_none());
        assert!(matches!(failed[0].error, ApplyError::Malformed { .. }));
        assert_eq!(hub.status().health(), SyncHealth::Online);
    }

    #[test]
    fn failing_apply_retries_on_schedule_then_fails() {
        let flaky = Arc::new(Flaky::default());
        flaky.fail.store(1, Ordering::SeqCst);
        let mut hub = hub_with(flaky.clone());
        hub.set_consumer_ready(true);
        let start = Instant::now();
        hub.handle_transport_event_at(TransportEvent::Connected, start);
        let r = hub.handle_transport_event_at(project("p1"), start);
        assert_eq!(r.retried, 1);
        assert_eq!(hub.next_retry_at(), Some(start + Duration::from_millis(250)));

        hub.flush_at(start + Duration::from_millis(250));
        let r = hub.flush_at(start + Duration::from_millis(750));
        assert_eq!(r.failed, 1);
        let status = hub.status();
        assert_eq!(status.failed_events, 1);
        assert_eq!(status.queued_events, 0);
        assert_eq!(status.health(), SyncHealth::Problems);
    }

    #[test]
    fn unsubscribed_domain_defers_its_events() {
        let mut hub = hub_with(Arc::new(InvalidationBus::new()));
        hub.registry_mut().unsubscribe(Domain::Projects);
        hub.set_consumer_ready(true);
        hub.handle_transport_event(TransportEvent::Connected);
        let r = hub.handle_transport_event(project("p1"));
        assert_eq!(r.deferred, 1);
        assert_eq!(hub.status().queued_events, 1);

        hub.registry_mut()
            .subscribe(Box::new(crate::hooks::ProjectSubscriber));
        assert_eq!(hub.flush().applied, 1);
    }

    #[test]
    fn status_channel_sees_updates() {
        let mut hub = hub_with(Arc::new(InvalidationBus::new()));
        let rx = hub.subscribe_status();
        assert!(!rx.borrow().connected);
        hub.handle_transport_event(TransportEvent::Connected);
        assert!(rx.borrow().connected);
        hub.handle_transport_event(project("p1"));
        assert_eq!(rx.borrow().queued_events, 1);
        assert_eq!(hub.clear_queue(), 1);
        assert_eq!(rx.borrow().queued_events, 0);
    }

    #[test]
    fn reconnect_bound_is_tracked() {
        let mut hub = hub_with(Arc::new(InvalidationBus::new()));
        let max = hub.monitor().max_reconnect_attempts();
        for _ in 1..max {
            assert!(matches!(
                hub.on_reconnect_failed(),
                ReconnectDecision::RetryAfter(_)
            ));
        }
        assert_eq!(hub.on_reconnect_failed(), ReconnectDecision::GiveUp);
        assert!(hub.monitor().needs_manual_reconnect());
        hub.reconnect();
        assert!(hub.monitor().can_auto_reconnect());
    }
}

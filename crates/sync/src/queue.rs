//! Bounded per-entity FIFO buffer for inbound change events.
//!
//! Events are applied strictly in arrival order within one entity type.
//! A failing event holds its lane until it either applies or exhausts its
//! attempts; then it moves to the permanently-failed list. No ordering is
//! kept across entity types. The failed list is capped like the queue
//! itself, dropping its oldest entry when full.

use beacon_core::{ApplyError, BeaconConfig, ChangeEvent, EntityType};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Handler verdict for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apply {
    Applied,
    /// Nothing can consume this entity type yet; keep it queued.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub seq: u64,
    pub event: ChangeEvent,
    pub attempts: u32,
    pub retry_at: Option<Instant>,
    pub last_error: Option<ApplyError>,
}

/// Longest wait between two apply attempts of one event.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Event that exhausted its apply attempts, or a notification rejected
/// before it became an event.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub entity: EntityType,
    /// `None` for rejected notifications.
    pub event: Option<ChangeEvent>,
    pub attempts: u32,
    pub error: ApplyError,
    pub failed_at: DateTime<Utc>,
}

impl FailedEvent {
    pub fn row_id(&self) -> Option<&str> {
        self.event.as_ref().map(|event| event.row_id.as_str())
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
}

#[derive(Debug)]
pub struct EventQueue {
    lanes: BTreeMap<EntityType, VecDeque<QueuedEvent>>,
    len: usize,
    capacity: usize,
    next_seq: u64,
    max_attempts: u32,
    backoff: Duration,
    failed: VecDeque<FailedEvent>,
    failed_evicted: u64,
    dropped: u64,
}

impl EventQueue {
    pub fn new(capacity: usize, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            lanes: BTreeMap::new(),
            len: 0,
            capacity: capacity.max(1),
            next_seq: 0,
            max_attempts: max_attempts.max(1),
            backoff,
            failed: VecDeque::new(),
            failed_evicted: 0,
            dropped: 0,
        }
    }

    pub fn from_config(config: &BeaconConfig) -> Self {
        Self::new(
            config.queue_capacity,
            config.max_apply_attempts,
            config.apply_backoff(),
        )
    }

    /// Not-yet-applied events.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn queued_for(&self, entity: &EntityType) -> usize {
        self.lanes.get(entity).map_or(0, VecDeque::len)
    }

    /// Permanently failed events plus notifications rejected on arrival.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Oldest first.
    pub fn failed(&self) -> impl Iterator<Item = &FailedEvent> + '_ {
        self.failed.iter()
    }

    /// Failure records dropped because the failed list was full.
    pub fn failed_evicted(&self) -> u64 {
        self.failed_evicted
    }

    /// Events evicted by overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Appends in arrival order, evicting the oldest event when full.
    pub fn enqueue(&mut self, event: ChangeEvent) -> u64 {
        if self.len >= self.capacity {
            self.evict_oldest();
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.lanes
            .entry(event.entity.clone())
            .or_default()
            .push_back(QueuedEvent {
                seq,
                event,
                attempts: 0,
                retry_at: None,
                last_error: None,
            });
        self.len += 1;
        seq
    }

    /// A notification that could not be parsed into an event at all.
    pub fn record_rejected(&mut self, entity: EntityType, error: ApplyError) {
        tracing::warn!(%entity, error = %error, "change notification rejected");
        self.push_failed(FailedEvent {
            entity,
            event: None,
            attempts: 0,
            error,
            failed_at: Utc::now(),
        });
    }

    /// Wait before the next attempt once `attempts` have failed.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        retry_delay(self.backoff, attempts)
    }

    pub fn drain<F>(&mut self, handler: F) -> DrainReport
    where
        F: FnMut(&ChangeEvent) -> Result<Apply, ApplyError>,
    {
        self.drain_at(Instant::now(), handler)
    }

    /// Applies due events lane by lane, FIFO within each lane.
    pub fn drain_at<F>(&mut self, now: Instant, mut handler: F) -> DrainReport
    where
        F: FnMut(&ChangeEvent) -> Result<Apply, ApplyError>,
    {
        let mut report = DrainReport::default();
        let mut dead = Vec::new();

        for (entity, lane) in self.lanes.iter_mut() {
            while let Some(head) = lane.front_mut() {
                if head.retry_at.is_some_and(|at| at > now) {
                    break;
                }
                match handler(&head.event) {
                    Ok(Apply::Applied) => {
                        lane.pop_front();
                        self.len -= 1;
                        report.applied += 1;
                    }
                    Ok(Apply::Deferred) => {
                        report.deferred += 1;
                        break;
                    }
                    Err(error) => {
                        head.attempts += 1;
                        if head.attempts >= self.max_attempts {
                            tracing::warn!(
                                %entity,
                                row_id = %head.event.row_id,
                                attempts = head.attempts,
                                error = %error,
                                "event permanently failed"
                            );
                            if let Some(head) = lane.pop_front() {
                                dead.push(FailedEvent {
                                    entity: entity.clone(),
                                    event: Some(head.event),
                                    attempts: head.attempts,
                                    error,
                                    failed_at: Utc::now(),
                                });
                            }
                            self.len -= 1;
                            report.failed += 1;
                            continue;
                        }
                        let delay = retry_delay(self.backoff, head.attempts);
                        tracing::debug!(
                            %entity,
                            row_id = %head.event.row_id,
                            attempts = head.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "apply failed, will retry"
                        );
                        head.retry_at = Some(now + delay);
                        head.last_error = Some(error);
                        report.retried += 1;
                        break;
                    }
                }
            }
        }
        self.lanes.retain(|_, lane| !lane.is_empty());
        for failed in dead {
            self.push_failed(failed);
        }

        if report != DrainReport::default() {
            tracing::debug!(
                applied = report.applied,
                retried = report.retried,
                failed = report.failed,
                deferred = report.deferred,
                queued = self.len,
                "drain pass"
            );
        }
        report
    }

    /// Earliest pending retry, for scheduling the next drain.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.lanes
            .values()
            .filter_map(|lane| lane.front().and_then(|head| head.retry_at))
            .min()
    }

    /// Drops every queued event. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let cleared = self.len;
        self.lanes.clear();
        self.len = 0;
        if cleared > 0 {
            tracing::info!(cleared, "event queue cleared");
        }
        cleared
    }

    /// Hands every failure record to the caller and resets the count.
    pub fn take_failed(&mut self) -> Vec<FailedEvent> {
        self.failed.drain(..).collect()
    }

    fn push_failed(&mut self, failed: FailedEvent) {
        if self.failed.len() >= self.capacity {
            if let Some(oldest) = self.failed.pop_front() {
                self.failed_evicted += 1;
                tracing::warn!(
                    entity = %oldest.entity,
                    evicted = self.failed_evicted,
                    "failed list full, dropped oldest record"
                );
            }
        }
        self.failed.push_back(failed);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .lanes
            .iter()
            .filter_map(|(entity, lane)| lane.front().map(|head| (head.seq, entity.clone())))
            .min_by_key(|(seq, _)| *seq);
        let Some((seq, entity)) = oldest else {
            return;
        };
        if let Some(lane) = self.lanes.get_mut(&entity) {
            lane.pop_front();
            if lane.is_empty() {
                self.lanes.remove(&entity);
            }
        }
        self.len -= 1;
        self.dropped += 1;
        tracing::warn!(%entity, seq, dropped = self.dropped, "event queue full, dropped oldest");
    }
}

/// `backoff * 2^(attempts - 1)`, saturating at [`MAX_RETRY_DELAY`].
fn retry_delay(backoff: Duration, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    backoff
        .checked_mul(2u32.saturating_pow(exp))
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{ChangeKind, ChangePayload};
    use serde_json::json;

    fn event(entity: EntityType, id: &str) -> ChangeEvent {
        ChangeEvent::new(
            entity,
            ChangeKind::Update,
            id,
            ChangePayload::Unparsed(json!({ "id": id })),
        )
    }

    fn queue() -> EventQueue {
        EventQueue::new(500, 3, Duration::from_millis(100))
    }

    #[test]
    fn drains_fifo_per_entity() {
        let mut q = queue();
        for id in ["e1", "e2", "e3"] {
            q.enqueue(event(EntityType::Email, id));
        }
        let mut seen = Vec::new();
        let report = q.drain(|e| {
            seen.push(e.row_id.clone());
            Ok(Apply::Applied)
        });
        assert_eq!(seen, vec!["e1", "e2", "e3"]);
        assert_eq!(report.applied, 3);
        assert!(q.is_empty());
    }

    #[test]
    fn queued_count_tracks_unapplied_entries() {
        let mut q = queue();
        q.enqueue(event(EntityType::Email, "e1"));
        q.enqueue(event(EntityType::Project, "p1"));
        q.enqueue(event(EntityType::Email, "e2"));
        assert_eq!(q.len(), 3);
        assert_eq!(q.queued_for(&EntityType::Email), 2);

        q.drain(|e| {
            if e.entity == EntityType::Project {
                Ok(Apply::Applied)
            } else {
                Ok(Apply::Deferred)
            }
        });
        assert_eq!(q.len(), 2);
        assert_eq!(q.queued_for(&EntityType::Project), 0);
    }

    #[test]
    fn deferred_lane_keeps_order() {
        let mut q = queue();
        q.enqueue(event(EntityType::PlanningSlot, "s1"));
        q.enqueue(event(EntityType::PlanningSlot, "s2"));
        let report = q.drain(|_| Ok(Apply::Deferred));
        assert_eq!(report.deferred, 1);

        let mut seen = Vec::new();
        q.drain(|e| {
            seen.push(e.row_id.clone());
            Ok(Apply::Applied)
        });
        assert_eq!(seen, vec!["s1", "s2"]);
    }

    #[test]
    fn failing_head_blocks_lane_then_fails_permanently() {
        let mut q = queue();
        q.enqueue(event(EntityType::Email, "bad"));
        q.enqueue(event(EntityType::Email, "good"));
        let start = Instant::now();
        let fail = |e: &ChangeEvent| {
            if e.row_id == "bad" {
                Err(ApplyError::Upstream("refetch failed".into()))
            } else {
                Ok(Apply::Applied)
            }
        };

        let r1 = q.drain_at(start, fail);
        assert_eq!(r1.retried, 1);
        assert_eq!(q.len(), 2);
        assert_eq!(q.next_retry_at(), Some(start + Duration::from_millis(100)));

        // Not yet due.
        let r = q.drain_at(start + Duration::from_millis(50), fail);
        assert_eq!(r, DrainReport::default());

        let r2 = q.drain_at(start + Duration::from_millis(100), fail);
        assert_eq!(r2.retried, 1);
        assert_eq!(q.next_retry_at(), Some(start + Duration::from_millis(300)));

        let r3 = q.drain_at(start + Duration::from_millis(300), fail);
        assert_eq!(r3.failed, 1);
        assert_eq!(r3.applied, 1);
        assert!(q.is_empty());
        assert_eq!(q.failed_count(), 1);
        let failed: Vec<_> = q.failed().collect();
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].row_id(), Some("bad"));
    }

    #[test]
    fn overflow_drops_oldest_and_counts_it() {
        let mut q = EventQueue::new(3, 3, Duration::from_millis(100));
        q.enqueue(event(EntityType::Email, "e1"));
        q.enqueue(event(EntityType::Project, "p1"));
        q.enqueue(event(EntityType::Email, "e2"));
        q.enqueue(event(EntityType::Project, "p2"));

        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 1);
        let mut seen = Vec::new();
        q.drain(|e| {
            seen.push(e.row_id.clone());
            Ok(Apply::Applied)
        });
        seen.sort();
        assert_eq!(seen, vec!["e2", "p1", "p2"]);
    }

    #[test]
    fn clear_and_take_failed() {
        let mut q = queue();
        q.enqueue(event(EntityType::Email, "e1"));
        q.record_rejected(
            EntityType::Email,
            ApplyError::Malformed {
                entity: "emails".into(),
                reason: "missing row id".into(),
            },
        );
        assert_eq!(q.failed_count(), 1);
        assert_eq!(q.clear(), 1);
        assert!(q.is_empty());
        assert_eq!(q.dropped(), 0);

        let taken = q.take_failed();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].entity, EntityType::Email);
        assert_eq!(taken[0].row_id(), None);
        assert_eq!(taken[0].attempts, 0);
        assert_eq!(q.failed_count(), 0);
    }

    #[test]
    fn retry_delay_saturates_for_many_attempts() {
        let q = EventQueue::new(10, 40, Duration::from_millis(250));
        assert_eq!(q.retry_delay(1), Duration::from_millis(250));
        assert_eq!(q.retry_delay(3), Duration::from_millis(1000));
        assert_eq!(q.retry_delay(33), MAX_RETRY_DELAY);
        assert_eq!(q.retry_delay(u32::MAX), MAX_RETRY_DELAY);

        let huge = EventQueue::new(10, 3, Duration::from_secs(u64::MAX / 2));
        assert_eq!(huge.retry_delay(2), MAX_RETRY_DELAY);
    }

    #[test]
    fn always_failing_event_runs_out_of_attempts_at_high_bound() {
        let mut q = EventQueue::new(10, 40, Duration::from_millis(250));
        q.enqueue(event(EntityType::Project, "p1"));
        let mut now = Instant::now();
        let mut attempts = 0;
        loop {
            let r = q.drain_at(now, |_| Err(ApplyError::Upstream("down".into())));
            attempts += 1;
            if r.failed == 1 {
                break;
            }
            let next = q.next_retry_at().unwrap();
            assert!(next - now <= MAX_RETRY_DELAY);
            now = next;
        }
        assert_eq!(attempts, 40);
        assert_eq!(q.failed().next().unwrap().attempts, 40);
    }

    #[test]
    fn failed_list_is_capped_and_counts_evictions() {
        let mut q = EventQueue::new(2, 1, Duration::from_millis(100));
        q.enqueue(event(EntityType::Email, "e1"));
        q.enqueue(event(EntityType::Project, "p1"));
        q.drain(|_| Err(ApplyError::Upstream("down".into())));
        assert_eq!(q.failed_count(), 2);

        q.record_rejected(
            EntityType::PlanningSlot,
            ApplyError::Malformed {
                entity: "planning_slots".into(),
                reason: "missing row".into(),
            },
        );
        assert_eq!(q.failed_count(), 2);
        assert_eq!(q.failed_evicted(), 1);
        let entities: Vec<_> = q.failed().map(|f| f.entity.clone()).collect();
        assert_eq!(entities, vec![EntityType::Project, EntityType::PlanningSlot]);
    }
}

//! Realtime reconciliation: change events → cache invalidations.
//!
//! Each domain subscriber declares the entity channels it listens to and
//! maps an event to every cached view it could affect. The registry keeps
//! at most one subscriber per domain, so re-subscribing after a reconnect
//! never doubles handlers.

use crate::queue::Apply;
use beacon_core::{ApplyError, ChangeEvent, ChangeKind, ChangePayload, EntityType};
use beacon_transport::ChannelSpec;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio::sync::broadcast;

const INVALIDATION_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Domain {
    Email,
    Planning,
    Projects,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Email => "email",
            Self::Planning => "planning",
            Self::Projects => "projects",
        };
        f.write_str(name)
    }
}

/// A locally cached view. `None` scopes mean "all of them".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum CacheKey {
    EmailList { account_id: Option<String> },
    EmailSyncStatus { account_id: Option<String> },
    EmailThread { email_id: String },
    PlanningAvailability { user_id: Option<String> },
    PlanningCalendar,
    ProjectList,
    ProjectDetail { project_id: String },
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn scope(id: &Option<String>) -> &str {
            id.as_deref().unwrap_or("*")
        }
        match self {
            Self::EmailList { account_id } => write!(f, "emails/{}", scope(account_id)),
            Self::EmailSyncStatus { account_id } => {
                write!(f, "email-sync/{}", scope(account_id))
            }
            Self::EmailThread { email_id } => write!(f, "email/{email_id}"),
            Self::PlanningAvailability { user_id } => {
                write!(f, "availability/{}", scope(user_id))
            }
            Self::PlanningCalendar => write!(f, "calendar"),
            Self::ProjectList => write!(f, "projects"),
            Self::ProjectDetail { project_id } => write!(f, "project/{project_id}"),
        }
    }
}

/// Triggers a refetch of one cached view.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, key: &CacheKey) -> Result<(), ApplyError>;
}

/// Broadcasts invalidations to every listening view.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    sender: broadcast::Sender<CacheKey>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheKey> {
        self.sender.subscribe()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheInvalidator for InvalidationBus {
    fn invalidate(&self, key: &CacheKey) -> Result<(), ApplyError> {
        // No receivers means no mounted view holds this cache.
        let receivers = self.sender.send(key.clone()).unwrap_or(0);
        tracing::trace!(%key, receivers, "invalidated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

pub trait DomainSubscriber: Send + Sync {
    fn domain(&self) -> Domain;
    fn channels(&self) -> Vec<EntityType>;
    fn affected_keys(&self, event: &ChangeEvent) -> Vec<CacheKey>;
}

/// Email rows and account sync state.
#[derive(Debug, Default)]
pub struct EmailSubscriber;

impl DomainSubscriber for EmailSubscriber {
    fn domain(&self) -> Domain {
        Domain::Email
    }

    fn channels(&self) -> Vec<EntityType> {
        vec![EntityType::Email, EntityType::EmailAccount]
    }

    fn affected_keys(&self, event: &ChangeEvent) -> Vec<CacheKey> {
        match (&event.entity, &event.payload) {
            (EntityType::Email, payload) => {
                let account_id = match payload {
                    ChangePayload::Email(row) => Some(row.account_id.clone()),
                    _ => None,
                };
                let mut keys = vec![
                    CacheKey::EmailList {
                        account_id: account_id.clone(),
                    },
                    CacheKey::EmailSyncStatus { account_id },
                ];
                if event.kind != ChangeKind::Insert {
                    keys.push(CacheKey::EmailThread {
                        email_id: event.row_id.clone(),
                    });
                }
                keys
            }
            (EntityType::EmailAccount, _) => {
                let account_id = Some(event.row_id.clone());
                vec![
                    CacheKey::EmailSyncStatus {
                        account_id: account_id.clone(),
                    },
                    CacheKey::EmailList { account_id },
                ]
            }
            _ => Vec::new(),
        }
    }
}

/// Availability slots and the shared calendar.
#[derive(Debug, Default)]
pub struct PlanningSubscriber;

impl DomainSubscriber for PlanningSubscriber {
    fn domain(&self) -> Domain {
        Domain::Planning
    }

    fn channels(&self) -> Vec<EntityType> {
        vec![EntityType::PlanningSlot]
    }

    fn affected_keys(&self, event: &ChangeEvent) -> Vec<CacheKey> {
        if event.entity != EntityType::PlanningSlot {
            return Vec::new();
        }
        let user_id = match &event.payload {
            ChangePayload::PlanningSlot(slot) => Some(slot.user_id.clone()),
            _ => None,
        };
        vec![
            CacheKey::PlanningAvailability { user_id },
            CacheKey::PlanningCalendar,
        ]
    }
}

#[derive(Debug, Default)]
pub struct ProjectSubscriber;

impl DomainSubscriber for ProjectSubscriber {
    fn domain(&self) -> Domain {
        Domain::Projects
    }

    fn channels(&self) -> Vec<EntityType> {
        vec![EntityType::Project]
    }

    fn affected_keys(&self, event: &ChangeEvent) -> Vec<CacheKey> {
        if event.entity != EntityType::Project {
            return Vec::new();
        }
        vec![
            CacheKey::ProjectList,
            CacheKey::ProjectDetail {
                project_id: event.row_id.clone(),
            },
        ]
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    Replaced,
}

/// Active subscribers, keyed by domain, with an entity → domains route table.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscribers: BTreeMap<Domain, Box<dyn DomainSubscriber>>,
    routes: BTreeMap<EntityType, BTreeSet<Domain>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Email, planning and project subscribers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.subscribe(Box::new(EmailSubscriber));
        registry.subscribe(Box::new(PlanningSubscriber));
        registry.subscribe(Box::new(ProjectSubscriber));
        registry
    }

    /// Registers a subscriber, replacing any existing one for its domain.
    pub fn subscribe(&mut self, subscriber: Box<dyn DomainSubscriber>) -> SubscribeOutcome {
        let domain = subscriber.domain();
        let outcome = if self.subscribers.contains_key(&domain) {
            self.release_routes(domain);
            SubscribeOutcome::Replaced
        } else {
            SubscribeOutcome::Added
        };
        for entity in subscriber.channels() {
            self.routes.entry(entity).or_default().insert(domain);
        }
        self.subscribers.insert(domain, subscriber);
        tracing::debug!(%domain, ?outcome, "subscribed");
        outcome
    }

    /// Releases every channel of `domain`. Returns false if it was not active.
    pub fn unsubscribe(&mut self, domain: Domain) -> bool {
        if self.subscribers.remove(&domain).is_none() {
            return false;
        }
        self.release_routes(domain);
        tracing::debug!(%domain, "unsubscribed");
        true
    }

    /// Releases every domain.
    pub fn teardown(&mut self) -> usize {
        let count = self.subscribers.len();
        self.subscribers.clear();
        self.routes.clear();
        count
    }

    /// Teardown followed by subscribe of the same subscribers; returns the
    /// channels to open on the fresh connection.
    pub fn resubscribe_all(&mut self) -> Vec<ChannelSpec> {
        let subscribers = std::mem::take(&mut self.subscribers);
        self.routes.clear();
        for (_, subscriber) in subscribers {
            self.subscribe(subscriber);
        }
        self.channel_specs()
    }

    pub fn channel_specs(&self) -> Vec<ChannelSpec> {
        self.routes
            .keys()
            .cloned()
            .map(ChannelSpec::table)
            .collect()
    }

    pub fn domains(&self) -> Vec<Domain> {
        self.subscribers.keys().copied().collect()
    }

    pub fn is_routed(&self, entity: &EntityType) -> bool {
        self.routes.contains_key(entity)
    }

    /// Invalidates each affected view once.
    ///
    /// Entities nobody listens to yet are deferred; tables this client does
    /// not model are acknowledged without effect.
    pub fn dispatch(
        &self,
        event: &ChangeEvent,
        invalidator: &dyn CacheInvalidator,
    ) -> Result<Apply, ApplyError> {
        let Some(domains) = self.routes.get(&event.entity) else {
            if let EntityType::Unknown(table) = &event.entity {
                tracing::debug!(table, row_id = %event.row_id, "ignoring unmodelled table");
                return Ok(Apply::Applied);
            }
            return Ok(Apply::Deferred);
        };

        if !event.payload.is_parsed() {
            tracing::warn!(
                entity = %event.entity,
                row_id = %event.row_id,
                "unparsed payload, invalidating broad views"
            );
        }

        let keys: BTreeSet<CacheKey> = domains
            .iter()
            .filter_map(|domain| self.subscribers.get(domain))
            .flat_map(|subscriber| subscriber.affected_keys(event))
            .collect();
        for key in &keys {
            invalidator.invalidate(key)?;
        }
        Ok(Apply::Applied)
    }

    fn release_routes(&mut self, domain: Domain) {
        for domains in self.routes.values_mut() {
            domains.remove(&domain);
        }
        self.routes.retain(|_, domains| !domains.is_empty());
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("domains", &self.domains())
            .field("routes", &self.routes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::RawChange;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        keys: Mutex<Vec<CacheKey>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<CacheKey> {
            std::mem::take(&mut *self.keys.lock().unwrap())
        }
    }

    impl CacheInvalidator for Recorder {
        fn invalidate(&self, key: &CacheKey) -> Result<(), ApplyError> {
            self.keys.lock().unwrap().push(key.clone());
            Ok(())
        }
    }

    struct Refusing;

    impl CacheInvalidator for Refusing {
        fn invalidate(&self, _key: &CacheKey) -> Result<(), ApplyError> {
            Err(ApplyError::Invalidation("view unmounted".into()))
        }
    }

    fn parse(table: &str, kind: &str, row: serde_json::Value) -> ChangeEvent {
        ChangeEvent::from_raw(RawChange::new(table, kind, row)).unwrap()
    }

    #[test]
    fn email_change_invalidates_list_and_sync_status() {
        let registry = SubscriptionRegistry::with_defaults();
        let recorder = Recorder::default();
        let event = parse(
            "emails",
            "UPDATE",
            json!({"id": "e1", "account_id": "acc1", "is_read": true}),
        );

        assert_eq!(registry.dispatch(&event, &recorder), Ok(Apply::Applied));
        let keys = recorder.take();
        let account = Some("acc1".to_string());
        assert!(keys.contains(&CacheKey::EmailList {
            account_id: account.clone()
        }));
        assert!(keys.contains(&CacheKey::EmailSyncStatus {
            account_id: account
        }));
        assert!(keys.contains(&CacheKey::EmailThread {
            email_id: "e1".into()
        }));
    }

    #[test]
    fn planning_and_project_keys() {
        let registry = SubscriptionRegistry::with_defaults();
        let recorder = Recorder::default();

        let slot = parse(
            "planning_slots",
            "INSERT",
            json!({
                "id": "s1",
                "user_id": "u7",
                "starts_at": "2026-03-02T08:00:00Z",
                "ends_at": "2026-03-02T12:00:00Z"
            }),
        );
        registry.dispatch(&slot, &recorder).unwrap();
        assert_eq!(
            recorder.take(),
            vec![
                CacheKey::PlanningAvailability {
                    user_id: Some("u7".into())
                },
                CacheKey::PlanningCalendar,
            ]
        );

        let project = parse("projects", "DELETE", json!({"id": "p1", "name": "Roof"}));
        registry.dispatch(&project, &recorder).unwrap();
        assert_eq!(
            recorder.take(),
            vec![
                CacheKey::ProjectList,
                CacheKey::ProjectDetail {
                    project_id: "p1".into()
                },
            ]
        );
    }

    #[test]
    fn unparsed_email_invalidates_all_accounts() {
        let registry = SubscriptionRegistry::with_defaults();
        let recorder = Recorder::default();
        let event = parse("emails", "INSERT", json!({"id": "e9"}));
        registry.dispatch(&event, &recorder).unwrap();
        assert_eq!(
            recorder.take(),
            vec![
                CacheKey::EmailList { account_id: None },
                CacheKey::EmailSyncStatus { account_id: None },
            ]
        );
    }

    #[test]
    fn resubscribe_does_not_duplicate_invalidations() {
        let mut registry = SubscriptionRegistry::with_defaults();
        let before = registry.channel_specs();
        registry.subscribe(Box::new(EmailSubscriber));
        let after = registry.resubscribe_all();
        assert_eq!(before, after);
        assert_eq!(registry.domains().len(), 3);

        let recorder = Recorder::default();
        let event = parse("projects", "UPDATE", json!({"id": "p1", "name": "Roof"}));
        registry.dispatch(&event, &recorder).unwrap();
        assert_eq!(recorder.take().len(), 2);
    }

    #[test]
    fn unsubscribe_releases_channels_and_defers() {
        let mut registry = SubscriptionRegistry::with_defaults();
        assert!(registry.unsubscribe(Domain::Email));
        assert!(!registry.unsubscribe(Domain::Email));
        assert!(!registry.is_routed(&EntityType::Email));
        assert!(!registry.is_routed(&EntityType::EmailAccount));
        assert!(registry.is_routed(&EntityType::Project));

        let recorder = Recorder::default();
        let event = parse("emails", "INSERT", json!({"id": "e1", "account_id": "a"}));
        assert_eq!(registry.dispatch(&event, &recorder), Ok(Apply::Deferred));
        assert!(recorder.take().is_empty());

        assert_eq!(registry.teardown(), 2);
        assert!(registry.channel_specs().is_empty());
    }

    #[test]
    fn unknown_tables_are_acknowledged() {
        let registry = SubscriptionRegistry::with_defaults();
        let event = parse("invoices", "INSERT", json!({"id": "i1"}));
        assert_eq!(registry.dispatch(&event, &Refusing), Ok(Apply::Applied));
    }

    #[test]
    fn invalidator_failure_propagates() {
        let registry = SubscriptionRegistry::with_defaults();
        let event = parse("projects", "INSERT", json!({"id": "p1", "name": "Roof"}));
        assert!(matches!(
            registry.dispatch(&event, &Refusing),
            Err(ApplyError::Invalidation(_))
        ));
    }

    #[tokio::test]
    async fn bus_delivers_to_listeners() {
        let bus = InvalidationBus::new();
        let mut rx = bus.subscribe();
        bus.invalidate(&CacheKey::ProjectList).unwrap();
        assert_eq!(rx.recv().await.unwrap(), CacheKey::ProjectList);
        // No listeners is not an error.
        drop(rx);
        assert!(bus.invalidate(&CacheKey::PlanningCalendar).is_ok());
    }
}

//! Readiness state machine, event queue, sync status, realtime
//! reconciliation, orchestration and session output.

pub mod controller;
pub mod hooks;
pub mod hub;
pub mod queue;
pub mod readiness;
pub mod report;
pub mod sink;
pub mod status;

pub use controller::AppController;
pub use hooks::{
    CacheInvalidator, CacheKey, Domain, DomainSubscriber, EmailSubscriber, InvalidationBus,
    PlanningSubscriber, ProjectSubscriber, SubscribeOutcome, SubscriptionRegistry,
};
pub use hub::SyncHub;
pub use queue::{Apply, DrainReport, EventQueue, FailedEvent, QueuedEvent};
pub use readiness::{HistoryEntry, ReadinessMachine, ReadinessSnapshot, RetryTarget};
pub use report::SessionReport;
pub use status::{SyncHealth, SyncStatus};

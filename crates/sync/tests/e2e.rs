//! End-to-end scenarios over the in-memory backend and transport.

use beacon_core::{
    AppError, ApplyError, BeaconConfig, BeaconError, EntityType, ErrorKind, LoadingState,
    Permissions, RawChange, Role, TransitionError,
};
use beacon_sync::{
    AppController, CacheInvalidator, CacheKey, EventQueue, ReadinessMachine, SyncHealth, SyncHub,
    SyncStatus,
};
use beacon_transport::{
    Credentials, MemoryBackend, MemoryTransport, Phase, Profile, RealtimeTransport, Session,
    TransportEvent,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Default)]
struct Recorder {
    keys: Mutex<Vec<CacheKey>>,
}

impl Recorder {
    fn keys(&self) -> Vec<CacheKey> {
        self.keys.lock().unwrap().clone()
    }
}

impl CacheInvalidator for Recorder {
    fn invalidate(&self, key: &CacheKey) -> Result<(), ApplyError> {
        self.keys.lock().unwrap().push(key.clone());
        Ok(())
    }
}

async fn admin_backend() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend
        .add_user(
            "ada@acme.io",
            "secret",
            Profile {
                id: "u1".into(),
                role: Role::Administrator,
                display_name: None,
            },
            Permissions::from_iter(["users.manage".to_string()]),
        )
        .await;
    backend
        .set_cached_session(Some(Session {
            user_id: "u1".into(),
            expires_at: None,
        }))
        .await;
    backend
}

#[test]
fn invalid_transition_leaves_state_and_history() {
    let mut machine = ReadinessMachine::new(50, 3);
    let err = machine.start_loading_permissions("u1").unwrap_err();
    assert!(matches!(err, TransitionError::Invalid { .. }));
    assert_eq!(*machine.state(), LoadingState::Unauthenticated);
    assert_eq!(machine.history_len(), 0);

    machine.start_authenticating(true).unwrap();
    machine.start_validating_cache().unwrap();
    assert!(machine.start_validating_cache().is_err());
    assert!(machine.set_ready(beacon_core::UserInfo::new("u1", Role::Employee, ["x"])).is_err());
    assert_eq!(machine.history_len(), 2);
    assert_eq!(machine.transitions_accepted(), 2);
}

#[test]
fn problems_outranks_syncing() {
    let mut queue = EventQueue::new(500, 3, Duration::from_millis(250));
    for i in 0..5 {
        queue.enqueue(
            beacon_core::ChangeEvent::from_raw(RawChange::new(
                "projects",
                "INSERT",
                json!({"id": format!("p{i}"), "name": "Roof"}),
            ))
            .unwrap(),
        );
    }
    queue.record_rejected(
        EntityType::Project,
        ApplyError::Malformed {
            entity: "projects".into(),
            reason: "missing row id".into(),
        },
    );

    let status = SyncStatus::derive(true, &queue, None);
    assert_eq!(status.failed_events, 1);
    assert_eq!(status.queued_events, 5);
    assert_eq!(status.health(), SyncHealth::Problems);
}

#[test]
fn same_entity_events_apply_in_arrival_order() {
    let recorder = Arc::new(Recorder::default());
    let mut hub = SyncHub::from_config(&BeaconConfig::default(), recorder.clone());
    hub.handle_transport_event(TransportEvent::Connected);
    for id in ["e1", "e2", "e3"] {
        hub.handle_transport_event(TransportEvent::Change(RawChange::new(
            "emails",
            "UPDATE",
            json!({"id": id, "account_id": "acc1"}),
        )));
    }
    assert_eq!(hub.status().queued_events, 3);

    hub.set_consumer_ready(true);
    let threads: Vec<String> = recorder
        .keys()
        .into_iter()
        .filter_map(|key| match key {
            CacheKey::EmailThread { email_id } => Some(email_id),
            _ => None,
        })
        .collect();
    assert_eq!(threads, vec!["e1", "e2", "e3"]);
}

#[tokio::test]
async fn network_error_then_fresh_cycle_reaches_ready() {
    let backend = admin_backend().await;
    backend
        .push_failure(Phase::Validate, AppError::network("socket hang up"))
        .await;
    let ctl = AppController::new(
        backend,
        &BeaconConfig::default(),
        Arc::new(Recorder::default()),
    );

    match ctl.bootstrap(true).await {
        Err(BeaconError::Startup(error)) => {
            assert_eq!(error.kind, ErrorKind::Network);
            assert!(error.recoverable);
        }
        other => panic!("expected network failure, got {other:?}"),
    }

    let state = ctl
        .sign_in(&Credentials::new("ada@acme.io", "secret"))
        .await
        .unwrap();
    let LoadingState::Ready { user } = state else {
        panic!("expected ready");
    };
    assert_eq!(user.id, "u1");
    assert_eq!(user.role, Role::Administrator);
    assert!(user.has_permission("users.manage"));
}

#[tokio::test(start_paused = true)]
async fn stale_generation_completion_is_discarded() {
    let backend = admin_backend().await;
    backend
        .push_latency(Phase::Validate, Duration::from_secs(3))
        .await;
    let ctl = AppController::new(
        backend,
        &BeaconConfig::default(),
        Arc::new(Recorder::default()),
    );

    let first = {
        let ctl = ctl.clone();
        tokio::spawn(async move { ctl.bootstrap(true).await })
    };
    sleep(Duration::from_millis(100)).await;
    // Generation 2 validates immediately.
    let second = ctl.bootstrap(true).await.unwrap();
    assert!(second.is_ready());

    assert!(matches!(
        first.await.unwrap(),
        Err(BeaconError::Transition(TransitionError::Stale { .. }))
    ));
    let machine = ctl.machine();
    let machine = machine.lock().await;
    assert!(machine.state().is_ready());
    assert_eq!(machine.epoch(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_bound_requires_manual_action() {
    let config = BeaconConfig {
        max_reconnect_attempts: 5,
        ..BeaconConfig::default()
    };
    let ctl = AppController::new(
        admin_backend().await,
        &config,
        Arc::new(Recorder::default()),
    );
    let transport = Arc::new(MemoryTransport::new());
    transport.fail_next_connects(10).await;

    let task = {
        let ctl = ctl.clone();
        let transport: Arc<dyn RealtimeTransport> = transport.clone();
        tokio::spawn(async move { ctl.run_realtime(transport).await })
    };

    sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.connects().await, 5);
    sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.connects().await, 5);
    assert_eq!(ctl.sync_status().await.health(), SyncHealth::Offline);

    ctl.reconnect().await;
    sleep(Duration::from_millis(1)).await;
    assert_eq!(transport.connects().await, 6);

    ctl.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn resubscribe_after_reconnect_never_duplicates() {
    let recorder = Arc::new(Recorder::default());
    let ctl = AppController::new(admin_backend().await, &BeaconConfig::default(), recorder.clone());
    ctl.bootstrap(true).await.unwrap();
    let transport = Arc::new(MemoryTransport::new());

    let task = {
        let ctl = ctl.clone();
        let transport: Arc<dyn RealtimeTransport> = transport.clone();
        tokio::spawn(async move { ctl.run_realtime(transport).await })
    };

    for round in 0..3 {
        sleep(Duration::from_secs(2)).await;
        assert!(ctl.sync_status().await.connected, "round {round}");
        transport.close("network switch").await.unwrap();
    }
    sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.connects().await, 4);

    transport
        .emit(RawChange::new(
            "projects",
            "UPDATE",
            json!({"id": "p1", "name": "Roof"}),
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(
        recorder.keys(),
        vec![
            CacheKey::ProjectList,
            CacheKey::ProjectDetail {
                project_id: "p1".into()
            },
        ]
    );
    assert_eq!(ctl.sync_status().await.health(), SyncHealth::Online);

    ctl.shutdown();
    task.await.unwrap().unwrap();
}

async fn settle() {
    for _ in 0..1_000 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn sign_out_racing_startup_keeps_hub_and_machine_in_step() {
    let ctl = AppController::new(
        admin_backend().await,
        &BeaconConfig::default(),
        Arc::new(Recorder::default()),
    );
    let hub = ctl.hub().lock_owned().await;

    let signing_out = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.sign_out().await }
    });
    settle().await;
    let signing_in = tokio::spawn({
        let ctl = ctl.clone();
        async move {
            ctl.sign_in(&Credentials::new("ada@acme.io", "secret"))
                .await
        }
    });
    settle().await;
    drop(hub);

    signing_out.await.unwrap().unwrap();
    let returned = signing_in.await.unwrap().unwrap();
    let state = ctl.state().await;
    assert_eq!(returned, state);
    assert_eq!(ctl.hub().lock().await.consumer_ready(), state.is_ready());
}

#[tokio::test(start_paused = true)]
async fn apply_retries_at_configured_bound_never_overflow() {
    let config = BeaconConfig::from_json(r#"{"max_apply_attempts": 40}"#).unwrap();
    struct Down;
    impl CacheInvalidator for Down {
        fn invalidate(&self, _key: &CacheKey) -> Result<(), ApplyError> {
            Err(ApplyError::Upstream("refetch failed".into()))
        }
    }
    let mut hub = SyncHub::from_config(&config, Arc::new(Down));
    hub.set_consumer_ready(true);
    hub.handle_transport_event(TransportEvent::Connected);
    hub.handle_transport_event(TransportEvent::Change(RawChange::new(
        "projects",
        "UPDATE",
        json!({"id": "p1", "name": "Roof"}),
    )));

    while let Some(at) = hub.next_retry_at() {
        tokio::time::sleep_until(at).await;
        hub.flush();
    }
    let status = hub.status();
    assert_eq!(status.queued_events, 0);
    assert_eq!(status.failed_events, 1);
    let failed = hub.take_failed();
    assert_eq!(failed[0].attempts, 40);
    assert_eq!(failed[0].row_id(), Some("p1"));
}

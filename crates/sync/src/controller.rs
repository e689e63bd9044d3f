//! Async orchestration over the backend seams.
//!
//! The controller is the only writer of the readiness machine and the sync
//! hub. It walks the startup phases, bounds each network call with the
//! configured phase timeout, and drops completions whose epoch has been
//! superseded. `run_realtime` keeps the change channel alive with bounded
//! automatic reconnects.

use crate::hooks::CacheInvalidator;
use crate::hub::SyncHub;
use crate::readiness::{ReadinessMachine, ReadinessSnapshot, RetryTarget};
use crate::status::SyncStatus;
use beacon_core::{
    AppError, BeaconConfig, BeaconError, BeaconResult, Epoch, LoadingState, Section,
    TransitionError, UserInfo,
};
use beacon_transport::{
    Credentials, RealtimeTransport, ReconnectDecision, SessionBackend, TransportEvent,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{sleep, sleep_until, timeout, Instant};

const INITIAL_LOAD: &str = "initial load";

/// Why the event pump returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    Dropped,
    Shutdown,
}

#[derive(Clone)]
pub struct AppController {
    backend: Arc<dyn SessionBackend>,
    machine: Arc<Mutex<ReadinessMachine>>,
    hub: Arc<Mutex<SyncHub>>,
    phase_timeout: Duration,
    readiness_rx: watch::Receiver<ReadinessSnapshot>,
    status_rx: watch::Receiver<SyncStatus>,
    manual_reconnect: Arc<Notify>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppController {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        config: &BeaconConfig,
        invalidator: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self::with_parts(
            backend,
            ReadinessMachine::from_config(config),
            SyncHub::from_config(config, invalidator),
            config.phase_timeout(),
        )
    }

    pub fn with_parts(
        backend: Arc<dyn SessionBackend>,
        machine: ReadinessMachine,
        hub: SyncHub,
        phase_timeout: Duration,
    ) -> Self {
        let readiness_rx = machine.subscribe();
        let status_rx = hub.subscribe_status();
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            machine: Arc::new(Mutex::new(machine)),
            hub: Arc::new(Mutex::new(hub)),
            phase_timeout,
            readiness_rx,
            status_rx,
            manual_reconnect: Arc::new(Notify::new()),
            shutdown: Arc::new(shutdown),
        }
    }

    // -- Observers ----------------------------------------------------------

    pub fn machine(&self) -> Arc<Mutex<ReadinessMachine>> {
        Arc::clone(&self.machine)
    }

    pub fn hub(&self) -> Arc<Mutex<SyncHub>> {
        Arc::clone(&self.hub)
    }

    pub async fn state(&self) -> LoadingState {
        self.machine.lock().await.state().clone()
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.hub.lock().await.status()
    }

    pub fn subscribe_readiness(&self) -> watch::Receiver<ReadinessSnapshot> {
        self.readiness_rx.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    // -- Startup ------------------------------------------------------------

    /// Starts a cycle. With a cached session, validates it and loads the
    /// user through to `Ready`; otherwise stops at `Authenticating` and waits
    /// for [`Self::sign_in`].
    pub async fn bootstrap(&self, has_cache: bool) -> BeaconResult<LoadingState> {
        let epoch = self.machine.lock().await.start_authenticating(has_cache)?;
        tracing::info!(epoch, has_cache, "bootstrap");
        if !has_cache {
            return Ok(self.state().await);
        }
        self.advance(epoch, |m| m.start_validating_cache()).await?;
        let session = self
            .phase(epoch, "validate_session", self.backend.validate_session())
            .await?;
        self.load_user(epoch, &session.user_id).await
    }

    /// Fresh credential sign-in. Supersedes any in-flight cycle.
    pub async fn sign_in(&self, credentials: &Credentials) -> BeaconResult<LoadingState> {
        let epoch = self.machine.lock().await.start_authenticating(false)?;
        tracing::info!(epoch, email = %credentials.email, "sign-in");
        let session = self
            .phase(epoch, "sign_in", self.backend.sign_in(credentials))
            .await?;
        self.load_user(epoch, &session.user_id).await
    }

    pub async fn retry(&self) -> BeaconResult<LoadingState> {
        let (epoch, target) = self.machine.lock().await.retry()?;
        tracing::info!(epoch, ?target, "retrying startup");
        match target {
            RetryTarget::Unauthenticated => Ok(self.state().await),
            RetryTarget::ValidatingCache => {
                let session = self
                    .phase(epoch, "validate_session", self.backend.validate_session())
                    .await?;
                self.load_user(epoch, &session.user_id).await
            }
        }
    }

    /// Resets local state first, then tells the backend.
    ///
    /// Takes the machine lock before the hub lock, like the last startup step.
    pub async fn sign_out(&self) -> BeaconResult<()> {
        let epoch = {
            let mut machine = self.machine.lock().await;
            let epoch = machine.set_unauthenticated();
            let mut hub = self.hub.lock().await;
            hub.set_consumer_ready(false);
            hub.clear_queue();
            epoch
        };
        tracing::info!(epoch, "signed out");

        match timeout(self.phase_timeout, self.backend.sign_out()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "backend sign-out failed");
                Err(BeaconError::Transport(error.to_string()))
            }
            Err(_) => {
                tracing::warn!("backend sign-out timed out");
                Err(BeaconError::Transport("sign-out timed out".to_string()))
            }
        }
    }

    async fn load_user(&self, epoch: Epoch, user_id: &str) -> BeaconResult<LoadingState> {
        self.advance(epoch, |m| m.start_loading_profile(user_id))
            .await?;
        let profile = self
            .phase(epoch, "fetch_profile", self.backend.fetch_profile(user_id))
            .await?;

        self.advance(epoch, |m| m.start_loading_permissions(user_id))
            .await?;
        let permissions = self
            .phase(
                epoch,
                "fetch_permissions",
                self.backend.fetch_permissions(user_id),
            )
            .await?;

        let user = UserInfo::new(profile.id, profile.role, permissions);
        let is_admin = user.is_admin();
        self.advance(epoch, |m| m.start_initializing_data(is_admin))
            .await?;

        for &section in Section::eager(is_admin) {
            self.advance(epoch, |m| {
                m.start_loading_section(section, Some(INITIAL_LOAD.to_string()))
            })
            .await?;
            self.phase(epoch, "load_section", self.backend.load_section(section))
                .await?;
            self.advance(epoch, |m| Ok(m.complete_section(section)))
                .await?;
        }

        let mut machine = self.machine.lock().await;
        machine.ensure_current(epoch)?;
        machine.set_ready(user)?;
        let report = self.hub.lock().await.set_consumer_ready(true);
        if report.applied > 0 {
            tracing::info!(applied = report.applied, "applied changes buffered during startup");
        }
        Ok(machine.state().clone())
    }

    /// Applies one transition if `epoch` is still the current cycle.
    async fn advance<T, F>(&self, epoch: Epoch, step: F) -> BeaconResult<T>
    where
        F: FnOnce(&mut ReadinessMachine) -> Result<T, TransitionError>,
    {
        let mut machine = self.machine.lock().await;
        machine.ensure_current(epoch)?;
        Ok(step(&mut *machine)?)
    }

    /// Awaits one backend call under the phase timeout.
    ///
    /// Stale completions are discarded before their result is looked at.
    /// Failures of the current cycle move the machine to `Error`.
    async fn phase<T, F>(&self, epoch: Epoch, name: &'static str, call: F) -> BeaconResult<T>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        let outcome = match timeout(self.phase_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AppError::network(format!(
                "{name} timed out after {}ms",
                self.phase_timeout.as_millis()
            ))),
        };

        let mut machine = self.machine.lock().await;
        machine.ensure_current(epoch)?;
        outcome.map_err(|error| {
            tracing::warn!(phase = name, epoch, error = %error, "startup phase failed");
            BeaconError::Startup(machine.set_error(error))
        })
    }

    // -- Realtime -----------------------------------------------------------

    /// Connects and pumps change events into the hub until [`Self::shutdown`].
    ///
    /// Failed connects back off exponentially. Once the monitor's bound is
    /// reached the loop parks until [`Self::reconnect`].
    pub async fn run_realtime(&self, transport: Arc<dyn RealtimeTransport>) -> BeaconResult<()> {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let channels = self.hub.lock().await.resubscribe();
            let delay = match transport.connect(&channels).await {
                Ok(events) => {
                    tracing::info!(channels = channels.len(), "realtime channel open");
                    if self.pump(events, &mut shutdown).await == PumpExit::Shutdown {
                        break;
                    }
                    Some(self.hub.lock().await.monitor().backoff_delay())
                }
                Err(err) => {
                    tracing::warn!(error = %err, "realtime connect failed");
                    match self.hub.lock().await.on_reconnect_failed() {
                        ReconnectDecision::RetryAfter(delay) => Some(delay),
                        ReconnectDecision::GiveUp => None,
                    }
                }
            };

            match delay {
                Some(delay) => {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                None => {
                    tracing::warn!("realtime parked until manual reconnect");
                    tokio::select! {
                        _ = self.manual_reconnect.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        self.hub
            .lock()
            .await
            .handle_transport_event(TransportEvent::Closed {
                reason: "shutdown".to_string(),
            });
        tracing::info!("realtime loop stopped");
        Ok(())
    }

    async fn pump(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        loop {
            let retry_at = self.hub.lock().await.next_retry_at();
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        self.hub.lock().await.handle_transport_event(TransportEvent::Closed {
                            reason: "stream ended".to_string(),
                        });
                        return PumpExit::Dropped;
                    };
                    let dropped = matches!(
                        event,
                        TransportEvent::Closed { .. } | TransportEvent::Error { .. }
                    );
                    self.hub.lock().await.handle_transport_event(event);
                    if dropped {
                        return PumpExit::Dropped;
                    }
                }
                _ = retry_timer(retry_at) => {
                    self.hub.lock().await.flush();
                }
                _ = shutdown.changed() => return PumpExit::Shutdown,
            }
        }
    }

    /// Manual reconnect. Wakes a parked realtime loop.
    pub async fn reconnect(&self) {
        let parked = {
            let mut hub = self.hub.lock().await;
            let parked = hub.monitor().needs_manual_reconnect();
            hub.reconnect();
            parked
        };
        if parked {
            self.manual_reconnect.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

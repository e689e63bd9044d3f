//! In-memory backend and transport.
//!
//! Scriptable stand-ins for the hosted backend: per-phase latency and
//! failure queues, call counters, and a push handle for change events.
//! Used by the CLI simulation and by tests.

use crate::{
    ChannelSpec, Credentials, Profile, RealtimeTransport, Session, SessionBackend, TransportError,
    TransportEvent,
};
use async_trait::async_trait;
use beacon_core::{AppError, Permissions, RawChange, Section};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const CHANNEL_CAPACITY: usize = 1024;

/// Backend call classes, for scripting latency and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    SignIn,
    Validate,
    Profile,
    Permissions,
    Section,
    SignOut,
}

#[derive(Debug, Default)]
struct BackendState {
    cached_session: Option<Session>,
    passwords: HashMap<String, (String, String)>,
    profiles: HashMap<String, (Profile, Permissions)>,
    latencies: HashMap<Phase, VecDeque<Duration>>,
    failures: HashMap<Phase, VecDeque<AppError>>,
    calls: HashMap<Phase, usize>,
    loaded_sections: Vec<Section>,
}

/// Scriptable [`SessionBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user that can sign in with `email`/`password`.
    pub async fn add_user(
        &self,
        email: &str,
        password: &str,
        profile: Profile,
        permissions: Permissions,
    ) {
        let mut state = self.state.lock().await;
        state.passwords.insert(
            email.to_string(),
            (password.to_string(), profile.id.clone()),
        );
        state
            .profiles
            .insert(profile.id.clone(), (profile, permissions));
    }

    /// Session returned by `validate_session`. `None` means no cached session.
    pub async fn set_cached_session(&self, session: Option<Session>) {
        self.state.lock().await.cached_session = session;
    }

    /// Delays the next call of `phase` by `latency`.
    pub async fn push_latency(&self, phase: Phase, latency: Duration) {
        let mut state = self.state.lock().await;
        state.latencies.entry(phase).or_default().push_back(latency);
    }

    /// Fails the next call of `phase` with `error`.
    pub async fn push_failure(&self, phase: Phase, error: AppError) {
        let mut state = self.state.lock().await;
        state.failures.entry(phase).or_default().push_back(error);
    }

    pub async fn calls(&self, phase: Phase) -> usize {
        self.state
            .lock()
            .await
            .calls
            .get(&phase)
            .copied()
            .unwrap_or(0)
    }

    pub async fn loaded_sections(&self) -> Vec<Section> {
        self.state.lock().await.loaded_sections.clone()
    }

    /// Counts the call, sleeps any scripted latency, then pops a scripted failure.
    async fn enter(&self, phase: Phase) -> Result<(), AppError> {
        let latency = {
            let mut state = self.state.lock().await;
            *state.calls.entry(phase).or_default() += 1;
            state
                .latencies
                .get_mut(&phase)
                .and_then(VecDeque::pop_front)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let failure = self
            .state
            .lock()
            .await
            .failures
            .get_mut(&phase)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AppError> {
        self.enter(Phase::SignIn).await?;
        let mut state = self.state.lock().await;
        let user_id = match state.passwords.get(&credentials.email) {
            Some((password, user_id)) if *password == credentials.password => user_id.clone(),
            _ => return Err(AppError::auth("invalid email or password")),
        };
        let session = Session {
            user_id,
            expires_at: None,
        };
        state.cached_session = Some(session.clone());
        Ok(session)
    }

    async fn validate_session(&self) -> Result<Session, AppError> {
        self.enter(Phase::Validate).await?;
        self.state
            .lock()
            .await
            .cached_session
            .clone()
            .ok_or_else(|| AppError::auth("session expired"))
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Profile, AppError> {
        self.enter(Phase::Profile).await?;
        self.state
            .lock()
            .await
            .profiles
            .get(user_id)
            .map(|(profile, _)| profile.clone())
            .ok_or_else(|| AppError::data(format!("no profile row for `{user_id}`")))
    }

    async fn fetch_permissions(&self, user_id: &str) -> Result<Permissions, AppError> {
        self.enter(Phase::Permissions).await?;
        self.state
            .lock()
            .await
            .profiles
            .get(user_id)
            .map(|(_, permissions)| permissions.clone())
            .ok_or_else(|| AppError::permission(format!("no role assigned to `{user_id}`")))
    }

    async fn load_section(&self, section: Section) -> Result<(), AppError> {
        self.enter(Phase::Section).await?;
        self.state.lock().await.loaded_sections.push(section);
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), AppError> {
        self.enter(Phase::SignOut).await?;
        self.state.lock().await.cached_session = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TransportState {
    sender: Option<mpsc::Sender<TransportEvent>>,
    failures_remaining: u32,
    connects: usize,
    channels: Vec<ChannelSpec>,
}

/// Scriptable [`RealtimeTransport`]. Tests push events through `emit`.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<TransportState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` connect attempts fail.
    pub async fn fail_next_connects(&self, n: u32) {
        self.state.lock().await.failures_remaining = n;
    }

    /// Successful + failed connect attempts so far.
    pub async fn connects(&self) -> usize {
        self.state.lock().await.connects
    }

    pub async fn channels(&self) -> Vec<ChannelSpec> {
        self.state.lock().await.channels.clone()
    }

    pub async fn is_open(&self) -> bool {
        self.state
            .lock()
            .await
            .sender
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Delivers one change on the open connection.
    pub async fn emit(&self, change: RawChange) -> Result<(), TransportError> {
        self.send(TransportEvent::Change(change)).await
    }

    /// Closes the open connection, as a server-side drop would.
    pub async fn close(&self, reason: &str) -> Result<(), TransportError> {
        let sender = self
            .state
            .lock()
            .await
            .sender
            .take()
            .ok_or(TransportError::Closed)?;
        sender
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn send(&self, event: TransportEvent) -> Result<(), TransportError> {
        let sender = self
            .state
            .lock()
            .await
            .sender
            .clone()
            .ok_or(TransportError::Closed)?;
        sender.send(event).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn connect(
        &self,
        channels: &[ChannelSpec],
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let mut state = self.state.lock().await;
        state.connects += 1;
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tx.send(TransportEvent::Connected)
            .await
            .map_err(|_| TransportError::Closed)?;
        state.sender = Some(tx);
        state.channels = channels.to_vec();
        Ok(rx)
    }
}

//! Application readiness state machine.
//!
//! Single source of truth for what the UI may show. Startup walks
//!
//! ```text
//! Unauthenticated → Authenticating → ValidatingCache → LoadingProfile
//!   → LoadingPermissions → InitializingData → LoadingSection* → Ready
//! ```
//!
//! with `Error` reachable from anywhere and `set_unauthenticated` resetting
//! from anywhere. Rejected requests leave state and history untouched.
//! Every accepted transition publishes one [`ReadinessSnapshot`].

use beacon_core::{
    AppError, BeaconConfig, Epoch, ErrorKind, LoadingState, Section, StateKind, TransitionError,
    UserInfo,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use tokio::sync::watch;

/// One accepted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub kind: StateKind,
    pub at: DateTime<Utc>,
    pub epoch: Epoch,
}

/// Derived view published to observers. All flags come from one state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadinessSnapshot {
    pub state: LoadingState,
    pub is_loading: bool,
    pub is_error: bool,
    pub is_ready: bool,
    pub is_authenticated: bool,
    pub can_retry: bool,
    pub epoch: Epoch,
    pub pending_sections: Vec<Section>,
}

impl ReadinessSnapshot {
    fn of(state: &LoadingState, epoch: Epoch, pending: &BTreeSet<Section>) -> Self {
        Self {
            state: state.clone(),
            is_loading: state.is_loading(),
            is_error: state.is_error(),
            is_ready: state.is_ready(),
            is_authenticated: state.is_authenticated(),
            can_retry: state.error().is_some_and(|e| e.recoverable),
            epoch,
            pending_sections: pending.iter().copied().collect(),
        }
    }
}

/// Where `retry()` restarts the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTarget {
    Unauthenticated,
    ValidatingCache,
}

#[derive(Debug)]
pub struct ReadinessMachine {
    state: LoadingState,
    epoch: Epoch,
    history: VecDeque<HistoryEntry>,
    history_capacity: usize,
    accepted: u64,
    pending_sections: BTreeSet<Section>,
    had_cache: bool,
    data_errors: u32,
    max_data_retries: u32,
    tx: watch::Sender<ReadinessSnapshot>,
}

impl ReadinessMachine {
    pub fn new(history_capacity: usize, max_data_retries: u32) -> Self {
        let state = LoadingState::Unauthenticated;
        let (tx, _rx) = watch::channel(ReadinessSnapshot::of(&state, 0, &BTreeSet::new()));
        Self {
            state,
            epoch: 0,
            history: VecDeque::with_capacity(history_capacity),
            history_capacity: history_capacity.max(1),
            accepted: 0,
            pending_sections: BTreeSet::new(),
            had_cache: false,
            data_errors: 0,
            max_data_retries,
            tx,
        }
    }

    pub fn from_config(config: &BeaconConfig) -> Self {
        Self::new(config.history_capacity, config.max_data_retries)
    }

    // -- Observers ----------------------------------------------------------

    pub fn state(&self) -> &LoadingState {
        &self.state
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Retained history, oldest first. Capped; see [`Self::transitions_accepted`].
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Total accepted transitions, including those evicted from history.
    pub fn transitions_accepted(&self) -> u64 {
        self.accepted
    }

    pub fn pending_sections(&self) -> impl Iterator<Item = Section> + '_ {
        self.pending_sections.iter().copied()
    }

    pub fn snapshot(&self) -> ReadinessSnapshot {
        ReadinessSnapshot::of(&self.state, self.epoch, &self.pending_sections)
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessSnapshot> {
        self.tx.subscribe()
    }

    /// Rejects completions that belong to a superseded cycle.
    pub fn ensure_current(&self, epoch: Epoch) -> Result<(), TransitionError> {
        if epoch != self.epoch {
            tracing::debug!(stale = epoch, current = self.epoch, "discarding stale completion");
            return Err(TransitionError::Stale {
                stale: epoch,
                current: self.epoch,
            });
        }
        Ok(())
    }

    // -- Transitions --------------------------------------------------------

    /// Starts a new authentication cycle and returns its epoch.
    ///
    /// Accepted from `Unauthenticated`, from `Error`, and from any in-flight
    /// startup phase, which it supersedes. Rejected once `Ready`.
    pub fn start_authenticating(&mut self, has_cache: bool) -> Result<Epoch, TransitionError> {
        const ACTION: &str = "start_authenticating";
        if self.state.is_ready() {
            return Err(self.invalid(ACTION));
        }
        if !matches!(
            self.state,
            LoadingState::Unauthenticated | LoadingState::Error { .. }
        ) {
            tracing::info!(
                from = %self.state.kind(),
                epoch = self.epoch,
                "superseding in-flight authentication"
            );
        }
        self.epoch += 1;
        self.had_cache = has_cache;
        self.pending_sections.clear();
        self.transition(LoadingState::Authenticating { has_cache });
        Ok(self.epoch)
    }

    pub fn start_validating_cache(&mut self) -> Result<(), TransitionError> {
        const ACTION: &str = "start_validating_cache";
        match self.state {
            LoadingState::Authenticating { has_cache: true } => {
                self.transition(LoadingState::ValidatingCache);
                Ok(())
            }
            LoadingState::ValidatingCache => Err(self.duplicate(ACTION)),
            _ => Err(self.invalid(ACTION)),
        }
    }

    pub fn start_loading_profile(&mut self, user_id: &str) -> Result<(), TransitionError> {
        const ACTION: &str = "start_loading_profile";
        require_user_id(ACTION, user_id)?;
        match &self.state {
            LoadingState::Authenticating { .. } | LoadingState::ValidatingCache => {
                self.transition(LoadingState::LoadingProfile {
                    user_id: user_id.to_string(),
                });
                Ok(())
            }
            LoadingState::LoadingProfile { user_id: active } if active == user_id => {
                Err(self.duplicate(ACTION))
            }
            _ => Err(self.invalid(ACTION)),
        }
    }

    pub fn start_loading_permissions(&mut self, user_id: &str) -> Result<(), TransitionError> {
        const ACTION: &str = "start_loading_permissions";
        require_user_id(ACTION, user_id)?;
        match &self.state {
            LoadingState::LoadingProfile { user_id: active } if active == user_id => {
                self.transition(LoadingState::LoadingPermissions {
                    user_id: user_id.to_string(),
                });
                Ok(())
            }
            LoadingState::LoadingProfile { user_id: active } => {
                let err = TransitionError::UserMismatch {
                    action: ACTION,
                    requested: user_id.to_string(),
                    active: active.clone(),
                };
                tracing::warn!(error = %err, "transition rejected");
                Err(err)
            }
            LoadingState::LoadingPermissions { user_id: active } if active == user_id => {
                Err(self.duplicate(ACTION))
            }
            _ => Err(self.invalid(ACTION)),
        }
    }

    pub fn start_initializing_data(&mut self, is_admin: bool) -> Result<(), TransitionError> {
        const ACTION: &str = "start_initializing_data";
        match self.state {
            LoadingState::LoadingPermissions { .. } => {
                self.transition(LoadingState::InitializingData { is_admin });
                Ok(())
            }
            LoadingState::InitializingData { .. } => Err(self.duplicate(ACTION)),
            _ => Err(self.invalid(ACTION)),
        }
    }

    /// Marks `section` as loading. Repeatable for different sections.
    pub fn start_loading_section(
        &mut self,
        section: Section,
        operation: Option<String>,
    ) -> Result<(), TransitionError> {
        const ACTION: &str = "start_loading_section";
        match self.state {
            LoadingState::InitializingData { .. } | LoadingState::LoadingSection { .. } => {
                if self.pending_sections.contains(&section) {
                    return Err(self.duplicate(ACTION));
                }
                self.pending_sections.insert(section);
                self.transition(LoadingState::LoadingSection { section, operation });
                Ok(())
            }
            _ => Err(self.invalid(ACTION)),
        }
    }

    /// Clears one pending section flag. Not a transition.
    pub fn complete_section(&mut self, section: Section) -> bool {
        let removed = self.pending_sections.remove(&section);
        if removed {
            tracing::debug!(%section, "section loaded");
            self.publish();
        }
        removed
    }

    pub fn set_ready(&mut self, user: UserInfo) -> Result<(), TransitionError> {
        const ACTION: &str = "set_ready";
        match self.state {
            LoadingState::InitializingData { .. } | LoadingState::LoadingSection { .. } => {
                self.pending_sections.clear();
                self.data_errors = 0;
                tracing::info!(user_id = %user.id, role = %user.role, "ready");
                self.transition(LoadingState::Ready { user });
                Ok(())
            }
            _ => Err(self.invalid(ACTION)),
        }
    }

    /// Terminal failure for the cycle. Accepted from any state.
    ///
    /// Returns the stored error, which loses its retry affordance once
    /// consecutive data errors exceed the configured cap.
    pub fn set_error(&mut self, error: AppError) -> AppError {
        let error = if error.kind == ErrorKind::Data {
            self.data_errors += 1;
            if self.data_errors > self.max_data_retries {
                error.into_terminal()
            } else {
                error
            }
        } else {
            self.data_errors = 0;
            error
        };
        tracing::warn!(
            kind = %error.kind,
            recoverable = error.recoverable,
            message = %error.message,
            "entering error state"
        );
        self.transition(LoadingState::Error {
            error: error.clone(),
        });
        error
    }

    /// Sign-out or session expiry. Accepted from any state.
    pub fn set_unauthenticated(&mut self) -> Epoch {
        self.epoch += 1;
        self.pending_sections.clear();
        self.had_cache = false;
        self.data_errors = 0;
        self.transition(LoadingState::Unauthenticated);
        self.epoch
    }

    /// Restarts after a recoverable error.
    ///
    /// Network and data failures of a cycle that had a cached session resume
    /// at cache validation; everything else goes back to sign-in.
    pub fn retry(&mut self) -> Result<(Epoch, RetryTarget), TransitionError> {
        const ACTION: &str = "retry";
        let error = match &self.state {
            LoadingState::Error { error } => error,
            _ => return Err(self.invalid(ACTION)),
        };
        if !error.recoverable {
            return Err(TransitionError::NotRecoverable);
        }
        let target = match error.kind {
            ErrorKind::Network | ErrorKind::Data if self.had_cache => RetryTarget::ValidatingCache,
            _ => RetryTarget::Unauthenticated,
        };
        self.epoch += 1;
        self.pending_sections.clear();
        match target {
            RetryTarget::ValidatingCache => self.transition(LoadingState::ValidatingCache),
            RetryTarget::Unauthenticated => {
                self.had_cache = false;
                self.transition(LoadingState::Unauthenticated)
            }
        }
        Ok((self.epoch, target))
    }

    // -- Internals ----------------------------------------------------------

    fn transition(&mut self, next: LoadingState) {
        let from = self.state.kind();
        self.state = next;
        let to = self.state.kind();

        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            kind: to,
            at: Utc::now(),
            epoch: self.epoch,
        });
        self.accepted += 1;

        tracing::debug!(%from, %to, epoch = self.epoch, "transition");
        self.publish();
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        let err = TransitionError::Invalid {
            from: self.state.kind().as_str(),
            action,
        };
        tracing::warn!(error = %err, "transition rejected");
        err
    }

    fn duplicate(&self, action: &'static str) -> TransitionError {
        tracing::debug!(action, "duplicate request ignored");
        TransitionError::Duplicate { action }
    }
}

fn require_user_id(action: &'static str, user_id: &str) -> Result<(), TransitionError> {
    if user_id.trim().is_empty() {
        return Err(TransitionError::EmptyUserId { action });
    }
    Ok(())
}

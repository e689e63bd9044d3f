//! Backend abstractions and realtime connection monitoring for Beacon.

pub mod memory;
pub mod monitor;

use async_trait::async_trait;
use beacon_core::error::BeaconError;
use beacon_core::{AppError, EntityType, Permissions, RawChange, Role, Section};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::{MemoryBackend, MemoryTransport, Phase};
pub use monitor::{ConnectionMonitor, ConnectionSnapshot, ReconnectDecision};

// ---------------------------------------------------------------------------
// Session API
// ---------------------------------------------------------------------------

/// Authenticated backend session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Profile row loaded after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub role: Role,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// Session, profile and section calls against the hosted backend.
///
/// Failures are already classified into the user-facing taxonomy.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AppError>;
    /// Verifies the locally cached session is still accepted.
    async fn validate_session(&self) -> Result<Session, AppError>;
    async fn fetch_profile(&self, user_id: &str) -> Result<Profile, AppError>;
    async fn fetch_permissions(&self, user_id: &str) -> Result<Permissions, AppError>;
    async fn load_section(&self, section: Section) -> Result<(), AppError>;
    async fn sign_out(&self) -> Result<(), AppError>;
}

// ---------------------------------------------------------------------------
// Realtime transport
// ---------------------------------------------------------------------------

/// One realtime subscription: a table plus an optional row filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub entity: EntityType,
    pub filter: Option<String>,
}

impl ChannelSpec {
    pub fn table(entity: EntityType) -> Self {
        Self {
            entity,
            filter: None,
        }
    }
}

/// Transport-level notifications, in delivery order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Change(RawChange),
    Closed { reason: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("channel closed")]
    Closed,
}

impl From<TransportError> for BeaconError {
    fn from(err: TransportError) -> Self {
        BeaconError::Transport(err.to_string())
    }
}

/// Push channel delivering row-level change notifications.
///
/// `connect` opens one logical connection for the given channels. The
/// receiver ends when the connection is gone.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(
        &self,
        channels: &[ChannelSpec],
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;
}

//! Centralized error types for the Beacon workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error enum. Variants map to subsystems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BeaconError {
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup failed: {0}")]
    Startup(AppError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type BeaconResult<T> = Result<T, BeaconError>;

// ---------------------------------------------------------------------------
// User-facing application errors
// ---------------------------------------------------------------------------

/// Failure classes surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invalid credentials or expired session. Recoverable via re-login.
    Auth,
    /// Transport failure or timeout. Recoverable via retry.
    Network,
    /// Authorization denial. Needs a role change, never retried.
    Permission,
    /// Malformed or unexpected backend payload. Retry allowed but capped.
    Data,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "AuthError"),
            Self::Network => write!(f, "NetworkError"),
            Self::Permission => write!(f, "PermissionError"),
            Self::Data => write!(f, "DataError"),
        }
    }
}

/// Error attached to the `Error` loading state.
///
/// `recoverable` decides whether the UI offers a retry action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl AppError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Auth,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Network,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permission,
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Data,
            message: message.into(),
            recoverable: true,
        }
    }

    /// Same error, but with the retry affordance removed.
    pub fn into_terminal(mut self) -> Self {
        self.recoverable = false;
        self
    }
}

// ---------------------------------------------------------------------------
// State machine errors
// ---------------------------------------------------------------------------

/// Rejected transition requests. Programmer errors: state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition: `{action}` is not allowed from `{from}`")]
    Invalid { from: &'static str, action: &'static str },

    #[error("duplicate request: `{action}` is already in progress")]
    Duplicate { action: &'static str },

    #[error("stale completion from epoch {stale}, current epoch is {current}")]
    Stale { stale: u64, current: u64 },

    #[error("`{action}` requires a non-empty user id")]
    EmptyUserId { action: &'static str },

    #[error("`{action}` for user `{requested}` does not match active user `{active}`")]
    UserMismatch {
        action: &'static str,
        requested: String,
        active: String,
    },

    #[error("retry is not available for a non-recoverable error")]
    NotRecoverable,
}

// ---------------------------------------------------------------------------
// Event application errors
// ---------------------------------------------------------------------------

/// A single event could not be applied to local caches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("malformed payload for `{entity}`: {reason}")]
    Malformed { entity: String, reason: String },

    #[error("cache invalidation failed: {0}")]
    Invalidation(String),

    #[error("upstream rejected apply: {0}")]
    Upstream(String),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

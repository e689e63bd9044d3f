//! Domain types for the readiness state machine.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Role as stored on the backend profile row.
///
/// Unknown role names are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Administrator,
    Manager,
    Employee,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Administrator => "Administrator",
            Self::Manager => "Manager",
            Self::Employee => "Employee",
            Self::Other(name) => name,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Administrator)
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Administrator" | "admin" => Self::Administrator,
            "Manager" | "manager" => Self::Manager,
            "Employee" | "employee" => Self::Employee,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission names granted to a user. Most users carry a handful.
pub type Permissions = SmallVec<[String; 8]>;

/// Minimal identity attached to the `Ready` state only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: String,
    pub role: Role,
    pub permissions: Permissions,
}

impl UserInfo {
    pub fn new<I, S>(id: impl Into<String>, role: impl Into<Role>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            role: role.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Independently loaded areas of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Section {
    Dashboard,
    Quotes,
    Invoices,
    Emails,
    Planning,
    Projects,
    Users,
    Settings,
}

impl Section {
    pub const ALL: [Section; 8] = [
        Section::Dashboard,
        Section::Quotes,
        Section::Invoices,
        Section::Emails,
        Section::Planning,
        Section::Projects,
        Section::Users,
        Section::Settings,
    ];

    /// Sections loaded during startup, by privilege level.
    pub fn eager(is_admin: bool) -> &'static [Section] {
        if is_admin {
            &[
                Section::Dashboard,
                Section::Users,
                Section::Planning,
                Section::Emails,
            ]
        } else {
            &[Section::Dashboard, Section::Planning, Section::Emails]
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Quotes => "quotes",
            Self::Invoices => "invoices",
            Self::Emails => "emails",
            Self::Planning => "planning",
            Self::Projects => "projects",
            Self::Users => "users",
            Self::Settings => "settings",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Loading state
// ---------------------------------------------------------------------------

/// Monotonic cycle tag. Completions carrying an older epoch are stale.
pub type Epoch = u64;

/// What the UI is allowed to show right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadingState {
    Unauthenticated,
    Authenticating { has_cache: bool },
    ValidatingCache,
    LoadingProfile { user_id: String },
    LoadingPermissions { user_id: String },
    InitializingData { is_admin: bool },
    LoadingSection {
        section: Section,
        operation: Option<String>,
    },
    Ready { user: UserInfo },
    Error { error: AppError },
}

impl LoadingState {
    pub fn kind(&self) -> StateKind {
        match self {
            Self::Unauthenticated => StateKind::Unauthenticated,
            Self::Authenticating { .. } => StateKind::Authenticating,
            Self::ValidatingCache => StateKind::ValidatingCache,
            Self::LoadingProfile { .. } => StateKind::LoadingProfile,
            Self::LoadingPermissions { .. } => StateKind::LoadingPermissions,
            Self::InitializingData { .. } => StateKind::InitializingData,
            Self::LoadingSection { .. } => StateKind::LoadingSection,
            Self::Ready { .. } => StateKind::Ready,
            Self::Error { .. } => StateKind::Error,
        }
    }

    /// Ready and Error end a cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Error { .. })
    }

    pub fn is_loading(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// True from `LoadingProfile` onward.
    pub fn is_authenticated(&self) -> bool {
        matches!(
            self,
            Self::LoadingProfile { .. }
                | Self::LoadingPermissions { .. }
                | Self::InitializingData { .. }
                | Self::LoadingSection { .. }
                | Self::Ready { .. }
        )
    }

    pub fn user(&self) -> Option<&UserInfo> {
        match self {
            Self::Ready { user } => Some(user),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&AppError> {
        match self {
            Self::Error { error } => Some(error),
            _ => None,
        }
    }
}

/// Payload-free discriminant of [`LoadingState`], used in history and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    Unauthenticated,
    Authenticating,
    ValidatingCache,
    LoadingProfile,
    LoadingPermissions,
    InitializingData,
    LoadingSection,
    Ready,
    Error,
}

impl StateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::Authenticating => "Authenticating",
            Self::ValidatingCache => "ValidatingCache",
            Self::LoadingProfile => "LoadingProfile",
            Self::LoadingPermissions => "LoadingPermissions",
            Self::InitializingData => "InitializingData",
            Self::LoadingSection => "LoadingSection",
            Self::Ready => "Ready",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Realtime change notifications.
//!
//! The backend pushes loosely shaped JSON rows. They are parsed once at the
//! boundary into [`ChangeEvent`]; anything that does not match the known
//! row shape for its table is kept as [`ChangePayload::Unparsed`].

use crate::error::ApplyError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Entity types
// ---------------------------------------------------------------------------

/// Backend table a change notification belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Email,
    EmailAccount,
    PlanningSlot,
    Project,
    Unknown(String),
}

impl EntityType {
    pub fn from_table(table: &str) -> Self {
        match table {
            "emails" => Self::Email,
            "email_accounts" => Self::EmailAccount,
            "planning_slots" | "availability" => Self::PlanningSlot,
            "projects" => Self::Project,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Email => "emails",
            Self::EmailAccount => "email_accounts",
            Self::PlanningSlot => "planning_slots",
            Self::Project => "projects",
            Self::Unknown(table) => table,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// Row change exactly as the realtime channel delivers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub table: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    pub fn new(table: &str, event_type: &str, row: Value) -> Self {
        let is_delete = event_type.eq_ignore_ascii_case("DELETE");
        Self {
            table: table.to_string(),
            event_type: event_type.to_string(),
            new: (!is_delete).then(|| row.clone()),
            old: is_delete.then_some(row),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRow {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAccountRow {
    pub id: String,
    #[serde(default)]
    pub sync_status: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningSlotRow {
    pub id: String,
    pub user_id: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Closed set of payload shapes, one per known entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "row", rename_all = "snake_case")]
pub enum ChangePayload {
    Email(EmailRow),
    EmailAccount(EmailAccountRow),
    PlanningSlot(PlanningSlotRow),
    Project(ProjectRow),
    /// Row did not match the expected shape, or the table is unknown.
    Unparsed(Value),
}

impl ChangePayload {
    fn parse(entity: &EntityType, row: Value) -> Self {
        match entity {
            EntityType::Email => typed(row, Self::Email),
            EntityType::EmailAccount => typed(row, Self::EmailAccount),
            EntityType::PlanningSlot => typed(row, Self::PlanningSlot),
            EntityType::Project => typed(row, Self::Project),
            EntityType::Unknown(_) => Self::Unparsed(row),
        }
    }

    pub fn is_parsed(&self) -> bool {
        !matches!(self, Self::Unparsed(_))
    }
}

fn typed<T: DeserializeOwned>(row: Value, wrap: fn(T) -> ChangePayload) -> ChangePayload {
    match serde_json::from_value::<T>(row.clone()) {
        Ok(parsed) => wrap(parsed),
        Err(_) => ChangePayload::Unparsed(row),
    }
}

// ---------------------------------------------------------------------------
// Change event
// ---------------------------------------------------------------------------

/// A parsed row-level change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity: EntityType,
    pub kind: ChangeKind,
    pub row_id: String,
    pub payload: ChangePayload,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        entity: EntityType,
        kind: ChangeKind,
        row_id: impl Into<String>,
        payload: ChangePayload,
    ) -> Self {
        Self {
            entity,
            kind,
            row_id: row_id.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Parses a raw notification received now.
    pub fn from_raw(raw: RawChange) -> Result<Self, ApplyError> {
        Self::from_raw_at(raw, Utc::now())
    }

    /// Parses a raw notification.
    ///
    /// Deletes read the `old` row, inserts and updates read `new`. The
    /// envelope (event type, row id) must be valid; the row body may not be.
    pub fn from_raw_at(raw: RawChange, received_at: DateTime<Utc>) -> Result<Self, ApplyError> {
        let entity = EntityType::from_table(&raw.table);
        let kind = ChangeKind::parse(&raw.event_type).ok_or_else(|| ApplyError::Malformed {
            entity: raw.table.clone(),
            reason: format!("unknown event type `{}`", raw.event_type),
        })?;

        let row = match kind {
            ChangeKind::Delete => raw.old.or(raw.new),
            ChangeKind::Insert | ChangeKind::Update => raw.new.or(raw.old),
        }
        .ok_or_else(|| ApplyError::Malformed {
            entity: raw.table.clone(),
            reason: "missing row".to_string(),
        })?;

        let row_id = row_id_of(&row).ok_or_else(|| ApplyError::Malformed {
            entity: raw.table.clone(),
            reason: "missing row id".to_string(),
        })?;

        let payload = ChangePayload::parse(&entity, row);

        Ok(Self {
            entity,
            kind,
            row_id,
            payload,
            received_at,
        })
    }
}

fn row_id_of(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

const DEFAULT_HISTORY_CAPACITY: usize = 50;
const DEFAULT_QUEUE_CAPACITY: usize = 500;
const DEFAULT_MAX_APPLY_ATTEMPTS: u32 = 3;
const DEFAULT_APPLY_BACKOFF_MS: u64 = 250;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_PHASE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_DATA_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BeaconConfig {
    /// Realtime endpoint. Informational for in-memory transports.
    pub realtime_url: Option<Url>,
    /// Retained state-history entries.
    pub history_capacity: usize,
    /// Queued events kept before the oldest is dropped.
    pub queue_capacity: usize,
    /// Apply attempts per event before it is marked permanently failed.
    pub max_apply_attempts: u32,
    pub apply_backoff_ms: u64,
    /// Consecutive failed automatic reconnects before manual action is required.
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Upper bound for each network-bound startup phase.
    pub phase_timeout_ms: u64,
    /// Consecutive data errors after which retry is withdrawn.
    pub max_data_retries: u32,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            realtime_url: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_apply_attempts: DEFAULT_MAX_APPLY_ATTEMPTS,
            apply_backoff_ms: DEFAULT_APPLY_BACKOFF_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            phase_timeout_ms: DEFAULT_PHASE_TIMEOUT_MS,
            max_data_retries: DEFAULT_MAX_DATA_RETRIES,
        }
    }
}

pub const MAX_APPLY_ATTEMPTS: u64 = 1_000;
pub const MAX_APPLY_BACKOFF_MS: u64 = 60 * 60 * 1_000;

impl BeaconConfig {
    /// Loads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("history_capacity", self.history_capacity as u64)?;
        positive("queue_capacity", self.queue_capacity as u64)?;
        positive("max_apply_attempts", self.max_apply_attempts as u64)?;
        positive("phase_timeout_ms", self.phase_timeout_ms)?;
        at_most("max_apply_attempts", self.max_apply_attempts as u64, MAX_APPLY_ATTEMPTS)?;
        at_most("apply_backoff_ms", self.apply_backoff_ms, MAX_APPLY_BACKOFF_MS)?;
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "reconnect_base_delay_ms",
                reason: format!(
                    "{} exceeds reconnect_max_delay_ms {}",
                    self.reconnect_base_delay_ms, self.reconnect_max_delay_ms
                ),
            });
        }
        if let Some(url) = &self.realtime_url {
            if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
                return Err(ConfigError::Invalid {
                    field: "realtime_url",
                    reason: format!("unsupported scheme `{}`", url.scheme()),
                });
            }
        }
        Ok(())
    }

    pub fn apply_backoff(&self) -> Duration {
        Duration::from_millis(self.apply_backoff_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }
}

fn at_most(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{value} exceeds the limit of {max}"),
        });
    }
    Ok(())
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

//! Domain models, shared types, configuration and error definitions.
//!
//! Foundation crate -- no async or I/O dependencies beyond config loading.

pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::BeaconConfig;
pub use error::{AppError, ApplyError, BeaconError, BeaconResult, ErrorKind, TransitionError};
pub use event::{ChangeEvent, ChangeKind, ChangePayload, EntityType, RawChange};
pub use types::{Epoch, LoadingState, Permissions, Role, Section, StateKind, UserInfo};

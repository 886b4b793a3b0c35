//! Provisioning error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use keybroker_core::EntropyError;
use keybroker_state::StateError;

/// Which kind of entity an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Instance,
    Binding,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Instance => f.write_str("instance"),
            EntityKind::Binding => f.write_str("binding"),
        }
    }
}

/// Errors returned by provisioning operations.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: EntityKind, id: String },

    #[error("{kind} {id} does not exist")]
    NotFound { kind: EntityKind, id: String },

    #[error("store call {step} timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store error: {0}")]
    Store(StateError),

    #[error("deleting instance {instance_id} stopped at binding {binding_id}: {source}")]
    CascadeAborted {
        instance_id: String,
        binding_id: String,
        source: Box<ProvisionError>,
    },

    #[error("{id}: cancelled before any change was made")]
    Cancelled { id: String },

    #[error("{id}: interrupted at {step}, final state unknown")]
    Interrupted { id: String, step: &'static str },

    #[error("entropy source unavailable: {0}")]
    EntropyUnavailable(String),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

impl ProvisionError {
    pub fn already_exists(kind: EntityKind, id: &str) -> Self {
        ProvisionError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    pub fn not_found(kind: EntityKind, id: &str) -> Self {
        ProvisionError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// The store could not answer in time or at all; nothing is known to
    /// be broken and the caller may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ProvisionError::Timeout { .. }
            | ProvisionError::StoreUnavailable(_)
            | ProvisionError::Cancelled { .. } => true,
            ProvisionError::CascadeAborted { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// The process cannot provision anything until restarted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProvisionError::EntropyUnavailable(_))
    }
}

impl From<StateError> for ProvisionError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Entropy(e) => ProvisionError::EntropyUnavailable(e.to_string()),
            other => ProvisionError::Store(other),
        }
    }
}

impl From<EntropyError> for ProvisionError {
    fn from(e: EntropyError) -> Self {
        ProvisionError::EntropyUnavailable(e.to_string())
    }
}

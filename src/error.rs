//! Error taxonomy shared by the partition core.
//!
//! Every fallible core operation returns [`PartitionResult`]. Collaborator
//! failures surface as [`CollabError`] and are folded into the core taxonomy
//! at the call site.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Still in use: {0}")]
    StillInUse(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PartitionError {
    /// Stable short name, used in API responses and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InsufficientResources(_) => "insufficient_resources",
            Self::StateConflict(_) => "state_conflict",
            Self::StillInUse(_) => "still_in_use",
            Self::NotSupported(_) => "not_supported",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Internal(_) => "internal",
        }
    }
}

pub type PartitionResult<T> = Result<T, PartitionError>;

/// Failure reported by an external collaborator (memory manager, run-queue
/// subsystem, capability registry, transport, ...).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error("{op}: resource exhausted")]
    Exhausted { op: &'static str },

    #[error("{op} failed: {reason}")]
    Failed { op: &'static str, reason: String },

    #[error("{op}: unknown handle {handle}")]
    UnknownHandle { op: &'static str, handle: u64 },
}

impl From<CollabError> for PartitionError {
    fn from(err: CollabError) -> Self {
        match err {
            CollabError::Exhausted { .. } => PartitionError::InsufficientResources(err.to_string()),
            _ => PartitionError::Internal(err.to_string()),
        }
    }
}

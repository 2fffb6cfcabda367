//! Caller identity and privilege.

use crate::error::{PartitionError, PartitionResult};

/// Who is calling the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub client_id: String,
    pub privileged: bool,
}

impl Caller {
    pub fn privileged(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            privileged: true,
        }
    }

    pub fn unprivileged(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            privileged: false,
        }
    }

    pub fn require_privileged(&self, op: &str) -> PartitionResult<()> {
        if self.privileged {
            Ok(())
        } else {
            Err(PartitionError::PermissionDenied(format!(
                "{op} requires a privileged caller (client {})",
                self.client_id
            )))
        }
    }
}

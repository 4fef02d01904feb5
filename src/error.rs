use crate::store::StoreError;
use crate::supervisor::SupervisorError;
use thiserror::Error;

/// Failures surfaced by job commands.
#[derive(Debug, Error)]
pub enum JobError {
    /// No record matches the token. Nothing was attempted.
    #[error("job not found: {0}")]
    NotFound(String),
    /// Registry failure, including `StoreError::Conflict` for a duplicate unit.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The supervisor could not be reached or refused a write.
    #[error("failed to {action}: {reason}")]
    CollaboratorUnavailable {
        action: &'static str,
        reason: SupervisorError,
    },
    /// The unit is running but the registry insert failed, so nothing tracks it.
    #[error("job started as {unit} but failed to record it: {reason}")]
    PostLaunchPersistence { unit: String, reason: StoreError },
    /// Rejected before any side effect.
    #[error("{0}")]
    InvalidInput(String),
}

impl JobError {
    pub fn unavailable(action: &'static str, reason: SupervisorError) -> Self {
        JobError::CollaboratorUnavailable { action, reason }
    }

    /// Process exit status for this error. An untracked-but-running job gets
    /// its own status so scripts can tell it apart from a failed launch.
    pub fn exit_code(&self) -> i32 {
        match self {
            JobError::PostLaunchPersistence { .. } => 2,
            _ => 1,
        }
    }
}

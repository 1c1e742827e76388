//! Client engine errors

use thiserror::Error;
use vouch_core::{
    ActionId, AuditShapeError, AuditTime, CoreError, RoleId, StorageError, TransportError,
};

/// The host (or local application) refused an action; its local effect has
/// been rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Action {action_id} rejected: {reason}")]
pub struct ActionRejected {
    pub action_id: ActionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Rejected(#[from] ActionRejected),

    /// Delivery failed; pending actions stay queued for the next exchange
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    /// Local persistence failed; the step that failed left no trace
    #[error("Local storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// A trail entry could not be decoded or authorized; the pass was aborted
    /// and resumes from the last confirmed watermark
    #[error("Untrusted trail entry at {time}: {reason}")]
    TrailEntry { time: AuditTime, reason: String },

    /// The host answered with a malformed audit
    #[error("Invalid response audit: {reason}")]
    InvalidAudit { reason: String },

    #[error("Role {role} is not known to this engine")]
    UnknownRole { role: RoleId },

    /// The role only audits; it cannot originate actions
    #[error("Role {role} is not controlled by this engine")]
    NotControlled { role: RoleId },

    #[error("Reconciliation did not settle after {rounds} rounds")]
    RoundsExhausted { rounds: usize },

    /// The caller stopped waiting; the work itself continues
    #[error("Timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// The engine went away before the outcome was known
    #[error("Outcome abandoned: {reason}")]
    Abandoned { reason: String },
}

impl From<AuditShapeError> for SyncError {
    fn from(err: AuditShapeError) -> Self {
        SyncError::InvalidAudit {
            reason: err.to_string(),
        }
    }
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Rejected(_) => "sync_action_rejected",
            SyncError::Transport(err) => err.code(),
            SyncError::Storage(err) => err.code(),
            SyncError::Core(err) => err.code(),
            SyncError::TrailEntry { .. } => "sync_trail_entry",
            SyncError::InvalidAudit { .. } => "sync_invalid_audit",
            SyncError::UnknownRole { .. } => "sync_unknown_role",
            SyncError::NotControlled { .. } => "sync_not_controlled",
            SyncError::RoundsExhausted { .. } => "sync_rounds_exhausted",
            SyncError::Timeout { .. } => "sync_timeout",
            SyncError::Abandoned { .. } => "sync_abandoned",
        }
    }

    /// Whether trying the same call again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_)
                | SyncError::Storage(_)
                | SyncError::TrailEntry { .. }
                | SyncError::InvalidAudit { .. }
                | SyncError::RoundsExhausted { .. }
                | SyncError::Timeout { .. }
        )
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_final_transport_is_not() {
        let rejected = SyncError::from(ActionRejected {
            action_id: ActionId::from_name("a"),
            reason: "precondition failed".to_string(),
        });
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.code(), "sync_action_rejected");

        let transport = SyncError::from(TransportError::Timeout);
        assert!(transport.is_retryable());
        assert_eq!(transport.code(), "transport_timeout");
    }
}

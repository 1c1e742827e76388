//! Error types for the audit log store

use thiserror::Error;
use vouch_core::{AuditTime, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Underlying storage failed; nothing was committed
    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    /// A stored value could not be decoded
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// The requester claims a position the log has not reached
    #[error("Watermark {since} is ahead of log tail {tail}")]
    WatermarkAhead { since: AuditTime, tail: AuditTime },

    /// Service name cannot be used as a storage key segment
    #[error("Invalid stream: {reason}")]
    InvalidStream { reason: String },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Storage(err) => err.code(),
            StoreError::Corrupt { .. } => "store_corrupt",
            StoreError::WatermarkAhead { .. } => "store_watermark_ahead",
            StoreError::InvalidStream { .. } => "store_invalid_stream",
        }
    }

    /// Storage failures leave the log unchanged and may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

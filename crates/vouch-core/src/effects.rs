//! Effect traits consumed by the store, host and client engine.
//!
//! - [`StorageEffects`]: durable key/value storage with atomic batches
//! - [`TimeEffects`]: wall clock used for retention
//! - [`Transport`]: request/response delivery to a host

use crate::protocol::{ExchangeRequest, ExchangeResponse, StateQuery, StateReply};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Storage failures. All of them are retryable from the caller's side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("Stored value is corrupt: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::InvalidKey { .. } => "storage_invalid_key",
            StorageError::ReadFailed(_) => "storage_read",
            StorageError::WriteFailed(_) => "storage_write",
            StorageError::DeleteFailed(_) => "storage_delete",
            StorageError::Corrupt(_) => "storage_corrupt",
        }
    }
}

/// Puts and deletes applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    /// `Some` is a put, `None` a delete; later writes to a key win
    ops: BTreeMap<String, Option<Vec<u8>>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.insert(key.into(), Some(value));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.insert(key.into(), None);
        self
    }

    /// Fold another batch in; its writes win on conflicting keys
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Vec<u8>>)> {
        self.ops.iter()
    }

    pub fn into_ops(self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.ops
    }
}

#[async_trait]
pub trait StorageEffects: Send + Sync {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Returns whether the key existed
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Sorted keys, optionally restricted to a prefix
    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError>;

    /// Apply every write in `batch` or none of them
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

/// Wall clock in milliseconds since the Unix epoch
pub trait TimeEffects: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeEffects for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Delivery failures; the request may or may not have reached the host
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Host unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Exchange timed out")]
    Timeout,

    #[error("Host failed: {reason}")]
    Host { reason: String },
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Unreachable { .. } => "transport_unreachable",
            TransportError::Timeout => "transport_timeout",
            TransportError::Host { .. } => "transport_host",
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: ExchangeRequest)
        -> Result<ExchangeResponse, TransportError>;

    async fn query_state(&self, query: StateQuery) -> Result<StateReply, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_batch_writes_win() {
        let mut batch = WriteBatch::new();
        batch.put("a", vec![1]).put("b", vec![2]);
        let mut other = WriteBatch::new();
        other.delete("a");
        batch.extend(other);

        let ops = batch.into_ops();
        assert_eq!(ops.get("a"), Some(&None));
        assert_eq!(ops.get("b"), Some(&Some(vec![2])));
    }
}

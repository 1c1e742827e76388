//! Storage wrapper that fails on demand

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use vouch_core::{MemoryStorageHandler, StorageEffects, StorageError, WriteBatch};

/// Memory storage that can be told to fail one upcoming commit. A failed
/// commit writes nothing.
#[derive(Debug, Clone, Default)]
pub struct FlakyStorage {
    inner: MemoryStorageHandler,
    /// Successful commits left before the injected failure
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStorageHandler {
        &self.inner
    }

    /// Let `after` commits through, then fail the next one
    pub fn fail_commit(&self, after: usize) {
        *self.fail_after.lock() = Some(after);
    }
}

#[async_trait]
impl StorageEffects for FlakyStorage {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.inner.store(key, value).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.retrieve(key).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.remove(key).await
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        self.inner.list_keys(prefix).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let fail = {
            let mut countdown = self.fail_after.lock();
            match *countdown {
                Some(0) => {
                    *countdown = None;
                    true
                }
                Some(left) => {
                    *countdown = Some(left - 1);
                    false
                }
                None => false,
            }
        };
        if fail {
            return Err(StorageError::WriteFailed(
                "injected commit failure".to_string(),
            ));
        }
        self.inner.commit(batch).await
    }
}

//! In-memory storage handler

use crate::effects::{StorageEffects, StorageError, WriteBatch};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory storage; clones share the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageHandler {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorageHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl StorageEffects for MemoryStorageHandler {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                reason: "Key cannot be empty".to_string(),
            });
        }
        let mut data = self.data.write().await;
        data.insert(key.to_string(), value);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = match prefix {
            Some(prefix) => data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect(),
            None => data.keys().cloned().collect(),
        };
        Ok(keys)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.iter().any(|(key, _)| key.is_empty()) {
            return Err(StorageError::InvalidKey {
                reason: "Key cannot be empty".to_string(),
            });
        }
        let mut data = self.data.write().await;
        for (key, value) in batch.into_ops() {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_listing_is_sorted_and_bounded() {
        let storage = MemoryStorageHandler::new();
        storage.store("a/2", vec![]).await.unwrap();
        storage.store("a/1", vec![]).await.unwrap();
        storage.store("b/1", vec![]).await.unwrap();

        assert_eq!(
            storage.list_keys(Some("a/")).await.unwrap(),
            vec!["a/1".to_string(), "a/2".to_string()]
        );
        assert_eq!(storage.list_keys(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn invalid_batch_applies_nothing() {
        let storage = MemoryStorageHandler::new();
        let mut batch = WriteBatch::new();
        batch.put("ok", vec![1]).put("", vec![2]);
        assert!(storage.commit(batch).await.is_err());
        assert!(storage.is_empty().await);
    }
}

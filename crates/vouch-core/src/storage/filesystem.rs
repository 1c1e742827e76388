//! Filesystem storage handler.
//!
//! One file per key (`<base>/<key>.dat`). Single writes go through a
//! temporary file and a rename. A batch is first sealed into a journal
//! holding the batch and the prior value of every key it touches, then
//! applied. If applying fails the prior values are restored before the error
//! is returned. A journal found on [`FilesystemStorageHandler::open`] is
//! rolled forward, or back when the batch cannot be applied, so a batch
//! interrupted by a crash is never left half visible.

use crate::effects::{StorageEffects, StorageError, WriteBatch};
use crate::serialization;
use async_lock::Mutex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;

const JOURNAL_FILE: &str = ".batch.journal";
const JOURNAL_TMP_FILE: &str = ".batch.journal.tmp";

/// A sealed batch with the values its keys held before it
#[derive(Debug, Serialize, Deserialize)]
struct Journal {
    redo: WriteBatch,
    undo: WriteBatch,
}

#[derive(Debug, Clone)]
pub struct FilesystemStorageHandler {
    base_path: PathBuf,
    /// Serializes writers so a batch never interleaves with another write
    write_lock: Arc<Mutex<()>>,
    /// Set when a failed batch could not be undone; writes are refused until
    /// the journal is resolved
    poisoned: Arc<AtomicBool>,
}

impl FilesystemStorageHandler {
    /// Open a store rooted at `base_path`, replaying any unfinished batch
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let handler = Self {
            base_path: base_path.into(),
            write_lock: Arc::new(Mutex::new(())),
            poisoned: Arc::new(AtomicBool::new(false)),
        };
        fs::create_dir_all(&handler.base_path)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to create directory: {e}")))?;
        handler.recover().await?;
        Ok(handler)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn validate_key(key: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey {
                reason: "Key cannot be empty".to_string(),
            });
        }
        if key.starts_with('/') || key.split('/').any(|s| s.is_empty() || s == ".." || s == ".")
        {
            return Err(StorageError::InvalidKey {
                reason: format!("Key {key} is not a relative path"),
            });
        }
        if key.split('/').any(|s| s.starts_with('.')) {
            return Err(StorageError::InvalidKey {
                reason: format!("Key {key} has a hidden segment"),
            });
        }
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{key}.dat"))
    }

    async fn write_file(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::WriteFailed(format!("Failed to create directory: {e}"))
            })?;
        }
        let tmp = path.with_extension("dat.tmp");
        fs::write(&tmp, value)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to write file: {e}")))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to rename file: {e}")))
    }

    async fn remove_file(&self, key: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::DeleteFailed(format!(
                "Failed to remove file: {e}"
            ))),
        }
    }

    async fn apply_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        for (key, value) in batch.into_ops() {
            match value {
                Some(value) => self.write_file(&key, &value).await?,
                None => {
                    self.remove_file(&key).await?;
                }
            }
        }
        Ok(())
    }

    /// A journal left by an earlier failure must be resolved before any
    /// further write, or its batch would be overwritten unresolved
    async fn ensure_writable(&self) -> Result<(), StorageError> {
        let pending = self.poisoned.load(Ordering::SeqCst)
            || fs::try_exists(self.journal_path()).await.unwrap_or(true);
        if !pending {
            return Ok(());
        }
        self.recover().await.map_err(|err| {
            StorageError::WriteFailed(format!("Unresolved batch journal: {err}"))
        })
    }

    async fn read_file(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadFailed(format!("Failed to read file: {e}"))),
        }
    }

    fn journal_path(&self) -> PathBuf {
        self.base_path.join(JOURNAL_FILE)
    }

    async fn remove_journal(&self) -> Result<(), StorageError> {
        fs::remove_file(self.journal_path())
            .await
            .map_err(|e| StorageError::DeleteFailed(format!("Failed to remove journal: {e}")))
    }

    /// Resolve a leftover journal: roll it forward, or restore the prior
    /// values when the batch cannot be applied
    async fn recover(&self) -> Result<(), StorageError> {
        let bytes = match fs::read(self.journal_path()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::ReadFailed(format!(
                    "Failed to read batch journal: {e}"
                )))
            }
        };
        let journal: Journal = serialization::from_slice(&bytes)
            .map_err(|e| StorageError::Corrupt(format!("Batch journal: {e}")))?;
        tracing::warn!(
            path = %self.base_path.display(),
            writes = journal.redo.len(),
            "Replaying unfinished storage batch"
        );
        if let Err(err) = self.apply_batch(journal.redo).await {
            tracing::warn!(
                path = %self.base_path.display(),
                error = %err,
                "Unfinished batch does not apply; restoring prior values"
            );
            self.apply_batch(journal.undo).await?;
        }
        self.remove_journal().await?;
        self.poisoned.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl StorageEffects for FilesystemStorageHandler {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        Self::validate_key(key)?;
        let _guard = self.write_lock.lock().await;
        self.ensure_writable().await?;
        self.write_file(key, &value).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Self::validate_key(key)?;
        self.read_file(key).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Self::validate_key(key)?;
        let _guard = self.write_lock.lock().await;
        self.ensure_writable().await?;
        self.remove_file(key).await
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        // Keys contain path separators, so walk the tree and strip `.dat`.
        let mut keys = Vec::new();
        let mut stack: Vec<PathBuf> = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StorageError::ReadFailed(format!(
                        "Failed to read directory: {e}"
                    )))
                }
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                StorageError::ReadFailed(format!("Failed to read directory entry: {e}"))
            })? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| {
                    StorageError::ReadFailed(format!("Failed to read file type: {e}"))
                })?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.base_path) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                let Some(key) = relative.strip_suffix(".dat") else {
                    continue;
                };
                if prefix.map_or(true, |p| key.starts_with(p)) {
                    keys.push(key.to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        for (key, _) in batch.iter() {
            Self::validate_key(key)?;
        }
        if batch.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        self.ensure_writable().await?;

        let mut undo = WriteBatch::new();
        for (key, _) in batch.iter() {
            match self.read_file(key).await? {
                Some(prior) => undo.put(key.clone(), prior),
                None => undo.delete(key.clone()),
            };
        }
        let journal = Journal { redo: batch, undo };
        let bytes = serialization::to_vec(&journal)
            .map_err(|e| StorageError::WriteFailed(format!("Batch journal: {e}")))?;
        let tmp = self.base_path.join(JOURNAL_TMP_FILE);
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to write journal: {e}")))?;
        fs::rename(&tmp, self.journal_path())
            .await
            .map_err(|e| StorageError::WriteFailed(format!("Failed to seal journal: {e}")))?;

        let Journal { redo, undo } = journal;
        if let Err(err) = self.apply_batch(redo).await {
            match self.apply_batch(undo).await {
                Ok(()) => self.remove_journal().await?,
                Err(undo_err) => {
                    self.poisoned.store(true, Ordering::SeqCst);
                    tracing::error!(
                        path = %self.base_path.display(),
                        error = %undo_err,
                        "Failed batch could not be undone; refusing writes"
                    );
                }
            }
            return Err(err);
        }
        self.remove_journal().await
    }
}

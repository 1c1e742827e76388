//! Storage effect handlers

mod filesystem;
mod memory;

pub use filesystem::FilesystemStorageHandler;
pub use memory::MemoryStorageHandler;

use crate::config::StoreConfig;
use crate::effects::{StorageEffects, StorageError};
use std::sync::Arc;

/// Filesystem storage under `data_dir` when configured, memory otherwise
pub async fn open_storage(config: &StoreConfig) -> Result<Arc<dyn StorageEffects>, StorageError> {
    match &config.data_dir {
        Some(dir) => {
            tracing::info!(path = %dir.display(), "Opening filesystem storage");
            Ok(Arc::new(FilesystemStorageHandler::open(dir.clone()).await?))
        }
        None => Ok(Arc::new(MemoryStorageHandler::new())),
    }
}

//! Client-side durable state.
//!
//! ```text
//! state/<role>/<entity>/<module>           -> module state blob
//! mirror/<role>/<service>/<time>           -> encoded action folded in at <time>
//! watermark/<role>/<service>               -> AuditTime
//! dirty/<role>/<service>                   -> modules awaiting a full-state fetch
//! unsettled/<role>/<service>               -> session and modules with pending actions
//! ```
//!
//! Every reconciliation step writes through a single [`WriteBatch`] so the
//! state change and its mirror record land together. The dirty set is staged
//! in the same batch as the watermark advance that skipped past its modules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;
use vouch_core::{
    serialization, AuditTime, CoreError, EntityId, ModuleId, RoleId, ServiceId, StorageEffects,
    StorageError, TrailEntry, WriteBatch,
};

/// Modules whose optimistic effects are in local state while their actions
/// sit in the pending queue of session `session`. The queue lives in memory,
/// so a record left by another session marks effects nothing will settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsettled {
    pub session: Uuid,
    pub modules: BTreeSet<ModuleId>,
}

#[derive(Clone)]
pub struct LocalStore {
    storage: Arc<dyn StorageEffects>,
}

fn corrupt(key: &str, err: CoreError) -> StorageError {
    StorageError::Corrupt(format!("{key}: {err}"))
}

impl LocalStore {
    pub fn new(storage: Arc<dyn StorageEffects>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn StorageEffects> {
        &self.storage
    }

    pub fn state_key(role: RoleId, entity: EntityId, module: &ModuleId) -> String {
        format!("state/{role}/{entity}/{module}")
    }

    fn mirror_prefix(role: RoleId, service: &ServiceId) -> String {
        format!("mirror/{role}/{service}/")
    }

    pub fn mirror_key(role: RoleId, service: &ServiceId, time: AuditTime) -> String {
        format!("{}{}", Self::mirror_prefix(role, service), time.key_fragment())
    }

    pub fn watermark_key(role: RoleId, service: &ServiceId) -> String {
        format!("watermark/{role}/{service}")
    }

    pub fn dirty_key(role: RoleId, service: &ServiceId) -> String {
        format!("dirty/{role}/{service}")
    }

    pub fn unsettled_key(role: RoleId, service: &ServiceId) -> String {
        format!("unsettled/{role}/{service}")
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self.storage.retrieve(key).await? {
            Some(bytes) => serialization::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt(key, e)),
            None => Ok(None),
        }
    }

    fn stage<T: Serialize>(batch: &mut WriteBatch, key: String, value: &T) -> Result<(), StorageError> {
        let bytes = serialization::to_vec(value).map_err(|e| corrupt(&key, e))?;
        batch.put(key, bytes);
        Ok(())
    }

    /// Modules of (role, service) waiting for a full-state fetch
    pub async fn dirty(
        &self,
        role: RoleId,
        service: &ServiceId,
    ) -> Result<BTreeSet<ModuleId>, StorageError> {
        Ok(self
            .decode(&Self::dirty_key(role, service))
            .await?
            .unwrap_or_default())
    }

    pub async fn unsettled(
        &self,
        role: RoleId,
        service: &ServiceId,
    ) -> Result<Option<Unsettled>, StorageError> {
        self.decode(&Self::unsettled_key(role, service)).await
    }

    /// Stage the bookkeeping that must move together with a state change:
    /// the dirty set gains `added`, loses `cleared`, and absorbs the modules
    /// another session left unsettled; the unsettled record is rewritten for
    /// `session`. Returns the dirty set the batch leaves behind.
    #[allow(clippy::too_many_arguments)]
    pub async fn stage_tracking(
        &self,
        batch: &mut WriteBatch,
        role: RoleId,
        service: &ServiceId,
        session: Uuid,
        unsettled: BTreeSet<ModuleId>,
        added: &BTreeSet<ModuleId>,
        cleared: &BTreeSet<ModuleId>,
    ) -> Result<BTreeSet<ModuleId>, StorageError> {
        let mut dirty = self.dirty(role, service).await?;
        if let Some(left) = self.unsettled(role, service).await? {
            if left.session != session {
                dirty.extend(left.modules);
            }
        }
        dirty.extend(added.iter().cloned());
        dirty.retain(|module| !cleared.contains(module));

        let key = Self::dirty_key(role, service);
        if dirty.is_empty() {
            batch.delete(key);
        } else {
            Self::stage(batch, key, &dirty)?;
        }
        let key = Self::unsettled_key(role, service);
        if unsettled.is_empty() {
            batch.delete(key);
        } else {
            Self::stage(
                batch,
                key,
                &Unsettled {
                    session,
                    modules: unsettled,
                },
            )?;
        }
        Ok(dirty)
    }

    /// Stage deletion of mirror records at or below `floor`
    pub async fn stage_mirror_prune(
        &self,
        batch: &mut WriteBatch,
        role: RoleId,
        service: &ServiceId,
        floor: AuditTime,
    ) -> Result<usize, StorageError> {
        let prefix = Self::mirror_prefix(role, service);
        let mut pruned = 0;
        for key in self.storage.list_keys(Some(&prefix)).await? {
            let time = key
                .strip_prefix(&prefix)
                .and_then(|raw| raw.parse::<u64>().ok());
            if time.is_some_and(|time| time <= floor.value()) {
                batch.delete(key);
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    pub async fn state(
        &self,
        role: RoleId,
        entity: EntityId,
        module: &ModuleId,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.storage
            .retrieve(&Self::state_key(role, entity, module))
            .await
    }

    pub async fn is_mirrored(
        &self,
        role: RoleId,
        service: &ServiceId,
        time: AuditTime,
    ) -> Result<bool, StorageError> {
        Ok(self
            .storage
            .retrieve(&Self::mirror_key(role, service, time))
            .await?
            .is_some())
    }

    /// Trail entries folded in for (role, service), ascending
    pub async fn mirrored_trail(
        &self,
        role: RoleId,
        service: &ServiceId,
    ) -> Result<Vec<TrailEntry>, StorageError> {
        let prefix = Self::mirror_prefix(role, service);
        let mut trail = Vec::new();
        for key in self.storage.list_keys(Some(&prefix)).await? {
            let Some(time) = key
                .strip_prefix(&prefix)
                .and_then(|raw| raw.parse::<u64>().ok())
            else {
                continue;
            };
            if let Some(action) = self.storage.retrieve(&key).await? {
                trail.push(TrailEntry {
                    time: AuditTime(time),
                    action,
                });
            }
        }
        trail.sort_by_key(|entry| entry.time);
        Ok(trail)
    }

    pub async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.storage.commit(batch).await
    }
}

/// Persisted (role, service) -> last fully reconciled audit time
#[derive(Clone)]
pub struct WatermarkTable {
    storage: Arc<dyn StorageEffects>,
}

impl WatermarkTable {
    pub fn new(storage: Arc<dyn StorageEffects>) -> Self {
        Self { storage }
    }

    /// [`AuditTime::ZERO`] for a role that has never reconciled
    pub async fn get(&self, role: RoleId, service: &ServiceId) -> Result<AuditTime, StorageError> {
        let key = LocalStore::watermark_key(role, service);
        match self.storage.retrieve(&key).await? {
            Some(bytes) => serialization::from_slice(&bytes).map_err(|e| corrupt(&key, e)),
            None => Ok(AuditTime::ZERO),
        }
    }

    /// Stage an advance to `time`; a value at or below the current watermark
    /// stages nothing. Returns the watermark the batch leaves behind.
    pub async fn stage_advance(
        &self,
        batch: &mut WriteBatch,
        role: RoleId,
        service: &ServiceId,
        time: AuditTime,
    ) -> Result<AuditTime, StorageError> {
        let current = self.get(role, service).await?;
        if time <= current {
            return Ok(current);
        }
        let key = LocalStore::watermark_key(role, service);
        let bytes = serialization::to_vec(&time).map_err(|e| corrupt(&key, e))?;
        batch.put(key, bytes);
        Ok(time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vouch_core::MemoryStorageHandler;

    #[tokio::test]
    async fn watermark_never_moves_back() {
        let storage: Arc<dyn StorageEffects> = Arc::new(MemoryStorageHandler::new());
        let table = WatermarkTable::new(storage.clone());
        let local = LocalStore::new(storage);
        let role = RoleId::from_name("r");
        let service = ServiceId::from("profile");

        assert_eq!(table.get(role, &service).await.unwrap(), AuditTime::ZERO);

        let mut batch = WriteBatch::new();
        let left = table
            .stage_advance(&mut batch, role, &service, AuditTime(7))
            .await
            .unwrap();
        assert_eq!(left, AuditTime(7));
        local.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        let left = table
            .stage_advance(&mut batch, role, &service, AuditTime(3))
            .await
            .unwrap();
        assert_eq!(left, AuditTime(7));
        assert!(batch.is_empty());
        assert_eq!(table.get(role, &service).await.unwrap(), AuditTime(7));
    }

    #[tokio::test]
    async fn mirror_lists_in_time_order() {
        let storage: Arc<dyn StorageEffects> = Arc::new(MemoryStorageHandler::new());
        let local = LocalStore::new(storage);
        let role = RoleId::from_name("r");
        let service = ServiceId::from("profile");

        let mut batch = WriteBatch::new();
        for time in [12, 3, 100] {
            batch.put(LocalStore::mirror_key(role, &service, AuditTime(time)), vec![time as u8]);
        }
        local.commit(batch).await.unwrap();

        let times: Vec<u64> = local
            .mirrored_trail(role, &service)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.time.value())
            .collect();
        assert_eq!(times, vec![3, 12, 100]);
        assert!(local.is_mirrored(role, &service, AuditTime(12)).await.unwrap());
        assert!(!local.is_mirrored(role, &service, AuditTime(13)).await.unwrap());

        let mut batch = WriteBatch::new();
        let pruned = local
            .stage_mirror_prune(&mut batch, role, &service, AuditTime(12))
            .await
            .unwrap();
        assert_eq!(pruned, 2);
        local.commit(batch).await.unwrap();
        assert_eq!(local.mirrored_trail(role, &service).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn modules_left_unsettled_by_another_session_become_dirty() {
        let storage: Arc<dyn StorageEffects> = Arc::new(MemoryStorageHandler::new());
        let local = LocalStore::new(storage);
        let role = RoleId::from_name("r");
        let service = ServiceId::from("profile");
        let counter = ModuleId::from("counter");
        let likes = ModuleId::from("likes");
        let none = BTreeSet::new();

        let before = Uuid::new_v4();
        let mut batch = WriteBatch::new();
        let dirty = local
            .stage_tracking(&mut batch, role, &service, before, BTreeSet::from([counter.clone()]), &none, &none)
            .await
            .unwrap();
        assert!(dirty.is_empty());
        local.commit(batch).await.unwrap();

        // Same session: its own record is not a leftover
        let mut batch = WriteBatch::new();
        let dirty = local
            .stage_tracking(&mut batch, role, &service, before, BTreeSet::from([counter.clone()]), &none, &none)
            .await
            .unwrap();
        assert!(dirty.is_empty());

        let after = Uuid::new_v4();
        let mut batch = WriteBatch::new();
        let dirty = local
            .stage_tracking(&mut batch, role, &service, after, BTreeSet::new(), &BTreeSet::from([likes.clone()]), &none)
            .await
            .unwrap();
        assert_eq!(dirty, BTreeSet::from([counter.clone(), likes.clone()]));
        local.commit(batch).await.unwrap();
        assert_eq!(local.dirty(role, &service).await.unwrap(), dirty);
        assert_eq!(local.unsettled(role, &service).await.unwrap(), None);

        let mut batch = WriteBatch::new();
        let dirty = local
            .stage_tracking(&mut batch, role, &service, after, BTreeSet::new(), &none, &BTreeSet::from([counter]))
            .await
            .unwrap();
        assert_eq!(dirty, BTreeSet::from([likes]));
    }
}

//! The audit log store.

use crate::error::{StoreError, StoreResult};
use crate::record::{decode, encode, AuditRecord, StreamKey};
use async_lock::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};
use vouch_core::{
    open_storage, Action, ActionId, AuditTime, ResponseAudit, RoleId, StorageEffects, StoreConfig,
    TimeEffects, TrailEntry, Viewer, Visibility, WriteBatch,
};

/// Outcome of a retention purge on one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    /// Floor after the purge; requests below it are truncated
    pub floor: AuditTime,
}

/// Host-side append-only log of executed actions
///
/// Times are assigned under a single append lock, so they are strictly
/// increasing per stream. Every append is committed in the same storage batch
/// as the caller's own effect writes.
pub struct AuditLogStore {
    storage: Arc<dyn StorageEffects>,
    clock: Arc<dyn TimeEffects>,
    retention: Duration,
    append_lock: Mutex<()>,
}

impl AuditLogStore {
    pub fn new(
        storage: Arc<dyn StorageEffects>,
        clock: Arc<dyn TimeEffects>,
        retention: Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            retention,
            append_lock: Mutex::new(()),
        }
    }

    /// Open the storage `config` names, keeping entries for `config.retention()`
    pub async fn open(config: &StoreConfig, clock: Arc<dyn TimeEffects>) -> StoreResult<Self> {
        let storage = open_storage(config).await?;
        Ok(Self::new(storage, clock, config.retention()))
    }

    pub fn storage(&self) -> &Arc<dyn StorageEffects> {
        &self.storage
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    async fn read_time(&self, key: &str) -> StoreResult<AuditTime> {
        match self.storage.retrieve(key).await? {
            Some(bytes) => decode(key, &bytes),
            None => Ok(AuditTime::ZERO),
        }
    }

    /// Current tail position (time of the last persisted record)
    pub async fn tail(&self, stream: &StreamKey) -> StoreResult<AuditTime> {
        self.read_time(&stream.tail_key()).await
    }

    /// Highest time that may have been purged
    pub async fn floor(&self, stream: &StreamKey) -> StoreResult<AuditTime> {
        self.read_time(&stream.floor_key()).await
    }

    pub async fn record(
        &self,
        stream: &StreamKey,
        time: AuditTime,
    ) -> StoreResult<Option<AuditRecord>> {
        let key = stream.record_key(time);
        match self.storage.retrieve(&key).await? {
            Some(bytes) => decode(&key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Time at which an action was persisted, if it was
    pub async fn lookup(
        &self,
        stream: &StreamKey,
        action: ActionId,
    ) -> StoreResult<Option<AuditTime>> {
        let key = stream.id_key(action);
        match self.storage.retrieve(&key).await? {
            Some(bytes) => decode(&key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Assign the next time to `action` and commit its record together with
    /// `effect`. Either both land or neither does.
    pub async fn persist(
        &self,
        stream: &StreamKey,
        action: &Action,
        encoded: Vec<u8>,
        visibility: Visibility,
        effect: WriteBatch,
    ) -> StoreResult<AuditTime> {
        let _guard = self.append_lock.lock().await;

        let time = self.tail(stream).await?.next();
        let record = AuditRecord {
            time,
            action_id: action.id,
            action: encoded,
            visibility,
            persisted_at_ms: self.clock.now_ms(),
        };

        let tail_key = stream.tail_key();
        let record_key = stream.record_key(time);
        let id_key = stream.id_key(action.id);
        let mut batch = effect;
        batch.put(record_key.clone(), encode(&record_key, &record)?);
        batch.put(tail_key.clone(), encode(&tail_key, &time)?);
        batch.put(id_key.clone(), encode(&id_key, &time)?);
        self.storage.commit(batch).await?;

        debug!(
            entity = %stream.entity,
            service = %stream.service,
            action_id = %action.id,
            %time,
            "Persisted audit record"
        );
        Ok(time)
    }

    /// Records with `time > since` that `viewer` may see, ascending.
    ///
    /// `this_time` is the tail at query time even when the trail is empty.
    /// When `since` is below the purge floor the response is marked truncated
    /// and carries no entries.
    pub async fn query(
        &self,
        stream: &StreamKey,
        since: AuditTime,
        viewer: &Viewer,
    ) -> StoreResult<ResponseAudit> {
        let tail = self.tail(stream).await?;
        if since > tail {
            return Err(StoreError::WatermarkAhead { since, tail });
        }

        let floor = self.floor(stream).await?;
        if since < floor {
            info!(
                entity = %stream.entity,
                service = %stream.service,
                %since,
                %floor,
                "Audit request below purge floor"
            );
            let mut response = ResponseAudit::empty(since, tail);
            response.truncated = true;
            return Ok(response);
        }

        let mut response = ResponseAudit::empty(since, tail);
        for key in self.storage.list_keys(Some(&stream.log_prefix())).await? {
            let Some(time) = stream.time_of(&key) else {
                continue;
            };
            if time <= since || time > tail {
                continue;
            }
            let Some(bytes) = self.storage.retrieve(&key).await? else {
                continue;
            };
            let record: AuditRecord = decode(&key, &bytes)?;
            if let Some(denial) = viewer.denial(&record.visibility) {
                trace!(%time, ?denial, "Audit record hidden from viewer");
                continue;
            }
            response.trail.push(TrailEntry {
                time,
                action: record.action,
            });
        }

        debug!(
            entity = %stream.entity,
            service = %stream.service,
            %since,
            this_time = %tail,
            entries = response.trail.len(),
            "Answered audit query"
        );
        Ok(response)
    }

    /// Remember the watermark a role claimed; never moves backwards
    pub async fn record_observed(
        &self,
        stream: &StreamKey,
        role: RoleId,
        time: AuditTime,
    ) -> StoreResult<()> {
        let key = stream.observed_key(role);
        let _guard = self.append_lock.lock().await;
        let current: Option<AuditTime> = match self.storage.retrieve(&key).await? {
            Some(bytes) => Some(decode(&key, &bytes)?),
            None => None,
        };
        if current.is_some_and(|current| current >= time) {
            return Ok(());
        }
        self.storage.store(&key, encode(&key, &time)?).await?;
        Ok(())
    }

    /// Lowest watermark claimed by any known role, if any role is known
    pub async fn observed_floor(&self, stream: &StreamKey) -> StoreResult<Option<AuditTime>> {
        let mut lowest: Option<AuditTime> = None;
        for key in self
            .storage
            .list_keys(Some(&stream.observed_prefix()))
            .await?
        {
            let time = self.read_time(&key).await?;
            lowest = Some(lowest.map_or(time, |current| current.min(time)));
        }
        Ok(lowest)
    }

    /// Every stream with at least one persisted record
    pub async fn streams(&self) -> StoreResult<Vec<StreamKey>> {
        let mut streams = Vec::new();
        for key in self.storage.list_keys(Some("audit/")).await? {
            let mut parts = key.split('/');
            let (Some(_), Some(entity), Some(service), Some("tail"), None) = (
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
                parts.next(),
            ) else {
                continue;
            };
            let Some(entity) = entity
                .strip_prefix("entity-")
                .and_then(|raw| raw.parse::<uuid::Uuid>().ok())
            else {
                continue;
            };
            streams.push(StreamKey::new(entity.into(), service.into())?);
        }
        Ok(streams)
    }

    /// Drop records older than the retention horizon that every known role
    /// has already observed. Only a contiguous prefix of the log is removed,
    /// and the floor is advanced to the last removed time.
    pub async fn purge(&self, stream: &StreamKey) -> StoreResult<PurgeReport> {
        let _guard = self.append_lock.lock().await;

        let floor = self.floor(stream).await?;
        let tail = self.tail(stream).await?;
        let observed = self.observed_floor(stream).await?.unwrap_or(tail);
        let retention_ms = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        let horizon = self.clock.now_ms().saturating_sub(retention_ms);

        let mut batch = WriteBatch::new();
        let mut new_floor = floor;
        let mut removed = 0;
        for key in self.storage.list_keys(Some(&stream.log_prefix())).await? {
            let Some(time) = stream.time_of(&key) else {
                continue;
            };
            if time > observed {
                break;
            }
            let Some(bytes) = self.storage.retrieve(&key).await? else {
                continue;
            };
            let record: AuditRecord = decode(&key, &bytes)?;
            if record.persisted_at_ms >= horizon {
                break;
            }
            batch.delete(key);
            new_floor = time;
            removed += 1;
        }

        if removed > 0 {
            let floor_key = stream.floor_key();
            batch.put(floor_key.clone(), encode(&floor_key, &new_floor)?);
            self.storage.commit(batch).await?;
            info!(
                entity = %stream.entity,
                service = %stream.service,
                removed,
                floor = %new_floor,
                "Purged expired audit records"
            );
        }

        Ok(PurgeReport {
            removed,
            floor: new_floor,
        })
    }

    /// Purge every stream
    pub async fn purge_all(&self) -> StoreResult<Vec<(StreamKey, PurgeReport)>> {
        let mut reports = Vec::new();
        for stream in self.streams().await? {
            let report = self.purge(&stream).await?;
            reports.push((stream, report));
        }
        Ok(reports)
    }

    /// Run [`AuditLogStore::purge_all`] every `every` until the handle is aborted
    pub fn spawn_retention(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(err) = self.purge_all().await {
                    tracing::warn!(error = %err, code = err.code(), "Audit retention pass failed");
                }
            }
        })
    }
}

//! Audit reconciler.
//!
//! Folds a host trail into local state. Each trail entry is one atomic step:
//! the module's new state and the entry's mirror record commit in a single
//! batch, or nothing changes. Entries the client already holds (at or below
//! the watermark, or mirrored by an interrupted earlier pass) are skipped, so
//! reconciling the same response twice is a no-op.
//!
//! When an incoming entry does not apply, the maximal suffix of the module's
//! pending actions that interferes with it is reversed newest first, the entry
//! is applied, and the suffix is redone oldest first. If the entry still does
//! not apply, the module is suspended for a full-state transfer.

use crate::coordinator::Lane;
use crate::error::{SyncError, SyncResult};
use crate::local::{LocalStore, WatermarkTable};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use vouch_core::{
    Action, ActionCodec, ActionId, AuditTime, DynModule, EntityId, ModuleId, ModuleRegistry,
    RegistryCodec, ResponseAudit, RoleBinding, RoleId, ServiceId, Transition, WriteBatch,
};

/// What one reconciliation (possibly several rounds) did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Trail entries whose effect was applied locally
    pub applied: usize,
    /// Entries already held, acknowledged own actions, or entries of
    /// suspended or ignored modules
    pub skipped: usize,
    /// Entries that only applied after reversing interfering pending actions
    pub conflicts_resolved: usize,
    /// Modules refreshed through full-state transfer
    pub suspended: BTreeSet<ModuleId>,
    pub rounds: usize,
    /// Watermark after the pass
    pub watermark: AuditTime,
    /// The host could not serve a complete trail and the service was reloaded
    pub reloaded: bool,
}

/// Result of applying an action beneath pending local actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rebase {
    /// Applied directly on the current state
    Clean(Vec<u8>),
    /// Applied after reversing an interfering suffix; `redone` tells, per
    /// queue index, whether that pending action could be re-applied
    Rebased {
        state: Vec<u8>,
        redone: Vec<(usize, bool)>,
    },
    Failed(String),
}

fn refusal(transition: Transition) -> Option<String> {
    match transition {
        Transition::Applied(_) => None,
        Transition::Rejected(reason) | Transition::Conflict(reason) => Some(reason),
    }
}

/// Apply `incoming` to `state`, which already carries the effect of every
/// action in `pending` (oldest first, tagged with their queue index).
pub(crate) fn rebase(
    module: &dyn DynModule,
    state: Option<&[u8]>,
    pending: &[(usize, &Action)],
    incoming: &Action,
) -> SyncResult<Rebase> {
    let reason = match module.apply(state, incoming)? {
        Transition::Applied(next) => return Ok(Rebase::Clean(next)),
        Transition::Rejected(reason) | Transition::Conflict(reason) => reason,
    };

    let mut start = pending.len();
    while start > 0 && module.interferes_with(pending[start - 1].1, incoming)? {
        start -= 1;
    }
    let suffix = &pending[start..];
    if suffix.is_empty() {
        return Ok(Rebase::Failed(reason));
    }

    let mut current = state.map(<[u8]>::to_vec);
    for (_, action) in suffix.iter().rev() {
        let reversed = module.reverse(action)?;
        match module.apply(current.as_deref(), &reversed)? {
            Transition::Applied(next) => current = Some(next),
            other => {
                let reason = refusal(other).unwrap_or_default();
                return Ok(Rebase::Failed(format!(
                    "pending {} cannot be reversed: {reason}",
                    action.id
                )));
            }
        }
    }

    let mut current = match module.apply(current.as_deref(), incoming)? {
        Transition::Applied(next) => next,
        other => return Ok(Rebase::Failed(refusal(other).unwrap_or(reason))),
    };

    let mut redone = Vec::with_capacity(suffix.len());
    for (index, action) in suffix {
        match module.apply(Some(&current), action)? {
            Transition::Applied(next) => {
                current = next;
                redone.push((*index, true));
            }
            _ => redone.push((*index, false)),
        }
    }
    Ok(Rebase::Rebased {
        state: current,
        redone,
    })
}

/// The lane a pass runs on
pub(crate) struct Pass<'a> {
    pub role: RoleId,
    pub entity: EntityId,
    pub service: &'a ServiceId,
    pub lane: &'a Lane,
}

pub struct Reconciler {
    registry: Arc<ModuleRegistry>,
    codec: RegistryCodec,
    local: LocalStore,
    watermarks: WatermarkTable,
    /// Tags the unsettled records this process writes
    session: Uuid,
    /// Mirror records this far below the watermark are pruned
    mirror_window: u64,
}

impl Reconciler {
    pub fn new(registry: Arc<ModuleRegistry>, local: LocalStore) -> Self {
        Self {
            codec: RegistryCodec::new(registry.clone()),
            watermarks: WatermarkTable::new(local.storage().clone()),
            registry,
            local,
            session: Uuid::new_v4(),
            mirror_window: vouch_core::DEFAULT_MIRROR_WINDOW,
        }
    }

    pub fn with_mirror_window(mut self, window: u64) -> Self {
        self.mirror_window = window;
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn watermarks(&self) -> &WatermarkTable {
        &self.watermarks
    }

    /// Stage the lane's dirty and unsettled records into `batch`
    pub(crate) async fn stage_tracking(
        &self,
        batch: &mut WriteBatch,
        pass: &Pass<'_>,
        unsettled: BTreeSet<ModuleId>,
        added: &BTreeSet<ModuleId>,
        cleared: &BTreeSet<ModuleId>,
    ) -> SyncResult<BTreeSet<ModuleId>> {
        Ok(self
            .local
            .stage_tracking(
                batch,
                pass.role,
                pass.service,
                self.session,
                unsettled,
                added,
                cleared,
            )
            .await?)
    }

    async fn mirror_only(&self, pass: &Pass<'_>, time: AuditTime, encoded: &[u8]) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            LocalStore::mirror_key(pass.role, pass.service, time),
            encoded.to_vec(),
        );
        self.local.commit(batch).await?;
        Ok(())
    }

    /// One round: fold every trail entry, then advance the watermark to
    /// `this_time`. The modules suspended here are recorded dirty in the same
    /// batch as the advance. Returns every module awaiting a full-state
    /// transfer, including ones left dirty by earlier passes or sessions.
    ///
    /// `executed` holds the ids of this client's actions the host acknowledged
    /// in the same exchange. `ignored` maps modules refreshed by an earlier
    /// round to the audit time their snapshot reflects; their entries up to
    /// that time are skipped.
    pub(crate) async fn fold(
        &self,
        pass: &Pass<'_>,
        response: &ResponseAudit,
        executed: &HashSet<ActionId>,
        ignored: &BTreeMap<ModuleId, AuditTime>,
        report: &mut ReconcileReport,
    ) -> SyncResult<BTreeSet<ModuleId>> {
        response.validate()?;
        let binding = RoleBinding::new(pass.role, pass.entity);
        let watermark = self.watermarks.get(pass.role, pass.service).await?;
        let mut suspended = BTreeSet::new();

        for entry in &response.trail {
            if entry.time <= watermark
                || self
                    .local
                    .is_mirrored(pass.role, pass.service, entry.time)
                    .await?
            {
                trace!(time = %entry.time, "Trail entry already held");
                report.skipped += 1;
                continue;
            }

            let action = self
                .codec
                .decode(&entry.action, &binding)
                .map_err(|err| SyncError::TrailEntry {
                    time: entry.time,
                    reason: err.to_string(),
                })?;
            if &action.service != pass.service {
                return Err(SyncError::TrailEntry {
                    time: entry.time,
                    reason: format!("entry belongs to service {}", action.service),
                });
            }

            let mut queue = pass.lane.pending().await;
            let own = queue.position(action.id);
            let skip_module = suspended.contains(&action.module)
                || ignored
                    .get(&action.module)
                    .is_some_and(|as_of| entry.time <= *as_of);

            let own_reflected = own.is_some_and(|index| queue.entries[index].applied_locally);
            if own_reflected
                || (own.is_none() && executed.contains(&action.id))
                || skip_module
            {
                self.mirror_only(pass, entry.time, &entry.action).await?;
                if let Some(index) = own {
                    if let Some(mut mine) = queue.remove(index) {
                        mine.resolve(Ok(entry.time));
                    }
                    debug!(action_id = %action.id, time = %entry.time, "Own action reconciled");
                }
                report.skipped += 1;
                continue;
            }

            let module = self
                .registry
                .resolve(&action)
                .map_err(|err| SyncError::TrailEntry {
                    time: entry.time,
                    reason: err.to_string(),
                })?;
            let key = LocalStore::state_key(pass.role, pass.entity, &action.module);
            let state = self.local.state(pass.role, pass.entity, &action.module).await?;
            let indices = queue.applied_for(&action.module, 0);
            let pending: Vec<(usize, &Action)> = indices
                .iter()
                .map(|index| (*index, &queue.entries[*index].action))
                .collect();

            let outcome = rebase(module.as_ref(), state.as_deref(), &pending, &action)?;
            let (next, redone) = match outcome {
                Rebase::Clean(next) => (next, Vec::new()),
                Rebase::Rebased { state, redone } => (state, redone),
                Rebase::Failed(reason) => {
                    warn!(
                        role = %pass.role,
                        service = %pass.service,
                        module = %action.module,
                        time = %entry.time,
                        %reason,
                        "Trail entry does not apply; suspending module"
                    );
                    suspended.insert(action.module.clone());
                    continue;
                }
            };

            let mut batch = WriteBatch::new();
            batch.put(key, next);
            batch.put(
                LocalStore::mirror_key(pass.role, pass.service, entry.time),
                entry.action.clone(),
            );
            self.local.commit(batch).await?;

            if !redone.is_empty() {
                report.conflicts_resolved += 1;
                debug!(
                    module = %action.module,
                    time = %entry.time,
                    reversed = redone.len(),
                    "Resolved conflict by reverse and redo"
                );
            }
            for (index, applied) in redone {
                if !applied {
                    warn!(
                        action_id = %queue.entries[index].id(),
                        "Pending action no longer applies on host state"
                    );
                }
                queue.entries[index].applied_locally = applied;
            }
            if let Some(index) = own {
                // Own action whose effect was missing locally is now applied
                if let Some(mut mine) = queue.remove(index) {
                    mine.resolve(Ok(entry.time));
                }
            }
            report.applied += 1;
        }

        let queue = pass.lane.pending().await;
        let mut batch = WriteBatch::new();
        let watermark = self
            .watermarks
            .stage_advance(&mut batch, pass.role, pass.service, response.this_time)
            .await?;
        let dirty = self
            .stage_tracking(&mut batch, pass, queue.modules(), &suspended, &BTreeSet::new())
            .await?;
        let mut pruned = 0;
        if let Some(floor) = watermark.value().checked_sub(self.mirror_window) {
            pruned = self
                .local
                .stage_mirror_prune(&mut batch, pass.role, pass.service, AuditTime(floor))
                .await?;
        }
        self.local.commit(batch).await?;
        drop(queue);
        report.watermark = watermark;

        info!(
            role = %pass.role,
            service = %pass.service,
            entries = response.trail.len(),
            applied = report.applied,
            suspended = suspended.len(),
            dirty = dirty.len(),
            pruned,
            %watermark,
            "Folded audit trail"
        );
        Ok(dirty)
    }

    /// Undo a host-rejected pending action, reversing and redoing later
    /// pending actions of the same module that interfere with the rollback.
    /// Returns false when the local state could not be rolled back.
    pub(crate) async fn roll_back(
        &self,
        pass: &Pass<'_>,
        queue: &mut crate::coordinator::PendingQueue,
        index: usize,
    ) -> SyncResult<bool> {
        let (rejected, applied) = match queue.entries.get(index) {
            Some(entry) => (entry.action.clone(), entry.applied_locally),
            None => return Ok(true),
        };
        if !applied {
            return Ok(true);
        }

        let module = self.registry.resolve(&rejected)?;
        let undo = module.reverse(&rejected)?;
        let state = self
            .local
            .state(pass.role, pass.entity, &rejected.module)
            .await?;
        let indices = queue.applied_for(&rejected.module, index + 1);
        let later: Vec<(usize, &Action)> = indices
            .iter()
            .map(|i| (*i, &queue.entries[*i].action))
            .collect();

        let (next, redone) = match rebase(module.as_ref(), state.as_deref(), &later, &undo)? {
            Rebase::Clean(next) => (next, Vec::new()),
            Rebase::Rebased { state, redone } => (state, redone),
            Rebase::Failed(reason) => {
                warn!(action_id = %rejected.id, %reason, "Rejected action cannot be rolled back");
                return Ok(false);
            }
        };

        let mut batch = WriteBatch::new();
        batch.put(
            LocalStore::state_key(pass.role, pass.entity, &rejected.module),
            next,
        );
        self.local.commit(batch).await?;
        for (i, applied) in redone {
            queue.entries[i].applied_locally = applied;
        }
        Ok(true)
    }
}

//! Full-state transfer.
//!
//! Replaces the local state of whole modules with the host's, for modules the
//! reconciler could not replay incrementally and for a forced reload.
//! Replacement is destructive: the old state is removed and the snapshot
//! added, never merged. Pending actions of the replaced modules are then
//! settled against the snapshot: the ones the host already executed are
//! dropped (their effect is in the snapshot), the rest are redone on top.
//! The replaced modules leave the lane's dirty set in the same batch.

use crate::coordinator::EntryState;
use crate::error::SyncResult;
use crate::local::LocalStore;
use crate::reconcile::{Pass, Reconciler};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{info, warn};
use vouch_core::{
    ActionId, AuditTime, ModuleId, StateQuery, StateReply, Transition, WriteBatch,
};

/// What replacing modules did to the pending queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replacement {
    pub modules: usize,
    /// Pending actions found executed by the host and dropped
    pub settled: usize,
    /// Pending actions redone on top of the snapshots
    pub redone: usize,
    /// Pending actions that no longer apply on the snapshots
    pub stranded: usize,
}

impl Reconciler {
    /// Query for `modules`, listing every pending action whose fate is unknown
    pub(crate) async fn state_query(
        &self,
        pass: &Pass<'_>,
        modules: &BTreeSet<ModuleId>,
    ) -> StateQuery {
        let queue = pass.lane.pending().await;
        let pending: Vec<ActionId> = queue
            .iter()
            .filter(|entry| {
                modules.contains(entry.module())
                    && !matches!(entry.state, EntryState::Acknowledged(_))
            })
            .map(|entry| entry.id())
            .collect();
        StateQuery {
            role: pass.role,
            entity: pass.entity,
            service: pass.service.clone(),
            modules: modules.iter().cloned().collect(),
            pending,
        }
    }

    /// Replace `modules` with the snapshots in `reply`. With `advance` the
    /// watermark moves to the reply's `as_of` in the same batch.
    pub(crate) async fn replace_modules(
        &self,
        pass: &Pass<'_>,
        modules: &BTreeSet<ModuleId>,
        reply: &StateReply,
        advance: bool,
    ) -> SyncResult<Replacement> {
        let mut queue = pass.lane.pending().await;
        let executed: HashMap<ActionId, AuditTime> = reply.executed.iter().copied().collect();

        let mut states: BTreeMap<ModuleId, Option<Vec<u8>>> =
            modules.iter().map(|module| (module.clone(), None)).collect();
        for snapshot in &reply.snapshots {
            if !modules.contains(&snapshot.module) {
                warn!(module = %snapshot.module, "Ignoring unrequested snapshot");
                continue;
            }
            states.insert(snapshot.module.clone(), snapshot.state.clone());
        }

        let mut report = Replacement {
            modules: states.len(),
            ..Replacement::default()
        };
        let mut settled: Vec<(usize, AuditTime)> = Vec::new();
        let mut redone: Vec<(usize, bool)> = Vec::new();
        for (index, entry) in queue.iter().enumerate() {
            let Some(state) = states.get_mut(entry.module()) else {
                continue;
            };
            let persisted_at = match entry.state {
                EntryState::Acknowledged(time) => Some(time),
                _ => executed.get(&entry.id()).copied(),
            };
            if let Some(time) = persisted_at {
                settled.push((index, time));
                continue;
            }
            let module = self.registry().module(entry.module())?;
            match module.apply(state.as_deref(), &entry.action)? {
                Transition::Applied(next) => {
                    *state = Some(next);
                    redone.push((index, true));
                }
                _ => redone.push((index, false)),
            }
        }

        let mut batch = WriteBatch::new();
        for (module, state) in &states {
            let key = LocalStore::state_key(pass.role, pass.entity, module);
            batch.delete(key.clone());
            if let Some(state) = state {
                batch.put(key, state.clone());
            }
        }
        let remaining: BTreeSet<ModuleId> = queue
            .iter()
            .enumerate()
            .filter(|(index, _)| !settled.iter().any(|(done, _)| done == index))
            .map(|(_, entry)| entry.module().clone())
            .collect();
        self.stage_tracking(&mut batch, pass, remaining, &BTreeSet::new(), modules)
            .await?;
        if advance {
            self.watermarks()
                .stage_advance(&mut batch, pass.role, pass.service, reply.as_of)
                .await?;
        }
        self.local().commit(batch).await?;

        for (index, applied) in redone {
            if applied {
                report.redone += 1;
            } else {
                report.stranded += 1;
            }
            queue.entries[index].applied_locally = applied;
        }
        for (index, time) in settled.into_iter().rev() {
            if let Some(mut entry) = queue.remove(index) {
                entry.resolve(Ok(time));
                report.settled += 1;
            }
        }

        info!(
            role = %pass.role,
            service = %pass.service,
            modules = report.modules,
            settled = report.settled,
            redone = report.redone,
            stranded = report.stranded,
            as_of = %reply.as_of,
            "Replaced module state from host"
        );
        Ok(report)
    }
}

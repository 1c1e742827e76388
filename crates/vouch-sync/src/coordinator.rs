//! Synchronization coordinator.
//!
//! One [`Lane`] per (role, service):
//!
//! - a non-reentrant **gate**: whoever holds it may attach a `RequestAudit`
//!   to an exchange and reconcile the response; everyone else sends their
//!   methods without one
//! - the **pending queue** with its own lock, which also serializes every
//!   mutation of the lane's local module state, so `execute` can enqueue
//!   while a reconciliation pass is running
//! - a **transmit** lock so methods of one lane reach the host in queue order
//!
//! Host replies are settled into the queue only by the gate holder; an
//! exchange sent without the gate waits for it before settling.
//!
//! Different lanes never contend.

use crate::error::ActionRejected;
use async_lock::{Mutex, MutexGuard, MutexGuardArc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;
use vouch_core::{Action, ActionId, AuditTime, ModuleId, RoleId, ServiceId};

/// Where a pending action is in its round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for the next exchange
    Queued,
    /// Sent, reply not yet seen
    InFlight,
    /// Host persisted it at this time; kept until its trail entry is folded in
    Acknowledged(AuditTime),
}

pub(crate) type AckSender = oneshot::Sender<Result<AuditTime, ActionRejected>>;

/// A locally applied action the host has not yet been reconciled against
pub struct PendingEntry {
    pub action: Action,
    /// Signed encoding sent to the host
    pub encoded: Vec<u8>,
    pub state: EntryState,
    /// False when the action could not be redone on top of newer host state;
    /// its effect is then absent locally
    pub applied_locally: bool,
    ack: Option<AckSender>,
}

impl PendingEntry {
    pub(crate) fn new(action: Action, encoded: Vec<u8>, ack: AckSender) -> Self {
        Self {
            action,
            encoded,
            state: EntryState::Queued,
            applied_locally: true,
            ack: Some(ack),
        }
    }

    pub fn id(&self) -> ActionId {
        self.action.id
    }

    pub fn module(&self) -> &ModuleId {
        &self.action.module
    }

    /// Resolve the caller's ticket; later calls are no-ops
    pub(crate) fn resolve(&mut self, outcome: Result<AuditTime, ActionRejected>) {
        if let Some(ack) = self.ack.take() {
            // The caller may have dropped its ticket
            let _ = ack.send(outcome);
        }
    }
}

impl std::fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEntry")
            .field("id", &self.action.id)
            .field("module", &self.action.module)
            .field("state", &self.state)
            .field("applied_locally", &self.applied_locally)
            .finish()
    }
}

/// FIFO of pending entries for one lane
#[derive(Debug, Default)]
pub struct PendingQueue {
    pub(crate) entries: VecDeque<PendingEntry>,
}

impl PendingQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }

    /// Modules with at least one entry in the queue
    pub(crate) fn modules(&self) -> BTreeSet<ModuleId> {
        self.entries.iter().map(|entry| entry.module().clone()).collect()
    }

    pub(crate) fn position(&self, id: ActionId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id() == id)
    }

    pub(crate) fn push(&mut self, entry: PendingEntry) {
        self.entries.push_back(entry);
    }

    /// Mark every queued entry in flight and return their encodings in order
    pub(crate) fn take_outgoing(&mut self) -> Vec<(ActionId, Vec<u8>)> {
        self.entries
            .iter_mut()
            .filter(|entry| entry.state == EntryState::Queued)
            .map(|entry| {
                entry.state = EntryState::InFlight;
                (entry.id(), entry.encoded.clone())
            })
            .collect()
    }

    /// Return the in-flight entries among `ids` to the queue after a failed
    /// or unanswered delivery. Entries sent by another exchange are left alone.
    pub(crate) fn requeue(&mut self, ids: &[ActionId]) -> usize {
        let mut requeued = 0;
        for entry in self.entries.iter_mut() {
            if entry.state == EntryState::InFlight && ids.contains(&entry.id()) {
                entry.state = EntryState::Queued;
                requeued += 1;
            }
        }
        requeued
    }

    pub(crate) fn acknowledge(&mut self, id: ActionId, time: AuditTime) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id() == id) {
            Some(entry) => {
                entry.state = EntryState::Acknowledged(time);
                entry.resolve(Ok(time));
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<PendingEntry> {
        self.entries.remove(index)
    }

    /// Indices of entries for `module` whose effect is present locally, FIFO
    pub(crate) fn applied_for(&self, module: &ModuleId, from: usize) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .skip(from)
            .filter(|(_, entry)| entry.module() == module && entry.applied_locally)
            .map(|(index, _)| index)
            .collect()
    }
}

/// Per (role, service) coordination state
#[derive(Debug, Default)]
pub struct Lane {
    gate: Arc<Mutex<()>>,
    transmit: Mutex<()>,
    pending: Mutex<PendingQueue>,
}

impl Lane {
    pub async fn pending(&self) -> MutexGuard<'_, PendingQueue> {
        self.pending.lock().await
    }

    pub(crate) async fn transmit(&self) -> MutexGuard<'_, ()> {
        self.transmit.lock().await
    }
}

/// Held while a role reconciles a service; dropping it resumes the lane
#[must_use = "dropping the guard releases the gate immediately"]
pub struct SuspendGuard {
    _gate: MutexGuardArc<()>,
}

#[derive(Debug, Default)]
pub struct SyncCoordinator {
    lanes: parking_lot::Mutex<HashMap<(RoleId, ServiceId), Arc<Lane>>>,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lane(&self, role: RoleId, service: &ServiceId) -> Arc<Lane> {
        self.lanes
            .lock()
            .entry((role, service.clone()))
            .or_default()
            .clone()
    }

    /// Try to take the gate; `None` while another exchange holds it
    pub fn suspend(&self, role: RoleId, service: &ServiceId) -> Option<SuspendGuard> {
        let guard = self.lane(role, service).gate.try_lock_arc()?;
        trace!(%role, %service, "Lane suspended");
        Some(SuspendGuard { _gate: guard })
    }

    /// Wait for the gate
    pub async fn suspend_wait(&self, role: RoleId, service: &ServiceId) -> SuspendGuard {
        let gate = self.lane(role, service).gate.clone();
        let guard = gate.lock_arc().await;
        trace!(%role, %service, "Lane suspended after wait");
        SuspendGuard { _gate: guard }
    }

    /// Release the gate taken by [`SyncCoordinator::suspend`]
    pub fn resume(&self, guard: SuspendGuard) {
        drop(guard);
    }
}

//! The client synchronization engine.
//!
//! [`SyncEngine`] is the public surface: `execute` applies an action locally
//! and queues it, `flush` sends queued actions (with a watermark claim when
//! the lane's gate is free) and reconciles the reply, `refresh` forces an
//! incremental pass, `reload` forces a full-state resync.

use crate::coordinator::{EntryState, Lane, PendingEntry, SyncCoordinator};
use crate::error::{ActionRejected, SyncError, SyncResult};
use crate::fullstate::Replacement;
use crate::local::LocalStore;
use crate::reconcile::{Pass, ReconcileReport, Reconciler};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use vouch_core::{
    open_storage, serialization, Action, ActionCodec, ActionId, ActionSigner, AuditTime,
    CoreError, EntityId, ExchangeRequest, ModuleId, ModuleRegistry, RegistryCodec, Reply,
    RequestAudit, ResponseAudit, RoleId, ServiceId, StorageEffects, SyncConfig, Transition,
    Transport, TrailEntry, VouchConfig, WriteBatch,
};

// =============================================================================
// Public types
// =============================================================================

/// A role this engine knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleHandle {
    pub role: RoleId,
    pub entity: EntityId,
    /// False for roles that only audit; they never originate actions and
    /// their pending queue is always empty
    pub controlled: bool,
}

/// Ticket for an executed action; resolves when the host decides
#[derive(Debug)]
pub struct PendingAck {
    action_id: ActionId,
    receiver: oneshot::Receiver<Result<AuditTime, ActionRejected>>,
}

impl PendingAck {
    pub fn action_id(&self) -> ActionId {
        self.action_id
    }

    /// Audit time the host persisted the action at, or its rejection
    pub async fn wait(self) -> SyncResult<AuditTime> {
        match self.receiver.await {
            Ok(outcome) => outcome.map_err(SyncError::from),
            Err(_) => Err(SyncError::Abandoned {
                reason: format!("action {} left the queue unresolved", self.action_id),
            }),
        }
    }

    pub async fn wait_for(self, limit: Duration) -> SyncResult<AuditTime> {
        match tokio::time::timeout(limit, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SyncError::Timeout {
                millis: millis(limit),
            }),
        }
    }
}

fn millis(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of one exchange with the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub acknowledged: usize,
    pub rejected: Vec<ActionRejected>,
    /// Present when the exchange carried a watermark claim
    pub reconcile: Option<ReconcileReport>,
}

/// Read-only view of a queue entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingView {
    pub action_id: ActionId,
    pub module: ModuleId,
    pub state: EntryState,
    pub applied_locally: bool,
}

// =============================================================================
// Engine
// =============================================================================

pub struct SyncEngine {
    reconciler: Reconciler,
    codec: RegistryCodec,
    transport: Arc<dyn Transport>,
    signer: Option<Arc<dyn ActionSigner>>,
    coordinator: SyncCoordinator,
    roles: RwLock<HashMap<RoleId, RoleHandle>>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        storage: Arc<dyn StorageEffects>,
        transport: Arc<dyn Transport>,
        config: SyncConfig,
    ) -> Self {
        Self {
            codec: RegistryCodec::new(registry.clone()),
            reconciler: Reconciler::new(registry, LocalStore::new(storage))
                .with_mirror_window(config.mirror_window),
            transport,
            signer: None,
            coordinator: SyncCoordinator::new(),
            roles: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Engine over the storage named by `config.store`
    pub async fn open(
        config: &VouchConfig,
        registry: Arc<ModuleRegistry>,
        transport: Arc<dyn Transport>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let storage = open_storage(&config.store).await?;
        Ok(Self::new(registry, storage, transport, config.sync.clone()))
    }

    pub fn with_signer(mut self, signer: Arc<dyn ActionSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// Register a role this client acts as
    pub fn add_role(&self, role: RoleId, entity: EntityId) {
        self.insert_role(RoleHandle {
            role,
            entity,
            controlled: true,
        });
    }

    /// Register a role this client only audits
    pub fn add_auditor(&self, role: RoleId, entity: EntityId) {
        self.insert_role(RoleHandle {
            role,
            entity,
            controlled: false,
        });
    }

    fn insert_role(&self, handle: RoleHandle) {
        debug!(role = %handle.role, entity = %handle.entity, controlled = handle.controlled, "Registered role");
        self.roles.write().insert(handle.role, handle);
    }

    fn role(&self, role: RoleId) -> SyncResult<RoleHandle> {
        self.roles
            .read()
            .get(&role)
            .copied()
            .ok_or(SyncError::UnknownRole { role })
    }

    fn controlled(&self, role: RoleId) -> SyncResult<RoleHandle> {
        let handle = self.role(role)?;
        if !handle.controlled {
            return Err(SyncError::NotControlled { role });
        }
        Ok(handle)
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub async fn watermark(&self, role: RoleId, service: &ServiceId) -> SyncResult<AuditTime> {
        Ok(self.reconciler.watermarks().get(role, service).await?)
    }

    /// Encoded local state of a module
    pub async fn state(&self, role: RoleId, module: &ModuleId) -> SyncResult<Option<Vec<u8>>> {
        let handle = self.role(role)?;
        Ok(self
            .reconciler
            .local()
            .state(role, handle.entity, module)
            .await?)
    }

    /// Decoded local state of a module; the default when there is none
    pub async fn typed_state<S: DeserializeOwned + Default>(
        &self,
        role: RoleId,
        module: &ModuleId,
    ) -> SyncResult<S> {
        match self.state(role, module).await? {
            Some(bytes) => Ok(serialization::from_slice(&bytes)?),
            None => Ok(S::default()),
        }
    }

    pub async fn pending(&self, role: RoleId, service: &ServiceId) -> Vec<PendingView> {
        let lane = self.coordinator.lane(role, service);
        let queue = lane.pending().await;
        queue
            .iter()
            .map(|entry| PendingView {
                action_id: entry.id(),
                module: entry.module().clone(),
                state: entry.state,
                applied_locally: entry.applied_locally,
            })
            .collect()
    }

    /// Trail entries folded into local state so far
    pub async fn mirrored_trail(
        &self,
        role: RoleId,
        service: &ServiceId,
    ) -> SyncResult<Vec<TrailEntry>> {
        Ok(self
            .reconciler
            .local()
            .mirrored_trail(role, service)
            .await?)
    }

    // -------------------------------------------------------------------------
    // Execute
    // -------------------------------------------------------------------------

    /// Apply `action` locally, queue it for the host and, with `auto_flush`,
    /// schedule transmission. A local refusal is returned as
    /// [`SyncError::Rejected`] and leaves nothing behind.
    pub async fn execute(self: &Arc<Self>, role: RoleId, mut action: Action) -> SyncResult<PendingAck> {
        let handle = self.controlled(role)?;
        if action.entity != handle.entity {
            return Err(CoreError::WrongEntity {
                expected: handle.entity,
                actual: action.entity,
            }
            .into());
        }
        let module = self.reconciler.registry().resolve(&action)?.clone();
        if let Some(signer) = &self.signer {
            action.sign(signer.as_ref())?;
        }
        let encoded = self.codec.encode(&action)?;
        let service = action.service.clone();
        let action_id = action.id;

        let lane = self.coordinator.lane(role, &service);
        let (sender, receiver) = oneshot::channel();
        {
            let mut queue = lane.pending().await;
            let state = self
                .reconciler
                .local()
                .state(role, handle.entity, &action.module)
                .await?;
            match module.apply(state.as_deref(), &action)? {
                Transition::Applied(next) => {
                    let mut batch = WriteBatch::new();
                    batch.put(
                        LocalStore::state_key(role, handle.entity, &action.module),
                        next,
                    );
                    // The effect is durable before the queue entry exists, so
                    // its module is recorded unsettled in the same batch
                    let mut unsettled = queue.modules();
                    unsettled.insert(action.module.clone());
                    let pass = Pass {
                        role,
                        entity: handle.entity,
                        service: &service,
                        lane: &lane,
                    };
                    self.reconciler
                        .stage_tracking(&mut batch, &pass, unsettled, &BTreeSet::new(), &BTreeSet::new())
                        .await?;
                    self.reconciler.local().commit(batch).await?;
                }
                Transition::Rejected(reason) | Transition::Conflict(reason) => {
                    debug!(%role, %action_id, %reason, "Action refused locally");
                    return Err(ActionRejected { action_id, reason }.into());
                }
            }
            queue.push(PendingEntry::new(action, encoded, sender));
            debug!(%role, %service, %action_id, queued = queue.len(), "Action applied and queued");
        }

        if self.config.auto_flush {
            self.spawn_flush(role, service);
        }
        Ok(PendingAck {
            action_id,
            receiver,
        })
    }

    fn spawn_flush(self: &Arc<Self>, role: RoleId, service: ServiceId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(%role, %service, "No runtime; action waits for the next flush");
            return;
        };
        let engine = self.clone();
        runtime.spawn(async move {
            if let Err(err) = engine.flush(role, &service).await {
                warn!(%role, %service, error = %err, code = err.code(), "Background flush failed");
            }
        });
    }

    // -------------------------------------------------------------------------
    // Exchange
    // -------------------------------------------------------------------------

    /// Send queued actions. When the gate is free the exchange also claims the
    /// watermark and the reply's trail is reconciled before returning; when
    /// another exchange holds the gate the actions go out without a claim.
    pub async fn flush(&self, role: RoleId, service: &ServiceId) -> SyncResult<FlushReport> {
        let handle = self.role(role)?;
        let lane = self.coordinator.lane(role, service);
        let gate = self.coordinator.suspend(role, service);
        let report = self.exchange(&handle, service, &lane, gate.is_some()).await;
        if let Some(gate) = gate {
            self.coordinator.resume(gate);
        }
        report
    }

    /// Reconcile now, waiting for the gate if another exchange holds it
    pub async fn refresh(&self, role: RoleId, service: &ServiceId) -> SyncResult<ReconcileReport> {
        let handle = self.role(role)?;
        let lane = self.coordinator.lane(role, service);
        let _gate = self.coordinator.suspend_wait(role, service).await;
        let report = self.exchange(&handle, service, &lane, true).await?;
        Ok(report.reconcile.unwrap_or_default())
    }

    /// [`SyncEngine::refresh`] on its own task. The caller stops waiting after
    /// `exchange_timeout_ms`; the pass itself always runs to completion.
    pub async fn refresh_detached(
        self: &Arc<Self>,
        role: RoleId,
        service: &ServiceId,
    ) -> SyncResult<ReconcileReport> {
        let engine = self.clone();
        let owned = service.clone();
        let task = tokio::spawn(async move { engine.refresh(role, &owned).await });
        let limit = self.config.exchange_timeout();
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(SyncError::Abandoned {
                reason: join.to_string(),
            }),
            Err(_) => Err(SyncError::Timeout {
                millis: millis(limit),
            }),
        }
    }

    /// Replace every module of the service with the host's state
    pub async fn reload(&self, role: RoleId, service: &ServiceId) -> SyncResult<Replacement> {
        let handle = self.role(role)?;
        let lane = self.coordinator.lane(role, service);
        let _gate = self.coordinator.suspend_wait(role, service).await;
        let pass = Pass {
            role,
            entity: handle.entity,
            service,
            lane: &lane,
        };
        self.reload_locked(&pass).await
    }

    async fn reload_locked(&self, pass: &Pass<'_>) -> SyncResult<Replacement> {
        let modules: BTreeSet<ModuleId> = self
            .reconciler
            .registry()
            .modules_of(pass.service)
            .into_iter()
            .collect();
        let query = self.reconciler.state_query(pass, &modules).await;
        let reply = self.transport.query_state(query).await?;
        self.reconciler
            .replace_modules(pass, &modules, &reply, true)
            .await
    }

    async fn exchange(
        &self,
        handle: &RoleHandle,
        service: &ServiceId,
        lane: &Lane,
        with_audit: bool,
    ) -> SyncResult<FlushReport> {
        let pass = Pass {
            role: handle.role,
            entity: handle.entity,
            service,
            lane,
        };
        let transmit = lane.transmit().await;
        let outgoing = lane.pending().await.take_outgoing();
        let audit = if with_audit {
            Some(RequestAudit::since(self.watermark(handle.role, service).await?))
        } else {
            None
        };
        if outgoing.is_empty() && audit.is_none() {
            return Ok(FlushReport::default());
        }

        let sent: Vec<ActionId> = outgoing.iter().map(|(id, _)| *id).collect();
        let request = ExchangeRequest::new(handle.role, handle.entity, service.clone())
            .with_methods(outgoing.into_iter().map(|(_, encoded)| encoded).collect())
            .with_audit(audit);
        debug!(role = %handle.role, %service, sent = sent.len(), claim = ?audit, "Sending exchange");

        let response = match self.transport.exchange(request).await {
            Ok(response) => response,
            Err(err) => {
                let requeued = lane.pending().await.requeue(&sent);
                warn!(
                    role = %handle.role,
                    %service,
                    requeued,
                    error = %err,
                    "Exchange failed; pending actions stay queued"
                );
                return Err(err.into());
            }
        };

        // Only the gate holder settles replies into the queue. Without the
        // gate the transmit lock is released first, since the holder may be
        // waiting for it.
        let (transmit, _waited) = if with_audit {
            (Some(transmit), None)
        } else {
            drop(transmit);
            let gate = self.coordinator.suspend_wait(handle.role, service).await;
            (None, Some(gate))
        };

        let mut report = FlushReport {
            sent: sent.len(),
            ..FlushReport::default()
        };
        let executed = match self
            .settle_replies(&pass, &sent, &response.replies, &mut report)
            .await
        {
            Ok(executed) => executed,
            Err(err) => {
                lane.pending().await.requeue(&sent);
                return Err(err);
            }
        };
        drop(transmit);

        if with_audit {
            let audit = response.audit.ok_or_else(|| SyncError::InvalidAudit {
                reason: "host omitted the requested audit".to_string(),
            })?;
            report.reconcile = Some(self.reconcile(&pass, audit, executed).await?);
        }
        Ok(report)
    }

    /// Apply the host's verdicts on `sent` to the queue; returns the
    /// acknowledged ids. Runs under the lane's gate.
    async fn settle_replies(
        &self,
        pass: &Pass<'_>,
        sent: &[ActionId],
        replies: &[Reply],
        report: &mut FlushReport,
    ) -> SyncResult<HashSet<ActionId>> {
        let mut executed = HashSet::new();
        let mut queue = pass.lane.pending().await;
        for reply in replies {
            match reply {
                Reply::Applied { action, time } => {
                    executed.insert(*action);
                    if queue.acknowledge(*action, *time) {
                        report.acknowledged += 1;
                    }
                }
                Reply::Rejected { action, reason } => {
                    let Some(index) = queue.position(*action) else {
                        continue;
                    };
                    let rolled_back = self.reconciler.roll_back(pass, &mut queue, index).await?;
                    if let Some(mut entry) = queue.remove(index) {
                        if !rolled_back {
                            let mut batch = WriteBatch::new();
                            let module = BTreeSet::from([entry.module().clone()]);
                            self.reconciler
                                .stage_tracking(&mut batch, pass, queue.modules(), &module, &BTreeSet::new())
                                .await?;
                            self.reconciler.local().commit(batch).await?;
                        }
                        let rejection = ActionRejected {
                            action_id: *action,
                            reason: reason.clone(),
                        };
                        info!(role = %pass.role, action_id = %action, %reason, "Host rejected action");
                        entry.resolve(Err(rejection.clone()));
                        report.rejected.push(rejection);
                    }
                }
            }
        }
        let answered: HashSet<ActionId> = replies.iter().map(Reply::action).collect();
        let unanswered: Vec<ActionId> = sent
            .iter()
            .filter(|id| !answered.contains(id))
            .copied()
            .collect();
        if !unanswered.is_empty() {
            let requeued = queue.requeue(&unanswered);
            warn!(role = %pass.role, requeued, "Host left methods unanswered");
        }
        Ok(executed)
    }

    /// Fold `response`, then fetch full state for suspended modules and fold a
    /// fresh trail with them ignored, until no module is suspended.
    async fn reconcile(
        &self,
        pass: &Pass<'_>,
        mut response: ResponseAudit,
        executed: HashSet<ActionId>,
    ) -> SyncResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut ignored: BTreeMap<ModuleId, AuditTime> = BTreeMap::new();

        loop {
            report.rounds += 1;
            if report.rounds > self.config.max_reconcile_rounds {
                return Err(SyncError::RoundsExhausted {
                    rounds: self.config.max_reconcile_rounds,
                });
            }

            if response.truncated {
                info!(
                    role = %pass.role,
                    service = %pass.service,
                    since = %response.last_time,
                    "Host trail truncated; reloading service"
                );
                self.reload_locked(pass).await?;
                report.reloaded = true;
                break;
            }

            let watermark = self.watermark(pass.role, pass.service).await?;
            if response.last_time > watermark {
                return Err(SyncError::InvalidAudit {
                    reason: format!(
                        "trail starts after {} but local watermark is {watermark}",
                        response.last_time
                    ),
                });
            }

            // Includes modules left dirty by an earlier pass or session; they
            // stay recorded until a replacement lands
            let suspended = self
                .reconciler
                .fold(pass, &response, &executed, &ignored, &mut report)
                .await?;
            if suspended.is_empty() {
                break;
            }

            let query = self.reconciler.state_query(pass, &suspended).await;
            let reply = self.transport.query_state(query).await?;
            self.reconciler
                .replace_modules(pass, &suspended, &reply, false)
                .await?;
            for module in &suspended {
                ignored.insert(module.clone(), reply.as_of);
            }
            report.suspended.extend(suspended);

            let since = self.watermark(pass.role, pass.service).await?;
            let request = ExchangeRequest::new(pass.role, pass.entity, pass.service.clone())
                .with_audit(Some(RequestAudit::since(since)));
            response = self
                .transport
                .exchange(request)
                .await?
                .audit
                .ok_or_else(|| SyncError::InvalidAudit {
                    reason: "host omitted the requested audit".to_string(),
                })?;
        }

        report.watermark = self.watermark(pass.role, pass.service).await?;
        info!(
            role = %pass.role,
            service = %pass.service,
            rounds = report.rounds,
            applied = report.applied,
            conflicts = report.conflicts_resolved,
            suspended = report.suspended.len(),
            watermark = %report.watermark,
            "Reconciliation settled"
        );
        Ok(report)
    }
}

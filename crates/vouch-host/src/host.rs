//! Authoritative host.
//!
//! The host is the source of truth for every entity it serves. It executes
//! incoming methods against its own module state, persists each executed
//! action into the audit log in the same batch as the state change, and
//! answers audit requests and full-state queries scoped to the requesting
//! role's viewer.

use crate::error::{HostError, HostResult};
use async_lock::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vouch_core::{
    serialization, Action, ActionCodec, ActionSigner, AuditTime, EntityId, ExchangeRequest,
    ExchangeResponse, ModuleId, ModuleRegistry, ModuleSnapshot, RegistryCodec, Reply,
    RequestAudit, ResponseAudit, RoleBinding, RoleId, StateQuery, StateReply, TimeEffects,
    Transition, Viewer, VouchConfig, WriteBatch,
};
use vouch_core::protocol::WIRE_SCHEMA_VERSION;
use vouch_store::{AuditLogStore, StreamKey};

/// What a role may do and see on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGrant {
    pub role: RoleId,
    pub entity: EntityId,
    pub viewer: Viewer,
}

pub struct Host {
    registry: Arc<ModuleRegistry>,
    codec: RegistryCodec,
    store: Arc<AuditLogStore>,
    verifier: Option<Arc<dyn ActionSigner>>,
    grants: RwLock<HashMap<RoleId, RoleGrant>>,
    /// Serializes read-apply-persist per (entity, service)
    stream_locks: parking_lot::Mutex<HashMap<StreamKey, Arc<Mutex<()>>>>,
    /// Periodic audit purge, aborted when the host drops
    retention_task: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for Host {
    fn drop(&mut self) {
        if let Some(task) = self.retention_task.take() {
            task.abort();
        }
    }
}

fn state_key(entity: EntityId, module: &ModuleId) -> String {
    format!("host/state/{entity}/{module}")
}

impl Host {
    pub fn new(registry: Arc<ModuleRegistry>, store: Arc<AuditLogStore>) -> Self {
        Self {
            codec: RegistryCodec::new(registry.clone()),
            registry,
            store,
            verifier: None,
            grants: RwLock::new(HashMap::new()),
            stream_locks: parking_lot::Mutex::new(HashMap::new()),
            retention_task: None,
        }
    }

    /// Host over the storage `config` names, purging expired audit entries
    /// every `store.purge_interval_secs` on the current runtime
    pub async fn open(
        config: &VouchConfig,
        registry: Arc<ModuleRegistry>,
        clock: Arc<dyn TimeEffects>,
    ) -> HostResult<Self> {
        config.validate()?;
        let store = Arc::new(AuditLogStore::open(&config.store, clock).await?);
        let every = config.store.purge_interval();
        info!(
            retention_secs = config.store.retention_secs,
            purge_interval_secs = config.store.purge_interval_secs,
            "Opening host"
        );
        let task = store.clone().spawn_retention(every);
        let mut host = Self::new(registry, store);
        host.retention_task = Some(task);
        Ok(host)
    }

    /// Require a valid signature on every incoming method
    pub fn with_verifier(mut self, verifier: Arc<dyn ActionSigner>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<AuditLogStore> {
        &self.store
    }

    pub fn grant(&self, grant: RoleGrant) {
        info!(role = %grant.role, entity = %grant.entity, "Granted role");
        self.grants.write().insert(grant.role, grant);
    }

    pub fn revoke(&self, role: RoleId) -> bool {
        self.grants.write().remove(&role).is_some()
    }

    fn grant_for(&self, role: RoleId, entity: EntityId) -> HostResult<RoleGrant> {
        let grant = self
            .grants
            .read()
            .get(&role)
            .cloned()
            .ok_or(HostError::UnknownRole { role })?;
        if grant.entity != entity {
            return Err(HostError::WrongEntity { role, entity });
        }
        Ok(grant)
    }

    fn stream_lock(&self, stream: &StreamKey) -> Arc<Mutex<()>> {
        self.stream_locks
            .lock()
            .entry(stream.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current authoritative state of one module for an entity
    pub async fn module_state(
        &self,
        entity: EntityId,
        module: &ModuleId,
    ) -> HostResult<Option<Vec<u8>>> {
        Ok(self
            .store
            .storage()
            .retrieve(&state_key(entity, module))
            .await
            .map_err(vouch_store::StoreError::from)?)
    }

    /// Execute methods in order, then answer the audit request if present
    pub async fn handle_exchange(&self, request: ExchangeRequest) -> HostResult<ExchangeResponse> {
        if request.schema_version != WIRE_SCHEMA_VERSION {
            return Err(HostError::Malformed {
                reason: format!("unsupported schema version {}", request.schema_version),
            });
        }
        let grant = self.grant_for(request.role, request.entity)?;
        let stream = StreamKey::new(request.entity, request.service.clone())?;
        let lock = self.stream_lock(&stream);
        let _guard = lock.lock().await;

        let binding = RoleBinding::new(grant.role, grant.entity);
        let mut replies = Vec::with_capacity(request.methods.len());
        for bytes in &request.methods {
            replies.push(self.execute_method(&stream, &grant, &binding, bytes).await?);
        }

        let audit = match request.audit {
            Some(audit) => Some(self.answer_audit(&stream, &grant, audit).await?),
            None => None,
        };

        Ok(ExchangeResponse { replies, audit })
    }

    async fn answer_audit(
        &self,
        stream: &StreamKey,
        grant: &RoleGrant,
        audit: RequestAudit,
    ) -> HostResult<ResponseAudit> {
        self.store
            .record_observed(stream, grant.role, audit.last_time)
            .await?;
        Ok(self
            .store
            .query(stream, audit.last_time, &grant.viewer)
            .await?)
    }

    async fn execute_method(
        &self,
        stream: &StreamKey,
        grant: &RoleGrant,
        binding: &RoleBinding,
        bytes: &[u8],
    ) -> HostResult<Reply> {
        let raw: Action = serialization::from_slice(bytes).map_err(|e| HostError::Malformed {
            reason: format!("method is not an action: {e}"),
        })?;
        let reject = |reason: String| {
            warn!(role = %grant.role, action_id = %raw.id, %reason, "Rejected method");
            Ok(Reply::Rejected {
                action: raw.id,
                reason,
            })
        };

        if let Some(time) = self.store.lookup(stream, raw.id).await? {
            debug!(action_id = %raw.id, %time, "Method already executed");
            return Ok(Reply::Applied {
                action: raw.id,
                time,
            });
        }

        let action = match self.codec.decode(bytes, binding) {
            Ok(action) => action,
            Err(err) => return reject(err.to_string()),
        };
        if action.service != stream.service {
            return reject(format!(
                "action addressed to {} sent on {}",
                action.service, stream.service
            ));
        }
        if action.compensating {
            return reject("compensating actions are never sent".to_string());
        }
        if grant.viewer.restrictions.read_only {
            return reject("role is read-only".to_string());
        }
        if let Some(verifier) = &self.verifier {
            if !action.verify(verifier.as_ref())? {
                return reject("signature does not verify".to_string());
            }
        }

        let module = self.registry.resolve(&action)?;
        let key = state_key(action.entity, &action.module);
        let state = self
            .store
            .storage()
            .retrieve(&key)
            .await
            .map_err(vouch_store::StoreError::from)?;

        match module.apply(state.as_deref(), &action)? {
            Transition::Applied(next) => {
                let visibility = module.required_visibility(&action)?;
                let mut effect = WriteBatch::new();
                effect.put(key, next);
                let time = self
                    .store
                    .persist(stream, &action, bytes.to_vec(), visibility, effect)
                    .await?;
                Ok(Reply::Applied {
                    action: action.id,
                    time,
                })
            }
            Transition::Rejected(reason) => reject(reason),
            Transition::Conflict(reason) => reject(format!("precondition failed: {reason}")),
        }
    }

    /// Full state of the requested modules, narrowed to the role's viewer
    pub async fn handle_state_query(&self, query: StateQuery) -> HostResult<StateReply> {
        let grant = self.grant_for(query.role, query.entity)?;
        let stream = StreamKey::new(query.entity, query.service.clone())?;
        let lock = self.stream_lock(&stream);
        let _guard = lock.lock().await;

        let served = self.registry.modules_of(&query.service);
        let mut snapshots = Vec::with_capacity(query.modules.len());
        for module_id in &query.modules {
            if !served.contains(module_id) {
                return Err(HostError::UnknownModule {
                    module: module_id.clone(),
                    service: query.service.clone(),
                });
            }
            let module = self.registry.module(module_id)?;
            let state = match self.module_state(query.entity, module_id).await? {
                Some(state) => Some(module.visible_state(&state, &grant.viewer)?),
                None => None,
            };
            snapshots.push(ModuleSnapshot {
                module: module_id.clone(),
                state,
            });
        }

        let mut executed = Vec::new();
        for action in &query.pending {
            if let Some(time) = self.store.lookup(&stream, *action).await? {
                executed.push((*action, time));
            }
        }

        let as_of: AuditTime = self.store.tail(&stream).await?;
        debug!(
            role = %grant.role,
            service = %query.service,
            modules = snapshots.len(),
            %as_of,
            "Answered state query"
        );
        Ok(StateReply {
            as_of,
            snapshots,
            executed,
        })
    }
}

//! Messages exchanged between a client engine and the host.

use crate::audit::{RequestAudit, ResponseAudit};
use crate::identifiers::{ActionId, EntityId, ModuleId, RoleId, ServiceId};
use crate::time::AuditTime;
use serde::{Deserialize, Serialize};

pub const WIRE_SCHEMA_VERSION: u16 = 1;

/// Outgoing methods plus an optional watermark claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub schema_version: u16,
    pub role: RoleId,
    pub entity: EntityId,
    pub service: ServiceId,
    /// Encoded, signed actions in the order they were applied locally
    pub methods: Vec<Vec<u8>>,
    /// Present only when the sender holds the synchronization gate
    pub audit: Option<RequestAudit>,
}

impl ExchangeRequest {
    pub fn new(role: RoleId, entity: EntityId, service: ServiceId) -> Self {
        Self {
            schema_version: WIRE_SCHEMA_VERSION,
            role,
            entity,
            service,
            methods: Vec::new(),
            audit: None,
        }
    }

    pub fn with_methods(mut self, methods: Vec<Vec<u8>>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_audit(mut self, audit: Option<RequestAudit>) -> Self {
        self.audit = audit;
        self
    }
}

/// Host verdict on one method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Executed and persisted at `time`
    Applied { action: ActionId, time: AuditTime },
    /// Not executed; nothing was persisted
    Rejected { action: ActionId, reason: String },
}

impl Reply {
    pub fn action(&self) -> ActionId {
        match self {
            Reply::Applied { action, .. } | Reply::Rejected { action, .. } => *action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    /// One reply per method, same order
    pub replies: Vec<Reply>,
    pub audit: Option<ResponseAudit>,
}

/// Request for the full state of some modules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateQuery {
    pub role: RoleId,
    pub entity: EntityId,
    pub service: ServiceId,
    pub modules: Vec<ModuleId>,
    /// Local actions whose fate the client cannot tell (lost replies)
    pub pending: Vec<ActionId>,
}

/// Full state of one module; `None` if the entity has no state there
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    pub module: ModuleId,
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReply {
    /// Audit position the snapshots reflect
    pub as_of: AuditTime,
    pub snapshots: Vec<ModuleSnapshot>,
    /// The subset of the queried pending actions the host has persisted
    pub executed: Vec<(ActionId, AuditTime)>,
}

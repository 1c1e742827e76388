//! Host error types

use thiserror::Error;
use vouch_core::{CoreError, EntityId, ModuleId, RoleId, ServiceId};
use vouch_store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("Unknown role: {role}")]
    UnknownRole { role: RoleId },

    #[error("Role {role} does not act for {entity}")]
    WrongEntity { role: RoleId, entity: EntityId },

    #[error("Module {module} is not part of service {service}")]
    UnknownModule { module: ModuleId, service: ServiceId },

    #[error("Malformed request: {reason}")]
    Malformed { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl HostError {
    pub fn code(&self) -> &'static str {
        match self {
            HostError::UnknownRole { .. } => "host_unknown_role",
            HostError::WrongEntity { .. } => "host_wrong_entity",
            HostError::UnknownModule { .. } => "host_unknown_module",
            HostError::Malformed { .. } => "host_malformed",
            HostError::Store(err) => err.code(),
            HostError::Core(err) => err.code(),
        }
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

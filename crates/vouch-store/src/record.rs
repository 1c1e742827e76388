//! Persisted audit records and their storage layout.
//!
//! ```text
//! audit/<entity>/<service>/tail              -> AuditTime
//! audit/<entity>/<service>/floor             -> AuditTime (purge floor)
//! audit/<entity>/<service>/log/<time>        -> AuditRecord
//! audit/<entity>/<service>/observed/<role>   -> AuditTime
//! audit/<entity>/<service>/ids/<action>      -> AuditTime
//! ```

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use vouch_core::{serialization, ActionId, AuditTime, EntityId, RoleId, ServiceId, Visibility};

/// One executed action as stored by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub time: AuditTime,
    pub action_id: ActionId,
    /// Encoded action, shipped verbatim in trails
    pub action: Vec<u8>,
    /// What a viewer needs to receive this record
    pub visibility: Visibility,
    /// Wall clock at persist time, for retention
    pub persisted_at_ms: u64,
}

/// The audit log of one (entity, service) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub entity: EntityId,
    pub service: ServiceId,
}

impl StreamKey {
    pub fn new(entity: EntityId, service: ServiceId) -> StoreResult<Self> {
        let name = service.as_str();
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(StoreError::InvalidStream {
                reason: format!("service name {name:?} is not a key segment"),
            });
        }
        Ok(Self { entity, service })
    }

    fn root(&self) -> String {
        format!("audit/{}/{}", self.entity, self.service)
    }

    pub fn tail_key(&self) -> String {
        format!("{}/tail", self.root())
    }

    pub fn floor_key(&self) -> String {
        format!("{}/floor", self.root())
    }

    pub fn log_prefix(&self) -> String {
        format!("{}/log/", self.root())
    }

    pub fn record_key(&self, time: AuditTime) -> String {
        format!("{}{}", self.log_prefix(), time.key_fragment())
    }

    pub fn observed_prefix(&self) -> String {
        format!("{}/observed/", self.root())
    }

    pub fn observed_key(&self, role: RoleId) -> String {
        format!("{}{}", self.observed_prefix(), role)
    }

    pub fn id_key(&self, action: ActionId) -> String {
        format!("{}/ids/{}", self.root(), action)
    }

    /// Parse the time out of a record key under this stream
    pub fn time_of(&self, key: &str) -> Option<AuditTime> {
        key.strip_prefix(&self.log_prefix())?
            .parse::<u64>()
            .ok()
            .map(AuditTime)
    }
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(key: &str, bytes: &[u8]) -> StoreResult<T> {
    serialization::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> StoreResult<Vec<u8>> {
    serialization::to_vec(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

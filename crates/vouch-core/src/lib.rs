#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
#![allow(missing_docs)]
//! # Vouch Core
//!
//! Shared vocabulary for the action synchronization engine:
//!
//! - identifiers and audit positions ([`AuditTime`])
//! - [`Action`] values and the [`ModuleRegistry`] that gives them behaviour
//! - [`RequestAudit`] / [`ResponseAudit`] and the client/host [`protocol`]
//! - the audit [`visibility`] model
//! - effect traits for storage, time and transport, with storage handlers
//! - configuration and error types

pub mod action;
pub mod audit;
pub mod codec;
pub mod config;
pub mod effects;
pub mod errors;
pub mod identifiers;
pub mod module;
pub mod protocol;
pub mod serialization;
pub mod storage;
pub mod time;
pub mod visibility;

pub use action::{Action, ActionSigner, Signature};
pub use audit::{AuditShapeError, RequestAudit, ResponseAudit, TrailEntry};
pub use codec::{ActionCodec, RegistryCodec};
pub use config::{
    StoreConfig, SyncConfig, VouchConfig, DEFAULT_MIRROR_WINDOW, DEFAULT_PURGE_INTERVAL_SECS,
    DEFAULT_RETENTION_SECS,
};
pub use effects::{
    StorageEffects, StorageError, SystemClock, TimeEffects, Transport, TransportError, WriteBatch,
};
pub use errors::{CoreError, CoreResult};
pub use identifiers::{
    ActionId, ClientId, EntityId, ModuleId, RoleBinding, RoleId, ServiceId,
};
pub use module::{ApplyOutcome, DynModule, Module, ModuleRegistry, Transition};
pub use protocol::{
    ExchangeRequest, ExchangeResponse, ModuleSnapshot, Reply, StateQuery, StateReply,
};
pub use storage::{open_storage, FilesystemStorageHandler, MemoryStorageHandler};
pub use time::AuditTime;
pub use visibility::{
    AgentPath, AuditRestrictions, ContextPath, PermissionSet, Viewer, ViewerRestrictions,
    Visibility, VisibilityDenial,
};

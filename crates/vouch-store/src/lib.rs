#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
#![allow(missing_docs)]
//! # Vouch Store - host-side audit log
//!
//! Durable, append-only record of executed actions per (entity, service),
//! answering visibility-filtered range queries.
//!
//! - **Atomic append**: a record and the action's own effect writes commit in
//!   one storage batch
//! - **All-or-nothing visibility**: an entry is either in a trail or absent
//! - **Bounded retention**: records past the retention horizon that every
//!   known role has observed may be purged; the purge floor is retained so
//!   requests from below it are answered as truncated

mod error;
mod log;
mod record;

pub use error::{StoreError, StoreResult};
pub use log::{AuditLogStore, PurgeReport};
pub use record::{AuditRecord, StreamKey};

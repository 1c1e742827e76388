#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
#![allow(missing_docs)]
//! # Vouch Sync - client-side action synchronization
//!
//! Applies actions optimistically, queues them per (role, service), sends
//! them to the host and folds the host's audit trail back into local state.
//!
//! - **Coordinator**: a per-lane gate so at most one exchange per
//!   (role, service) claims a watermark, plus the pending queue
//! - **Reconciler**: replays trail entries; conflicts with pending actions
//!   are resolved by reversing the interfering suffix, applying, redoing
//! - **Full-state fallback**: modules that cannot be replayed are replaced
//!   wholesale with the host's state
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use vouch_core::{ModuleRegistry, MemoryStorageHandler, SyncConfig, Transport, RoleId, EntityId, Action};
//! # use vouch_sync::SyncEngine;
//! # async fn example(registry: Arc<ModuleRegistry>, transport: Arc<dyn Transport>, action: Action) -> vouch_sync::SyncResult<()> {
//! let engine = Arc::new(SyncEngine::new(
//!     registry,
//!     Arc::new(MemoryStorageHandler::new()),
//!     transport,
//!     SyncConfig::default(),
//! ));
//! let role = RoleId::from_name("phone");
//! engine.add_role(role, action.entity);
//! let service = action.service.clone();
//! let ticket = engine.execute(role, action).await?;
//! engine.flush(role, &service).await?;
//! let time = ticket.wait().await?;
//! # let _ = time;
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod engine;
mod error;
mod fullstate;
mod local;
mod reconcile;

pub use coordinator::{EntryState, Lane, PendingEntry, PendingQueue, SuspendGuard, SyncCoordinator};
pub use engine::{FlushReport, PendingAck, PendingView, RoleHandle, SyncEngine};
pub use error::{ActionRejected, SyncError, SyncResult};
pub use fullstate::Replacement;
pub use local::{LocalStore, WatermarkTable};
pub use reconcile::{ReconcileReport, Reconciler};

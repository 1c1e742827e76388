#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
#![allow(missing_docs)]
//! # Vouch Host
//!
//! The authoritative side of synchronization. A [`Host`] executes the
//! methods clients send, persists every executed action to the audit log
//! atomically with its state change, and answers audit requests and
//! full-state queries with what the requesting role may see.
//!
//! [`LoopbackTransport`] connects a client engine to an in-process host.

mod error;
mod host;
mod loopback;

pub use error::{HostError, HostResult};
pub use host::{Host, RoleGrant};
pub use loopback::{Fault, LoopbackTransport};

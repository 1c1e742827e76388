#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(missing_docs)]
//! # Vouch Testkit
//!
//! Fixtures shared by the integration tests of the store, host and sync
//! crates.
//!
//! ```toml
//! [dev-dependencies]
//! vouch-testkit = { workspace = true }
//! ```

pub mod clock;
pub mod fixtures;
pub mod modules;
pub mod signer;
pub mod storage;
pub mod transport;

pub use clock::ManualClock;
pub use fixtures::{owner_viewer, profile, test_registry, HostFixture, PROFILE};
pub use modules::{
    add_contact, counter_action, increment, set, Contact, ContactsModule, ContactsOp,
    CounterModule, CounterOp, CONTACTS, CONTACTS_PERMISSION, COUNTER,
};
pub use signer::Blake3Signer;
pub use storage::FlakyStorage;
pub use transport::ScriptedTransport;

/// Install a fmt subscriber filtered by `RUST_LOG`; safe to call from every test
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

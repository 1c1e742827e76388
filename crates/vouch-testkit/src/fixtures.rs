//! Host fixtures

use crate::clock::ManualClock;
use crate::modules::{ContactsModule, CounterModule, CONTACTS_PERMISSION};
use std::sync::Arc;
use std::time::Duration;
use vouch_core::{
    ActionSigner, ClientId, EntityId, ModuleRegistry, PermissionSet, RoleId, ServiceId, StorageEffects, Viewer,
};
use vouch_host::{Host, LoopbackTransport, RoleGrant};
use vouch_store::AuditLogStore;

/// Service holding the counter and contacts modules
pub const PROFILE: &str = "profile";

pub fn profile() -> ServiceId {
    ServiceId::from(PROFILE)
}

/// Registry with the example modules under [`PROFILE`]
pub fn test_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register(PROFILE, CounterModule::new())
        .register(PROFILE, ContactsModule);
    registry
}

/// Read-write viewer with every example permission
pub fn owner_viewer(role: RoleId) -> Viewer {
    Viewer::owner(
        role,
        ClientId::from_name(&format!("client-of-{role}")),
        PermissionSet::from_names([CONTACTS_PERMISSION]),
    )
}

/// An in-process host with a loopback transport in front of it
pub struct HostFixture {
    pub host: Arc<Host>,
    pub transport: LoopbackTransport,
    pub clock: ManualClock,
    pub storage: Arc<dyn StorageEffects>,
}

impl HostFixture {
    pub fn new() -> Self {
        Self::with_registry(test_registry())
    }

    pub fn with_registry(registry: ModuleRegistry) -> Self {
        Self::build(
            Arc::new(registry),
            Arc::new(vouch_core::MemoryStorageHandler::new()),
            Duration::from_secs(vouch_core::config::DEFAULT_RETENTION_SECS),
        )
    }

    /// Host that only executes methods signed by `verifier`
    pub fn verified(verifier: Arc<dyn ActionSigner>) -> Self {
        Self::assemble(
            Arc::new(test_registry()),
            Arc::new(vouch_core::MemoryStorageHandler::new()),
            Duration::from_secs(vouch_core::config::DEFAULT_RETENTION_SECS),
            Some(verifier),
        )
    }

    pub fn build(
        registry: Arc<ModuleRegistry>,
        storage: Arc<dyn StorageEffects>,
        retention: Duration,
    ) -> Self {
        Self::assemble(registry, storage, retention, None)
    }

    fn assemble(
        registry: Arc<ModuleRegistry>,
        storage: Arc<dyn StorageEffects>,
        retention: Duration,
        verifier: Option<Arc<dyn ActionSigner>>,
    ) -> Self {
        let clock = ManualClock::at(1_000);
        let store = Arc::new(AuditLogStore::new(
            storage.clone(),
            Arc::new(clock.clone()),
            retention,
        ));
        let mut host = Host::new(registry, store);
        if let Some(verifier) = verifier {
            host = host.with_verifier(verifier);
        }
        let host = Arc::new(host);
        Self {
            transport: LoopbackTransport::new(host.clone()),
            host,
            clock,
            storage,
        }
    }

    /// Grant `role` full control of `entity` and return its viewer
    pub fn grant_owner(&self, role: RoleId, entity: EntityId) -> Viewer {
        let viewer = owner_viewer(role);
        self.grant(role, entity, viewer.clone());
        viewer
    }

    pub fn grant(&self, role: RoleId, entity: EntityId, viewer: Viewer) {
        self.host.grant(RoleGrant {
            role,
            entity,
            viewer,
        });
    }
}

impl Default for HostFixture {
    fn default() -> Self {
        Self::new()
    }
}

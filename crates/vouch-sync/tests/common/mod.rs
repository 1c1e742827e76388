//! Shared engine fixtures for the sync integration tests

#![allow(dead_code)]

use std::sync::Arc;
use vouch_core::{
    serialization, Action, AuditTime, EntityId, MemoryStorageHandler, ModuleRegistry, RoleId,
    StorageEffects, SyncConfig, TrailEntry, Transport,
};
use vouch_sync::SyncEngine;
use vouch_testkit::{init_test_tracing, test_registry, HostFixture, COUNTER};

/// Engines in tests flush only when asked
pub fn manual_config() -> SyncConfig {
    SyncConfig {
        auto_flush: false,
        ..SyncConfig::default()
    }
}

pub fn engine_with(
    registry: ModuleRegistry,
    storage: Arc<dyn StorageEffects>,
    transport: Arc<dyn Transport>,
) -> Arc<SyncEngine> {
    init_test_tracing();
    Arc::new(SyncEngine::new(
        Arc::new(registry),
        storage,
        transport,
        manual_config(),
    ))
}

pub fn engine(transport: Arc<dyn Transport>) -> Arc<SyncEngine> {
    engine_with(
        test_registry(),
        Arc::new(MemoryStorageHandler::new()),
        transport,
    )
}

/// A client engine holding one controlled owner role on the fixture's host
pub struct Device {
    pub engine: Arc<SyncEngine>,
    pub role: RoleId,
    pub entity: EntityId,
}

impl Device {
    pub fn join(fixture: &HostFixture, entity: EntityId, name: &str) -> Self {
        let role = RoleId::from_name(name);
        fixture.grant_owner(role, entity);
        let engine = engine(Arc::new(fixture.transport.clone()));
        engine.add_role(role, entity);
        Self {
            engine,
            role,
            entity,
        }
    }

    pub async fn counter(&self) -> i64 {
        counter_of(&self.engine, self.role).await
    }
}

pub async fn counter_of(engine: &SyncEngine, role: RoleId) -> i64 {
    engine
        .typed_state::<i64>(role, &COUNTER.into())
        .await
        .unwrap()
}

pub async fn host_counter(fixture: &HostFixture, entity: EntityId) -> i64 {
    match fixture
        .host
        .module_state(entity, &COUNTER.into())
        .await
        .unwrap()
    {
        Some(bytes) => serialization::from_slice(&bytes).unwrap(),
        None => 0,
    }
}

/// Trail entry carrying `action` at `time`
pub fn trail_entry(time: u64, action: &Action) -> TrailEntry {
    TrailEntry {
        time: AuditTime(time),
        action: serialization::to_vec(action).unwrap(),
    }
}

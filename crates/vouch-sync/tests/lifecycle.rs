//! Restarts, retention truncation and background transmission

mod common;

use common::{counter_of, engine_with, host_counter, manual_config, Device};
use std::sync::Arc;
use std::time::Duration;
use vouch_core::{
    AuditTime, EntityId, MemoryStorageHandler, ModuleId, RoleId, StoreConfig, SyncConfig, VouchConfig,
};
use vouch_sync::SyncEngine;
use vouch_testkit::{increment, profile, test_registry, HostFixture};

#[tokio::test]
async fn watermark_and_state_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = HostFixture::new();
    let entity = EntityId::from_name("alice");
    let role = RoleId::from_name("desktop");
    let service = profile();
    fixture.grant_owner(role, entity);

    let config = VouchConfig {
        sync: manual_config(),
        store: StoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..StoreConfig::default()
        },
    };

    {
        let engine = Arc::new(
            SyncEngine::open(
                &config,
                Arc::new(test_registry()),
                Arc::new(fixture.transport.clone()),
            )
            .await
            .unwrap(),
        );
        engine.add_role(role, entity);
        engine
            .execute(role, increment(entity, &service, 2))
            .await
            .unwrap();
        engine.flush(role, &service).await.unwrap();
        assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime(1));
    }

    let laptop = Device::join(&fixture, entity, "laptop");
    laptop
        .engine
        .execute(laptop.role, increment(entity, &service, 3))
        .await
        .unwrap();
    laptop.engine.flush(laptop.role, &service).await.unwrap();

    let engine = SyncEngine::open(
        &config,
        Arc::new(test_registry()),
        Arc::new(fixture.transport.clone()),
    )
    .await
    .unwrap();
    engine.add_role(role, entity);
    assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime(1));
    assert_eq!(counter_of(&engine, role).await, 2);
    assert_eq!(engine.mirrored_trail(role, &service).await.unwrap().len(), 1);

    let report = engine.refresh(role, &service).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(counter_of(&engine, role).await, 5);
}

#[tokio::test]
async fn unsent_effects_are_discarded_after_restart() {
    let fixture = HostFixture::new();
    let storage = Arc::new(MemoryStorageHandler::new());
    let entity = EntityId::from_name("alice");
    let role = RoleId::from_name("desktop");
    let service = profile();
    fixture.grant_owner(role, entity);

    {
        let engine = engine_with(
            test_registry(),
            storage.clone(),
            Arc::new(fixture.transport.clone()),
        );
        engine.add_role(role, entity);
        engine
            .execute(role, increment(entity, &service, 3))
            .await
            .unwrap();
        assert_eq!(counter_of(&engine, role).await, 3);
        // Gone before the action was ever sent
    }

    let engine = engine_with(
        test_registry(),
        storage,
        Arc::new(fixture.transport.clone()),
    );
    engine.add_role(role, entity);
    assert!(engine.pending(role, &service).await.is_empty());

    let report = engine.refresh(role, &service).await.unwrap();
    assert!(report.suspended.contains(&ModuleId::from(vouch_testkit::COUNTER)));
    assert_eq!(counter_of(&engine, role).await, 0);
    assert_eq!(host_counter(&fixture, entity).await, 0);
}

#[tokio::test]
async fn client_below_purge_floor_reloads() {
    let fixture = HostFixture::build(
        Arc::new(test_registry()),
        Arc::new(MemoryStorageHandler::new()),
        Duration::from_secs(60),
    );
    let entity = EntityId::from_name("alice");
    let service = profile();
    let phone = Device::join(&fixture, entity, "phone");

    for by in 1..=3 {
        phone
            .engine
            .execute(phone.role, increment(entity, &service, by))
            .await
            .unwrap();
    }
    phone.engine.flush(phone.role, &service).await.unwrap();
    // Tell the host the phone holds everything
    phone.engine.refresh(phone.role, &service).await.unwrap();

    fixture.clock.advance(Duration::from_secs(120));
    let purged = fixture.host.store().purge_all().await.unwrap();
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].1.removed, 3);
    assert_eq!(purged[0].1.floor, AuditTime(3));

    let tablet = Device::join(&fixture, entity, "tablet");
    let report = tablet.engine.refresh(tablet.role, &service).await.unwrap();
    assert!(report.reloaded);
    assert_eq!(report.watermark, AuditTime(3));
    assert_eq!(tablet.counter().await, 6);

    // Incremental sync carries on from the reloaded position
    tablet
        .engine
        .execute(tablet.role, increment(entity, &service, 4))
        .await
        .unwrap();
    tablet.engine.flush(tablet.role, &service).await.unwrap();
    phone.engine.refresh(phone.role, &service).await.unwrap();
    assert_eq!(tablet.counter().await, 10);
    assert_eq!(phone.counter().await, 10);
}

#[tokio::test]
async fn unobserved_records_are_kept_past_retention() {
    let fixture = HostFixture::build(
        Arc::new(test_registry()),
        Arc::new(MemoryStorageHandler::new()),
        Duration::from_secs(60),
    );
    let entity = EntityId::from_name("alice");
    let service = profile();
    let phone = Device::join(&fixture, entity, "phone");
    let laptop = Device::join(&fixture, entity, "laptop");

    // Laptop claims T=0 and never comes back
    laptop.engine.refresh(laptop.role, &service).await.unwrap();

    phone
        .engine
        .execute(phone.role, increment(entity, &service, 1))
        .await
        .unwrap();
    phone.engine.flush(phone.role, &service).await.unwrap();
    phone.engine.refresh(phone.role, &service).await.unwrap();

    fixture.clock.advance(Duration::from_secs(120));
    let purged = fixture.host.store().purge_all().await.unwrap();
    assert_eq!(purged[0].1.removed, 0);

    let report = laptop.engine.refresh(laptop.role, &service).await.unwrap();
    assert!(!report.reloaded);
    assert_eq!(laptop.counter().await, 1);
}

#[tokio::test]
async fn auto_flush_delivers_without_explicit_flush() {
    let fixture = HostFixture::new();
    let entity = EntityId::from_name("alice");
    let role = RoleId::from_name("watch");
    let service = profile();
    fixture.grant_owner(role, entity);

    let engine = Arc::new(SyncEngine::new(
        Arc::new(test_registry()),
        Arc::new(MemoryStorageHandler::new()),
        Arc::new(fixture.transport.clone()),
        SyncConfig::default(),
    ));
    engine.add_role(role, entity);

    let ticket = engine
        .execute(role, increment(entity, &service, 9))
        .await
        .unwrap();
    let time = ticket.wait_for(Duration::from_secs(5)).await.unwrap();
    assert_eq!(time, AuditTime(1));
    assert_eq!(host_counter(&fixture, entity).await, 9);
}

#[tokio::test]
async fn detached_refresh_reports_the_pass() {
    let fixture = HostFixture::new();
    let entity = EntityId::from_name("alice");
    let service = profile();
    let phone = Device::join(&fixture, entity, "phone");
    let laptop = Device::join(&fixture, entity, "laptop");

    laptop
        .engine
        .execute(laptop.role, increment(entity, &service, 4))
        .await
        .unwrap();
    laptop.engine.flush(laptop.role, &service).await.unwrap();

    let report = phone
        .engine
        .refresh_detached(phone.role, &service)
        .await
        .unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(phone.counter().await, 4);
}

//! Reconciliation against scripted host answers

mod common;

use assert_matches::assert_matches;
use proptest::prelude::*;
use common::{counter_of, engine, engine_with, trail_entry};
use std::sync::Arc;
use vouch_core::{
    AuditTime, EntityId, ExchangeResponse, ModuleId, ModuleSnapshot, Reply, RequestAudit,
    ResponseAudit, RoleId, StateReply, TrailEntry, serialization,
};
use vouch_sync::{EntryState, SyncError};
use vouch_testkit::{
    increment, profile, set, test_registry, CounterModule, FlakyStorage, ScriptedTransport,
    COUNTER, PROFILE,
};

fn alice() -> (EntityId, RoleId) {
    (EntityId::from_name("alice"), RoleId::from_name("alice-phone"))
}

#[tokio::test]
async fn foreign_set_is_replayed_beneath_pending_increment() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    // Nothing to replay up to T=100
    transport.push_audit(ResponseAudit::empty(AuditTime::ZERO, AuditTime(100)));
    engine.refresh(role, &service).await.unwrap();
    assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime(100));

    let a1 = increment(entity, &service, 1);
    let ticket = engine.execute(role, a1.clone()).await.unwrap();
    assert_eq!(counter_of(&engine, role).await, 1);

    // Another client's Set{0 -> 5} landed at T=101, before a1 reached the host
    let a2 = set(entity, &service, 0, 5);
    let mut audit = ResponseAudit::empty(AuditTime(100), AuditTime(101));
    audit.trail.push(trail_entry(101, &a2));
    transport.push_audit(audit);

    let report = engine.refresh(role, &service).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.conflicts_resolved, 1);
    assert_eq!(report.watermark, AuditTime(101));
    assert_eq!(counter_of(&engine, role).await, 6);

    let requests = transport.requests();
    assert_eq!(requests[1].audit, Some(RequestAudit::since(AuditTime(100))));
    assert_eq!(requests[1].methods.len(), 1);

    // The scripted host never answered a1, so it is queued again
    let pending = engine.pending(role, &service).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_id, a1.id);
    assert_eq!(pending[0].state, EntryState::Queued);
    assert!(pending[0].applied_locally);

    // Now the host executes a1 at T=102
    let mut audit = ResponseAudit::empty(AuditTime(101), AuditTime(102));
    audit.trail.push(trail_entry(102, &a1));
    transport.push_exchange(Ok(ExchangeResponse {
        replies: vec![Reply::Applied {
            action: a1.id,
            time: AuditTime(102),
        }],
        audit: Some(audit),
    }));
    let flushed = engine.flush(role, &service).await.unwrap();
    assert_eq!(flushed.acknowledged, 1);
    assert_eq!(ticket.wait().await.unwrap(), AuditTime(102));
    assert_eq!(counter_of(&engine, role).await, 6);
    assert!(engine.pending(role, &service).await.is_empty());
    assert_eq!(engine.mirrored_trail(role, &service).await.unwrap().len(), 2);
}

fn three_entry_trail(entity: EntityId) -> ResponseAudit {
    let service = profile();
    let mut audit = ResponseAudit::empty(AuditTime::ZERO, AuditTime(3));
    audit.trail = vec![
        trail_entry(1, &increment(entity, &service, 1)),
        trail_entry(2, &increment(entity, &service, 2)),
        trail_entry(3, &set(entity, &service, 3, 10)),
    ];
    audit
}

#[tokio::test]
async fn same_response_twice_is_applied_once() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let audit = three_entry_trail(entity);
    transport.push_audit(audit.clone());
    let first = engine.refresh(role, &service).await.unwrap();
    assert_eq!(first.applied, 3);
    assert_eq!(counter_of(&engine, role).await, 10);

    // A replayed response from below the watermark
    transport.push_audit(audit);
    let second = engine.refresh(role, &service).await.unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(counter_of(&engine, role).await, 10);
    assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime(3));
}

#[tokio::test]
async fn interrupted_pass_resumes_without_double_apply() {
    let transport = ScriptedTransport::new();
    let storage = FlakyStorage::new();
    let engine = engine_with(
        test_registry(),
        Arc::new(storage.clone()),
        Arc::new(transport.clone()),
    );
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    // The first entry commits, the second one fails
    storage.fail_commit(1);
    transport.push_audit(three_entry_trail(entity));
    let err = engine.refresh(role, &service).await.unwrap_err();
    assert_matches!(err, SyncError::Storage(_));
    assert!(err.is_retryable());
    assert_eq!(counter_of(&engine, role).await, 1);
    assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime::ZERO);

    transport.push_audit(three_entry_trail(entity));
    let report = engine.refresh(role, &service).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied, 2);
    assert_eq!(counter_of(&engine, role).await, 10);
    assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime(3));
}

#[tokio::test]
async fn undecodable_entry_aborts_without_moving_watermark() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let mut audit = ResponseAudit::empty(AuditTime::ZERO, AuditTime(2));
    audit.trail = vec![
        trail_entry(1, &increment(entity, &service, 4)),
        TrailEntry {
            time: AuditTime(2),
            action: vec![0xff, 0x00, 0x13],
        },
    ];
    transport.push_audit(audit);

    let err = engine.refresh(role, &service).await.unwrap_err();
    assert_matches!(err, SyncError::TrailEntry { time, .. } if time == AuditTime(2));
    assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime::ZERO);
    // The entry before it was a complete step of its own
    assert_eq!(counter_of(&engine, role).await, 4);
}

#[tokio::test]
async fn entry_for_another_entity_is_refused() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let stranger = EntityId::from_name("mallory");
    let mut audit = ResponseAudit::empty(AuditTime::ZERO, AuditTime(1));
    audit.trail = vec![trail_entry(1, &increment(stranger, &service, 1))];
    transport.push_audit(audit);

    assert_matches!(
        engine.refresh(role, &service).await,
        Err(SyncError::TrailEntry { .. })
    );
    assert_eq!(counter_of(&engine, role).await, 0);
}

#[tokio::test]
async fn trail_starting_past_watermark_is_invalid() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    transport.push_audit(ResponseAudit::empty(AuditTime(7), AuditTime(9)));
    assert_matches!(
        engine.refresh(role, &service).await,
        Err(SyncError::InvalidAudit { .. })
    );
    assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime::ZERO);
}

#[tokio::test]
async fn unreplayable_modules_are_fetched_whole() {
    let likes = ModuleId::from("likes");
    let mut registry = test_registry();
    registry.register(PROFILE, CounterModule::named("likes"));

    let transport = ScriptedTransport::new();
    let engine = engine_with(
        registry,
        Arc::new(vouch_core::MemoryStorageHandler::new()),
        Arc::new(transport.clone()),
    );
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let set_likes = vouch_testkit::counter_action(
        entity,
        &service,
        "likes",
        vouch_testkit::CounterOp::Set { from: 1, to: 2 },
    )
    .unwrap();

    // Neither Set matches the local value 0, and nothing is pending to rebase
    let mut audit = ResponseAudit::empty(AuditTime::ZERO, AuditTime(3));
    audit.trail = vec![
        trail_entry(1, &set(entity, &service, 7, 8)),
        trail_entry(2, &set_likes),
        trail_entry(3, &increment(entity, &service, 1)),
    ];
    transport.push_audit(audit);
    transport.push_state(Ok(StateReply {
        as_of: AuditTime(3),
        snapshots: vec![
            ModuleSnapshot {
                module: COUNTER.into(),
                state: Some(serialization::to_vec(&9i64).unwrap()),
            },
            ModuleSnapshot {
                module: likes.clone(),
                state: Some(serialization::to_vec(&2i64).unwrap()),
            },
        ],
        executed: Vec::new(),
    }));
    transport.push_audit(ResponseAudit::empty(AuditTime(3), AuditTime(3)));

    let report = engine.refresh(role, &service).await.unwrap();
    assert_eq!(report.suspended.len(), 2);
    assert!(report.rounds <= report.suspended.len() + 1);
    assert_eq!(report.watermark, AuditTime(3));
    assert_eq!(counter_of(&engine, role).await, 9);
    assert_eq!(engine.typed_state::<i64>(role, &likes).await.unwrap(), 2);

    let queries = transport.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].modules, vec![ModuleId::from(COUNTER), likes]);
}

#[tokio::test]
async fn pending_actions_are_redone_on_fetched_state() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let mine = increment(entity, &service, 5);
    engine.execute(role, mine.clone()).await.unwrap();

    let mut audit = ResponseAudit::empty(AuditTime::ZERO, AuditTime(1));
    audit.trail = vec![trail_entry(1, &set(entity, &service, 7, 8))];
    transport.push_audit(audit);
    transport.push_state(Ok(StateReply {
        as_of: AuditTime(1),
        snapshots: vec![ModuleSnapshot {
            module: COUNTER.into(),
            state: Some(serialization::to_vec(&8i64).unwrap()),
        }],
        executed: Vec::new(),
    }));
    transport.push_audit(ResponseAudit::empty(AuditTime(1), AuditTime(1)));

    let report = engine.refresh(role, &service).await.unwrap();
    assert_eq!(report.suspended.len(), 1);
    assert_eq!(counter_of(&engine, role).await, 13);

    // The query asks about the unanswered pending action
    assert_eq!(transport.queries()[0].pending, vec![mine.id]);
    let pending = engine.pending(role, &service).await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].applied_locally);
}

#[tokio::test]
async fn failed_state_fetch_is_retried_by_next_pass() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let mut audit = ResponseAudit::empty(AuditTime::ZERO, AuditTime(1));
    audit.trail = vec![trail_entry(1, &set(entity, &service, 7, 8))];
    transport.push_audit(audit);
    // No state reply scripted: the query fails
    assert_matches!(
        engine.refresh(role, &service).await,
        Err(SyncError::Transport(_))
    );

    // The next pass has nothing new in the trail but still fetches the module
    transport.push_audit(ResponseAudit::empty(AuditTime(1), AuditTime(1)));
    transport.push_state(Ok(StateReply {
        as_of: AuditTime(1),
        snapshots: vec![ModuleSnapshot {
            module: COUNTER.into(),
            state: Some(serialization::to_vec(&8i64).unwrap()),
        }],
        executed: Vec::new(),
    }));
    transport.push_audit(ResponseAudit::empty(AuditTime(1), AuditTime(1)));

    let report = engine.refresh(role, &service).await.unwrap();
    assert!(report.suspended.contains(&ModuleId::from(COUNTER)));
    assert_eq!(counter_of(&engine, role).await, 8);
}

#[tokio::test]
async fn module_suspended_before_restart_is_fetched_after_it() {
    let storage = Arc::new(vouch_core::MemoryStorageHandler::new());
    let (entity, role) = alice();
    let service = profile();

    let before = ScriptedTransport::new();
    {
        let engine = engine_with(test_registry(), storage.clone(), Arc::new(before.clone()));
        engine.add_role(role, entity);
        let mut audit = ResponseAudit::empty(AuditTime::ZERO, AuditTime(1));
        audit.trail = vec![trail_entry(1, &set(entity, &service, 7, 9))];
        before.push_audit(audit);
        // No state reply scripted: the query fails and the process goes away
        assert_matches!(
            engine.refresh(role, &service).await,
            Err(SyncError::Transport(_))
        );
        assert_eq!(engine.watermark(role, &service).await.unwrap(), AuditTime(1));
    }

    let after = ScriptedTransport::new();
    let engine = engine_with(test_registry(), storage, Arc::new(after.clone()));
    engine.add_role(role, entity);
    after.push_audit(ResponseAudit::empty(AuditTime(1), AuditTime(1)));
    after.push_state(Ok(StateReply {
        as_of: AuditTime(1),
        snapshots: vec![ModuleSnapshot {
            module: COUNTER.into(),
            state: Some(serialization::to_vec(&9i64).unwrap()),
        }],
        executed: Vec::new(),
    }));
    after.push_audit(ResponseAudit::empty(AuditTime(1), AuditTime(1)));

    let report = engine.refresh(role, &service).await.unwrap();
    assert!(report.suspended.contains(&ModuleId::from(COUNTER)));
    assert_eq!(after.queries().len(), 1);
    assert_eq!(counter_of(&engine, role).await, 9);

    // Replaced, so the next pass has nothing left to fetch
    after.push_audit(ResponseAudit::empty(AuditTime(1), AuditTime(1)));
    let report = engine.refresh(role, &service).await.unwrap();
    assert!(report.suspended.is_empty());
    assert_eq!(after.queries().len(), 1);
}

#[tokio::test]
async fn mirror_keeps_only_the_configured_window() {
    let transport = ScriptedTransport::new();
    let engine = Arc::new(vouch_sync::SyncEngine::new(
        Arc::new(test_registry()),
        Arc::new(vouch_core::MemoryStorageHandler::new()),
        Arc::new(transport.clone()),
        vouch_core::SyncConfig {
            auto_flush: false,
            mirror_window: 2,
            ..vouch_core::SyncConfig::default()
        },
    ));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    for time in 1..=3u64 {
        let mut audit = ResponseAudit::empty(AuditTime(time - 1), AuditTime(time));
        audit.trail = vec![trail_entry(time, &increment(entity, &service, 1))];
        transport.push_audit(audit);
        engine.refresh(role, &service).await.unwrap();
    }

    let kept: Vec<u64> = engine
        .mirrored_trail(role, &service)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.time.value())
        .collect();
    assert_eq!(kept, vec![2, 3]);
    assert_eq!(counter_of(&engine, role).await, 3);
}

#[tokio::test]
async fn round_limit_bounds_recursive_reconciliation() {
    let transport = ScriptedTransport::new();
    let registry = test_registry();
    let engine = Arc::new(vouch_sync::SyncEngine::new(
        Arc::new(registry),
        Arc::new(vouch_core::MemoryStorageHandler::new()),
        Arc::new(transport.clone()),
        vouch_core::SyncConfig {
            auto_flush: false,
            max_reconcile_rounds: 1,
            ..vouch_core::SyncConfig::default()
        },
    ));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let mut audit = ResponseAudit::empty(AuditTime::ZERO, AuditTime(1));
    audit.trail = vec![trail_entry(1, &set(entity, &service, 7, 8))];
    transport.push_audit(audit);
    transport.push_state(Ok(StateReply {
        as_of: AuditTime(1),
        snapshots: vec![ModuleSnapshot {
            module: COUNTER.into(),
            state: Some(serialization::to_vec(&8i64).unwrap()),
        }],
        executed: Vec::new(),
    }));
    transport.push_audit(ResponseAudit::empty(AuditTime(1), AuditTime(1)));

    assert_matches!(
        engine.refresh(role, &service).await,
        Err(SyncError::RoundsExhausted { rounds: 1 })
    );
}

#[tokio::test]
async fn busy_gate_sends_methods_without_a_claim() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let action = increment(entity, &service, 2);
    let ticket = engine.execute(role, action.clone()).await.unwrap();

    let held = engine.coordinator().suspend(role, &service).unwrap();
    transport.push_exchange(Ok(ExchangeResponse {
        replies: vec![Reply::Applied {
            action: action.id,
            time: AuditTime(1),
        }],
        audit: None,
    }));
    let flushing = {
        let engine = engine.clone();
        let service = service.clone();
        tokio::spawn(async move { engine.flush(role, &service).await })
    };
    while transport.requests().is_empty() {
        tokio::task::yield_now().await;
    }
    // Sent, but the reply is settled only once the gate is free
    assert_eq!(transport.requests()[0].audit, None);
    assert_eq!(
        engine.pending(role, &service).await[0].state,
        EntryState::InFlight
    );
    engine.coordinator().resume(held);

    let report = flushing.await.unwrap().unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.acknowledged, 1);
    assert!(report.reconcile.is_none());
    assert_eq!(ticket.wait().await.unwrap(), AuditTime(1));

    // Acknowledged but not yet folded in
    let pending = engine.pending(role, &service).await;
    assert_eq!(pending[0].state, EntryState::Acknowledged(AuditTime(1)));
}

#[tokio::test]
async fn rejection_sent_without_gate_settles_after_holder() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let refused = increment(entity, &service, 4);
    let ticket = engine.execute(role, refused.clone()).await.unwrap();
    assert_eq!(counter_of(&engine, role).await, 4);

    // Another exchange of the lane holds the gate while this flush is answered
    let held = engine.coordinator().suspend(role, &service).unwrap();
    transport.push_exchange(Ok(ExchangeResponse {
        replies: vec![Reply::Rejected {
            action: refused.id,
            reason: "precondition".to_string(),
        }],
        audit: None,
    }));
    let flushing = {
        let engine = engine.clone();
        let service = service.clone();
        tokio::spawn(async move { engine.flush(role, &service).await })
    };
    while transport.requests().is_empty() {
        tokio::task::yield_now().await;
    }
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    // The queue and local state are untouched while the holder runs
    assert_eq!(counter_of(&engine, role).await, 4);
    assert_eq!(engine.pending(role, &service).await.len(), 1);

    engine.coordinator().resume(held);
    let report = flushing.await.unwrap().unwrap();
    assert_eq!(report.rejected.len(), 1);
    assert_matches!(ticket.wait().await, Err(SyncError::Rejected(_)));
    assert_eq!(counter_of(&engine, role).await, 0);
    assert!(engine.pending(role, &service).await.is_empty());
}

#[tokio::test]
async fn host_omitting_requested_audit_is_an_error() {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    engine.add_role(role, entity);

    transport.push_exchange(Ok(ExchangeResponse {
        replies: Vec::new(),
        audit: None,
    }));
    assert_matches!(
        engine.refresh(role, &profile()).await,
        Err(SyncError::InvalidAudit { .. })
    );
}

/// Each window is (how far below the watermark it starts, how far past its
/// start it ends)
async fn replay_windows(windows: Vec<(u64, u64)>) -> Vec<(AuditTime, AuditTime)> {
    let transport = ScriptedTransport::new();
    let engine = engine(Arc::new(transport.clone()));
    let (entity, role) = alice();
    let service = profile();
    engine.add_role(role, entity);

    let mut observed = Vec::new();
    for (back, span) in windows {
        let before = engine.watermark(role, &service).await.unwrap();
        let last = AuditTime(before.value().saturating_sub(back));
        transport.push_audit(ResponseAudit::empty(last, AuditTime(last.value() + span)));
        let report = engine.refresh(role, &service).await.unwrap();
        observed.push((before, report.watermark));
    }
    observed
}

proptest! {
    #[test]
    fn watermark_is_monotonic(windows in proptest::collection::vec((0u64..5, 0u64..5), 1..16)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let observed = runtime.block_on(replay_windows(windows.clone()));
        for ((before, after), (back, span)) in observed.into_iter().zip(windows) {
            let this_time = before.value().saturating_sub(back) + span;
            prop_assert!(after >= before);
            prop_assert_eq!(after.value(), before.value().max(this_time));
        }
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the sync protocol.
//!
//! Each scenario runs against both `MemoryStore` and a WAL-mode
//! `SqliteStore` in a temp directory.
//!
//! # Test Organization
//! - `protocol_*` - full sync rounds between several clients
//! - `conflict_*` - detection and resolution end to end
//! - `delta_*` - paginated delta reads
//! - `fanout_*` - subscriptions and notifications
//! - `sqlite_*` - persistence across reopen

mod common;

use common::{sync_request, task_update, ts, TestEngine, T0};
use offline_sync_engine::{
    DeltaRequest, DomainChange, EngineConfig, NoOpApplier, Operation, ResolutionStrategy,
    ResolveConflictRequest, SqliteStore, SyncEngine, SyncStore,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

macro_rules! on_both_stores {
    ($scenario:ident, $memory:ident, $sqlite:ident) => {
        #[tokio::test]
        async fn $memory() {
            $scenario(TestEngine::memory()).await;
        }

        #[tokio::test]
        async fn $sqlite() {
            $scenario(TestEngine::sqlite().await).await;
        }
    };
}

// =============================================================================
// Protocol
// =============================================================================

/// Two clients editing different entities see each other's changes.
async fn no_lost_updates(engine: TestEngine) {
    let c = &engine.coordinator;

    let a = c
        .process_sync_request(sync_request(
            "a",
            None,
            vec![task_update("t-1", T0 - 100, "a1"), task_update("t-2", T0 - 90, "a2")],
        ))
        .await
        .unwrap();
    assert_eq!(a.statistics.accepted, 2);

    engine.clock.advance(Duration::from_secs(1));
    let b = c
        .process_sync_request(sync_request("b", None, vec![task_update("t-3", T0 - 50, "b3")]))
        .await
        .unwrap();
    assert_eq!(b.statistics.accepted, 1);
    let seen_by_b: BTreeSet<_> = b.server_changes.iter().map(|r| r.entity_id.clone()).collect();
    assert_eq!(seen_by_b, BTreeSet::from(["t-1".to_string(), "t-2".to_string()]));

    engine.clock.advance(Duration::from_secs(1));
    let a2 = c
        .process_sync_request(sync_request("a", Some(a.server_timestamp), vec![]))
        .await
        .unwrap();
    let seen_by_a: Vec<_> = a2.server_changes.iter().map(|r| r.entity_id.as_str()).collect();
    assert_eq!(seen_by_a, vec!["t-3"]);

    // every accepted change reached the domain exactly once
    assert_eq!(engine.applier.applied().await.len(), 3);
    assert_eq!(engine.applier.entity("task", "t-3").await, Some(b"b3".to_vec()));
}

on_both_stores!(no_lost_updates, protocol_no_lost_updates_memory, protocol_no_lost_updates_sqlite);

/// Checkpoints advance; a second round with the new checkpoint is quiet.
async fn checkpoint_advances(engine: TestEngine) {
    let c = &engine.coordinator;
    c.process_sync_request(sync_request("b", None, vec![task_update("t-1", T0 - 10, "x")]))
        .await
        .unwrap();

    engine.clock.advance(Duration::from_secs(1));
    let first = c.process_sync_request(sync_request("a", None, vec![])).await.unwrap();
    assert_eq!(first.server_changes.len(), 1);
    assert_eq!(first.server_timestamp, ts(T0 + 1000));

    engine.clock.advance(Duration::from_secs(1));
    let second = c
        .process_sync_request(sync_request("a", Some(first.server_timestamp), vec![]))
        .await
        .unwrap();
    assert!(second.server_changes.is_empty());

    let client = engine.store.get_client("a").await.unwrap().unwrap();
    assert_eq!(client.last_sync_at, Some(ts(T0 + 2000)));
    assert_eq!(client.descriptor, "a device");
}

on_both_stores!(checkpoint_advances, protocol_checkpoint_advances_memory, protocol_checkpoint_advances_sqlite);

/// A change the processor commits after a retry still reaches clients whose
/// checkpoints moved past its first submission.
async fn late_retry_redelivered(engine: TestEngine) {
    let c = &engine.coordinator;
    engine.applier.fail_next(1);
    let a = c
        .process_sync_request(sync_request("a", None, vec![task_update("t-1", T0 - 10, "x")]))
        .await
        .unwrap();
    let change_id = a.errors[0].queued_change_id.clone().unwrap();

    engine.clock.advance(Duration::from_secs(1));
    let b1 = c.process_sync_request(sync_request("b", None, vec![])).await.unwrap();
    assert!(b1.server_changes.is_empty());
    assert_eq!(b1.server_timestamp, ts(T0 + 1000));

    // requeue, then apply once the backoff has elapsed
    engine.processor.run_pass().await;
    engine.clock.advance(Duration::from_secs(1));
    let report = engine.processor.run_pass().await;
    assert_eq!(report.applied, 1);

    let record = engine.store.get_change(&change_id).await.unwrap().unwrap();
    assert!(record.is_committed());
    assert_eq!(record.created_at, ts(T0 + 2000));

    engine.clock.advance(Duration::from_secs(1));
    let b2 = c
        .process_sync_request(sync_request("b", Some(b1.server_timestamp), vec![]))
        .await
        .unwrap();
    let seen: Vec<_> = b2.server_changes.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(seen, vec![change_id.as_str()]);
}

on_both_stores!(late_retry_redelivered, protocol_late_retry_redelivered_memory, protocol_late_retry_redelivered_sqlite);

/// Partial failure: a validation rejection does not stop its siblings.
async fn partial_failure(engine: TestEngine) {
    engine.applier.reject_entity("t-bad").await;
    let response = engine
        .coordinator
        .process_sync_request(sync_request(
            "a",
            None,
            vec![
                task_update("t-1", T0 - 10, "ok"),
                task_update("t-bad", T0 - 10, "nope"),
                task_update("t-2", T0 - 10, "ok"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.statistics.total_changes, 3);
    assert_eq!(response.statistics.accepted, 2);
    assert_eq!(response.errors.len(), 1);
    assert_eq!(response.errors[0].index, 1);
    assert!(!response.errors[0].retryable);
}

on_both_stores!(partial_failure, protocol_partial_failure_memory, protocol_partial_failure_sqlite);

// =============================================================================
// Conflicts
// =============================================================================

/// A and B both edit task X; B lands first with the later timestamp.
async fn example_scenario(engine: TestEngine) {
    let c = &engine.coordinator;
    let t1 = T0 + 100;
    let t2 = T0 + 200;

    let a0 = c.process_sync_request(sync_request("a", None, vec![])).await.unwrap();

    engine.clock.advance(Duration::from_secs(1));
    let b = c
        .process_sync_request(sync_request("b", None, vec![task_update("x", t2, "from-b")]))
        .await
        .unwrap();
    assert_eq!(b.statistics.accepted, 1);

    engine.clock.advance(Duration::from_secs(1));
    let a = c
        .process_sync_request(sync_request(
            "a",
            Some(a0.server_timestamp),
            vec![task_update("x", t1, "from-a")],
        ))
        .await
        .unwrap();
    assert_eq!(a.statistics.conflicts, 1);
    assert_eq!(a.statistics.accepted, 0);
    let conflict = &a.conflicts[0];
    assert_eq!(conflict.recommended_strategy, ResolutionStrategy::LastWriterWins);
    // a also learns about b's write in the same round
    assert_eq!(a.server_changes.len(), 1);

    // no silent overwrite
    assert_eq!(engine.applier.entity("task", "x").await, Some(b"from-b".to_vec()));
    assert_eq!(c.get_pending_conflicts("user-1", None).await.unwrap().len(), 1);

    let resolved = c
        .resolve_conflict(ResolveConflictRequest {
            conflict_id: conflict.id.clone(),
            user_id: "user-1".into(),
            strategy: conflict.recommended_strategy,
            resolved_data: None,
        })
        .await
        .unwrap();
    assert_eq!(resolved.resolution.unwrap().resolved_data, b"from-b");
    assert_eq!(engine.applier.entity("task", "x").await, Some(b"from-b".to_vec()));
    assert!(c.get_pending_conflicts("user-1", None).await.unwrap().is_empty());
}

on_both_stores!(example_scenario, conflict_example_scenario_memory, conflict_example_scenario_sqlite);

/// ClientWins pushes the client's data through the applier and out to others.
async fn client_wins_redelivers(engine: TestEngine) {
    let c = &engine.coordinator;
    c.process_sync_request(sync_request("b", None, vec![task_update("x", T0 + 200, "from-b")]))
        .await
        .unwrap();
    engine.clock.advance(Duration::from_secs(1));
    let a = c
        .process_sync_request(sync_request("a", None, vec![task_update("x", T0 + 100, "from-a")]))
        .await
        .unwrap();
    let conflict = a.conflicts[0].clone();

    engine.clock.advance(Duration::from_secs(1));
    let b_checkpoint = ts(T0 + 1500);
    c.resolve_conflict(ResolveConflictRequest {
        conflict_id: conflict.id,
        user_id: "user-1".into(),
        strategy: ResolutionStrategy::ClientWins,
        resolved_data: None,
    })
    .await
    .unwrap();
    assert_eq!(engine.applier.entity("task", "x").await, Some(b"from-a".to_vec()));

    engine.clock.advance(Duration::from_secs(1));
    let b = c
        .process_sync_request(sync_request("b", Some(b_checkpoint), vec![]))
        .await
        .unwrap();
    assert_eq!(b.server_changes.len(), 1);
    assert_eq!(b.server_changes[0].data, b"from-a");
}

on_both_stores!(client_wins_redelivers, conflict_client_wins_memory, conflict_client_wins_sqlite);

/// Auto-resolution applies the per-entity strategy once enabled.
async fn auto_resolution(engine: TestEngine) {
    let c = &engine.coordinator;
    c.process_sync_request(sync_request("b", None, vec![task_update("x", T0 + 200, "from-b")]))
        .await
        .unwrap();
    engine.clock.advance(Duration::from_secs(1));
    c.process_sync_request(sync_request("a", None, vec![task_update("x", T0 + 100, "from-a")]))
        .await
        .unwrap();

    let mut config = c.get_sync_configuration("user-1").await.unwrap();
    config.auto_resolve_conflicts = true;
    config.entity_overrides.insert(
        "task".into(),
        offline_sync_engine::EntityTypeSettings {
            default_strategy: Some(ResolutionStrategy::ClientWins),
            ..Default::default()
        },
    );
    c.update_sync_configuration(config).await.unwrap();

    engine.clock.advance(Duration::from_secs(1));
    let resolved = c.auto_resolve_conflicts("a", "user-1").await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(engine.applier.entity("task", "x").await, Some(b"from-a".to_vec()));
}

on_both_stores!(auto_resolution, conflict_auto_resolution_memory, conflict_auto_resolution_sqlite);

// =============================================================================
// Delta
// =============================================================================

/// Paging with the continuation token yields every change exactly once.
async fn delta_pagination(engine: TestEngine) {
    let c = &engine.coordinator;
    for i in 0..7 {
        c.create_sync_item(DomainChange {
            entity_type: "project".into(),
            entity_id: format!("p-{i}"),
            operation: Operation::Create,
            data: format!("{{\"n\":{i}}}").into_bytes(),
            user_id: "user-1".into(),
        })
        .await
        .unwrap();
        // pairs share a millisecond to exercise the id tiebreak
        if i % 2 == 1 {
            engine.clock.advance(Duration::from_millis(5));
        }
    }

    let mut seen = Vec::new();
    let mut token = None;
    let mut pages = 0;
    loop {
        let page = c
            .get_delta_changes(&DeltaRequest {
                entity_type: "project".into(),
                user_id: Some("user-1".into()),
                page_size: Some(3),
                continuation_token: token.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        pages += 1;
        seen.extend(page.changes.iter().map(|r| r.entity_id.clone()));
        if !page.has_more_data {
            break;
        }
        token = page.continuation_token;
    }

    assert_eq!(pages, 3);
    let unique: BTreeSet<_> = seen.iter().cloned().collect();
    assert_eq!(seen.len(), 7);
    assert_eq!(unique.len(), 7);
}

on_both_stores!(delta_pagination, delta_pagination_memory, delta_pagination_sqlite);

// =============================================================================
// Fan-out
// =============================================================================

async fn fanout_respects_subscriptions(engine: TestEngine) {
    let c = &engine.coordinator;
    for client in ["a", "b", "c"] {
        c.ensure_client_exists(client, "user-1", None).await.unwrap();
    }
    c.subscribe_to_entity_changes("b", "user-1", &["task".to_string()])
        .await
        .unwrap();
    c.subscribe_to_entity_changes("c", "user-1", &["project".to_string()])
        .await
        .unwrap();

    c.process_sync_request(sync_request("a", None, vec![task_update("t-1", T0 - 10, "x")]))
        .await
        .unwrap();

    assert_eq!(c.get_pending_notifications("b", "user-1", 10).await.unwrap().len(), 1);
    assert!(c.get_pending_notifications("c", "user-1", 10).await.unwrap().is_empty());
    // a originated the change and has no subscription
    assert!(c.get_pending_notifications("a", "user-1", 10).await.unwrap().is_empty());
}

on_both_stores!(fanout_respects_subscriptions, fanout_subscriptions_memory, fanout_subscriptions_sqlite);

// =============================================================================
// Status
// =============================================================================

async fn status_reports_failures(engine: TestEngine) {
    let c = &engine.coordinator;
    engine.applier.fail_next(1);
    let response = c
        .process_sync_request(sync_request("a", None, vec![task_update("t-1", T0 - 10, "x")]))
        .await
        .unwrap();
    assert!(response.errors[0].queued_change_id.is_some());

    let status = c.get_sync_status("a", "user-1").await.unwrap();
    assert!(!status.is_healthy);
    assert_eq!(status.failed_items, 1);
    assert!(status.health_issues.iter().any(|i| i.contains("awaiting retry")));

    // the processor picks it up once the backoff elapses
    engine.processor.run_pass().await;
    engine.clock.advance(Duration::from_secs(5));
    let report = engine.processor.run_pass().await;
    assert_eq!(report.applied, 1);

    let status = c.get_sync_status("a", "user-1").await.unwrap();
    assert!(status.is_healthy);
    assert!(status.last_completed_at.is_some());
}

on_both_stores!(status_reports_failures, status_reports_failures_memory, status_reports_failures_sqlite);

// =============================================================================
// SQLite persistence
// =============================================================================

#[tokio::test]
async fn sqlite_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");

    let mut config = EngineConfig::for_testing();
    config.store.sqlite_path = path.to_string_lossy().to_string();

    let mut engine = SyncEngine::open(config.clone(), Arc::new(NoOpApplier)).await.unwrap();
    let response = engine
        .coordinator()
        .process_sync_request(sync_request("a", None, vec![task_update("t-1", T0, "x")]))
        .await
        .unwrap();
    let change_id = response.accepted_change_ids[0].clone();
    engine.shutdown().await;

    let store = SqliteStore::open(&path, true).await.unwrap();
    let record = store.get_change(&change_id).await.unwrap().unwrap();
    assert!(record.is_committed());
    assert!(store.get_client("a").await.unwrap().is_some());
    store.close().await;
}

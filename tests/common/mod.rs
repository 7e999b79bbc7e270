// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A recording [`MockApplier`] with scriptable failures
//! - Engine/coordinator builders over `MemoryStore` and `SqliteStore`
//! - Request helpers

pub mod mock_applier;

pub use mock_applier::*;

use offline_sync_engine::{
    ApplierCircuit, BackgroundProcessor, CircuitConfig, EngineConfig, LocalChange, ManualClock,
    MemoryStore, Operation, SqliteStore, SyncCoordinator, SyncRequest, SyncStore,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tempfile::TempDir;

/// Fixed starting point for manual clocks: 2023-11-14T22:13:20Z.
pub const T0: i64 = 1_700_000_000_000;

pub fn ts(ms: i64) -> DateTime<Utc> {
    offline_sync_engine::clock::from_millis(ms).unwrap()
}

/// Coordinator and processor sharing one store, applier, circuit and clock.
pub struct TestEngine {
    pub store: Arc<dyn SyncStore>,
    pub applier: Arc<MockApplier>,
    pub clock: Arc<ManualClock>,
    pub circuit: Arc<ApplierCircuit>,
    pub coordinator: SyncCoordinator,
    pub processor: BackgroundProcessor,
    /// Keeps the SQLite file alive for the test's duration.
    #[allow(dead_code)]
    pub dir: Option<TempDir>,
}

impl TestEngine {
    pub fn memory() -> Self {
        Self::build(
            Arc::new(MemoryStore::new()),
            None,
            EngineConfig::for_testing(),
            CircuitConfig::default(),
        )
    }

    #[allow(dead_code)]
    pub fn memory_with(config: EngineConfig, circuit: CircuitConfig) -> Self {
        Self::build(Arc::new(MemoryStore::new()), None, config, circuit)
    }

    #[allow(dead_code)]
    pub async fn sqlite() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let store = SqliteStore::open(&path, true).await.unwrap();
        Self::build(
            Arc::new(store),
            Some(dir),
            EngineConfig::for_testing(),
            CircuitConfig::default(),
        )
    }

    fn build(
        store: Arc<dyn SyncStore>,
        dir: Option<TempDir>,
        config: EngineConfig,
        circuit: CircuitConfig,
    ) -> Self {
        let applier = Arc::new(MockApplier::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let circuit = Arc::new(ApplierCircuit::new(circuit));
        let config = Arc::new(config);
        let coordinator = SyncCoordinator::new(
            Arc::clone(&store),
            applier.clone(),
            Arc::clone(&circuit),
            clock.clone(),
            Arc::clone(&config),
        );
        let processor = BackgroundProcessor::with_horizon(
            Arc::clone(&store),
            applier.clone(),
            Arc::clone(&circuit),
            clock.clone(),
            config,
            Arc::clone(coordinator.horizon()),
        );
        Self {
            store,
            applier,
            clock,
            circuit,
            coordinator,
            processor,
            dir,
        }
    }
}

/// A task update made on a client at `at_ms`.
pub fn task_update(entity_id: &str, at_ms: i64, data: &str) -> LocalChange {
    LocalChange {
        entity_type: "task".into(),
        entity_id: entity_id.into(),
        operation: Operation::Update,
        data: data.as_bytes().to_vec(),
        timestamp: ts(at_ms),
    }
}

pub fn sync_request(
    client_id: &str,
    last_sync: Option<DateTime<Utc>>,
    changes: Vec<LocalChange>,
) -> SyncRequest {
    SyncRequest {
        client_id: client_id.into(),
        user_id: "user-1".into(),
        last_sync_timestamp: last_sync,
        local_changes: changes,
        client_descriptor: Some(format!("{client_id} device")),
    }
}

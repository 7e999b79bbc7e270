// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine assembly.
//!
//! [`SyncEngine`] wires one store, one applier, one clock and one applier
//! circuit into a [`SyncCoordinator`] and a [`BackgroundProcessor`] that
//! share them.

use std::sync::Arc;
use tracing::info;

use crate::applier::EntityApplier;
use crate::circuit_breaker::ApplierCircuit;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::coordinator::SyncCoordinator;
use crate::error::Result;
use crate::processor::{BackgroundProcessor, ProcessorState};
use crate::store::{MemoryStore, SqliteStore, SyncStore};

/// The assembled offline-sync engine.
pub struct SyncEngine {
    config: Arc<EngineConfig>,
    coordinator: Arc<SyncCoordinator>,
    processor: BackgroundProcessor,
    /// Closed on shutdown when the engine opened it.
    sqlite: Option<Arc<SqliteStore>>,
}

impl SyncEngine {
    /// Assemble an engine over caller-supplied parts.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SyncStore>,
        applier: Arc<dyn EntityApplier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let circuit = Arc::new(ApplierCircuit::new(config.circuit.circuit_config()));

        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&applier),
            Arc::clone(&circuit),
            Arc::clone(&clock),
            Arc::clone(&config),
        ));
        let processor = BackgroundProcessor::with_horizon(
            store,
            applier,
            circuit,
            clock,
            Arc::clone(&config),
            Arc::clone(coordinator.horizon()),
        );

        Ok(Self {
            config,
            coordinator,
            processor,
            sqlite: None,
        })
    }

    /// Open the SQLite store named in `config.store` and use the system clock.
    pub async fn open(config: EngineConfig, applier: Arc<dyn EntityApplier>) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.store.sqlite_path, config.store.wal_mode).await?);
        info!(path = %store.path(), "Sync engine store opened");
        let mut engine = Self::new(config, store.clone(), applier, Arc::new(SystemClock))?;
        engine.sqlite = Some(store);
        Ok(engine)
    }

    /// Engine over a fresh [`MemoryStore`] and the system clock.
    pub fn in_memory(config: EngineConfig, applier: Arc<dyn EntityApplier>) -> Result<Self> {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            applier,
            Arc::new(SystemClock),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Request-serving API. Cheap to clone out and share across tasks.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn processor(&self) -> &BackgroundProcessor {
        &self.processor
    }

    pub fn processor_state(&self) -> ProcessorState {
        self.processor.state()
    }

    /// Start the background processor.
    pub fn start(&mut self) -> Result<()> {
        self.processor.start()
    }

    /// Stop the processor, then checkpoint and close an owned SQLite store.
    pub async fn shutdown(&mut self) {
        self.processor.shutdown().await;
        if let Some(store) = self.sqlite.take() {
            store.close().await;
        }
        info!("Sync engine stopped");
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Offline Sync Engine
//!
//! Reconciles changes made by disconnected clients with shared server state,
//! surfaces conflicting edits, and redelivers committed changes to the other
//! clients of the same user.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              SyncEngine                                   │
//! │                                                                           │
//! │  clients ──► ┌─────────────────┐    ┌──────────────┐    ┌─────────────┐   │
//! │              │ SyncCoordinator │───►│ConflictDetect│    │ DeltaFeed   │   │
//! │              │ (per request)   │    │ + Resolver   │    │ (keyset)    │   │
//! │              └─────────────────┘    └──────────────┘    └─────────────┘   │
//! │                 │          │                                  ▲           │
//! │                 ▼          ▼                                  │           │
//! │  ┌──────────────────┐  ┌────────────────┐   ┌──────────────────────────┐  │
//! │  │ ApplierCircuit   │  │ ClientRegistry │   │ SyncStore                │  │
//! │  │ → EntityApplier  │  │ (fan-out)      │──►│ (Memory / SQLite)        │  │
//! │  └──────────────────┘  └────────────────┘   └──────────────────────────┘  │
//! │                 ▲                                     ▲                   │
//! │                 │       ┌───────────────────────┐     │                   │
//! │                 └───────│ BackgroundProcessor   │─────┘                   │
//! │                         │ reclaim/drain/retry/  │                         │
//! │                         │ cleanup               │                         │
//! │                         └───────────────────────┘                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Paths
//!
//! 1. **Request path**: [`SyncCoordinator::process_sync_request`] validates,
//!    detects conflicts, applies through the domain applier and returns the
//!    server changes the client has not seen.
//! 2. **Background path**: [`BackgroundProcessor`] retries failed applies with
//!    exponential backoff, dead-letters what exhausts its retries, reclaims
//!    stalled work and enforces retention.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use offline_sync_engine::{EngineConfig, NoOpApplier, SyncEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> offline_sync_engine::Result<()> {
//!     let mut engine = SyncEngine::open(EngineConfig::default(), Arc::new(NoOpApplier)).await?;
//!     engine.start()?;
//!
//!     // serve sync requests through engine.coordinator()
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod delta;
pub mod engine;
pub mod error;
pub mod horizon;
pub mod metrics;
pub mod model;
pub mod processor;
pub mod registry;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use applier::{ApplyError, ApplyFuture, EntityApplier, NoOpApplier};
pub use circuit_breaker::{ApplierCircuit, CircuitBreaker, CircuitConfig, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use coordinator::{
    CleanupReport, DomainChange, ItemError, LocalChange, ResolveConflictRequest, SyncCoordinator,
    SyncRequest, SyncResponse, SyncStatistics, SyncStatus,
};
pub use delta::{ContinuationToken, DeltaPage, DeltaRequest};
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use horizon::{CommitHorizon, HorizonGuard};
pub use model::{
    ChangeNotification, ChangeRecord, ChangeStatus, ClientRegistration, Conflict,
    ConflictResolution, EntityTypeSettings, Operation, ResolutionStrategy, Subscription,
    SyncConfiguration,
};
pub use processor::{BackgroundProcessor, PassReport, ProcessorState};
pub use registry::ClientRegistry;
pub use store::{MemoryStore, SqliteStore, SyncStore};

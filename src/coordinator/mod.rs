// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync coordinator.
//!
//! The request/response side of the engine. Ties together:
//! - Client ownership and checkpoints via [`ClientRegistry`]
//! - Conflict detection via [`crate::conflict`]
//! - Domain applies through the shared [`ApplierCircuit`]
//! - Delta reads via [`DeltaFeed`]
//!
//! # Request Flow
//!
//! ```text
//! process_sync_request
//!   ├─ bulkhead slot (else Overloaded)
//!   ├─ validate whole request (else reject, nothing persisted)
//!   ├─ now = horizon.enter(clock)     ◄── single reading for the round
//!   ├─ ensure client (auto-register, ownership check)
//!   ├─ for each local change, in order:
//!   │     validate ─► detect conflict ─► apply ─► persist Completed ─► fan out
//!   ├─ server changes since last checkpoint (other origins, capped)
//!   └─ registry checkpoint = now, held back to the oldest in-flight writer
//! ```
//!
//! Items are processed sequentially: a later change to the same entity sees
//! the records committed by earlier ones.

mod conflicts;
mod domain;
mod maintenance;
mod request;
mod types;

pub use types::{
    CleanupReport, DomainChange, ItemError, LocalChange, ResolveConflictRequest, SyncRequest,
    SyncResponse, SyncStatistics, SyncStatus,
};

pub(crate) use maintenance::purge_history;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::applier::EntityApplier;
use crate::circuit_breaker::{ApplierCircuit, CircuitState};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::delta::{DeltaFeed, DeltaPage, DeltaRequest};
use crate::error::{Result, SyncError};
use crate::horizon::CommitHorizon;
use crate::model::{ChangeRecord, ClientRegistration, Subscription, SyncConfiguration};
use crate::registry::ClientRegistry;
use crate::resilience::Bulkhead;
use crate::store::SyncStore;

/// Handles client sync rounds and the engine's synchronous API.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct SyncCoordinator {
    store: Arc<dyn SyncStore>,
    applier: Arc<dyn EntityApplier>,
    circuit: Arc<ApplierCircuit>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    registry: ClientRegistry,
    delta: DeltaFeed,
    bulkhead: Bulkhead,
    /// Shared with the processor so checkpoints respect its passes too.
    horizon: Arc<CommitHorizon>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        applier: Arc<dyn EntityApplier>,
        circuit: Arc<ApplierCircuit>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let registry = ClientRegistry::new(Arc::clone(&store), config.registry.clone());
        let delta = DeltaFeed::new(Arc::clone(&store), config.coordinator.clone());
        let bulkhead = Bulkhead::new(config.coordinator.max_concurrent_requests);
        Self {
            store,
            applier,
            circuit,
            clock,
            config,
            registry,
            delta,
            bulkhead,
            horizon: Arc::new(CommitHorizon::new()),
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn circuit(&self) -> &Arc<ApplierCircuit> {
        &self.circuit
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Writers in flight; hand this to a processor sharing the store.
    pub fn horizon(&self) -> &Arc<CommitHorizon> {
        &self.horizon
    }

    /// Sync requests currently being processed.
    pub fn inflight_requests(&self) -> usize {
        self.bulkhead.in_use()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status
    // ═══════════════════════════════════════════════════════════════════════

    /// Health snapshot for one client.
    ///
    /// Healthy iff nothing is failed-and-retrying and the pending count is
    /// below the configured ceiling. Issues also list advisory items
    /// (conflicts, dead letters, an open circuit) that do not flip the flag.
    #[instrument(skip(self))]
    pub async fn get_sync_status(&self, client_id: &str, user_id: &str) -> Result<SyncStatus> {
        let client = self.owned_client(client_id, user_id).await?;
        let summary = self.store.client_change_summary(client_id).await?;
        let conflicts = self
            .store
            .unresolved_conflicts(user_id, Some(client_id))
            .await?
            .len();
        let circuit_state = self.circuit.state();
        let ceiling = self.config.coordinator.health_pending_ceiling;

        let mut issues = Vec::new();
        if summary.failed > 0 {
            issues.push(format!("{} items failed and are awaiting retry", summary.failed));
        }
        if summary.pending >= ceiling {
            issues.push(format!("{} items pending (ceiling {ceiling})", summary.pending));
        }
        if conflicts > 0 {
            issues.push(format!("{conflicts} unresolved conflicts"));
        }
        if summary.dead_lettered > 0 {
            issues.push(format!(
                "{} items were abandoned after exhausting retries",
                summary.dead_lettered
            ));
        }
        if circuit_state == CircuitState::Open {
            issues.push("domain applier circuit is open".to_string());
        }

        Ok(SyncStatus {
            client_id: client.client_id,
            user_id: client.user_id,
            pending_items: summary.pending,
            failed_items: summary.failed,
            dead_lettered_items: summary.dead_lettered,
            unresolved_conflicts: conflicts,
            last_sync_at: client.last_sync_at,
            last_completed_at: summary.last_completed_at,
            circuit_state: circuit_state.to_string(),
            is_healthy: summary.failed == 0 && summary.pending < ceiling,
            health_issues: issues,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delta feed
    // ═══════════════════════════════════════════════════════════════════════

    /// One page of committed changes for an entity type.
    #[instrument(skip(self, request), fields(entity_type = %request.entity_type))]
    pub async fn get_delta_changes(&self, request: &DeltaRequest) -> Result<DeltaPage> {
        let now = self.horizon.checkpoint(self.clock.now());
        self.delta.fetch(request, now).await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Per-user configuration
    // ═══════════════════════════════════════════════════════════════════════

    /// Stored configuration, or engine defaults if the user has none.
    pub async fn get_sync_configuration(&self, user_id: &str) -> Result<SyncConfiguration> {
        if user_id.trim().is_empty() {
            return Err(SyncError::validation("user_id", "must not be empty"));
        }
        let now = self.clock.now();
        self.load_configuration(user_id, now).await
    }

    /// Validate and store a user's configuration.
    #[instrument(skip(self, config), fields(user_id = %config.user_id))]
    pub async fn update_sync_configuration(
        &self,
        mut config: SyncConfiguration,
    ) -> Result<SyncConfiguration> {
        config.validate()?;
        config.updated_at = self.clock.now();
        self.store.put_configuration(&config).await?;
        info!(
            auto_resolve = config.auto_resolve_conflicts,
            strategy = %config.default_strategy,
            overrides = config.entity_overrides.len(),
            "Sync configuration updated"
        );
        Ok(config)
    }

    async fn load_configuration(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncConfiguration> {
        Ok(self
            .store
            .get_configuration(user_id)
            .await?
            .unwrap_or_else(|| self.config.default_sync_configuration(user_id, now)))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client registry
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn register_client(
        &self,
        descriptor: &str,
        user_id: &str,
    ) -> Result<ClientRegistration> {
        self.registry
            .register_client(descriptor, user_id, self.clock.now())
            .await
    }

    pub async fn ensure_client_exists(
        &self,
        client_id: &str,
        user_id: &str,
        descriptor: Option<&str>,
    ) -> Result<ClientRegistration> {
        self.registry
            .ensure_client_exists(client_id, user_id, descriptor, self.clock.now())
            .await
    }

    pub async fn update_client_last_seen(
        &self,
        client_id: &str,
        user_id: &str,
    ) -> Result<ClientRegistration> {
        self.registry
            .update_last_seen(client_id, user_id, self.clock.now())
            .await
    }

    pub async fn get_active_clients(&self, user_id: &str) -> Result<Vec<ClientRegistration>> {
        self.registry
            .get_active_clients(user_id, self.clock.now())
            .await
    }

    /// Advance a client's checkpoint for one entity type.
    pub async fn update_entity_checkpoint(
        &self,
        client_id: &str,
        user_id: &str,
        entity_type: &str,
        at: DateTime<Utc>,
    ) -> Result<ClientRegistration> {
        self.registry
            .update_entity_checkpoint(client_id, user_id, entity_type, at)
            .await
    }

    pub async fn subscribe_to_entity_changes(
        &self,
        client_id: &str,
        user_id: &str,
        entity_types: &[String],
    ) -> Result<Subscription> {
        self.registry
            .subscribe(client_id, user_id, entity_types, self.clock.now())
            .await
    }

    pub async fn unsubscribe_from_entity_changes(
        &self,
        client_id: &str,
        user_id: &str,
        entity_types: &[String],
    ) -> Result<bool> {
        self.registry
            .unsubscribe(client_id, user_id, entity_types, self.clock.now())
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Shared helpers
    // ═══════════════════════════════════════════════════════════════════════

    async fn owned_client(&self, client_id: &str, user_id: &str) -> Result<ClientRegistration> {
        match self.store.get_client(client_id).await? {
            Some(client) if client.user_id == user_id => Ok(client),
            Some(_) => Err(SyncError::ClientOwnership {
                client_id: client_id.to_string(),
                user_id: user_id.to_string(),
            }),
            None => Err(SyncError::not_found("client", client_id)),
        }
    }

    /// Fan out a committed change; failures are logged, never surfaced.
    async fn fan_out_quietly(&self, change: &ChangeRecord, now: DateTime<Utc>) {
        if let Err(e) = self.registry.fan_out(change, now).await {
            warn!(change_id = %change.id, error = %e, "Failed to queue change notifications");
        }
    }
}

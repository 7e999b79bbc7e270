// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict listing and resolution.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::types::ResolveConflictRequest;
use super::SyncCoordinator;
use crate::conflict::{resolve, ResolvedSide, AUTO_RESOLVER};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::model::{ChangeRecord, ChangeStatus, Conflict, ConflictResolution, ResolutionStrategy};

impl SyncCoordinator {
    /// Unresolved conflicts for a user, optionally for one client, oldest first.
    pub async fn get_pending_conflicts(
        &self,
        user_id: &str,
        client_id: Option<&str>,
    ) -> Result<Vec<Conflict>> {
        if user_id.trim().is_empty() {
            return Err(SyncError::validation("user_id", "must not be empty"));
        }
        self.store.unresolved_conflicts(user_id, client_id).await
    }

    /// Settle one conflict with a caller-chosen strategy.
    ///
    /// When the winning value is not already the server's, it is applied
    /// through the domain applier and committed as a new change. A failed
    /// apply leaves the conflict unresolved.
    #[instrument(skip(self, request), fields(conflict_id = %request.conflict_id, strategy = %request.strategy))]
    pub async fn resolve_conflict(&self, request: ResolveConflictRequest) -> Result<Conflict> {
        if request.conflict_id.trim().is_empty() {
            return Err(SyncError::validation("conflict_id", "must not be empty"));
        }
        let conflict = match self.store.get_conflict(&request.conflict_id).await? {
            Some(c) if c.user_id == request.user_id => c,
            _ => return Err(SyncError::not_found("conflict", request.conflict_id)),
        };
        if conflict.is_resolved() {
            return Err(SyncError::InvalidState {
                expected: "unresolved conflict".into(),
                actual: "resolved".into(),
            });
        }

        let writer = self.horizon.enter(self.clock.as_ref());
        self.settle_conflict(
            conflict,
            request.strategy,
            request.resolved_data,
            &request.user_id,
            writer.at(),
        )
        .await
    }

    /// Resolve a client's conflicts with the user's configured strategies.
    ///
    /// A no-op unless the user enabled auto-resolution. Conflicts whose
    /// strategy is `ManualResolution` are left for the caller. One failed
    /// resolution does not stop the rest.
    #[instrument(skip(self))]
    pub async fn auto_resolve_conflicts(
        &self,
        client_id: &str,
        user_id: &str,
    ) -> Result<Vec<Conflict>> {
        self.owned_client(client_id, user_id).await?;
        let writer = self.horizon.enter(self.clock.as_ref());
        let now = writer.at();
        let user_config = self.load_configuration(user_id, now).await?;
        if !user_config.auto_resolve_conflicts {
            debug!("Auto-resolution disabled for user");
            return Ok(Vec::new());
        }

        let pending = self
            .store
            .unresolved_conflicts(user_id, Some(client_id))
            .await?;
        let mut resolved = Vec::with_capacity(pending.len());
        for conflict in pending {
            let strategy = user_config.strategy_for(&conflict.entity_type);
            if !strategy.is_automatic() {
                continue;
            }
            let conflict_id = conflict.id.clone();
            match self
                .settle_conflict(conflict, strategy, None, AUTO_RESOLVER, now)
                .await
            {
                Ok(c) => resolved.push(c),
                Err(e) => warn!(conflict_id = %conflict_id, error = %e, "Auto-resolution failed"),
            }
        }

        info!(resolved = resolved.len(), "Auto-resolution complete");
        Ok(resolved)
    }

    async fn settle_conflict(
        &self,
        mut conflict: Conflict,
        strategy: ResolutionStrategy,
        supplied: Option<Vec<u8>>,
        resolved_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Conflict> {
        let outcome = resolve(&conflict, strategy, supplied);

        if !outcome.keeps_server_state() {
            let origin = match outcome.side {
                ResolvedSide::Client => Some(conflict.client_id.clone()),
                _ => None,
            };
            let mut record = ChangeRecord::new(
                conflict.entity_type.as_str(),
                conflict.entity_id.as_str(),
                outcome.operation,
                outcome.data.clone(),
                origin,
                conflict.user_id.as_str(),
                now,
                now,
                ChangeStatus::InProgress,
            );
            self.circuit.apply(self.applier.as_ref(), &record).await?;
            record.complete(now)?;
            self.store.insert_change(&record).await?;
            self.fan_out_quietly(&record, now).await;
        }

        conflict.resolution = Some(ConflictResolution {
            strategy,
            resolved_data: outcome.data,
            resolved_by: resolved_by.to_string(),
            resolved_at: now,
        });
        self.store.update_conflict(&conflict).await?;

        let automatic = resolved_by == AUTO_RESOLVER;
        metrics::record_conflict_resolved(strategy.as_str(), automatic);
        info!(
            conflict_id = %conflict.id,
            entity_type = %conflict.entity_type,
            entity_id = %conflict.entity_id,
            strategy = %strategy,
            automatic,
            "Conflict resolved"
        );
        Ok(conflict)
    }
}

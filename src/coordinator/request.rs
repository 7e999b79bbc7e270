// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `process_sync_request`: one client sync round.
//!
//! Partial failure is the default. Once the request passes validation, each
//! local change is accepted, turned into a conflict, or reported as an item
//! error; one bad item never aborts its siblings.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::types::{ItemError, LocalChange, SyncRequest, SyncResponse, SyncStatistics};
use super::SyncCoordinator;
use crate::clock::truncate_to_millis;
use crate::conflict::{build_conflict, detect_conflict, refresh_conflict};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::model::{ChangeRecord, ChangeStatus, Conflict, Operation, SyncConfiguration};
use crate::processor::{settle_failure, Settled};

/// Where one local change ended up.
enum ItemOutcome {
    Accepted(String),
    Conflict(Conflict),
}

/// A per-item failure, possibly with the record kept for background retry.
struct ItemFailure {
    error: SyncError,
    queued_change_id: Option<String>,
}

impl From<SyncError> for ItemFailure {
    fn from(error: SyncError) -> Self {
        Self {
            error,
            queued_change_id: None,
        }
    }
}

impl SyncCoordinator {
    /// Run one sync round for a client.
    ///
    /// Rejects the whole request (nothing persisted) on malformed input or a
    /// client/user mismatch, and with [`SyncError::Overloaded`] when too
    /// many rounds are in flight. Everything after that is reported per item.
    #[instrument(
        skip(self, request),
        fields(
            client_id = %request.client_id,
            user_id = %request.user_id,
            changes = request.local_changes.len()
        )
    )]
    pub async fn process_sync_request(&self, request: SyncRequest) -> Result<SyncResponse> {
        let Some(permit) = self.bulkhead.try_acquire() else {
            metrics::record_sync_rejected("overloaded");
            warn!(
                max_concurrent = self.bulkhead.max_concurrent(),
                "Sync request rejected, coordinator overloaded"
            );
            return Err(SyncError::Overloaded {
                max_concurrent: self.bulkhead.max_concurrent(),
            });
        };
        metrics::set_inflight_requests(self.bulkhead.in_use());

        let result = self.run_sync_round(&request).await;

        drop(permit);
        metrics::set_inflight_requests(self.bulkhead.in_use());
        result
    }

    async fn run_sync_round(&self, request: &SyncRequest) -> Result<SyncResponse> {
        if let Err(e) = self.validate_request(request) {
            metrics::record_sync_rejected("validation");
            warn!(error = %e, "Sync request rejected");
            return Err(e);
        }

        let round = self.horizon.enter(self.clock.as_ref());
        let now = round.at();
        let started = Instant::now();

        let client = match self
            .registry
            .ensure_client_exists(
                &request.client_id,
                &request.user_id,
                request.client_descriptor.as_deref(),
                now,
            )
            .await
        {
            Ok(client) => client,
            Err(e) => {
                if matches!(e, SyncError::ClientOwnership { .. }) {
                    metrics::record_sync_rejected("ownership");
                }
                warn!(error = %e, "Sync request rejected");
                return Err(e);
            }
        };

        let user_config = self.load_configuration(&request.user_id, now).await?;
        if let Err(e) = check_user_batch_limits(&request.local_changes, &user_config) {
            metrics::record_sync_rejected("validation");
            warn!(error = %e, "Sync request rejected");
            return Err(e);
        }

        let mut touched: BTreeSet<String> = BTreeSet::new();
        let mut accepted_change_ids = Vec::new();
        let mut conflicts = Vec::new();
        let mut errors = Vec::new();

        for (index, change) in request.local_changes.iter().enumerate() {
            touched.insert(change.entity_type.clone());
            match self
                .process_local_change(request, change, &user_config, now)
                .await
            {
                Ok(ItemOutcome::Accepted(id)) => accepted_change_ids.push(id),
                Ok(ItemOutcome::Conflict(conflict)) => conflicts.push(conflict),
                Err(failure) => {
                    warn!(
                        index,
                        entity_type = %change.entity_type,
                        entity_id = %change.entity_id,
                        error = %failure.error,
                        queued = failure.queued_change_id.is_some(),
                        "Local change failed"
                    );
                    errors.push(ItemError {
                        index,
                        entity_type: change.entity_type.clone(),
                        entity_id: change.entity_id.clone(),
                        message: failure.error.to_string(),
                        retryable: failure.error.is_retryable(),
                        queued_change_id: failure.queued_change_id,
                    });
                }
            }
        }

        let page_size = self.config.coordinator.server_changes_page_size;
        let mut server_changes = self
            .store
            .completed_changes_since(
                &request.user_id,
                &request.client_id,
                request.last_sync_timestamp,
                page_size.saturating_add(1),
            )
            .await?;

        // A truncated page must not advance the checkpoint past what was sent,
        // nor may any checkpoint pass a writer that has yet to insert.
        let has_more_server_changes = server_changes.len() > page_size;
        let mut checkpoint = self.horizon.checkpoint(now);
        if has_more_server_changes {
            checkpoint = checkpoint.min(server_changes[page_size].created_at);
            server_changes.truncate(page_size);
        }
        touched.extend(server_changes.iter().map(|c| c.entity_type.clone()));

        if let Err(e) = self
            .registry
            .record_sync(client, checkpoint, now, &touched)
            .await
        {
            warn!(error = %e, "Failed to record sync checkpoint");
        }
        drop(round);

        let elapsed = started.elapsed();
        let statistics = SyncStatistics {
            processing_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            total_changes: request.local_changes.len(),
            accepted: accepted_change_ids.len(),
            conflicts: conflicts.len(),
            errors: errors.len(),
            server_changes: server_changes.len(),
        };
        metrics::record_sync_request(
            statistics.accepted,
            statistics.conflicts,
            statistics.errors,
            statistics.server_changes,
            elapsed,
        );
        info!(
            accepted = statistics.accepted,
            conflicts = statistics.conflicts,
            errors = statistics.errors,
            server_changes = statistics.server_changes,
            has_more_server_changes,
            duration_ms = statistics.processing_time_ms,
            "Sync round complete"
        );

        Ok(SyncResponse {
            server_timestamp: checkpoint,
            server_changes,
            accepted_change_ids,
            conflicts,
            errors,
            has_more_server_changes,
            statistics,
        })
    }

    /// Reject malformed requests before anything is read or written.
    fn validate_request(&self, request: &SyncRequest) -> Result<()> {
        if request.client_id.trim().is_empty() {
            return Err(SyncError::validation("client_id", "must not be empty"));
        }
        if request.user_id.trim().is_empty() {
            return Err(SyncError::validation("user_id", "must not be empty"));
        }
        let max = self.config.coordinator.max_batch_size;
        if request.local_changes.len() > max {
            return Err(SyncError::validation(
                "local_changes",
                format!("{} changes exceeds the limit of {max}", request.local_changes.len()),
            ));
        }
        for (index, change) in request.local_changes.iter().enumerate() {
            if change.entity_type.trim().is_empty() {
                return Err(SyncError::validation(
                    format!("local_changes[{index}].entity_type"),
                    "must not be empty",
                ));
            }
            if change.entity_id.trim().is_empty() {
                return Err(SyncError::validation(
                    format!("local_changes[{index}].entity_id"),
                    "must not be empty",
                ));
            }
            if change.operation != Operation::Delete && change.data.is_empty() {
                return Err(SyncError::validation(
                    format!("local_changes[{index}].data"),
                    format!("{} requires a payload", change.operation),
                ));
            }
        }
        Ok(())
    }

    async fn process_local_change(
        &self,
        request: &SyncRequest,
        change: &LocalChange,
        user_config: &SyncConfiguration,
        now: DateTime<Utc>,
    ) -> std::result::Result<ItemOutcome, ItemFailure> {
        let mut record = ChangeRecord::new(
            change.entity_type.as_str(),
            change.entity_id.as_str(),
            change.operation,
            change.data.clone(),
            Some(request.client_id.clone()),
            request.user_id.as_str(),
            truncate_to_millis(change.timestamp),
            now,
            ChangeStatus::Pending,
        );

        if let Err(e) = self.applier.validate_entity_change(&record).await {
            return Err(SyncError::Apply {
                entity_type: record.entity_type,
                entity_id: record.entity_id,
                message: e.message,
                retryable: false,
            }
            .into());
        }

        let existing = self
            .store
            .latest_committed_change(&record.entity_type, &record.entity_id)
            .await?;
        if let Some(existing) = existing.as_ref() {
            if let Some(reason) = detect_conflict(&record, Some(existing)) {
                let conflict = self
                    .record_conflict(&record, existing, user_config, reason, now)
                    .await?;
                return Ok(ItemOutcome::Conflict(conflict));
            }
        }

        record.transition(ChangeStatus::InProgress, now)?;
        match self.circuit.apply(self.applier.as_ref(), &record).await {
            Ok(()) => {
                record.complete(now)?;
                self.store.insert_change(&record).await?;
                self.fan_out_quietly(&record, now).await;
                debug!(change_id = %record.id, "Local change accepted");
                Ok(ItemOutcome::Accepted(record.id))
            }
            Err(SyncError::CircuitOpen) => {
                // Keep it for the processor without charging a retry.
                record.requeue(Some(SyncError::CircuitOpen.to_string()), now)?;
                record.next_retry_at = Some(now);
                self.store.insert_change(&record).await?;
                Err(ItemFailure {
                    error: SyncError::CircuitOpen,
                    queued_change_id: Some(record.id),
                })
            }
            Err(error) if error.is_retryable() => {
                let policy = self
                    .config
                    .processor
                    .retry_policy_for(user_config, &record.entity_type);
                let settled = settle_failure(&mut record, error.to_string(), true, &policy, now)?;
                self.store.insert_change(&record).await?;
                let queued = (settled == Settled::Retrying).then(|| record.id.clone());
                if queued.is_none() {
                    metrics::record_processor_item("dead_lettered");
                }
                debug!(
                    change_id = %record.id,
                    next_retry_at = ?record.next_retry_at.map(|t| t.to_rfc3339()),
                    "Local change queued for background retry"
                );
                Err(ItemFailure {
                    error,
                    queued_change_id: queued,
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Store a conflict, reusing an unresolved one for the same client/entity.
    async fn record_conflict(
        &self,
        incoming: &ChangeRecord,
        existing: &ChangeRecord,
        user_config: &SyncConfiguration,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<Conflict> {
        let recommended = user_config.strategy_for(&incoming.entity_type);
        let fresh = build_conflict(incoming, existing, recommended, reason, now);

        let prior = self
            .store
            .unresolved_conflict_for(&fresh.client_id, &fresh.entity_type, &fresh.entity_id)
            .await?;
        let conflict = match prior {
            Some(mut prior) => {
                refresh_conflict(&mut prior, fresh);
                self.store.update_conflict(&prior).await?;
                debug!(conflict_id = %prior.id, "Existing conflict refreshed");
                prior
            }
            None => {
                self.store.insert_conflict(&fresh).await?;
                metrics::record_conflict_created(&fresh.entity_type);
                info!(
                    conflict_id = %fresh.id,
                    entity_type = %fresh.entity_type,
                    entity_id = %fresh.entity_id,
                    recommended = %fresh.recommended_strategy,
                    "Conflict detected"
                );
                fresh
            }
        };
        Ok(conflict)
    }
}

/// Enforce the user's batch size, per entity type where overridden.
fn check_user_batch_limits(changes: &[LocalChange], user_config: &SyncConfiguration) -> Result<()> {
    if changes.len() > user_config.batch_size {
        return Err(SyncError::validation(
            "local_changes",
            format!(
                "{} changes exceeds the user batch size of {}",
                changes.len(),
                user_config.batch_size
            ),
        ));
    }
    let mut per_type: BTreeMap<&str, usize> = BTreeMap::new();
    for change in changes {
        *per_type.entry(change.entity_type.as_str()).or_default() += 1;
    }
    for (entity_type, count) in per_type {
        let limit = user_config.batch_size_for(entity_type);
        if count > limit {
            return Err(SyncError::validation(
                format!("local_changes.{entity_type}"),
                format!("{count} changes exceeds the batch size of {limit}"),
            ));
        }
    }
    Ok(())
}

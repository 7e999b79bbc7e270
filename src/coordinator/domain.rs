// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain-service entry points and the notification queue.

use tracing::{debug, info, instrument};

use super::types::DomainChange;
use super::SyncCoordinator;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::model::{ChangeNotification, ChangeRecord, ChangeStatus, Operation};

impl SyncCoordinator {
    /// Record a mutation the domain service has already applied.
    ///
    /// Persisted `Completed` with no originating client, so every one of the
    /// user's clients receives it, then fanned out.
    #[instrument(skip(self, change), fields(entity_type = %change.entity_type, entity_id = %change.entity_id))]
    pub async fn create_sync_item(&self, change: DomainChange) -> Result<ChangeRecord> {
        validate_domain_change(&change)?;
        let writer = self.horizon.enter(self.clock.as_ref());
        let now = writer.at();
        let record = ChangeRecord::new(
            change.entity_type,
            change.entity_id,
            change.operation,
            change.data,
            None,
            change.user_id,
            now,
            now,
            ChangeStatus::Completed,
        );
        self.store.insert_change(&record).await?;
        drop(writer);
        metrics::record_change_enqueued("domain_committed");
        self.fan_out_quietly(&record, now).await;
        debug!(change_id = %record.id, "Domain change committed");
        Ok(record)
    }

    /// Queue a mutation for the background processor to apply.
    #[instrument(skip(self, change), fields(entity_type = %change.entity_type, entity_id = %change.entity_id))]
    pub async fn enqueue_change(&self, change: DomainChange) -> Result<ChangeRecord> {
        validate_domain_change(&change)?;
        let now = self.clock.now();
        let mut record = ChangeRecord::new(
            change.entity_type,
            change.entity_id,
            change.operation,
            change.data,
            None,
            change.user_id,
            now,
            now,
            ChangeStatus::Pending,
        );
        record.next_retry_at = Some(now);
        self.store.insert_change(&record).await?;
        metrics::record_change_enqueued("domain_pending");
        debug!(change_id = %record.id, "Domain change queued");
        Ok(record)
    }

    /// Queue notifications of a committed change for interested clients.
    pub async fn notify_clients_of_changes(&self, change: &ChangeRecord) -> Result<usize> {
        if !change.is_committed() {
            return Err(SyncError::InvalidState {
                expected: "committed change".into(),
                actual: change.status.to_string(),
            });
        }
        self.registry.fan_out(change, self.clock.now()).await
    }

    /// Make a failed record due immediately, without waiting out its backoff.
    #[instrument(skip(self))]
    pub async fn retry_change(&self, change_id: &str, user_id: &str) -> Result<ChangeRecord> {
        let mut record = match self.store.get_change(change_id).await? {
            Some(r) if r.user_id == user_id => r,
            _ => return Err(SyncError::not_found("change", change_id)),
        };
        let now = self.clock.now();
        match record.status {
            ChangeStatus::Failed => record.requeue(None, now)?,
            ChangeStatus::Pending => {}
            other => {
                return Err(SyncError::InvalidState {
                    expected: "Failed or Pending".into(),
                    actual: other.to_string(),
                })
            }
        }
        record.next_retry_at = Some(now);
        self.store.update_change(&record).await?;
        info!(change_id, retry_count = record.retry_count, "Change requeued by caller");
        Ok(record)
    }

    /// Undelivered notifications for a client, oldest first.
    pub async fn get_pending_notifications(
        &self,
        client_id: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ChangeNotification>> {
        self.owned_client(client_id, user_id).await?;
        self.store.undelivered_notifications(client_id, limit).await
    }

    /// Mark notifications delivered. Returns how many were updated.
    pub async fn acknowledge_notifications(
        &self,
        client_id: &str,
        user_id: &str,
        notification_ids: &[String],
    ) -> Result<u64> {
        self.owned_client(client_id, user_id).await?;
        if notification_ids.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();
        self.store
            .mark_notifications_delivered(client_id, notification_ids, now)
            .await
    }
}

fn validate_domain_change(change: &DomainChange) -> Result<()> {
    if change.entity_type.trim().is_empty() {
        return Err(SyncError::validation("entity_type", "must not be empty"));
    }
    if change.entity_id.trim().is_empty() {
        return Err(SyncError::validation("entity_id", "must not be empty"));
    }
    if change.user_id.trim().is_empty() {
        return Err(SyncError::validation("user_id", "must not be empty"));
    }
    if change.operation != Operation::Delete && change.data.is_empty() {
        return Err(SyncError::validation(
            "data",
            format!("{} requires a payload", change.operation),
        ));
    }
    Ok(())
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retention cleanup.
//!
//! Every purge runs in bounded batches so no single statement holds the
//! store for long. The background processor calls [`purge_history`] on its
//! cleanup cadence; operators call `cleanup_old_sync_data` directly.

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use super::types::CleanupReport;
use super::SyncCoordinator;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::store::{BoxFuture, SyncStore};

/// Purge completed records, resolved conflicts and delivered notifications
/// older than their cutoffs.
pub(crate) async fn purge_history(
    store: &dyn SyncStore,
    completed_cutoff: DateTime<Utc>,
    conflict_cutoff: DateTime<Utc>,
    notification_cutoff: DateTime<Utc>,
    batch: usize,
) -> Result<CleanupReport> {
    if batch == 0 {
        return Err(SyncError::Config("cleanup batch size must be at least 1".into()));
    }

    let completed_records = drain(batch, "completed_records", |limit| {
        store.purge_completed_before(completed_cutoff, limit)
    })
    .await?;
    let resolved_conflicts = drain(batch, "resolved_conflicts", |limit| {
        store.purge_resolved_conflicts_before(conflict_cutoff, limit)
    })
    .await?;
    let delivered_notifications = drain(batch, "delivered_notifications", |limit| {
        store.purge_delivered_notifications_before(notification_cutoff, limit)
    })
    .await?;

    Ok(CleanupReport {
        completed_records,
        resolved_conflicts,
        delivered_notifications,
    })
}

/// Repeat `purge` until a batch comes back short.
async fn drain<'a, F>(batch: usize, kind: &str, purge: F) -> Result<u64>
where
    F: Fn(usize) -> BoxFuture<'a, u64>,
{
    let mut total = 0u64;
    loop {
        let removed = purge(batch).await?;
        total += removed;
        if removed < batch as u64 {
            break;
        }
    }
    if total > 0 {
        metrics::record_cleanup_purged(kind, total);
    }
    Ok(total)
}

impl SyncCoordinator {
    /// Operator-triggered sweep using one cutoff for every kind of history.
    #[instrument(skip(self))]
    pub async fn cleanup_old_sync_data(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport> {
        let report = purge_history(
            self.store.as_ref(),
            cutoff,
            cutoff,
            cutoff,
            self.config.retention.cleanup_batch_size,
        )
        .await?;
        info!(
            completed_records = report.completed_records,
            resolved_conflicts = report.resolved_conflicts,
            delivered_notifications = report.delivered_notifications,
            "Sync history cleaned up"
        );
        Ok(report)
    }
}

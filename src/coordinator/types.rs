// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request and response types for the sync protocol.
//!
//! A sync round never fails as a whole once validation has passed: every
//! local change ends up in exactly one of three buckets.
//!
//! ```text
//! local_changes[i] ──┬──► accepted   (committed, fanned out)
//!                    ├──► conflicts  (recorded, not applied)
//!                    └──► errors     (with retryable flag)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ChangeRecord, Conflict, Operation, ResolutionStrategy};

/// One change made on the client while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    /// Opaque serialized entity.
    #[serde(default)]
    pub data: Vec<u8>,
    /// When the client made the change.
    pub timestamp: DateTime<Utc>,
}

/// A client's sync round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub client_id: String,
    pub user_id: String,
    /// `server_timestamp` from the previous response; `None` on first sync.
    #[serde(default)]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub local_changes: Vec<LocalChange>,
    /// Descriptor stored if this is the client's first contact.
    #[serde(default)]
    pub client_descriptor: Option<String>,
}

/// Failure for one local change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Position in `local_changes`.
    pub index: usize,
    pub entity_type: String,
    pub entity_id: String,
    pub message: String,
    /// Whether resubmitting the unchanged change may succeed.
    pub retryable: bool,
    /// Set when the server kept the change and will retry it in the background.
    #[serde(default)]
    pub queued_change_id: Option<String>,
}

/// Per-request counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub processing_time_ms: u64,
    pub total_changes: usize,
    pub accepted: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub server_changes: usize,
}

/// Result of a sync round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// The new checkpoint: the clock reading taken when processing began.
    pub server_timestamp: DateTime<Utc>,
    /// Committed changes from other origins since the previous checkpoint.
    pub server_changes: Vec<ChangeRecord>,
    /// Ids of the change records created for accepted local changes.
    pub accepted_change_ids: Vec<String>,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<ItemError>,
    /// More server changes exist than fit in this response.
    pub has_more_server_changes: bool,
    pub statistics: SyncStatistics,
}

/// Health snapshot for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub client_id: String,
    pub user_id: String,
    /// Records not yet completed.
    pub pending_items: u64,
    /// Not-yet-completed records that failed at least once.
    pub failed_items: u64,
    pub dead_lettered_items: u64,
    pub unresolved_conflicts: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Applier circuit state as seen by this process.
    pub circuit_state: String,
    pub is_healthy: bool,
    pub health_issues: Vec<String>,
}

/// Caller request to settle a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveConflictRequest {
    pub conflict_id: String,
    pub user_id: String,
    pub strategy: ResolutionStrategy,
    /// Required for a real manual merge; server data is kept otherwise.
    #[serde(default)]
    pub resolved_data: Option<Vec<u8>>,
}

/// A domain mutation entering the engine outside the sync protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainChange {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub data: Vec<u8>,
    pub user_id: String,
}

/// Rows removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub completed_records: u64,
    pub resolved_conflicts: u64,
    pub delivered_notifications: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.completed_records + self.resolved_conflicts + self.delivered_notifications
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_request_defaults_from_json() {
        let request: SyncRequest =
            serde_json::from_str(r#"{"client_id":"c-1","user_id":"u-1"}"#).unwrap();
        assert!(request.local_changes.is_empty());
        assert!(request.last_sync_timestamp.is_none());
        assert!(request.client_descriptor.is_none());
    }

    #[test]
    fn test_local_change_from_json() {
        let change: LocalChange = serde_json::from_str(
            r#"{"entity_type":"task","entity_id":"t-1","operation":"delete","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(change.operation, Operation::Delete);
        assert!(change.data.is_empty());
    }

    #[test]
    fn test_cleanup_report_total() {
        let report = CleanupReport {
            completed_records: 3,
            resolved_conflicts: 2,
            delivered_notifications: 1,
        };
        assert_eq!(report.total(), 6);
    }
}

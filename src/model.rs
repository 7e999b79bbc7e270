// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared data model.
//!
//! ```text
//! ChangeRecord ──(entity_type, entity_id)──► Conflict
//!      │                                        │
//!      └── client_id ──► ClientRegistration ◄───┘
//!                             │
//!                             ├── Subscription (entity types of interest)
//!                             └── ChangeNotification (fan-out queue)
//! ```
//!
//! Payloads (`data`) are opaque bytes; the engine never looks inside them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// New random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Hex SHA-256 of a payload.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Operation / ChangeStatus
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(SyncError::Internal(format!("unknown operation: {other}"))),
        }
    }
}

/// Lifecycle status of a change record.
///
/// ```text
///            ┌──────── retry ────────┐
///            ▼                       │
///  Pending ──► InProgress ──► Failed ┘
///                  │            │
///                  ▼            │ (dead-letter)
///              Completed ◄──────┘
/// ```
///
/// `Completed` is terminal; only retention cleanup removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: ChangeStatus) -> bool {
        use ChangeStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Failed, Completed)
        )
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(SyncError::Internal(format!("unknown change status: {other}"))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ChangeRecord
// ═══════════════════════════════════════════════════════════════════════════════

/// One mutation to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    /// Opaque serialized payload.
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`, used for idempotent re-apply checks.
    pub content_hash: String,
    /// Originating client; `None` for server-side (domain service) changes.
    pub client_id: Option<String>,
    pub user_id: String,
    /// When the change was made, as declared by its origin.
    pub changed_at: DateTime<Utc>,
    /// When the engine accepted the record, or committed it if that came
    /// later through a background retry. Delta cursors order on this.
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub status: ChangeStatus,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Earliest time the next attempt may run.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ChangeRecord {
    /// Build a new record in the given initial status.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        data: Vec<u8>,
        client_id: Option<String>,
        user_id: impl Into<String>,
        changed_at: DateTime<Utc>,
        now: DateTime<Utc>,
        status: ChangeStatus,
    ) -> Self {
        let content_hash = content_hash(&data);
        Self {
            id: new_id(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            data,
            content_hash,
            client_id,
            user_id: user_id.into(),
            changed_at,
            created_at: now,
            modified_at: now,
            status,
            retry_count: 0,
            last_retry_at: None,
            next_retry_at: None,
            error_message: None,
        }
    }

    /// Move to `next`, enforcing the lifecycle rules.
    pub fn transition(&mut self, next: ChangeStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvalidState {
                expected: format!("a status that may become {next}"),
                actual: self.status.to_string(),
            });
        }
        self.status = next;
        self.modified_at = now;
        Ok(())
    }

    /// Completed and applied without a terminal error.
    pub fn is_committed(&self) -> bool {
        self.status == ChangeStatus::Completed && self.error_message.is_none()
    }

    /// Completed only because retries were exhausted.
    pub fn is_dead_lettered(&self) -> bool {
        self.status == ChangeStatus::Completed && self.error_message.is_some()
    }

    /// Whether this record came from `client_id`.
    pub fn is_from_client(&self, client_id: &str) -> bool {
        self.client_id.as_deref() == Some(client_id)
    }

    /// `InProgress -> Completed`, clearing any error left by earlier attempts.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ChangeStatus::Completed, now)?;
        self.error_message = None;
        self.next_retry_at = None;
        Ok(())
    }

    /// `InProgress -> Failed`, consuming one retry.
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(ChangeStatus::Failed, now)?;
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_retry_at = Some(now);
        self.next_retry_at = Some(next_retry_at);
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Give up: mark `Completed` while keeping the error on the record.
    pub fn dead_letter(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(ChangeStatus::Completed, now)?;
        self.last_retry_at = Some(now);
        self.next_retry_at = None;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Put the record back in the queue without consuming a retry.
    ///
    /// Works from `InProgress` (via `Failed`) and from `Failed`.
    pub fn requeue(&mut self, message: Option<String>, now: DateTime<Utc>) -> Result<()> {
        if self.status == ChangeStatus::InProgress {
            self.transition(ChangeStatus::Failed, now)?;
        }
        self.transition(ChangeStatus::Pending, now)?;
        if message.is_some() {
            self.error_message = message;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClientRegistration / Subscription / ChangeNotification
// ═══════════════════════════════════════════════════════════════════════════════

/// One installed client instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub client_id: String,
    pub user_id: String,
    /// Free-form client descriptor (device name, app version, ...).
    pub descriptor: String,
    pub registered_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub is_active: bool,
    /// Per entity type last-sync checkpoint.
    pub entity_checkpoints: BTreeMap<String, DateTime<Utc>>,
}

impl ClientRegistration {
    pub fn new(
        client_id: impl Into<String>,
        user_id: impl Into<String>,
        descriptor: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            user_id: user_id.into(),
            descriptor: descriptor.into(),
            registered_at: now,
            last_sync_at: None,
            last_seen_at: now,
            is_active: true,
            entity_checkpoints: BTreeMap::new(),
        }
    }

    /// Checkpoint for one entity type, falling back to the global one.
    pub fn checkpoint_for(&self, entity_type: &str) -> Option<DateTime<Utc>> {
        self.entity_checkpoints
            .get(entity_type)
            .copied()
            .or(self.last_sync_at)
    }
}

/// A client's declared interest in delta notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub client_id: String,
    pub user_id: String,
    /// Entity types of interest; empty means every type.
    pub entity_types: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn covers(&self, entity_type: &str) -> bool {
        self.entity_types.is_empty() || self.entity_types.contains(entity_type)
    }
}

/// One queued fan-out notification for one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub id: String,
    pub client_id: String,
    pub user_id: String,
    pub change_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl ChangeNotification {
    pub fn for_change(client_id: &str, change: &ChangeRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            client_id: client_id.to_string(),
            user_id: change.user_id.clone(),
            change_id: change.id.clone(),
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            operation: change.operation,
            created_at: now,
            delivered_at: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conflict
// ═══════════════════════════════════════════════════════════════════════════════

/// Policy for picking a winner between two conflicting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ClientWins,
    ServerWins,
    #[default]
    LastWriterWins,
    ManualResolution,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::LastWriterWins => "last_writer_wins",
            Self::ManualResolution => "manual_resolution",
        }
    }

    /// Whether the strategy can run without caller input.
    pub fn is_automatic(&self) -> bool {
        !matches!(self, Self::ManualResolution)
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client_wins" => Ok(Self::ClientWins),
            "server_wins" => Ok(Self::ServerWins),
            "last_writer_wins" => Ok(Self::LastWriterWins),
            "manual_resolution" => Ok(Self::ManualResolution),
            other => Err(SyncError::validation(
                "strategy",
                format!("unknown resolution strategy: {other}"),
            )),
        }
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub resolved_data: Vec<u8>,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

/// Two writes to the same entity that could not both apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub client_id: String,
    pub user_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub client_operation: Operation,
    pub client_data: Vec<u8>,
    /// Operation of the record the client's write collided with.
    pub server_operation: Operation,
    pub server_data: Vec<u8>,
    pub client_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    /// Record the client's write collided with.
    pub server_change_id: String,
    pub recommended_strategy: ResolutionStrategy,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub resolution: Option<ConflictResolution>,
}

impl Conflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncConfiguration
// ═══════════════════════════════════════════════════════════════════════════════

/// Per entity type overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeSettings {
    #[serde(default)]
    pub default_strategy: Option<ResolutionStrategy>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_retry_attempts: Option<u32>,
}

/// Per-user tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub user_id: String,
    pub max_retry_attempts: u32,
    /// Backoff unit in seconds: delay = unit * 2^retry_count.
    pub retry_delay_secs: u64,
    pub batch_size: usize,
    pub auto_resolve_conflicts: bool,
    pub default_strategy: ResolutionStrategy,
    #[serde(default)]
    pub entity_overrides: BTreeMap<String, EntityTypeSettings>,
    pub updated_at: DateTime<Utc>,
}

impl SyncConfiguration {
    /// Strategy for one entity type.
    pub fn strategy_for(&self, entity_type: &str) -> ResolutionStrategy {
        self.entity_overrides
            .get(entity_type)
            .and_then(|o| o.default_strategy)
            .unwrap_or(self.default_strategy)
    }

    /// Retry ceiling for one entity type.
    pub fn max_retries_for(&self, entity_type: &str) -> u32 {
        self.entity_overrides
            .get(entity_type)
            .and_then(|o| o.max_retry_attempts)
            .unwrap_or(self.max_retry_attempts)
    }

    /// Batch size for one entity type.
    pub fn batch_size_for(&self, entity_type: &str) -> usize {
        self.entity_overrides
            .get(entity_type)
            .and_then(|o| o.batch_size)
            .unwrap_or(self.batch_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(SyncError::validation("user_id", "must not be empty"));
        }
        if self.max_retry_attempts == 0 {
            return Err(SyncError::validation("max_retry_attempts", "must be at least 1"));
        }
        if self.retry_delay_secs == 0 {
            return Err(SyncError::validation("retry_delay_secs", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(SyncError::validation("batch_size", "must be at least 1"));
        }
        for (entity_type, overrides) in &self.entity_overrides {
            if overrides.batch_size == Some(0) {
                return Err(SyncError::validation(
                    format!("entity_overrides.{entity_type}.batch_size"),
                    "must be at least 1",
                ));
            }
            if overrides.max_retry_attempts == Some(0) {
                return Err(SyncError::validation(
                    format!("entity_overrides.{entity_type}.max_retry_attempts"),
                    "must be at least 1",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_millis;

    fn ts(ms: i64) -> DateTime<Utc> {
        from_millis(ms).unwrap()
    }

    fn record(status: ChangeStatus) -> ChangeRecord {
        ChangeRecord::new(
            "task",
            "t-1",
            Operation::Update,
            b"{\"title\":\"x\"}".to_vec(),
            Some("client-a".into()),
            "user-1",
            ts(1_000),
            ts(2_000),
            status,
        )
    }

    #[test]
    fn test_status_transitions() {
        use ChangeStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Completed));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(InProgress));
    }

    #[test]
    fn test_transition_updates_modified_at() {
        let mut r = record(ChangeStatus::Pending);
        r.transition(ChangeStatus::InProgress, ts(5_000)).unwrap();
        assert_eq!(r.status, ChangeStatus::InProgress);
        assert_eq!(r.modified_at, ts(5_000));
    }

    #[test]
    fn test_completed_is_immutable() {
        let mut r = record(ChangeStatus::Completed);
        let err = r.transition(ChangeStatus::Pending, ts(5_000)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState { .. }));
        assert_eq!(r.status, ChangeStatus::Completed);
    }

    #[test]
    fn test_failure_then_requeue_then_complete() {
        let mut r = record(ChangeStatus::Pending);
        r.transition(ChangeStatus::InProgress, ts(3_000)).unwrap();
        r.record_failure("timeout", ts(63_000), ts(3_000)).unwrap();
        assert_eq!(r.status, ChangeStatus::Failed);
        assert_eq!(r.retry_count, 1);
        assert_eq!(r.next_retry_at, Some(ts(63_000)));
        assert_eq!(r.error_message.as_deref(), Some("timeout"));

        r.requeue(None, ts(4_000)).unwrap();
        assert_eq!(r.status, ChangeStatus::Pending);
        assert_eq!(r.retry_count, 1);

        r.transition(ChangeStatus::InProgress, ts(5_000)).unwrap();
        r.complete(ts(5_000)).unwrap();
        assert!(r.is_committed());
        assert!(r.next_retry_at.is_none());
    }

    #[test]
    fn test_requeue_from_in_progress_keeps_retry_count() {
        let mut r = record(ChangeStatus::Pending);
        r.transition(ChangeStatus::InProgress, ts(3_000)).unwrap();
        r.requeue(Some("circuit open".into()), ts(3_000)).unwrap();
        assert_eq!(r.status, ChangeStatus::Pending);
        assert_eq!(r.retry_count, 0);
        assert_eq!(r.error_message.as_deref(), Some("circuit open"));
    }

    #[test]
    fn test_dead_letter_keeps_error() {
        let mut r = record(ChangeStatus::Pending);
        r.transition(ChangeStatus::InProgress, ts(3_000)).unwrap();
        r.dead_letter("gave up", ts(3_000)).unwrap();
        assert!(r.is_dead_lettered());
        assert!(!r.is_committed());

        let mut done = record(ChangeStatus::Completed);
        assert!(done.dead_letter("nope", ts(3_000)).is_err());
    }

    #[test]
    fn test_content_hash_matches_data() {
        let r = record(ChangeStatus::Pending);
        assert_eq!(r.content_hash, content_hash(&r.data));
        assert_eq!(r.content_hash.len(), 64);
    }

    #[test]
    fn test_dead_lettered_vs_committed() {
        let mut r = record(ChangeStatus::Completed);
        assert!(r.is_committed());
        assert!(!r.is_dead_lettered());
        r.error_message = Some("gave up".into());
        assert!(!r.is_committed());
        assert!(r.is_dead_lettered());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in [
            ChangeStatus::Pending,
            ChangeStatus::InProgress,
            ChangeStatus::Completed,
            ChangeStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<ChangeStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<ChangeStatus>().is_err());
    }

    #[test]
    fn test_strategy_parse_rejects_unknown() {
        assert_eq!(
            "last_writer_wins".parse::<ResolutionStrategy>().unwrap(),
            ResolutionStrategy::LastWriterWins
        );
        let err = "coin_flip".parse::<ResolutionStrategy>().unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_manual_is_not_automatic() {
        assert!(!ResolutionStrategy::ManualResolution.is_automatic());
        assert!(ResolutionStrategy::ClientWins.is_automatic());
    }

    #[test]
    fn test_subscription_covers() {
        let mut sub = Subscription {
            client_id: "c".into(),
            user_id: "u".into(),
            entity_types: BTreeSet::new(),
            created_at: ts(0),
            updated_at: ts(0),
        };
        assert!(sub.covers("task"));
        sub.entity_types.insert("project".into());
        assert!(!sub.covers("task"));
        assert!(sub.covers("project"));
    }

    #[test]
    fn test_checkpoint_falls_back_to_global() {
        let mut client = ClientRegistration::new("c", "u", "phone", ts(0));
        assert_eq!(client.checkpoint_for("task"), None);
        client.last_sync_at = Some(ts(10));
        assert_eq!(client.checkpoint_for("task"), Some(ts(10)));
        client.entity_checkpoints.insert("task".into(), ts(20));
        assert_eq!(client.checkpoint_for("task"), Some(ts(20)));
    }

    fn config() -> SyncConfiguration {
        SyncConfiguration {
            user_id: "u".into(),
            max_retry_attempts: 5,
            retry_delay_secs: 60,
            batch_size: 100,
            auto_resolve_conflicts: false,
            default_strategy: ResolutionStrategy::LastWriterWins,
            entity_overrides: BTreeMap::new(),
            updated_at: ts(0),
        }
    }

    #[test]
    fn test_entity_overrides() {
        let mut cfg = config();
        cfg.entity_overrides.insert(
            "file".into(),
            EntityTypeSettings {
                default_strategy: Some(ResolutionStrategy::ServerWins),
                batch_size: Some(10),
                max_retry_attempts: Some(2),
            },
        );
        assert_eq!(cfg.strategy_for("file"), ResolutionStrategy::ServerWins);
        assert_eq!(cfg.strategy_for("task"), ResolutionStrategy::LastWriterWins);
        assert_eq!(cfg.batch_size_for("file"), 10);
        assert_eq!(cfg.max_retries_for("file"), 2);
        assert_eq!(cfg.max_retries_for("task"), 5);
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut cfg = config();
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.retry_delay_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.entity_overrides.insert(
            "task".into(),
            EntityTypeSettings {
                batch_size: Some(0),
                ..Default::default()
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("entity_overrides.task.batch_size"));
    }
}

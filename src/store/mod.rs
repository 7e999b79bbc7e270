// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change Record Store.
//!
//! Durable home of change records, conflicts, client registrations, per-user
//! configuration, subscriptions and queued notifications. Only the
//! coordinator and the background processor mutate records through it.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: `RwLock`-guarded maps, for tests and embedded use.
//! - [`SqliteStore`]: WAL-mode SQLite via `sqlx`, with busy/locked retry.
//!
//! # Ordering
//!
//! Every list of change records is ordered by `(created_at, id)` ascending.
//! That pair is also the keyset the delta feed pages on, so both stores must
//! agree on it exactly.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

use crate::error::Result;
use crate::model::{
    ChangeNotification, ChangeRecord, ClientRegistration, Conflict, Subscription,
    SyncConfiguration,
};

/// Type alias for boxed store futures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Filter for one delta feed page.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaQuery {
    pub entity_type: String,
    /// Restrict to one owning user.
    pub user_id: Option<String>,
    /// Restrict to these entities; empty means all.
    pub entity_ids: Vec<String>,
    /// Inclusive lower bound on `created_at` (a client checkpoint).
    pub since: Option<DateTime<Utc>>,
    /// Exclusive keyset position `(created_at, id)` from a continuation token.
    pub after: Option<(DateTime<Utc>, String)>,
    pub limit: usize,
}

impl DeltaQuery {
    /// Whether a committed record belongs on this page (ignoring `limit`).
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        if !record.is_committed() || record.entity_type != self.entity_type {
            return false;
        }
        if let Some(user_id) = &self.user_id {
            if &record.user_id != user_id {
                return false;
            }
        }
        if !self.entity_ids.is_empty() && !self.entity_ids.contains(&record.entity_id) {
            return false;
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some((at, id)) = &self.after {
            if (record.created_at, record.id.as_str()) <= (*at, id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Per-client aggregate for sync status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientChangeSummary {
    /// Records not yet `Completed`.
    pub pending: u64,
    /// Not-yet-completed records that have failed at least once.
    pub failed: u64,
    /// Records dead-lettered after exhausting retries.
    pub dead_lettered: u64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Persistence operations the engine needs.
///
/// Implementations must make each single-record write atomic; no
/// cross-record transactions are assumed.
pub trait SyncStore: Send + Sync + 'static {
    // ── change records ─────────────────────────────────────────────────────

    fn insert_change<'a>(&'a self, change: &'a ChangeRecord) -> BoxFuture<'a, ()>;

    /// Overwrite an existing record by id.
    fn update_change<'a>(&'a self, change: &'a ChangeRecord) -> BoxFuture<'a, ()>;

    fn get_change<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<ChangeRecord>>;

    /// Most recent committed (completed, not dead-lettered) record for an entity.
    fn latest_committed_change<'a>(
        &'a self,
        entity_type: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Option<ChangeRecord>>;

    /// Committed changes for a user created at or after `since` by
    /// anyone other than `exclude_client`. Server-originated records are
    /// always included.
    fn completed_changes_since<'a>(
        &'a self,
        user_id: &'a str,
        exclude_client: &'a str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>>;

    fn delta_changes<'a>(&'a self, query: &'a DeltaQuery) -> BoxFuture<'a, Vec<ChangeRecord>>;

    /// `Pending` records whose backoff has elapsed, oldest first.
    fn due_changes<'a>(
        &'a self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>>;

    /// `Failed` records last modified at or before `cooldown_cutoff`.
    fn failed_changes<'a>(
        &'a self,
        cooldown_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>>;

    /// `InProgress` records last modified at or before `cutoff`.
    fn stale_in_progress<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>>;

    fn client_change_summary<'a>(&'a self, client_id: &'a str)
        -> BoxFuture<'a, ClientChangeSummary>;

    /// Delete up to `limit` completed records last modified before `cutoff`.
    fn purge_completed_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, u64>;

    // ── conflicts ──────────────────────────────────────────────────────────

    fn insert_conflict<'a>(&'a self, conflict: &'a Conflict) -> BoxFuture<'a, ()>;

    fn update_conflict<'a>(&'a self, conflict: &'a Conflict) -> BoxFuture<'a, ()>;

    fn get_conflict<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<Conflict>>;

    /// Unresolved conflicts for a user, optionally narrowed to one client,
    /// oldest first.
    fn unresolved_conflicts<'a>(
        &'a self,
        user_id: &'a str,
        client_id: Option<&'a str>,
    ) -> BoxFuture<'a, Vec<Conflict>>;

    fn unresolved_conflict_for<'a>(
        &'a self,
        client_id: &'a str,
        entity_type: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Option<Conflict>>;

    fn purge_resolved_conflicts_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, u64>;

    // ── clients ────────────────────────────────────────────────────────────

    fn get_client<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Option<ClientRegistration>>;

    fn upsert_client<'a>(&'a self, client: &'a ClientRegistration) -> BoxFuture<'a, ()>;

    fn clients_for_user<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Vec<ClientRegistration>>;

    // ── configuration ──────────────────────────────────────────────────────

    fn get_configuration<'a>(&'a self, user_id: &'a str)
        -> BoxFuture<'a, Option<SyncConfiguration>>;

    fn put_configuration<'a>(&'a self, config: &'a SyncConfiguration) -> BoxFuture<'a, ()>;

    // ── subscriptions ──────────────────────────────────────────────────────

    fn get_subscription<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Option<Subscription>>;

    fn put_subscription<'a>(&'a self, subscription: &'a Subscription) -> BoxFuture<'a, ()>;

    /// Returns whether a subscription existed.
    fn delete_subscription<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, bool>;

    fn subscriptions_for_user<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Vec<Subscription>>;

    // ── notifications ──────────────────────────────────────────────────────

    fn insert_notifications<'a>(
        &'a self,
        notifications: &'a [ChangeNotification],
    ) -> BoxFuture<'a, ()>;

    /// Undelivered notifications for a client, oldest first.
    fn undelivered_notifications<'a>(
        &'a self,
        client_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeNotification>>;

    /// Mark the given notifications of `client_id` delivered. Ids belonging
    /// to other clients are ignored.
    fn mark_notifications_delivered<'a>(
        &'a self,
        client_id: &'a str,
        ids: &'a [String],
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, u64>;

    fn purge_delivered_notifications_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, u64>;
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory store.
//!
//! A single `RwLock` guards all maps, so every method is atomic with respect
//! to every other. Nothing survives a restart.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{BoxFuture, ClientChangeSummary, DeltaQuery, SyncStore};
use crate::error::SyncError;
use crate::model::{
    ChangeNotification, ChangeRecord, ChangeStatus, ClientRegistration, Conflict, Subscription,
    SyncConfiguration,
};

#[derive(Default)]
struct State {
    changes: HashMap<String, ChangeRecord>,
    conflicts: HashMap<String, Conflict>,
    clients: HashMap<String, ClientRegistration>,
    configurations: HashMap<String, SyncConfiguration>,
    subscriptions: HashMap<String, Subscription>,
    notifications: HashMap<String, ChangeNotification>,
}

impl State {
    /// Change records matching `pred`, ordered by `(created_at, id)`.
    fn changes_where<F>(&self, limit: usize, pred: F) -> Vec<ChangeRecord>
    where
        F: Fn(&ChangeRecord) -> bool,
    {
        let mut out: Vec<&ChangeRecord> = self.changes.values().filter(|r| pred(r)).collect();
        out.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        out.into_iter().take(limit).cloned().collect()
    }
}

/// `SyncStore` backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of change records held (for tests and diagnostics).
    pub async fn change_count(&self) -> usize {
        self.state.read().await.changes.len()
    }
}

impl SyncStore for MemoryStore {
    fn insert_change<'a>(&'a self, change: &'a ChangeRecord) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.changes.contains_key(&change.id) {
                return Err(SyncError::Internal(format!(
                    "duplicate change record id: {}",
                    change.id
                )));
            }
            state.changes.insert(change.id.clone(), change.clone());
            Ok(())
        })
    }

    fn update_change<'a>(&'a self, change: &'a ChangeRecord) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.changes.get_mut(&change.id) {
                Some(existing) => {
                    *existing = change.clone();
                    Ok(())
                }
                None => Err(SyncError::not_found("change record", &change.id)),
            }
        })
    }

    fn get_change<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<ChangeRecord>> {
        Box::pin(async move { Ok(self.state.read().await.changes.get(id).cloned()) })
    }

    fn latest_committed_change<'a>(
        &'a self,
        entity_type: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Option<ChangeRecord>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .changes
                .values()
                .filter(|r| {
                    r.is_committed() && r.entity_type == entity_type && r.entity_id == entity_id
                })
                .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
                .cloned())
        })
    }

    fn completed_changes_since<'a>(
        &'a self,
        user_id: &'a str,
        exclude_client: &'a str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.changes_where(limit, |r| {
                r.is_committed()
                    && r.user_id == user_id
                    && !r.is_from_client(exclude_client)
                    && since.map_or(true, |s| r.created_at >= s)
            }))
        })
    }

    fn delta_changes<'a>(&'a self, query: &'a DeltaQuery) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.changes_where(query.limit, |r| query.matches(r)))
        })
    }

    fn due_changes<'a>(
        &'a self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.changes_where(limit, |r| {
                r.status == ChangeStatus::Pending && r.next_retry_at.map_or(true, |t| t <= now)
            }))
        })
    }

    fn failed_changes<'a>(
        &'a self,
        cooldown_cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.changes_where(limit, |r| {
                r.status == ChangeStatus::Failed && r.modified_at <= cooldown_cutoff
            }))
        })
    }

    fn stale_in_progress<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeRecord>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state.changes_where(limit, |r| {
                r.status == ChangeStatus::InProgress && r.modified_at <= cutoff
            }))
        })
    }

    fn client_change_summary<'a>(
        &'a self,
        client_id: &'a str,
    ) -> BoxFuture<'a, ClientChangeSummary> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut summary = ClientChangeSummary::default();
            for r in state.changes.values().filter(|r| r.is_from_client(client_id)) {
                if r.status != ChangeStatus::Completed {
                    summary.pending += 1;
                    if r.retry_count > 0 {
                        summary.failed += 1;
                    }
                } else if r.is_dead_lettered() {
                    summary.dead_lettered += 1;
                } else if summary.last_completed_at.map_or(true, |t| r.modified_at > t) {
                    summary.last_completed_at = Some(r.modified_at);
                }
            }
            Ok(summary)
        })
    }

    fn purge_completed_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut victims: Vec<(DateTime<Utc>, String)> = state
                .changes
                .values()
                .filter(|r| r.status == ChangeStatus::Completed && r.modified_at < cutoff)
                .map(|r| (r.modified_at, r.id.clone()))
                .collect();
            victims.sort();
            victims.truncate(limit);
            for (_, id) in &victims {
                state.changes.remove(id);
            }
            Ok(victims.len() as u64)
        })
    }

    fn insert_conflict<'a>(&'a self, conflict: &'a Conflict) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.conflicts.contains_key(&conflict.id) {
                return Err(SyncError::Internal(format!(
                    "duplicate conflict id: {}",
                    conflict.id
                )));
            }
            state.conflicts.insert(conflict.id.clone(), conflict.clone());
            Ok(())
        })
    }

    fn update_conflict<'a>(&'a self, conflict: &'a Conflict) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            match state.conflicts.get_mut(&conflict.id) {
                Some(existing) => {
                    *existing = conflict.clone();
                    Ok(())
                }
                None => Err(SyncError::not_found("conflict", &conflict.id)),
            }
        })
    }

    fn get_conflict<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Option<Conflict>> {
        Box::pin(async move { Ok(self.state.read().await.conflicts.get(id).cloned()) })
    }

    fn unresolved_conflicts<'a>(
        &'a self,
        user_id: &'a str,
        client_id: Option<&'a str>,
    ) -> BoxFuture<'a, Vec<Conflict>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut out: Vec<Conflict> = state
                .conflicts
                .values()
                .filter(|c| {
                    !c.is_resolved()
                        && c.user_id == user_id
                        && client_id.map_or(true, |id| c.client_id == id)
                })
                .cloned()
                .collect();
            out.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            Ok(out)
        })
    }

    fn unresolved_conflict_for<'a>(
        &'a self,
        client_id: &'a str,
        entity_type: &'a str,
        entity_id: &'a str,
    ) -> BoxFuture<'a, Option<Conflict>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .conflicts
                .values()
                .find(|c| {
                    !c.is_resolved()
                        && c.client_id == client_id
                        && c.entity_type == entity_type
                        && c.entity_id == entity_id
                })
                .cloned())
        })
    }

    fn purge_resolved_conflicts_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut victims: Vec<(DateTime<Utc>, String)> = state
                .conflicts
                .values()
                .filter_map(|c| {
                    c.resolution
                        .as_ref()
                        .filter(|r| r.resolved_at < cutoff)
                        .map(|r| (r.resolved_at, c.id.clone()))
                })
                .collect();
            victims.sort();
            victims.truncate(limit);
            for (_, id) in &victims {
                state.conflicts.remove(id);
            }
            Ok(victims.len() as u64)
        })
    }

    fn get_client<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Option<ClientRegistration>> {
        Box::pin(async move { Ok(self.state.read().await.clients.get(client_id).cloned()) })
    }

    fn upsert_client<'a>(&'a self, client: &'a ClientRegistration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .write()
                .await
                .clients
                .insert(client.client_id.clone(), client.clone());
            Ok(())
        })
    }

    fn clients_for_user<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Vec<ClientRegistration>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut out: Vec<ClientRegistration> = state
                .clients
                .values()
                .filter(|c| c.user_id == user_id)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
            Ok(out)
        })
    }

    fn get_configuration<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Option<SyncConfiguration>> {
        Box::pin(async move { Ok(self.state.read().await.configurations.get(user_id).cloned()) })
    }

    fn put_configuration<'a>(&'a self, config: &'a SyncConfiguration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .write()
                .await
                .configurations
                .insert(config.user_id.clone(), config.clone());
            Ok(())
        })
    }

    fn get_subscription<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Option<Subscription>> {
        Box::pin(async move { Ok(self.state.read().await.subscriptions.get(client_id).cloned()) })
    }

    fn put_subscription<'a>(&'a self, subscription: &'a Subscription) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .write()
                .await
                .subscriptions
                .insert(subscription.client_id.clone(), subscription.clone());
            Ok(())
        })
    }

    fn delete_subscription<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .state
                .write()
                .await
                .subscriptions
                .remove(client_id)
                .is_some())
        })
    }

    fn subscriptions_for_user<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Vec<Subscription>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut out: Vec<Subscription> = state
                .subscriptions
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.client_id.cmp(&b.client_id));
            Ok(out)
        })
    }

    fn insert_notifications<'a>(
        &'a self,
        notifications: &'a [ChangeNotification],
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            for n in notifications {
                state.notifications.insert(n.id.clone(), n.clone());
            }
            Ok(())
        })
    }

    fn undelivered_notifications<'a>(
        &'a self,
        client_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Vec<ChangeNotification>> {
        Box::pin(async move {
            let state = self.state.read().await;
            let mut out: Vec<ChangeNotification> = state
                .notifications
                .values()
                .filter(|n| n.client_id == client_id && n.delivered_at.is_none())
                .cloned()
                .collect();
            out.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            out.truncate(limit);
            Ok(out)
        })
    }

    fn mark_notifications_delivered<'a>(
        &'a self,
        client_id: &'a str,
        ids: &'a [String],
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut marked = 0;
            for id in ids {
                if let Some(n) = state.notifications.get_mut(id) {
                    if n.client_id == client_id && n.delivered_at.is_none() {
                        n.delivered_at = Some(at);
                        marked += 1;
                    }
                }
            }
            Ok(marked)
        })
    }

    fn purge_delivered_notifications_before<'a>(
        &'a self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut victims: Vec<(DateTime<Utc>, String)> = state
                .notifications
                .values()
                .filter_map(|n| {
                    n.delivered_at
                        .filter(|d| *d < cutoff)
                        .map(|d| (d, n.id.clone()))
                })
                .collect();
            victims.sort();
            victims.truncate(limit);
            for (_, id) in &victims {
                state.notifications.remove(id);
            }
            Ok(victims.len() as u64)
        })
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client registry, subscriptions and notification fan-out.
//!
//! Tracks every installed client: who owns it, when it last synced, when it
//! was last seen, and a per-entity-type checkpoint map. "Active" means seen
//! within [`RegistryConfig::active_window`], regardless of sync success.
//!
//! Fan-out is scoped by subscription: a committed change queues one
//! [`ChangeNotification`] for every other active client of the owning user
//! whose subscription covers the entity type. A client with no subscription
//! receives nothing.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::minus;
use crate::config::RegistryConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::model::{new_id, ChangeNotification, ChangeRecord, ClientRegistration, Subscription};
use crate::store::SyncStore;

/// Client registry over the shared store.
#[derive(Clone)]
pub struct ClientRegistry {
    store: Arc<dyn SyncStore>,
    config: RegistryConfig,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn SyncStore>, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    /// Register a brand-new client and return it with a fresh id.
    pub async fn register_client(
        &self,
        descriptor: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientRegistration> {
        require("user_id", user_id)?;
        let client = ClientRegistration::new(new_id(), user_id, descriptor, now);
        self.store.upsert_client(&client).await?;
        info!(client_id = %client.client_id, user_id, "Client registered");
        Ok(client)
    }

    /// Fetch a client, creating it on first contact.
    ///
    /// Fails with [`SyncError::ClientOwnership`] if the id is registered to
    /// another user. A known client is returned unchanged.
    pub async fn ensure_client_exists(
        &self,
        client_id: &str,
        user_id: &str,
        descriptor: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ClientRegistration> {
        require("client_id", client_id)?;
        require("user_id", user_id)?;

        match self.store.get_client(client_id).await? {
            Some(client) if client.user_id != user_id => Err(SyncError::ClientOwnership {
                client_id: client_id.to_string(),
                user_id: user_id.to_string(),
            }),
            Some(client) => Ok(client),
            None => {
                let client =
                    ClientRegistration::new(client_id, user_id, descriptor.unwrap_or_default(), now);
                self.store.upsert_client(&client).await?;
                info!(client_id, user_id, "Client auto-registered on first contact");
                Ok(client)
            }
        }
    }

    /// Record that the client was seen.
    pub async fn update_last_seen(
        &self,
        client_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClientRegistration> {
        let mut client = self.owned_client(client_id, user_id).await?;
        client.last_seen_at = now;
        client.is_active = true;
        self.store.upsert_client(&client).await?;
        Ok(client)
    }

    /// Close a sync round: advance the global checkpoint and the checkpoints
    /// of every entity type exchanged.
    ///
    /// `seen_at` is the round's clock reading; the checkpoint may lag it.
    pub async fn record_sync(
        &self,
        mut client: ClientRegistration,
        checkpoint: DateTime<Utc>,
        seen_at: DateTime<Utc>,
        entity_types: &BTreeSet<String>,
    ) -> Result<ClientRegistration> {
        client.last_sync_at = Some(checkpoint);
        client.last_seen_at = client.last_seen_at.max(seen_at);
        client.is_active = true;
        for entity_type in entity_types {
            client
                .entity_checkpoints
                .insert(entity_type.clone(), checkpoint);
        }
        self.store.upsert_client(&client).await?;
        Ok(client)
    }

    /// Advance one entity type's checkpoint, e.g. after draining a delta feed.
    ///
    /// Checkpoints never move backwards.
    pub async fn update_entity_checkpoint(
        &self,
        client_id: &str,
        user_id: &str,
        entity_type: &str,
        at: DateTime<Utc>,
    ) -> Result<ClientRegistration> {
        require("entity_type", entity_type)?;
        let mut client = self.owned_client(client_id, user_id).await?;
        let slot = client
            .entity_checkpoints
            .entry(entity_type.to_string())
            .or_insert(at);
        if *slot < at {
            *slot = at;
        }
        self.store.upsert_client(&client).await?;
        Ok(client)
    }

    /// Clients of `user_id` seen within the active window.
    pub async fn get_active_clients(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClientRegistration>> {
        let cutoff = minus(now, self.config.active_window_duration());
        let clients = self.store.clients_for_user(user_id).await?;
        Ok(clients
            .into_iter()
            .filter(|c| c.is_active && c.last_seen_at >= cutoff)
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════

    /// Add entity types to the client's subscription. An empty list
    /// subscribes to every type.
    pub async fn subscribe(
        &self,
        client_id: &str,
        user_id: &str,
        entity_types: &[String],
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        self.owned_client(client_id, user_id).await?;
        if entity_types.iter().any(|t| t.trim().is_empty()) {
            return Err(SyncError::validation("entity_types", "must not contain empty names"));
        }

        let subscription = match self.store.get_subscription(client_id).await? {
            Some(mut existing) => {
                if entity_types.is_empty() {
                    existing.entity_types.clear();
                } else if !existing.entity_types.is_empty() {
                    existing.entity_types.extend(entity_types.iter().cloned());
                }
                existing.updated_at = now;
                existing
            }
            None => Subscription {
                client_id: client_id.to_string(),
                user_id: user_id.to_string(),
                entity_types: entity_types.iter().cloned().collect(),
                created_at: now,
                updated_at: now,
            },
        };
        self.store.put_subscription(&subscription).await?;
        debug!(client_id, types = ?subscription.entity_types, "Subscription updated");
        Ok(subscription)
    }

    /// Remove entity types from the client's subscription. An empty list
    /// removes the subscription entirely, as does removing the last type.
    ///
    /// Returns whether anything changed.
    pub async fn unsubscribe(
        &self,
        client_id: &str,
        user_id: &str,
        entity_types: &[String],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.owned_client(client_id, user_id).await?;
        let Some(mut subscription) = self.store.get_subscription(client_id).await? else {
            return Ok(false);
        };

        if entity_types.is_empty() {
            return self.store.delete_subscription(client_id).await;
        }
        if subscription.entity_types.is_empty() {
            return Err(SyncError::validation(
                "entity_types",
                "subscription covers every entity type; unsubscribe entirely or resubscribe with an explicit list",
            ));
        }

        let before = subscription.entity_types.len();
        for entity_type in entity_types {
            subscription.entity_types.remove(entity_type);
        }
        if subscription.entity_types.len() == before {
            return Ok(false);
        }
        if subscription.entity_types.is_empty() {
            return self.store.delete_subscription(client_id).await;
        }
        subscription.updated_at = now;
        self.store.put_subscription(&subscription).await?;
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fan-out
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue notifications of `change` for interested clients.
    ///
    /// Returns the number queued.
    pub async fn fan_out(&self, change: &ChangeRecord, now: DateTime<Utc>) -> Result<usize> {
        let active = self.get_active_clients(&change.user_id, now).await?;
        if active.is_empty() {
            return Ok(0);
        }
        let subscriptions = self.store.subscriptions_for_user(&change.user_id).await?;

        let notifications: Vec<_> = active
            .iter()
            .filter(|c| !change.is_from_client(&c.client_id))
            .filter(|c| {
                subscriptions
                    .iter()
                    .any(|s| s.client_id == c.client_id && s.covers(&change.entity_type))
            })
            .map(|c| ChangeNotification::for_change(&c.client_id, change, now))
            .collect();

        if !notifications.is_empty() {
            self.store.insert_notifications(&notifications).await?;
            metrics::record_notifications_queued(notifications.len());
            debug!(
                change_id = %change.id,
                entity_type = %change.entity_type,
                recipients = notifications.len(),
                "Change fanned out"
            );
        }
        Ok(notifications.len())
    }

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
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SyncError::validation(field, "must not be empty"));
    }
    Ok(())
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict detection and strategy-based resolution.
//!
//! # Detection
//!
//! An incoming change conflicts when its entity already has a committed
//! change from a *different* origin whose declared timestamp is not strictly
//! older than the incoming one:
//!
//! ```text
//! existing.client != incoming.client  &&  existing.changed_at >= incoming.changed_at
//! ```
//!
//! Server-originated records (no client) count as a different origin. The
//! model is whole-entity: two writes touching disjoint fields still conflict.
//!
//! # Resolution
//!
//! | Strategy | Winner |
//! |----------|--------|
//! | `ClientWins` | client data, always |
//! | `ServerWins` | server data, always |
//! | `LastWriterWins` | later timestamp; a tie keeps the server's data |
//! | `ManualResolution` | caller-supplied data, else server data |
//!
//! These are pure functions; persisting and applying the outcome is the
//! coordinator's job.

use chrono::{DateTime, Utc};

use crate::model::{new_id, ChangeRecord, Conflict, Operation, ResolutionStrategy};

/// Resolver identity recorded for automatic resolutions.
pub const AUTO_RESOLVER: &str = "system:auto";

/// Where the resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSide {
    Client,
    Server,
    /// Caller-supplied data (manual resolution).
    Supplied,
}

/// Outcome of applying a strategy to a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub strategy: ResolutionStrategy,
    pub side: ResolvedSide,
    /// Operation to apply for the winning value.
    pub operation: Operation,
    pub data: Vec<u8>,
}

impl Resolved {
    /// Whether the server already holds the winning value.
    pub fn keeps_server_state(&self) -> bool {
        self.side == ResolvedSide::Server
    }
}

/// Check an incoming change against the entity's latest committed change.
///
/// Returns a human-readable reason when the two conflict.
pub fn detect_conflict(incoming: &ChangeRecord, existing: Option<&ChangeRecord>) -> Option<String> {
    let existing = existing.filter(|e| e.is_committed())?;
    if existing.entity_type != incoming.entity_type || existing.entity_id != incoming.entity_id {
        return None;
    }
    if let Some(client_id) = incoming.client_id.as_deref() {
        if existing.is_from_client(client_id) {
            return None;
        }
    }
    if existing.changed_at < incoming.changed_at {
        return None;
    }

    let origin = existing.client_id.as_deref().unwrap_or("server");
    Some(format!(
        "{}/{} was changed by {} at {} (operation {}), not older than the submitted change at {}",
        existing.entity_type,
        existing.entity_id,
        origin,
        existing.changed_at.to_rfc3339(),
        existing.operation,
        incoming.changed_at.to_rfc3339(),
    ))
}

/// Build a conflict record for a rejected incoming change.
pub fn build_conflict(
    incoming: &ChangeRecord,
    existing: &ChangeRecord,
    recommended: ResolutionStrategy,
    reason: String,
    now: DateTime<Utc>,
) -> Conflict {
    Conflict {
        id: new_id(),
        client_id: incoming.client_id.clone().unwrap_or_default(),
        user_id: incoming.user_id.clone(),
        entity_type: incoming.entity_type.clone(),
        entity_id: incoming.entity_id.clone(),
        client_operation: incoming.operation,
        client_data: incoming.data.clone(),
        server_operation: existing.operation,
        server_data: existing.data.clone(),
        client_timestamp: incoming.changed_at,
        server_timestamp: existing.changed_at,
        server_change_id: existing.id.clone(),
        recommended_strategy: recommended,
        reason,
        created_at: now,
        resolution: None,
    }
}

/// Refresh an unresolved conflict with a newer submission for the same entity.
pub fn refresh_conflict(conflict: &mut Conflict, fresh: Conflict) {
    conflict.client_operation = fresh.client_operation;
    conflict.client_data = fresh.client_data;
    conflict.server_operation = fresh.server_operation;
    conflict.server_data = fresh.server_data;
    conflict.client_timestamp = fresh.client_timestamp;
    conflict.server_timestamp = fresh.server_timestamp;
    conflict.server_change_id = fresh.server_change_id;
    conflict.recommended_strategy = fresh.recommended_strategy;
    conflict.reason = fresh.reason;
}

/// Apply `strategy` to a conflict.
///
/// `supplied` is only consulted for `ManualResolution`.
pub fn resolve(
    conflict: &Conflict,
    strategy: ResolutionStrategy,
    supplied: Option<Vec<u8>>,
) -> Resolved {
    let client = || Resolved {
        strategy,
        side: ResolvedSide::Client,
        operation: conflict.client_operation,
        data: conflict.client_data.clone(),
    };
    let server = || Resolved {
        strategy,
        side: ResolvedSide::Server,
        operation: conflict.server_operation,
        data: conflict.server_data.clone(),
    };

    match strategy {
        ResolutionStrategy::ClientWins => client(),
        ResolutionStrategy::ServerWins => server(),
        ResolutionStrategy::LastWriterWins => {
            if conflict.client_timestamp > conflict.server_timestamp {
                client()
            } else {
                server()
            }
        }
        ResolutionStrategy::ManualResolution => match supplied {
            Some(data) => Resolved {
                strategy,
                side: ResolvedSide::Supplied,
                operation: Operation::Update,
                data,
            },
            None => server(),
        },
    }
}

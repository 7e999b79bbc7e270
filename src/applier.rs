// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain applier integration.
//!
//! The engine never interprets payloads. Committing a change to the actual
//! domain tables (tasks, projects, files, ...) is delegated to an
//! [`EntityApplier`] supplied by the host application.
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync_engine::applier::{ApplyFuture, ApplyError, EntityApplier};
//! use offline_sync_engine::model::ChangeRecord;
//!
//! struct TaskTable;
//!
//! impl EntityApplier for TaskTable {
//!     fn apply_entity_change<'a>(&'a self, change: &'a ChangeRecord) -> ApplyFuture<'a, ()> {
//!         Box::pin(async move {
//!             if change.data.is_empty() {
//!                 return Err(ApplyError::permanent("empty payload"));
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

use crate::error::SyncError;
use crate::model::ChangeRecord;

/// Result type for applier operations.
pub type ApplyResult<T> = std::result::Result<T, ApplyError>;

/// Type alias for boxed applier futures.
pub type ApplyFuture<'a, T> = Pin<Box<dyn Future<Output = ApplyResult<T>> + Send + 'a>>;

/// Failure reported by a domain applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyError {
    pub message: String,
    /// Whether a later attempt could succeed.
    pub retryable: bool,
}

impl ApplyError {
    /// A failure worth retrying (timeouts, lock contention).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that will never succeed for this payload.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Attach entity context, producing an engine error.
    pub fn into_sync_error(self, change: &ChangeRecord) -> SyncError {
        SyncError::Apply {
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
            message: self.message,
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApplyError {}

/// What the engine needs from the host's domain layer.
///
/// Implementations must be idempotent for a given record id: the background
/// processor may re-run a change whose previous attempt was interrupted.
pub trait EntityApplier: Send + Sync + 'static {
    /// Reject a change before it is attempted.
    ///
    /// Default implementation accepts everything.
    fn validate_entity_change<'a>(&'a self, _change: &'a ChangeRecord) -> ApplyFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Commit a change to the domain store.
    fn apply_entity_change<'a>(&'a self, change: &'a ChangeRecord) -> ApplyFuture<'a, ()>;

    /// Whether the entity already holds content with this hash.
    ///
    /// Lets the processor skip re-applying a change that landed before a
    /// crash. Default: never current.
    fn is_current<'a>(
        &'a self,
        _entity_type: &'a str,
        _entity_id: &'a str,
        _content_hash: &'a str,
    ) -> ApplyFuture<'a, bool> {
        Box::pin(async { Ok(false) })
    }
}

/// Applier that accepts everything and stores nothing.
#[derive(Clone, Debug, Default)]
pub struct NoOpApplier;

impl EntityApplier for NoOpApplier {
    fn apply_entity_change<'a>(&'a self, change: &'a ChangeRecord) -> ApplyFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!(
                change_id = %change.id,
                entity_type = %change.entity_type,
                entity_id = %change.entity_id,
                operation = %change.operation,
                len = change.data.len(),
                "NoOp: would apply change"
            );
            Ok(())
        })
    }
}

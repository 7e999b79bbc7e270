// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! Errors are categorized by how the caller is expected to react. A detected
//! conflict is **not** an error: it is a first-class result of
//! [`process_sync_request`](crate::coordinator::SyncCoordinator::process_sync_request).
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Validation` | No | Malformed request field, rejected before anything is persisted |
//! | `ClientOwnership` | No | Client id is registered to a different user |
//! | `NotFound` | No | Conflict, record or client does not exist |
//! | `Store` | No | Local SQLite error (needs operator attention) |
//! | `StoreUnavailable` | Yes | Store temporarily unavailable (busy, pool timeout) |
//! | `Apply` | Depends | Domain applier rejected or failed a change |
//! | `CircuitOpen` | Yes | Applier circuit breaker is open |
//! | `Overloaded` | Yes | Too many concurrent sync requests |
//! | `InvalidContinuationToken` | No | Delta cursor could not be decoded |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Processor state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`SyncError::is_retryable()`] drives the `retryable` flag on per-item
//! errors returned to clients, and the background processor's decision to
//! schedule another attempt.

use thiserror::Error;

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur inside the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A request field is malformed or missing.
    ///
    /// Rejected synchronously; nothing is persisted.
    #[error("Validation error ({field}): {message}")]
    Validation { field: String, message: String },

    /// The client id is already registered to another user.
    #[error("Client {client_id} does not belong to user {user_id}")]
    ClientOwnership { client_id: String, user_id: String },

    /// Referenced entity does not exist (or is not visible to the caller).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// SQLite error from the persistent store.
    ///
    /// Not retryable - indicates local database issues that need attention.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The store is temporarily unavailable.
    ///
    /// Busy/locked databases and exhausted pools land here after the
    /// store's own retries are used up.
    #[error("Store unavailable ({operation}): {message}")]
    StoreUnavailable { operation: String, message: String },

    /// The domain applier failed to validate or apply a change.
    #[error("Apply failed for {entity_type}/{entity_id}: {message}")]
    Apply {
        entity_type: String,
        entity_id: String,
        message: String,
        retryable: bool,
    },

    /// The applier circuit breaker rejected the call.
    #[error("Applier circuit open, call rejected")]
    CircuitOpen,

    /// Request bulkhead is full.
    #[error("Sync coordinator overloaded: max {max_concurrent} concurrent requests")]
    Overloaded { max_concurrent: usize },

    /// A delta continuation token could not be decoded.
    #[error("Invalid continuation token: {0}")]
    InvalidContinuationToken(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a validation error for a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Create a store-unavailable error.
    pub fn store_unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation { .. } => false,
            Self::ClientOwnership { .. } => false,
            Self::NotFound { .. } => false,
            Self::Store(_) => false, // Local DB issues need attention
            Self::StoreUnavailable { .. } => true,
            Self::Apply { retryable, .. } => *retryable,
            Self::CircuitOpen => true,
            Self::Overloaded { .. } => true,
            Self::InvalidContinuationToken(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Whether this error rejects a whole request rather than one item.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::ClientOwnership { .. })
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker pattern for domain applier protection.
//!
//! Prevents a struggling domain store from being hammered by inline sync
//! requests and background retries at the same time. Uses the `recloser`
//! crate.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Applier unhealthy, calls fail fast without attempting
//! - **HalfOpen**: Testing if the applier recovered, limited calls allowed
//!
//! Only *transient* applier failures count against the circuit. A permanent
//! rejection (bad payload) is a property of the change, not of the applier's
//! health, and passes through without tripping anything.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use offline_sync_engine::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = CircuitBreaker::new("applier", CircuitConfig::default());
//!
//! match circuit.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* success */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, backoff */ }
//!     Err(CircuitError::Inner(e)) => { /* applier error */ }
//! }
//! # Ok(())
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::applier::EntityApplier;
use crate::error::{Result, SyncError};
use crate::model::ChangeRecord;

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Testing if service recovered
    HalfOpen = 1,
    /// Service unhealthy, fail-fast
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open).
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    /// Check if this is a rejection (circuit open).
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }

    /// Get the inner error if present.
    pub fn inner(&self) -> Option<&E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trip the circuit.
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit.
    pub success_threshold: u32,
    /// How long to wait before attempting recovery (half-open).
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Aggressive config for critical paths (trips faster, recovers cautiously).
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    /// Lenient config for less critical paths (tolerates more failures).
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(15),
        }
    }
}

/// A named circuit breaker with metrics tracking.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        // A full window of failures trips the circuit.
        let recloser = Recloser::custom()
            .error_rate(0.99)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Get the circuit breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute an async operation through the circuit breaker.
    ///
    /// Takes a closure that returns a Future, allowing lazy evaluation.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                debug!(circuit = %self.name, "Circuit call succeeded");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_rejection(&self.name);
                crate::metrics::set_circuit_state(&self.name, "open");
                warn!(circuit = %self.name, "Circuit breaker rejected call (open)");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Get total number of calls.
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors).
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open).
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Check if circuit is likely open (based on recent rejections).
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.rejections() > 0 && self.rejections() > self.successes()
    }
}

/// Circuits guarding the domain applier.
///
/// Shared between the coordinator's inline apply and the background
/// processor, so both see the same view of applier health.
pub struct ApplierCircuit {
    /// Circuit for `apply_entity_change`
    pub applies: CircuitBreaker,
    /// Circuit for `is_current` lookups
    pub lookups: CircuitBreaker,
}

impl Default for ApplierCircuit {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl ApplierCircuit {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            applies: CircuitBreaker::new("applier_writes", config),
            lookups: CircuitBreaker::new("applier_reads", CircuitConfig::lenient()),
        }
    }

    /// Apply a change through the write circuit.
    ///
    /// Permanent rejections bypass the failure count. An open circuit
    /// surfaces as [`SyncError::CircuitOpen`].
    pub async fn apply(&self, applier: &dyn EntityApplier, change: &ChangeRecord) -> Result<()> {
        let outcome = self
            .applies
            .call(|| async {
                match applier.apply_entity_change(change).await {
                    Err(e) if e.retryable => Err(e),
                    other => Ok(other),
                }
            })
            .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) | Err(CircuitError::Inner(e)) => Err(e.into_sync_error(change)),
            Err(CircuitError::Rejected) => Err(SyncError::CircuitOpen),
        }
    }

    /// Ask whether the entity already holds this content.
    ///
    /// Any failure, including an open circuit, reads as "not current" so the
    /// caller falls through to a real apply.
    pub async fn is_current(&self, applier: &dyn EntityApplier, change: &ChangeRecord) -> bool {
        let outcome = self
            .lookups
            .call(|| {
                applier.is_current(&change.entity_type, &change.entity_id, &change.content_hash)
            })
            .await;
        match outcome {
            Ok(current) => current,
            Err(e) => {
                debug!(change_id = %change.id, error = %e, "is_current lookup failed, assuming stale");
                false
            }
        }
    }

    /// Best-effort state of the write circuit.
    pub fn state(&self) -> CircuitState {
        if self.applies.is_likely_open() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::{ApplyError, ApplyFuture, NoOpApplier};
    use crate::clock::from_millis;
    use crate::model::{ChangeStatus, Operation};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }
    }

    fn change() -> ChangeRecord {
        let now = from_millis(0).unwrap();
        ChangeRecord::new(
            "task",
            "t-1",
            Operation::Update,
            vec![1, 2, 3],
            None,
            "u",
            now,
            now,
            ChangeStatus::Pending,
        )
    }

    struct Failing {
        retryable: bool,
        calls: AtomicUsize,
    }

    impl EntityApplier for Failing {
        fn apply_entity_change<'a>(&'a self, _change: &'a ChangeRecord) -> ApplyFuture<'a, ()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let retryable = self.retryable;
            Box::pin(async move {
                Err(ApplyError {
                    message: "down".into(),
                    retryable,
                })
            })
        }

        fn is_current<'a>(
            &'a self,
            _entity_type: &'a str,
            _entity_id: &'a str,
            _content_hash: &'a str,
        ) -> ApplyFuture<'a, bool> {
            Box::pin(async { Err(ApplyError::transient("lookup down")) })
        }
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", test_config());

        let result: std::result::Result<i32, CircuitError<&str>> =
            cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", test_config());

        let result: std::result::Result<i32, CircuitError<&str>> =
            cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold() {
        let cb = CircuitBreaker::new("test", test_config());

        for _ in 0..6 {
            let _: std::result::Result<i32, CircuitError<&str>> =
                cb.call(|| async { Err("fail") }).await;
        }

        assert!(cb.rejections() >= 1);
        assert!(cb.is_likely_open());
    }

    #[tokio::test]
    async fn test_applier_circuit_success() {
        let circuit = ApplierCircuit::new(test_config());
        circuit.apply(&NoOpApplier, &change()).await.unwrap();
        assert_eq!(circuit.applies.successes(), 1);
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_trip() {
        let circuit = ApplierCircuit::new(test_config());
        let applier = Failing {
            retryable: false,
            calls: AtomicUsize::new(0),
        };

        for _ in 0..6 {
            let err = circuit.apply(&applier, &change()).await.unwrap_err();
            assert!(matches!(err, SyncError::Apply { retryable: false, .. }));
        }
        assert_eq!(applier.calls.load(Ordering::SeqCst), 6);
        assert_eq!(circuit.applies.rejections(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_trip_to_circuit_open() {
        let circuit = ApplierCircuit::new(test_config());
        let applier = Failing {
            retryable: true,
            calls: AtomicUsize::new(0),
        };

        let mut saw_open = false;
        for _ in 0..6 {
            match circuit.apply(&applier, &change()).await {
                Err(SyncError::CircuitOpen) => saw_open = true,
                Err(SyncError::Apply { retryable, .. }) => assert!(retryable),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(saw_open);
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(applier.calls.load(Ordering::SeqCst) < 6);
    }

    #[tokio::test]
    async fn test_is_current_failure_reads_as_stale() {
        let circuit = ApplierCircuit::default();
        let applier = Failing {
            retryable: true,
            calls: AtomicUsize::new(0),
        };
        assert!(!circuit.is_current(&applier, &change()).await);
        assert!(!circuit.is_current(&NoOpApplier, &change()).await);
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        let aggressive = CircuitConfig::aggressive();
        let lenient = CircuitConfig::lenient();

        assert!(aggressive.failure_threshold < default.failure_threshold);
        assert!(lenient.failure_threshold > default.failure_threshold);
        assert!(aggressive.recovery_timeout > lenient.recovery_timeout);
    }

    #[test]
    fn test_circuit_error_methods() {
        let rejected: CircuitError<&str> = CircuitError::Rejected;
        assert!(rejected.is_rejected());
        assert!(rejected.inner().is_none());

        let inner: CircuitError<&str> = CircuitError::Inner("boom");
        assert!(!inner.is_rejected());
        assert_eq!(inner.inner(), Some(&"boom"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}

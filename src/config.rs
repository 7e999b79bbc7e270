// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync engine.
//!
//! Configuration is passed to [`SyncEngine::new()`](crate::SyncEngine::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use offline_sync_engine::config::{EngineConfig, ProcessorConfig};
//!
//! let config = EngineConfig {
//!     processor: ProcessorConfig {
//!         interval: "10s".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert_eq!(config.processor.interval_duration().as_secs(), 10);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── coordinator: CoordinatorConfig  # request limits, page sizes, health ceiling
//! ├── processor: ProcessorConfig      # background loop pacing, retry schedule
//! ├── retention: RetentionConfig      # cleanup windows
//! ├── registry: RegistryConfig        # "active client" window
//! ├── circuit: CircuitSettings        # applier circuit breaker
//! └── store: StoreConfig              # SQLite persistence
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "coordinator": { "max_batch_size": 200 },
//!   "processor": { "interval": "15s", "retry_base_delay": "30s" },
//!   "retention": { "completed_record_days": 14 },
//!   "store": { "sqlite_path": "/var/lib/app/sync.db" }
//! }
//! ```
//!
//! Durations are humantime strings ("30s", "5m", "1h"). An unparseable
//! duration falls back to the field's default rather than failing startup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::circuit_breaker::CircuitConfig;
use crate::error::{Result, SyncError};
use crate::model::{ResolutionStrategy, SyncConfiguration};
use crate::resilience::{RateLimitConfig, RetryPolicy};

fn parse_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to SyncEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `SyncEngine::new()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub store: StoreConfig,
}

impl EngineConfig {
    /// Parse from JSON; missing sections and fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| SyncError::Config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal config for tests: in-memory SQLite, fast loop.
    pub fn for_testing() -> Self {
        Self {
            processor: ProcessorConfig {
                interval: "50ms".into(),
                retry_base_delay: "10ms".into(),
                retry_max_delay: "100ms".into(),
                retry_cooldown: "0s".into(),
                cycle_error_backoff: "100ms".into(),
                ..Default::default()
            },
            store: StoreConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        let c = &self.coordinator;
        if c.max_batch_size == 0 {
            return Err(SyncError::Config("coordinator.max_batch_size must be > 0".into()));
        }
        if c.server_changes_page_size == 0 {
            return Err(SyncError::Config(
                "coordinator.server_changes_page_size must be > 0".into(),
            ));
        }
        if c.max_concurrent_requests == 0 {
            return Err(SyncError::Config(
                "coordinator.max_concurrent_requests must be > 0".into(),
            ));
        }
        if c.default_delta_page_size == 0 || c.default_delta_page_size > c.max_delta_page_size {
            return Err(SyncError::Config(
                "coordinator.default_delta_page_size must be in 1..=max_delta_page_size".into(),
            ));
        }
        let p = &self.processor;
        if p.batch_size == 0 {
            return Err(SyncError::Config("processor.batch_size must be > 0".into()));
        }
        if p.max_retry_attempts == 0 {
            return Err(SyncError::Config("processor.max_retry_attempts must be > 0".into()));
        }
        if p.stale_in_progress_passes == 0 {
            return Err(SyncError::Config(
                "processor.stale_in_progress_passes must be > 0".into(),
            ));
        }
        if self.retention.cleanup_batch_size == 0 {
            return Err(SyncError::Config("retention.cleanup_batch_size must be > 0".into()));
        }
        Ok(())
    }

    /// Per-user configuration used when a user has never stored one.
    pub fn default_sync_configuration(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> SyncConfiguration {
        SyncConfiguration {
            user_id: user_id.to_string(),
            max_retry_attempts: self.processor.max_retry_attempts,
            retry_delay_secs: self.processor.retry_base_delay_duration().as_secs().max(1),
            batch_size: self.coordinator.max_batch_size,
            auto_resolve_conflicts: false,
            default_strategy: ResolutionStrategy::LastWriterWins,
            entity_overrides: BTreeMap::new(),
            updated_at: now,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CoordinatorConfig: request/response limits
// ═══════════════════════════════════════════════════════════════════════════════

/// Sync Coordinator limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Cap on server changes returned per sync round.
    #[serde(default = "default_server_changes_page_size")]
    pub server_changes_page_size: usize,

    /// Maximum local changes accepted in one request.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Pending count at or above which a client is reported unhealthy.
    #[serde(default = "default_health_pending_ceiling")]
    pub health_pending_ceiling: u64,

    /// Concurrent sync requests before new ones are rejected as overloaded.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Delta page size when the caller does not ask for one.
    #[serde(default = "default_delta_page_size")]
    pub default_delta_page_size: usize,

    /// Upper clamp on requested delta page sizes.
    #[serde(default = "default_max_delta_page_size")]
    pub max_delta_page_size: usize,
}

fn default_server_changes_page_size() -> usize {
    1000
}

fn default_max_batch_size() -> usize {
    500
}

fn default_health_pending_ceiling() -> u64 {
    100
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_delta_page_size() -> usize {
    100
}

fn default_max_delta_page_size() -> usize {
    1000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_changes_page_size: 1000,
            max_batch_size: 500,
            health_pending_ceiling: 100,
            max_concurrent_requests: 100,
            default_delta_page_size: 100,
            max_delta_page_size: 1000,
        }
    }
}

impl CoordinatorConfig {
    /// Resolve a requested delta page size to the effective one.
    pub fn delta_page_size(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => self.default_delta_page_size,
            Some(n) => n.min(self.max_delta_page_size),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProcessorConfig: background loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Background processor pacing and retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Pause between passes.
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Maximum records drained per pass.
    #[serde(default = "default_processor_batch_size")]
    pub batch_size: usize,

    /// Failures before a record is dead-lettered (overridable per user).
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Backoff unit: delay = base * 2^retry_count (overridable per user).
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: String,

    /// Cap on a single backoff delay once a record's retries are used up.
    /// Raised per record as needed so earlier retries keep doubling.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: String,

    /// How long a record stays `Failed` before it may be reset to `Pending`.
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown: String,

    /// `InProgress` for longer than this many intervals counts as stalled.
    #[serde(default = "default_stale_in_progress_passes")]
    pub stale_in_progress_passes: u32,

    /// Pause after a pass in which every phase failed.
    #[serde(default = "default_cycle_error_backoff")]
    pub cycle_error_backoff: String,

    /// Minimum gap between retention sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,

    /// Sustained applier calls per second; unset means unlimited.
    #[serde(default)]
    pub apply_rate_limit_per_sec: Option<u32>,

    /// Burst allowance for the applier rate limit.
    #[serde(default = "default_apply_rate_limit_burst")]
    pub apply_rate_limit_burst: u32,
}

fn default_interval() -> String {
    "30s".to_string()
}

fn default_processor_batch_size() -> usize {
    100
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> String {
    "1m".to_string()
}

fn default_retry_max_delay() -> String {
    "1h".to_string()
}

fn default_retry_cooldown() -> String {
    "5m".to_string()
}

fn default_stale_in_progress_passes() -> u32 {
    3
}

fn default_cycle_error_backoff() -> String {
    "5m".to_string()
}

fn default_cleanup_interval() -> String {
    "1h".to_string()
}

fn default_apply_rate_limit_burst() -> u32 {
    100
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            batch_size: 100,
            max_retry_attempts: 5,
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            retry_cooldown: default_retry_cooldown(),
            stale_in_progress_passes: 3,
            cycle_error_backoff: default_cycle_error_backoff(),
            cleanup_interval: default_cleanup_interval(),
            apply_rate_limit_per_sec: None,
            apply_rate_limit_burst: 100,
        }
    }
}

impl ProcessorConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(30))
    }

    pub fn retry_base_delay_duration(&self) -> Duration {
        parse_or(&self.retry_base_delay, Duration::from_secs(60))
    }

    pub fn retry_max_delay_duration(&self) -> Duration {
        parse_or(&self.retry_max_delay, Duration::from_secs(3600))
    }

    pub fn retry_cooldown_duration(&self) -> Duration {
        parse_or(&self.retry_cooldown, Duration::from_secs(300))
    }

    pub fn cycle_error_backoff_duration(&self) -> Duration {
        parse_or(&self.cycle_error_backoff, Duration::from_secs(300))
    }

    pub fn cleanup_interval_duration(&self) -> Duration {
        parse_or(&self.cleanup_interval, Duration::from_secs(3600))
    }

    /// Age after which an `InProgress` record is reclaimed.
    pub fn stale_after(&self) -> Duration {
        self.interval_duration()
            .saturating_mul(self.stale_in_progress_passes.max(1))
    }

    /// Engine-wide retry schedule (before per-user overrides).
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_base_delay_duration(),
            self.retry_max_delay_duration(),
            self.max_retry_attempts,
        )
    }

    /// Retry schedule for one record, honoring the owner's tunables.
    ///
    /// `retry_max_delay` never clips a delay before the record's last
    /// attempt, so every retry waits strictly longer than the one before.
    pub fn retry_policy_for(&self, user: &SyncConfiguration, entity_type: &str) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(user.retry_delay_secs),
            max_attempts: user.max_retries_for(entity_type),
            ..self.retry_policy()
        }
        .uncapped_before_exhaustion()
    }

    /// Rate limit for applier calls, `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.apply_rate_limit_per_sec.map(|rate| RateLimitConfig {
            burst_size: self.apply_rate_limit_burst,
            refill_rate: rate,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetentionConfig: cleanup windows
// ═══════════════════════════════════════════════════════════════════════════════

/// How long history is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Completed change records and delivered notifications.
    #[serde(default = "default_completed_record_days")]
    pub completed_record_days: u32,

    /// Resolved conflicts.
    #[serde(default = "default_resolved_conflict_days")]
    pub resolved_conflict_days: u32,

    /// Rows deleted per statement during a sweep.
    #[serde(default = "default_cleanup_batch_size")]
    pub cleanup_batch_size: usize,
}

fn default_completed_record_days() -> u32 {
    30
}

fn default_resolved_conflict_days() -> u32 {
    7
}

fn default_cleanup_batch_size() -> usize {
    1000
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_record_days: 30,
            resolved_conflict_days: 7,
            cleanup_batch_size: 1000,
        }
    }
}

impl RetentionConfig {
    pub fn completed_record_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.completed_record_days) * 86_400)
    }

    pub fn resolved_conflict_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.resolved_conflict_days) * 86_400)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RegistryConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Client registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// A client seen within this window counts as active.
    #[serde(default = "default_active_window")]
    pub active_window: String,
}

fn default_active_window() -> String {
    "15m".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            active_window: default_active_window(),
        }
    }
}

impl RegistryConfig {
    pub fn active_window_duration(&self) -> Duration {
        parse_or(&self.active_window, Duration::from_secs(15 * 60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CircuitSettings: applier circuit breaker
// ═══════════════════════════════════════════════════════════════════════════════

/// Applier circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time spent open before probing again.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: default_recovery_timeout(),
        }
    }
}

impl CircuitSettings {
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: parse_or(&self.recovery_timeout, Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_sqlite_path() -> String {
    "sync_engine.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One background pass.
//!
//! # Phases
//!
//! ```text
//! reclaim stale InProgress ─► drain due Pending ─► retry Failed ─► cleanup
//! ```
//!
//! Each phase is guarded on its own: an error is logged and counted, and the
//! next phase still runs. Shutdown is checked between phases and between
//! items, so a pass never leaves an item mid-transition on purpose. Anything
//! left `InProgress` by a crash is picked up by the reclaim phase once it is
//! older than `stale_in_progress_passes × interval`.
//!
//! A pass is a writer on the [`CommitHorizon`]: records it commits are
//! restamped with the pass's clock reading, and no client checkpoint passes
//! that reading until the pass ends.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use super::types::PassReport;
use crate::applier::EntityApplier;
use crate::circuit_breaker::ApplierCircuit;
use crate::clock::{minus, plus, Clock};
use crate::config::EngineConfig;
use crate::coordinator::purge_history;
use crate::error::{Result, SyncError};
use crate::horizon::CommitHorizon;
use crate::metrics;
use crate::model::{ChangeRecord, ChangeStatus, SyncConfiguration};
use crate::registry::ClientRegistry;
use crate::resilience::{RateLimiter, RetryPolicy};
use crate::store::SyncStore;

const STALE_MESSAGE: &str = "reclaimed after stalled processing";

/// How a failure was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    /// `Failed`, scheduled for another attempt.
    Retrying,
    /// `Completed` with the error kept on the record.
    DeadLettered,
}

/// Record a failed attempt on an `InProgress` record.
///
/// Non-retryable failures and failures that exhaust `policy` dead-letter the
/// record; anything else moves it to `Failed` with the next backoff delay.
pub(crate) fn settle_failure(
    record: &mut ChangeRecord,
    message: String,
    retryable: bool,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Settled> {
    if !retryable {
        record.dead_letter(message, now)?;
        return Ok(Settled::DeadLettered);
    }
    let attempts = record.retry_count.saturating_add(1);
    if policy.is_exhausted(attempts) {
        record.retry_count = attempts;
        record.dead_letter(message, now)?;
        return Ok(Settled::DeadLettered);
    }
    let delay = policy.delay_for(record.retry_count);
    record.record_failure(message, plus(now, delay), now)?;
    Ok(Settled::Retrying)
}

/// Shared state for passes, owned behind an `Arc` by the processor.
pub(crate) struct PassWorker {
    store: Arc<dyn SyncStore>,
    applier: Arc<dyn EntityApplier>,
    circuit: Arc<ApplierCircuit>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    horizon: Arc<CommitHorizon>,
    registry: ClientRegistry,
    rate_limiter: Option<RateLimiter>,
    /// Held for the whole pass; the value is when cleanup last succeeded.
    pass_lock: Mutex<Option<DateTime<Utc>>>,
}

impl PassWorker {
    pub(crate) fn new(
        store: Arc<dyn SyncStore>,
        applier: Arc<dyn EntityApplier>,
        circuit: Arc<ApplierCircuit>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
        horizon: Arc<CommitHorizon>,
    ) -> Self {
        let registry = ClientRegistry::new(Arc::clone(&store), config.registry.clone());
        let rate_limiter = config.processor.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for background applies"
            );
            RateLimiter::new(cfg)
        });
        Self {
            store,
            applier,
            circuit,
            clock,
            config,
            horizon,
            registry,
            rate_limiter,
            pass_lock: Mutex::new(None),
        }
    }

    /// Run one pass. Concurrent callers queue behind each other.
    #[instrument(skip_all)]
    pub(crate) async fn run_pass(&self, shutdown: &watch::Receiver<bool>) -> PassReport {
        let mut last_cleanup = self.pass_lock.lock().await;
        let pass = self.horizon.enter(self.clock.as_ref());
        let now = pass.at();
        let mut report = PassReport::default();
        let mut configs = ConfigCache::default();

        report.phases_run += 1;
        if let Err(e) = self.reclaim_stale(now, &mut configs, &mut report).await {
            self.phase_failed("reclaim", &e, &mut report);
        }

        if !stopping(shutdown) {
            report.phases_run += 1;
            if let Err(e) = self.drain_due(now, shutdown, &mut configs, &mut report).await {
                self.phase_failed("drain", &e, &mut report);
            }
        }

        if !stopping(shutdown) {
            report.phases_run += 1;
            if let Err(e) = self.retry_failed(now, &mut configs, &mut report).await {
                self.phase_failed("retry", &e, &mut report);
            }
        }

        if !stopping(shutdown) && self.cleanup_due(*last_cleanup, now) {
            report.phases_run += 1;
            match self.cleanup(now).await {
                Ok(cleanup) => {
                    *last_cleanup = Some(now);
                    report.cleanup = Some(cleanup);
                }
                Err(e) => self.phase_failed("cleanup", &e, &mut report),
            }
        }

        report.cancelled = stopping(shutdown);
        drop(pass);
        report
    }

    fn phase_failed(&self, phase: &'static str, error: &SyncError, report: &mut PassReport) {
        warn!(phase, error = %error, "Processor phase failed");
        metrics::record_processor_phase_error(phase);
        report.failed_phases.push(phase);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase 1: reclaim stalled work
    // ═══════════════════════════════════════════════════════════════════════

    async fn reclaim_stale(
        &self,
        now: DateTime<Utc>,
        configs: &mut ConfigCache,
        report: &mut PassReport,
    ) -> Result<()> {
        let p = &self.config.processor;
        let cutoff = minus(now, p.stale_after());
        let stale = self.store.stale_in_progress(cutoff, p.batch_size).await?;

        for mut record in stale {
            let policy = self.policy_for(&record, configs, now).await;
            let settled = settle_failure(&mut record, STALE_MESSAGE.to_string(), true, &policy, now)?;
            self.store.update_change(&record).await?;
            if settled == Settled::DeadLettered {
                report.dead_lettered += 1;
                metrics::record_processor_item("dead_lettered");
            }
            report.reclaimed += 1;
            warn!(
                change_id = %record.id,
                retry_count = record.retry_count,
                "Reclaimed stalled in-progress change"
            );
        }
        if report.reclaimed > 0 {
            metrics::record_processor_reclaimed(report.reclaimed);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase 2: drain due pending records
    // ═══════════════════════════════════════════════════════════════════════

    async fn drain_due(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
        configs: &mut ConfigCache,
        report: &mut PassReport,
    ) -> Result<()> {
        let due = self
            .store
            .due_changes(now, self.config.processor.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "Draining due changes");

        for mut record in due {
            if stopping(shutdown) {
                debug!("Shutdown requested, stopping drain");
                break;
            }
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            record.transition(ChangeStatus::InProgress, now)?;
            self.store.update_change(&record).await?;

            if self.circuit.is_current(self.applier.as_ref(), &record).await {
                record.created_at = now;
                record.complete(now)?;
                self.store.update_change(&record).await?;
                self.fan_out(&record, now).await;
                report.skipped_current += 1;
                metrics::record_processor_item("skipped_current");
                continue;
            }

            match self.circuit.apply(self.applier.as_ref(), &record).await {
                Ok(()) => {
                    record.created_at = now;
                    record.complete(now)?;
                    self.store.update_change(&record).await?;
                    self.fan_out(&record, now).await;
                    report.applied += 1;
                    metrics::record_processor_item("applied");
                }
                Err(SyncError::CircuitOpen) => {
                    record.requeue(Some(SyncError::CircuitOpen.to_string()), now)?;
                    record.next_retry_at = Some(now);
                    self.store.update_change(&record).await?;
                    report.deferred += 1;
                    info!("Applier circuit open, deferring the rest of the drain");
                    break;
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    let policy = self.policy_for(&record, configs, now).await;
                    let settled = settle_failure(&mut record, e.to_string(), retryable, &policy, now)?;
                    self.store.update_change(&record).await?;
                    match settled {
                        Settled::Retrying => {
                            report.failed += 1;
                            metrics::record_processor_item("failed");
                            debug!(change_id = %record.id, retry_count = record.retry_count, error = %e, "Apply failed, will retry");
                        }
                        Settled::DeadLettered => {
                            report.dead_lettered += 1;
                            let outcome = if retryable { "dead_lettered" } else { "rejected" };
                            metrics::record_processor_item(outcome);
                            warn!(
                                change_id = %record.id,
                                retry_count = record.retry_count,
                                error = %e,
                                "Change dead-lettered"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase 3: retry cooled-down failures
    // ═══════════════════════════════════════════════════════════════════════

    async fn retry_failed(
        &self,
        now: DateTime<Utc>,
        configs: &mut ConfigCache,
        report: &mut PassReport,
    ) -> Result<()> {
        let p = &self.config.processor;
        let cutoff = minus(now, p.retry_cooldown_duration());
        let failed = self.store.failed_changes(cutoff, p.batch_size).await?;

        for mut record in failed {
            let policy = self.policy_for(&record, configs, now).await;
            if policy.is_exhausted(record.retry_count) {
                let message = record
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "retry limit reached".to_string());
                record.dead_letter(message, now)?;
                report.dead_lettered += 1;
                metrics::record_processor_item("dead_lettered");
            } else {
                record.requeue(None, now)?;
                report.retried += 1;
            }
            self.store.update_change(&record).await?;
        }
        if report.retried > 0 {
            metrics::record_processor_retried(report.retried);
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase 4: retention cleanup
    // ═══════════════════════════════════════════════════════════════════════

    fn cleanup_due(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last {
            None => true,
            Some(at) => plus(at, self.config.processor.cleanup_interval_duration()) <= now,
        }
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<crate::coordinator::CleanupReport> {
        let r = &self.config.retention;
        let completed_cutoff = minus(now, r.completed_record_retention());
        let conflict_cutoff = minus(now, r.resolved_conflict_retention());
        let report = purge_history(
            self.store.as_ref(),
            completed_cutoff,
            conflict_cutoff,
            completed_cutoff,
            r.cleanup_batch_size,
        )
        .await?;
        if report.total() > 0 {
            info!(
                completed_records = report.completed_records,
                resolved_conflicts = report.resolved_conflicts,
                delivered_notifications = report.delivered_notifications,
                "Retention cleanup purged history"
            );
        }
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    async fn policy_for(
        &self,
        record: &ChangeRecord,
        configs: &mut ConfigCache,
        now: DateTime<Utc>,
    ) -> RetryPolicy {
        let user = configs.get(self, &record.user_id, now).await;
        self.config
            .processor
            .retry_policy_for(user, &record.entity_type)
    }

    async fn fan_out(&self, record: &ChangeRecord, now: DateTime<Utc>) {
        if let Err(e) = self.registry.fan_out(record, now).await {
            warn!(change_id = %record.id, error = %e, "Failed to queue change notifications");
        }
    }
}

/// Per-pass cache of user configurations.
#[derive(Default)]
struct ConfigCache {
    by_user: HashMap<String, SyncConfiguration>,
}

impl ConfigCache {
    async fn get(
        &mut self,
        worker: &PassWorker,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> &SyncConfiguration {
        if !self.by_user.contains_key(user_id) {
            let loaded = match worker.store.get_configuration(user_id).await {
                Ok(Some(config)) => config,
                Ok(None) => worker.config.default_sync_configuration(user_id, now),
                Err(e) => {
                    warn!(user_id, error = %e, "Failed to load sync configuration, using defaults");
                    worker.config.default_sync_configuration(user_id, now)
                }
            };
            self.by_user.insert(user_id.to_string(), loaded);
        }
        &self.by_user[user_id]
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

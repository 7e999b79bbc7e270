// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background processor.
//!
//! One long-lived loop per engine instance. Each tick runs a pass (see
//! [`pass`](self) for the phases); a pass in which every phase failed backs
//! the whole loop off for `cycle_error_backoff` before the next tick.
//!
//! The processor owns its own handles (store, applier, clock) and shutdown
//! channel. Nothing about it is global: construct it, `start()` it, and
//! `shutdown()` it with the rest of the process.

mod pass;
mod types;

pub use types::{PassReport, ProcessorState};

pub(crate) use pass::{settle_failure, Settled};

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::applier::EntityApplier;
use crate::circuit_breaker::ApplierCircuit;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::horizon::CommitHorizon;
use crate::metrics;
use crate::store::SyncStore;
use pass::PassWorker;

/// Drives retries, stale reclaim and retention cleanup.
pub struct BackgroundProcessor {
    worker: Arc<PassWorker>,
    config: Arc<EngineConfig>,

    /// Processor state (broadcast to watchers)
    state_tx: watch::Sender<ProcessorState>,
    state_rx: watch::Receiver<ProcessorState>,

    /// Shutdown signal
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    handle: Option<JoinHandle<()>>,
}

impl BackgroundProcessor {
    /// Processor with a horizon of its own. Use [`with_horizon`] when a
    /// coordinator serves clients from the same store.
    ///
    /// [`with_horizon`]: BackgroundProcessor::with_horizon
    pub fn new(
        store: Arc<dyn SyncStore>,
        applier: Arc<dyn EntityApplier>,
        circuit: Arc<ApplierCircuit>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self::with_horizon(
            store,
            applier,
            circuit,
            clock,
            config,
            Arc::new(CommitHorizon::new()),
        )
    }

    /// Processor whose passes hold back the checkpoints of `horizon`.
    pub fn with_horizon(
        store: Arc<dyn SyncStore>,
        applier: Arc<dyn EntityApplier>,
        circuit: Arc<ApplierCircuit>,
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
        horizon: Arc<CommitHorizon>,
    ) -> Self {
        let worker = Arc::new(PassWorker::new(
            store,
            applier,
            circuit,
            clock,
            Arc::clone(&config),
            horizon,
        ));
        let (state_tx, state_rx) = watch::channel(ProcessorState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            worker,
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            handle: None,
        }
    }

    /// Get current processor state.
    pub fn state(&self) -> ProcessorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ProcessorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ProcessorState::Running)
    }

    /// Run a single pass now, outside the timer.
    ///
    /// Serialized with the loop's own passes.
    pub async fn run_pass(&self) -> PassReport {
        let started = Instant::now();
        let report = self.worker.run_pass(&self.shutdown_rx).await;
        metrics::record_processor_pass(started.elapsed(), report.is_healthy());
        report
    }

    /// Spawn the loop.
    pub fn start(&mut self) -> Result<()> {
        if self.state() != ProcessorState::Created {
            return Err(SyncError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let worker = Arc::clone(&self.worker);
        let config = Arc::clone(&self.config);
        let shutdown_rx = self.shutdown_rx.clone();
        self.handle = Some(tokio::spawn(run_loop(worker, config, shutdown_rx)));

        let _ = self.state_tx.send(ProcessorState::Running);
        metrics::set_processor_state("Running");
        info!(
            interval = %self.config.processor.interval,
            batch_size = self.config.processor.batch_size,
            "Background processor running"
        );
        Ok(())
    }

    /// Signal the loop and wait for the current pass to finish.
    pub async fn shutdown(&mut self) {
        if self.state() == ProcessorState::Stopped {
            return;
        }
        info!("Shutting down background processor");
        let _ = self.state_tx.send(ProcessorState::ShuttingDown);
        metrics::set_processor_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.handle.take() {
            let drain_timeout = std::time::Duration::from_secs(10);
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!("Processor loop completed gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Processor loop panicked during shutdown"),
                Err(_) => warn!("Processor loop timed out during shutdown"),
            }
        }

        let _ = self.state_tx.send(ProcessorState::Stopped);
        metrics::set_processor_state("Stopped");
        info!("Background processor stopped");
    }
}

async fn run_loop(
    worker: Arc<PassWorker>,
    config: Arc<EngineConfig>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("background_processor");

    async move {
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();

        let interval = config.processor.interval_duration();
        let backoff = config.processor.cycle_error_backoff_duration();
        info!(
            interval_ms = interval.as_millis() as u64,
            cycle_error_backoff_ms = backoff.as_millis() as u64,
            "Starting background processor loop"
        );

        let mut timer = tokio::time::interval(interval);
        // Skip missed ticks instead of bursting to catch up
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping processor loop");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            let started = Instant::now();
            let pass_worker = Arc::clone(&worker);
            let pass_shutdown = shutdown_rx.clone();
            let outcome =
                tokio::spawn(async move { pass_worker.run_pass(&pass_shutdown).await }).await;

            let cycle_failed = match outcome {
                Ok(report) => {
                    let duration = started.elapsed();
                    metrics::record_processor_pass(duration, report.is_healthy());
                    if report.touched() > 0 || report.cleanup.is_some() {
                        info!(
                            reclaimed = report.reclaimed,
                            applied = report.applied,
                            skipped_current = report.skipped_current,
                            failed = report.failed,
                            dead_lettered = report.dead_lettered,
                            deferred = report.deferred,
                            retried = report.retried,
                            duration_ms = duration.as_millis() as u64,
                            "Processor pass complete"
                        );
                    } else {
                        debug!("Processor pass complete, nothing to do");
                    }
                    report.is_cycle_failure()
                }
                Err(e) => {
                    error!(error = %e, "Processor pass panicked");
                    metrics::record_processor_pass(started.elapsed(), false);
                    true
                }
            };

            if cycle_failed {
                warn!(
                    backoff_ms = backoff.as_millis() as u64,
                    "Processor cycle failed, backing off"
                );
                tokio::select! {
                    biased;

                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Shutdown signal received during backoff");
                            break;
                        }
                    }

                    _ = tokio::time::sleep(backoff) => {}
                }
                timer.reset();
            }
        }

        info!("Background processor loop stopped");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::{ApplyError, ApplyFuture, NoOpApplier};
    use crate::clock::{from_millis, plus, ManualClock};
    use crate::model::{ChangeRecord, ChangeStatus, Operation};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        processor: BackgroundProcessor,
    }

    fn harness(applier: Arc<dyn EntityApplier>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let processor = BackgroundProcessor::new(
            store.clone(),
            applier,
            Arc::new(ApplierCircuit::default()),
            clock.clone(),
            Arc::new(EngineConfig::for_testing()),
        );
        Harness {
            store,
            clock,
            processor,
        }
    }

    fn pending(entity_id: &str) -> ChangeRecord {
        let t = from_millis(T0).unwrap();
        ChangeRecord::new(
            "task",
            entity_id,
            Operation::Update,
            b"x".to_vec(),
            None,
            "user-1",
            t,
            t,
            ChangeStatus::Pending,
        )
    }

    /// Fails the first `failures` applies with a transient error.
    struct FlakyApplier {
        failures: u32,
        calls: AtomicU32,
    }

    impl EntityApplier for FlakyApplier {
        fn apply_entity_change<'a>(&'a self, _change: &'a ChangeRecord) -> ApplyFuture<'a, ()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = call < self.failures;
            Box::pin(async move {
                if fail {
                    Err(ApplyError::transient("busy"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[test]
    fn test_initial_state() {
        let h = harness(Arc::new(NoOpApplier));
        assert_eq!(h.processor.state(), ProcessorState::Created);
        assert!(!h.processor.is_running());
        assert_eq!(*h.processor.state_receiver().borrow(), ProcessorState::Created);
    }

    #[tokio::test]
    async fn test_pass_applies_due_changes() {
        let h = harness(Arc::new(NoOpApplier));
        let record = pending("t-1");
        h.store.insert_change(&record).await.unwrap();

        let report = h.processor.run_pass().await;
        assert_eq!(report.applied, 1);
        assert!(report.is_healthy());
        let stored = h.store.get_change(&record.id).await.unwrap().unwrap();
        assert!(stored.is_committed());
    }

    #[tokio::test]
    async fn test_failed_change_retried_after_backoff() {
        let h = harness(Arc::new(FlakyApplier {
            failures: 1,
            calls: AtomicU32::new(0),
        }));
        let record = pending("t-1");
        h.store.insert_change(&record).await.unwrap();

        let report = h.processor.run_pass().await;
        assert_eq!(report.failed, 1);
        let stored = h.store.get_change(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        let next = stored.next_retry_at.unwrap();

        // retry phase of the next pass moves it back to pending, backoff still gates it
        let report = h.processor.run_pass().await;
        assert_eq!(report.retried, 1);
        assert_eq!(report.applied, 0);

        h.clock.set(plus(next, Duration::from_millis(1)));
        let report = h.processor.run_pass().await;
        assert_eq!(report.applied, 1);
        let stored = h.store.get_change(&record.id).await.unwrap().unwrap();
        assert!(stored.is_committed());
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_stale_in_progress_reclaimed() {
        let h = harness(Arc::new(NoOpApplier));
        let mut record = pending("t-1");
        record
            .transition(ChangeStatus::InProgress, from_millis(T0).unwrap())
            .unwrap();
        h.store.insert_change(&record).await.unwrap();

        // younger than interval * passes: untouched
        let report = h.processor.run_pass().await;
        assert_eq!(report.reclaimed, 0);

        h.clock.advance(Duration::from_secs(1));
        let report = h.processor.run_pass().await;
        assert_eq!(report.reclaimed, 1);
        let stored = h.store.get_change(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("reclaimed after stalled processing"));
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let mut h = harness(Arc::new(NoOpApplier));
        h.processor.start().unwrap();
        assert!(h.processor.is_running());
        let err = h.processor.start().unwrap_err();
        match err {
            SyncError::InvalidState { expected, actual } => {
                assert_eq!(expected, "Created");
                assert_eq!(actual, "Running");
            }
            other => panic!("unexpected error: {other}"),
        }
        h.processor.shutdown().await;
        assert_eq!(h.processor.state(), ProcessorState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let mut h = harness(Arc::new(NoOpApplier));
        h.processor.shutdown().await;
        assert_eq!(h.processor.state(), ProcessorState::Stopped);
        assert!(h.processor.start().is_err());
    }

    #[tokio::test]
    async fn test_loop_drains_in_background() {
        let mut h = harness(Arc::new(NoOpApplier));
        let record = pending("t-1");
        h.store.insert_change(&record).await.unwrap();

        h.processor.start().unwrap();
        let mut committed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stored = h.store.get_change(&record.id).await.unwrap().unwrap();
            if stored.is_committed() {
                committed = true;
                break;
            }
        }
        h.processor.shutdown().await;
        assert!(committed);
    }
}

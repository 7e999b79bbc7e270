// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Sync request outcomes and latency
//! - Delta feed reads
//! - Conflicts created and resolved
//! - Background processor passes
//! - Retention cleanup
//! - Circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by the library; without one every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use offline_sync_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_sync_request(12, 1, 0, 0, Duration::from_millis(8));
//! metrics::record_processor_item("applied");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Sync Coordinator
// =============================================================================

/// Record one processed sync request with its per-item outcome counts.
pub fn record_sync_request(
    accepted: usize,
    conflicts: usize,
    errors: usize,
    server_changes: usize,
    duration: Duration,
) {
    counter!("sync_requests_total").increment(1);
    counter!("sync_items_total", "outcome" => "accepted").increment(accepted as u64);
    counter!("sync_items_total", "outcome" => "conflict").increment(conflicts as u64);
    counter!("sync_items_total", "outcome" => "error").increment(errors as u64);
    histogram!("sync_server_changes_returned").record(server_changes as f64);
    histogram!("sync_request_duration_seconds").record(duration.as_secs_f64());
}

/// Record a request rejected before any item was processed.
pub fn record_sync_rejected(reason: &str) {
    counter!("sync_requests_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Gauge of sync requests currently holding a bulkhead slot.
pub fn set_inflight_requests(count: usize) {
    gauge!("sync_requests_inflight").set(count as f64);
}

/// Record a change entering the store outside the sync protocol.
pub fn record_change_enqueued(source: &str) {
    counter!("sync_changes_enqueued_total", "source" => source.to_string()).increment(1);
}

/// Record fan-out notifications queued for other clients.
pub fn record_notifications_queued(count: usize) {
    counter!("sync_notifications_queued_total").increment(count as u64);
}

// =============================================================================
// Delta Feed
// =============================================================================

/// Record one delta page read.
pub fn record_delta_fetch(entity_type: &str, returned: usize, has_more: bool) {
    let more = if has_more { "true" } else { "false" };
    counter!(
        "sync_delta_fetches_total",
        "entity_type" => entity_type.to_string(),
        "has_more" => more
    )
    .increment(1);
    histogram!("sync_delta_page_size", "entity_type" => entity_type.to_string())
        .record(returned as f64);
}

// =============================================================================
// Conflicts
// =============================================================================

/// Record a newly detected conflict.
pub fn record_conflict_created(entity_type: &str) {
    counter!("sync_conflicts_created_total", "entity_type" => entity_type.to_string())
        .increment(1);
}

/// Record a conflict resolution.
pub fn record_conflict_resolved(strategy: &str, automatic: bool) {
    let mode = if automatic { "auto" } else { "manual" };
    counter!(
        "sync_conflicts_resolved_total",
        "strategy" => strategy.to_string(),
        "mode" => mode
    )
    .increment(1);
}

// =============================================================================
// Background Processor
// =============================================================================

/// Record the outcome for one drained item.
///
/// Outcomes: `applied`, `skipped_current`, `failed`, `dead_lettered`, `rejected`.
pub fn record_processor_item(outcome: &str) {
    counter!("sync_processor_items_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record stalled `InProgress` items reclaimed at the start of a pass.
pub fn record_processor_reclaimed(count: usize) {
    counter!("sync_processor_reclaimed_total").increment(count as u64);
}

/// Record failed items reset to pending.
pub fn record_processor_retried(count: usize) {
    counter!("sync_processor_retried_total").increment(count as u64);
}

/// Record a phase that raised an error.
pub fn record_processor_phase_error(phase: &str) {
    counter!("sync_processor_phase_errors_total", "phase" => phase.to_string()).increment(1);
}

/// Record a completed pass.
pub fn record_processor_pass(duration: Duration, healthy: bool) {
    let status = if healthy { "ok" } else { "error" };
    counter!("sync_processor_passes_total", "status" => status).increment(1);
    histogram!("sync_processor_pass_duration_seconds").record(duration.as_secs_f64());
}

/// Gauge for processor state.
pub fn set_processor_state(state: &str) {
    // 0=created, 1=running, 2=shutting down, 3=stopped
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("sync_processor_state").set(value);
}

/// Record rows removed by retention cleanup.
pub fn record_cleanup_purged(kind: &str, count: u64) {
    counter!("sync_cleanup_purged_total", "kind" => kind.to_string()).increment(count);
}

// =============================================================================
// Store
// =============================================================================

/// Record a store statement retried after SQLITE_BUSY/SQLITE_LOCKED.
pub fn store_retries_total(operation: &str) {
    counter!("sync_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "sync_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("sync_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "sync_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder these are no-ops; the tests make sure
    // label construction never panics.

    #[test]
    fn test_record_sync_request() {
        record_sync_request(10, 2, 1, 40, Duration::from_millis(12));
        record_sync_request(0, 0, 0, 0, Duration::ZERO);
        record_sync_rejected("validation");
        set_inflight_requests(3);
    }

    #[test]
    fn test_record_delta_fetch() {
        record_delta_fetch("task", 100, true);
        record_delta_fetch("", 0, false);
    }

    #[test]
    fn test_record_conflicts() {
        record_conflict_created("task");
        record_conflict_resolved("last_writer_wins", true);
        record_conflict_resolved("manual_resolution", false);
    }

    #[test]
    fn test_record_processor() {
        record_processor_item("applied");
        record_processor_item("dead_lettered");
        record_processor_reclaimed(2);
        record_processor_retried(0);
        record_processor_phase_error("drain");
        record_processor_pass(Duration::from_secs(1), true);
        record_cleanup_purged("completed_records", 1000);
    }

    #[test]
    fn test_set_processor_state() {
        for state in ["Created", "Running", "ShuttingDown", "Stopped", "Unknown"] {
            set_processor_state(state);
        }
    }

    #[test]
    fn test_circuit_metrics() {
        record_circuit_call("applier", "success");
        set_circuit_state("applier", "open");
        set_circuit_state("applier", "weird");
        record_circuit_rejection("applier");
    }

    #[test]
    fn test_misc() {
        store_retries_total("insert_change");
        record_change_enqueued("domain");
        record_notifications_queued(4);
    }
}

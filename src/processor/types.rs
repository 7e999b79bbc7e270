// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Processor state and pass reporting.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Created ─────────────────→ Running
//!    │                          │
//!    │ shutdown()               │ shutdown()
//!    │                          ↓
//!    │                    ShuttingDown
//!    │                          │ (loop drained)
//!    ↓                          ↓
//! Stopped ←─────────────────────┘
//! ```

use crate::coordinator::CleanupReport;

/// Lifecycle state of the background processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Constructed, loop not spawned.
    Created,
    /// Loop running passes on its interval.
    Running,
    /// Shutdown signalled, waiting for the current pass to finish.
    ShuttingDown,
    /// Loop finished. Not restartable.
    Stopped,
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorState::Created => write!(f, "Created"),
            ProcessorState::Running => write!(f, "Running"),
            ProcessorState::ShuttingDown => write!(f, "ShuttingDown"),
            ProcessorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Stalled `InProgress` records sent back to the retry path.
    pub reclaimed: usize,
    pub applied: usize,
    /// Completed without applying because the entity already matched.
    pub skipped_current: usize,
    /// Failed and scheduled for a later retry.
    pub failed: usize,
    pub dead_lettered: usize,
    /// Put back to `Pending` because the applier circuit was open.
    pub deferred: usize,
    /// `Failed` records reset to `Pending`.
    pub retried: usize,
    /// Set when the cleanup phase ran.
    pub cleanup: Option<CleanupReport>,
    /// Phases that raised an error.
    pub failed_phases: Vec<&'static str>,
    /// Phases that ran (successfully or not).
    pub phases_run: usize,
    /// The pass stopped early on shutdown.
    pub cancelled: bool,
}

impl PassReport {
    /// No phase raised an error.
    pub fn is_healthy(&self) -> bool {
        self.failed_phases.is_empty()
    }

    /// Every phase that ran failed; the loop backs off before the next pass.
    pub fn is_cycle_failure(&self) -> bool {
        self.phases_run > 0 && self.failed_phases.len() == self.phases_run
    }

    /// Records whose status changed in this pass.
    pub fn touched(&self) -> usize {
        self.reclaimed
            + self.applied
            + self.skipped_current
            + self.failed
            + self.dead_lettered
            + self.deferred
            + self.retried
    }
}

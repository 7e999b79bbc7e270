// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit horizon.
//!
//! Records are stamped with the clock reading their writer took when it
//! started, but become visible only when the writer inserts them, possibly
//! much later. A checkpoint handed to a client must therefore never pass
//! the start of a writer that is still running:
//!
//! ```text
//! round A   now=T0 ─────────────── insert(created_at=T0) ──► done
//! round B        now=T0+10 ─► done, checkpoint = min(T0+10, T0) = T0
//! ```
//!
//! Every writer that stamps records (sync rounds, conflict resolutions,
//! domain commits, processor passes) takes its clock reading through
//! [`CommitHorizon::enter`] and holds the guard until its writes land.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::clock::Clock;

/// Clock readings of the writers currently in flight.
#[derive(Debug, Default)]
pub struct CommitHorizon {
    /// start time -> number of writers that started then
    inflight: Mutex<BTreeMap<DateTime<Utc>, usize>>,
}

impl CommitHorizon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the clock and register a writer at that reading.
    ///
    /// The reading happens under the lock, so no checkpoint computed
    /// concurrently can land past it.
    pub fn enter(&self, clock: &dyn Clock) -> HorizonGuard<'_> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        let at = clock.now();
        *inflight.entry(at).or_default() += 1;
        HorizonGuard { horizon: self, at }
    }

    /// Latest checkpoint that is safe to hand out at `now`.
    pub fn checkpoint(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.oldest() {
            Some(oldest) => oldest.min(now),
            None => now,
        }
    }

    /// Start of the oldest writer still in flight.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.keys().next().copied()
    }

    /// Writers currently registered.
    pub fn writers(&self) -> usize {
        let inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.values().sum()
    }

    fn leave(&self, at: DateTime<Utc>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = inflight.get_mut(&at) {
            *count -= 1;
            if *count == 0 {
                inflight.remove(&at);
            }
        }
    }
}

/// Registration of one in-flight writer; leaves the horizon on drop.
#[derive(Debug)]
pub struct HorizonGuard<'a> {
    horizon: &'a CommitHorizon,
    at: DateTime<Utc>,
}

impl HorizonGuard<'_> {
    /// The clock reading this writer stamps its records with.
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

impl Drop for HorizonGuard<'_> {
    fn drop(&mut self) {
        self.horizon.leave(self.at);
    }
}

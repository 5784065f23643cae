//! Three-phase timed eviction cycle.
//!
//! The cycle is driven by ticks from its owner rather than a background timer:
//!
//! 1. *unarmed*: the next tick records the arm time.
//! 2. *armed*: once half the timeout has passed, the tick captures the current
//!    entry count as the eviction cohort.
//! 3. *snapshotted*: once another half has passed, the tick asks the owner to
//!    drop that many entries from the oldest end and the cycle starts over.
//!
//! Entries added after the snapshot are not part of the cohort and survive
//! until a later cycle.

use std::time::Duration;
use tokio::time::Instant;

/// Current phase of the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanerPhase {
    Unarmed,
    Armed { since: Instant },
    Snapshotted { at: Instant, count: usize },
}

/// What a tick asks the owner to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanerStep {
    /// Nothing changed.
    Idle,
    /// Monitoring started.
    Armed,
    /// A cohort of this many entries was captured.
    Snapshot(usize),
    /// Drop this many entries from the oldest end.
    Evict(usize),
}

/// Timed state machine deciding when to evict a batch of the oldest entries.
#[derive(Debug, Clone)]
pub struct Cleaner {
    monitoring_timeout: Duration,
    phase: CleanerPhase,
}

impl Cleaner {
    /// Create a cleaner whose full cycle lasts `clear_timeout`.
    pub fn new(clear_timeout: Duration) -> Self {
        Self::with_phase_length(clear_timeout / 2)
    }

    /// Create a cleaner where each of the two timed phases lasts `phase`.
    pub fn with_phase_length(phase: Duration) -> Self {
        Self {
            monitoring_timeout: phase,
            phase: CleanerPhase::Unarmed,
        }
    }

    /// Length of one timed phase.
    pub fn monitoring_timeout(&self) -> Duration {
        self.monitoring_timeout
    }

    pub fn phase(&self) -> CleanerPhase {
        self.phase
    }

    /// Advance the cycle using the current time.
    pub fn tick(&mut self, len: usize) -> CleanerStep {
        self.tick_at(Instant::now(), len)
    }

    /// Advance the cycle as of `now`, given the owner's current entry count.
    pub fn tick_at(&mut self, now: Instant, len: usize) -> CleanerStep {
        match self.phase {
            CleanerPhase::Unarmed => {
                self.phase = CleanerPhase::Armed { since: now };
                CleanerStep::Armed
            }
            CleanerPhase::Armed { since }
                if now.saturating_duration_since(since) > self.monitoring_timeout =>
            {
                self.phase = CleanerPhase::Snapshotted { at: now, count: len };
                CleanerStep::Snapshot(len)
            }
            CleanerPhase::Snapshotted { at, count }
                if now.saturating_duration_since(at) > self.monitoring_timeout =>
            {
                self.phase = CleanerPhase::Unarmed;
                CleanerStep::Evict(count)
            }
            _ => CleanerStep::Idle,
        }
    }

    /// Forget any cycle in progress.
    pub fn reset(&mut self) {
        self.phase = CleanerPhase::Unarmed;
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Advisory acquisition counters.

use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Per-lock counters. All updates are relaxed; the numbers are advisory
/// and carry no ordering guarantees.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    acquires: AtomicU64,
    contended: AtomicU64,
    timeouts: AtomicU64,
    interrupts: AtomicU64,
}

impl Stats {
    pub(crate) fn count_acquire(&self) {
        self.acquires.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_contended(&self) {
        self.contended.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_timeout(&self) {
        self.timeouts.fetch_add(1, Relaxed);
    }

    pub(crate) fn count_interrupt(&self) {
        self.interrupts.fetch_add(1, Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acquires: self.acquires.load(Relaxed),
            contended: self.contended.load(Relaxed),
            timeouts: self.timeouts.load(Relaxed),
            interrupts: self.interrupts.load(Relaxed),
        }
    }
}

/// A point-in-time copy of a lock's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Successful acquisitions, including reentrant ones.
    pub acquires: u64,
    /// Acquisitions that went through the wait queue.
    pub contended: u64,
    /// Timed acquisitions that expired.
    pub timeouts: u64,
    /// Blocking acquisitions that failed with an interruption.
    pub interrupts: u64,
}

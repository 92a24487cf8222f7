// SPDX-License-Identifier: MPL-2.0

//! FIFO admission queues.
//!
//! A queue policy decides the order in which contending threads get to
//! claim the owner word of a lock. Arrival order is fixed by an atomic
//! exchange on the queue tail; a waiter then local-spins, paced by the
//! lock's [`WaitStrategy`], until its predecessor admits it, and finally
//! claims the lock through a caller-supplied closure.
//!
//! Two disciplines are provided: [`ClhQueue`] spins on a flag in the
//! predecessor's node, [`McsQueue`] spins on a flag in the waiter's own
//! node.
//!
//! [`WaitStrategy`]: crate::wait::WaitStrategy

mod clh;
mod mcs;

pub(crate) use clh::ClhQueue;
pub(crate) use mcs::McsQueue;

use core::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::prelude::*;
use crate::wait::WaitStrategy;

/// A FIFO wait queue guarding admission to an owner word.
///
/// The closure passed to the acquire methods tests and claims the lock; it
/// must be idempotent under spurious retries. The queue guarantees that at
/// any time at most one *queued* thread is invoking it (barging threads may
/// race it from outside the queue).
pub(crate) trait QueuePolicy: Send + Sync {
    /// Enqueues and blocks until `try_acquire` succeeds.
    ///
    /// Interruption observed while waiting is absorbed and re-raised on the
    /// calling thread's flag once the acquire has succeeded.
    fn acquire(&self, try_acquire: &dyn Fn() -> bool, strategy: &dyn WaitStrategy);

    /// Enqueues and blocks until `try_acquire` succeeds or the calling
    /// thread is interrupted, in which case the waiter is cancelled and
    /// unlinked before the error surfaces.
    fn acquire_interruptibly(
        &self,
        try_acquire: &dyn Fn() -> bool,
        strategy: &dyn WaitStrategy,
    ) -> Result<()>;

    /// Timed variant of [`acquire_interruptibly`]. Returns `Ok(false)` once
    /// `deadline` passes without the acquire succeeding.
    ///
    /// [`acquire_interruptibly`]: QueuePolicy::acquire_interruptibly
    fn acquire_timed(
        &self,
        try_acquire: &dyn Fn() -> bool,
        strategy: &dyn WaitStrategy,
        deadline: Instant,
    ) -> Result<bool>;

    /// Wakes the thread best positioned to acquire next, if any.
    ///
    /// Called by the release path after the owner word has been cleared.
    /// This is a wakeup aid for parked waiters; admission ordering is
    /// enforced by the queue links alone.
    fn unpark_successor(&self);
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates an identity for a queue instance, used to key the per-thread
/// node caches. Identities are never reused.
pub(crate) fn next_queue_id() -> u64 {
    NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed)
}

// SPDX-License-Identifier: MPL-2.0

//! The reentrant lock.
//!
//! The lock state is a pair: an atomic `owner` word holding the owning
//! thread's identity (zero when free) and a `hold` counter giving the
//! reentry depth. The counter is written only by the owner, so a plain
//! release store suffices; other threads read both words with snapshot
//! semantics.
//!
//! Acquisition is split between a fast path and the queue. The fast path
//! handles reentry and, on a non-fair lock, a single barging
//! compare-exchange on the owner word. Everything else goes through the
//! configured [`QueuePolicy`], which serializes admission and invokes a
//! closure over the owner word to perform the actual claim.
//!
//! [`QueuePolicy`]: crate::queue::QueuePolicy

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::debug;

use crate::condition::Condition;
use crate::park;
use crate::prelude::*;
use crate::queue::QueuePolicy;
use crate::stats::{Stats, StatsSnapshot};
use crate::wait::WaitStrategy;

/// A reentrant mutual-exclusion lock with a pluggable admission queue and
/// wait strategy.
///
/// Unlike the guard-based locks of the standard library, acquisition and
/// release are explicit and must be balanced by the caller: every
/// successful acquire is undone by one [`unlock`]. A thread may acquire
/// the lock it already owns; the lock is released for other threads once
/// the hold count returns to zero.
///
/// Construct instances through [`LockBuilder`], a [`Preset`], or
/// [`ReentrantLock::with_defaults`].
///
/// # Example
///
/// ```
/// use qlock::ReentrantLock;
///
/// let lock = ReentrantLock::with_defaults();
/// lock.lock();
/// lock.lock();
/// assert_eq!(lock.hold_count(), 2);
/// lock.unlock().unwrap();
/// lock.unlock().unwrap();
/// assert!(!lock.is_locked());
/// ```
///
/// [`unlock`]: ReentrantLock::unlock
/// [`LockBuilder`]: crate::LockBuilder
/// [`Preset`]: crate::Preset
pub struct ReentrantLock {
    /// Identity of the owning thread; zero when the lock is free.
    owner: AtomicU64,
    /// Reentry depth. Written only by the owner while `owner` names it.
    hold: AtomicUsize,
    /// When set, blocking and timed acquisitions never barge.
    fair: bool,
    queue: Box<dyn QueuePolicy>,
    strategy: Box<dyn WaitStrategy>,
    stats: Stats,
}

impl ReentrantLock {
    pub(crate) fn from_parts(
        queue: Box<dyn QueuePolicy>,
        strategy: Box<dyn WaitStrategy>,
        fair: bool,
    ) -> Self {
        Self {
            owner: AtomicU64::new(0),
            hold: AtomicUsize::new(0),
            fair,
            queue,
            strategy,
            stats: Stats::default(),
        }
    }

    /// Creates a non-fair CLH lock with the spin-then-park strategy.
    pub fn with_defaults() -> Self {
        crate::builder::LockBuilder::new().build_infallible()
    }

    /// Reports whether this lock admits strictly in arrival order.
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Acquires the lock, blocking until it is held.
    ///
    /// Reentrant: if the calling thread already owns the lock, the hold
    /// count is incremented. Interruption observed while blocked is
    /// absorbed and re-raised on the thread's flag before returning.
    pub fn lock(&self) {
        let me = park::current_thread_id().get();
        if self.try_reenter(me) {
            return;
        }
        if !self.fair && self.try_claim(me) {
            self.stats.count_acquire();
            return;
        }
        self.stats.count_contended();
        self.queue.acquire(&|| self.claim_queued(me), &*self.strategy);
        self.stats.count_acquire();
    }

    /// Acquires the lock unless the calling thread is interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the thread's interruption flag is
    /// set on entry or becomes set while blocked. The flag is cleared and
    /// the lock is not acquired.
    pub fn lock_interruptibly(&self) -> Result<()> {
        if park::interrupted() {
            return Err(Error::Interrupted);
        }
        let me = park::current_thread_id().get();
        if self.try_reenter(me) {
            return Ok(());
        }
        if !self.fair && self.try_claim(me) {
            self.stats.count_acquire();
            return Ok(());
        }
        self.stats.count_contended();
        match self
            .queue
            .acquire_interruptibly(&|| self.claim_queued(me), &*self.strategy)
        {
            Ok(()) => {
                self.stats.count_acquire();
                Ok(())
            }
            Err(err) => {
                debug!("lock acquisition interrupted");
                self.stats.count_interrupt();
                Err(err)
            }
        }
    }

    /// Acquires the lock only if that is possible without waiting.
    ///
    /// Always barges, even on a fair lock.
    pub fn try_lock(&self) -> bool {
        let me = park::current_thread_id().get();
        if self.try_reenter(me) {
            return true;
        }
        if self.try_claim(me) {
            self.stats.count_acquire();
            return true;
        }
        false
    }

    /// Acquires the lock, giving up after `timeout`.
    ///
    /// Returns `Ok(true)` if the lock was acquired and `Ok(false)` if the
    /// timeout elapsed first. On a fair lock the wait goes straight to the
    /// queue; on a non-fair lock a single barging attempt precedes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the calling thread is interrupted
    /// before the lock is acquired.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        if park::interrupted() {
            return Err(Error::Interrupted);
        }
        let me = park::current_thread_id().get();
        if self.try_reenter(me) {
            return Ok(true);
        }
        if !self.fair && self.try_claim(me) {
            self.stats.count_acquire();
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        self.stats.count_contended();
        match self
            .queue
            .acquire_timed(&|| self.claim_queued(me), &*self.strategy, deadline)
        {
            Ok(true) => {
                self.stats.count_acquire();
                Ok(true)
            }
            Ok(false) => {
                self.stats.count_timeout();
                Ok(false)
            }
            Err(err) => {
                self.stats.count_interrupt();
                Err(err)
            }
        }
    }

    /// Releases one hold on the lock.
    ///
    /// The lock becomes available to other threads once the hold count
    /// drops to zero, at which point the queue is asked to wake the next
    /// waiter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOwner`] if the calling thread does not hold the
    /// lock. The lock state is unchanged.
    pub fn unlock(&self) -> Result<()> {
        let me = park::current_thread_id().get();
        if self.owner.load(Ordering::Relaxed) != me {
            return Err(Error::NotOwner);
        }
        let hold = self.hold.load(Ordering::Relaxed);
        if hold > 1 {
            self.hold.store(hold - 1, Ordering::Release);
            return Ok(());
        }
        // Publish the zero count before the free owner word, and both
        // before waking a successor.
        self.hold.store(0, Ordering::Release);
        self.owner.store(0, Ordering::Release);
        self.queue.unpark_successor();
        Ok(())
    }

    /// Creates a new [`Condition`] bound to this lock.
    pub fn new_condition(self: &Arc<Self>) -> Condition {
        Condition::new(self.clone())
    }

    /// Reports whether any thread holds the lock. Snapshot semantics.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    /// Reports whether the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == park::current_thread_id().get()
    }

    /// Returns the calling thread's reentry depth, or zero if it does not
    /// hold the lock.
    pub fn hold_count(&self) -> usize {
        if self.is_held_by_current_thread() {
            self.hold.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Returns a copy of this lock's advisory counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Bumps the hold count if the calling thread already owns the lock.
    fn try_reenter(&self, me: u64) -> bool {
        if self.owner.load(Ordering::Relaxed) != me {
            return false;
        }
        let hold = self.hold.load(Ordering::Relaxed);
        self.hold.store(hold + 1, Ordering::Release);
        self.stats.count_acquire();
        true
    }

    /// A single barging claim of a free owner word.
    fn try_claim(&self, me: u64) -> bool {
        if self
            .owner
            .compare_exchange(0, me, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.hold.store(1, Ordering::Release);
        true
    }

    /// The claim closure handed to the queue. Also collapses the rare case
    /// where a condition reacquire raced this thread into the queue while
    /// it already took ownership.
    fn claim_queued(&self, me: u64) -> bool {
        if self.owner.load(Ordering::Acquire) == me {
            return true;
        }
        self.try_claim(me)
    }

    /// Drops every hold at once, returning the depth that was held.
    ///
    /// Condition-wait entry path; the caller must own the lock.
    pub(crate) fn release_all(&self) -> usize {
        let saved = self.hold.load(Ordering::Relaxed);
        self.hold.store(0, Ordering::Release);
        self.owner.store(0, Ordering::Release);
        self.queue.unpark_successor();
        saved
    }

    /// Regains the lock after a condition wait and restores the saved
    /// reentry depth.
    ///
    /// Each failed attempt parks for at most a millisecond; an unbounded
    /// spin here can live-lock against other reacquiring waiters.
    pub(crate) fn reacquire(&self, saved: usize) {
        while !self.try_lock() {
            thread::park_timeout(Duration::from_millis(1));
        }
        self.hold.store(saved, Ordering::Release);
    }
}

impl fmt::Debug for ReentrantLock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReentrantLock")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("hold", &self.hold.load(Ordering::Relaxed))
            .field("fair", &self.fair)
            .finish_non_exhaustive()
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Condition variables bound to a [`ReentrantLock`].
//!
//! A condition keeps its own FIFO of waiters, guarded by an internal spin
//! mutex that is only ever held across list mutation, never across a
//! park. Waiting atomically gives up the *entire* reentry depth of the
//! lock, parks until signalled (or interrupted, or timed out), and then
//! reacquires the lock to the exact depth held before. Every exit path
//! upholds that guarantee.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Instant;

use log::trace;

use crate::lock::ReentrantLock;
use crate::park;
use crate::prelude::*;

/// The longest single park inside a timed wait or a reacquire loop.
const PARK_SLICE: Duration = Duration::from_millis(1);

struct Waiter {
    thread: Thread,
    signalled: AtomicBool,
}

/// A condition variable tied to one [`ReentrantLock`].
///
/// Created through [`ReentrantLock::new_condition`]. All operations
/// require the calling thread to hold the lock; they fail with
/// [`Error::NotOwner`] otherwise.
///
/// As with any condition variable, waits should be wrapped in a loop that
/// re-checks the awaited predicate.
pub struct Condition {
    lock: Arc<ReentrantLock>,
    waiters: spin::Mutex<VecDeque<Arc<Waiter>>>,
}

impl Condition {
    pub(crate) fn new(lock: Arc<ReentrantLock>) -> Self {
        Self {
            lock,
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    /// Releases the lock and waits until signalled.
    ///
    /// On return, normal or erroneous, the lock is held again at the
    /// same reentry depth as on entry.
    ///
    /// # Errors
    ///
    /// [`Error::NotOwner`] if the caller does not hold the lock;
    /// [`Error::Interrupted`] if the thread is interrupted while waiting.
    pub fn wait(&self) -> Result<()> {
        self.require_owner()?;
        let waiter = self.enqueue_waiter();
        let saved = self.lock.release_all();
        loop {
            if waiter.signalled.load(Ordering::Acquire) {
                break;
            }
            if park::interrupted() {
                let removed = self.remove_waiter(&waiter);
                self.lock.reacquire(saved);
                if removed {
                    return Err(Error::Interrupted);
                }
                // A signal already claimed this waiter; consume the wake
                // and defer the interruption.
                park::raise_interrupt();
                return Ok(());
            }
            thread::park();
        }
        self.lock.reacquire(saved);
        Ok(())
    }

    /// Like [`wait`](Condition::wait), but interruption observed while
    /// parked is deferred: the wait continues and the flag is re-raised
    /// after the lock is reacquired.
    pub fn wait_uninterruptibly(&self) -> Result<()> {
        self.require_owner()?;
        let waiter = self.enqueue_waiter();
        let saved = self.lock.release_all();
        let mut deferred = false;
        while !waiter.signalled.load(Ordering::Acquire) {
            if park::interrupted() {
                deferred = true;
            }
            thread::park();
        }
        self.lock.reacquire(saved);
        if deferred {
            park::raise_interrupt();
        }
        Ok(())
    }

    /// Releases the lock and waits until signalled or until `nanos`
    /// nanoseconds have elapsed.
    ///
    /// Returns the residual time budget; a value of zero or less means the
    /// wait timed out.
    ///
    /// # Errors
    ///
    /// As for [`wait`](Condition::wait).
    pub fn wait_nanos(&self, nanos: i64) -> Result<i64> {
        self.require_owner()?;
        let deadline = Instant::now() + Duration::from_nanos(nanos.max(0) as u64);
        let waiter = self.enqueue_waiter();
        let saved = self.lock.release_all();
        loop {
            if waiter.signalled.load(Ordering::Acquire) {
                self.lock.reacquire(saved);
                return Ok(remaining_nanos(deadline));
            }
            if park::interrupted() {
                let removed = self.remove_waiter(&waiter);
                self.lock.reacquire(saved);
                if removed {
                    return Err(Error::Interrupted);
                }
                park::raise_interrupt();
                return Ok(remaining_nanos(deadline));
            }
            let remaining = remaining_nanos(deadline);
            if remaining <= 0 {
                let removed = self.remove_waiter(&waiter);
                self.lock.reacquire(saved);
                if removed {
                    trace!("condition wait timed out");
                }
                // If the waiter was already claimed by a signal, the wake
                // is consumed; the residual still reports the overrun.
                return Ok(remaining);
            }
            let budget = Duration::from_nanos(remaining as u64).min(PARK_SLICE);
            thread::park_timeout(budget);
        }
    }

    /// Releases the lock and waits until signalled or until `timeout`
    /// elapses. Returns `Ok(true)` if the wait ended with time to spare.
    ///
    /// # Errors
    ///
    /// As for [`wait`](Condition::wait).
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let nanos = i64::try_from(timeout.as_nanos()).unwrap_or(i64::MAX);
        Ok(self.wait_nanos(nanos)? > 0)
    }

    /// Releases the lock and waits until signalled or until `deadline`.
    /// Returns `Ok(false)` if the deadline was already past or passes
    /// while waiting.
    ///
    /// # Errors
    ///
    /// As for [`wait`](Condition::wait).
    pub fn wait_until(&self, deadline: Instant) -> Result<bool> {
        let now = Instant::now();
        let nanos = if deadline <= now {
            0
        } else {
            i64::try_from((deadline - now).as_nanos()).unwrap_or(i64::MAX)
        };
        Ok(self.wait_nanos(nanos)? > 0)
    }

    /// Wakes the longest-waiting thread, if any.
    ///
    /// # Errors
    ///
    /// [`Error::NotOwner`] if the caller does not hold the lock.
    pub fn signal(&self) -> Result<()> {
        self.require_owner()?;
        let waiter = self.waiters.lock().pop_front();
        if let Some(waiter) = waiter {
            waiter.signalled.store(true, Ordering::Release);
            waiter.thread.unpark();
        }
        Ok(())
    }

    /// Wakes every thread currently waiting.
    ///
    /// # Errors
    ///
    /// [`Error::NotOwner`] if the caller does not hold the lock.
    pub fn signal_all(&self) -> Result<()> {
        self.require_owner()?;
        // Detach the whole FIFO first; unparking happens outside the
        // internal mutex.
        let drained: Vec<_> = self.waiters.lock().drain(..).collect();
        for waiter in drained {
            waiter.signalled.store(true, Ordering::Release);
            waiter.thread.unpark();
        }
        Ok(())
    }

    /// Reports whether any thread is waiting on this condition.
    /// Snapshot semantics; the caller should hold the lock for a stable
    /// answer.
    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }

    fn require_owner(&self) -> Result<()> {
        if !self.lock.is_held_by_current_thread() {
            return Err(Error::NotOwner);
        }
        Ok(())
    }

    fn enqueue_waiter(&self) -> Arc<Waiter> {
        let waiter = Arc::new(Waiter {
            thread: thread::current(),
            signalled: AtomicBool::new(false),
        });
        self.waiters.lock().push_back(waiter.clone());
        waiter
    }

    /// Removes `waiter` from the FIFO. Returns false if a signal already
    /// claimed it.
    fn remove_waiter(&self, waiter: &Arc<Waiter>) -> bool {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            waiters.remove(pos);
            true
        } else {
            false
        }
    }
}

fn remaining_nanos(deadline: Instant) -> i64 {
    let now = Instant::now();
    if deadline >= now {
        i64::try_from((deadline - now).as_nanos()).unwrap_or(i64::MAX)
    } else {
        -i64::try_from((now - deadline).as_nanos()).unwrap_or(i64::MAX)
    }
}

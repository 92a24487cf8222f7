// SPDX-License-Identifier: MPL-2.0

//! Thread identity and cooperative interruption.
//!
//! The lock and condition machinery needs three things from the hosting
//! runtime: a stable integer identity per thread (for the owner word), a way
//! to park and unpark threads (provided by `std::thread`), and a cooperative
//! per-thread interruption flag. The standard library offers no interruption
//! flag, so this module provides one: an atomic bit attached to each thread,
//! settable from other threads through a cloneable [`InterruptHandle`].
//! Raising the flag also unparks the target thread so that blocked
//! operations observe it promptly.
//!
//! Observation follows test-and-clear semantics: [`interrupted`] reports the
//! flag and resets it, so an interruption is consumed by whoever surfaces it.

use core::num::NonZeroU64;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

struct InterruptState {
    flag: AtomicBool,
    thread: Thread,
}

struct ThreadState {
    id: NonZeroU64,
    interrupt: Arc<InterruptState>,
}

thread_local! {
    static CURRENT: ThreadState = ThreadState {
        id: match NonZeroU64::new(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)) {
            Some(id) => id,
            // The counter starts at 1; zero would mean it wrapped after
            // 2^64 thread births. Aliasing two threads onto one identity
            // would silently break mutual exclusion, so refuse instead.
            None => unreachable!("thread id counter wrapped"),
        },
        interrupt: Arc::new(InterruptState {
            flag: AtomicBool::new(false),
            thread: thread::current(),
        }),
    };
}

/// Returns the calling thread's crate-assigned identity.
///
/// Identities are allocated from a global counter on first use and are never
/// reused, so they can serve as the owner word of a lock.
pub(crate) fn current_thread_id() -> NonZeroU64 {
    CURRENT.with(|state| state.id)
}

/// Returns a handle to the calling thread's interruption flag.
///
/// The handle can be sent to other threads, which may then interrupt this
/// thread while it blocks in [`lock_interruptibly`], [`try_lock_for`], or a
/// condition wait.
///
/// [`lock_interruptibly`]: crate::ReentrantLock::lock_interruptibly
/// [`try_lock_for`]: crate::ReentrantLock::try_lock_for
pub fn interrupt_handle() -> InterruptHandle {
    InterruptHandle {
        state: CURRENT.with(|state| state.interrupt.clone()),
    }
}

/// Reports whether the calling thread has been interrupted, clearing the
/// flag in the process.
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.interrupt.flag.swap(false, Ordering::AcqRel))
}

/// Reports whether the calling thread has been interrupted without clearing
/// the flag.
pub fn is_interrupted() -> bool {
    CURRENT.with(|state| state.interrupt.flag.load(Ordering::Acquire))
}

/// Re-raises the calling thread's interruption flag.
///
/// Used by the non-interruptible blocking paths, which absorb an observed
/// interruption and restore it before returning.
pub(crate) fn raise_interrupt() {
    CURRENT.with(|state| state.interrupt.flag.store(true, Ordering::Release));
}

/// A cloneable handle to one thread's interruption flag.
pub struct InterruptHandle {
    state: Arc<InterruptState>,
}

impl InterruptHandle {
    /// Interrupts the designated thread: sets its flag and unparks it.
    pub fn interrupt(&self) {
        self.state.flag.store(true, Ordering::Release);
        self.state.thread.unpark();
    }

    /// Reports whether the flag is currently raised.
    pub fn is_interrupted(&self) -> bool {
        self.state.flag.load(Ordering::Acquire)
    }
}

impl Clone for InterruptHandle {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    mod identity {
        use super::*;

        #[test]
        fn stable_within_a_thread() {
            assert_eq!(current_thread_id(), current_thread_id());
        }

        #[test]
        fn distinct_across_threads() {
            let mine = current_thread_id();
            let theirs = thread::spawn(current_thread_id).join().unwrap();
            assert_ne!(mine, theirs);
        }
    }

    mod interruption {
        use super::*;

        #[test]
        fn observe_clears() {
            let handle = interrupt_handle();
            handle.interrupt();
            assert!(is_interrupted());
            assert!(interrupted());
            assert!(!interrupted());
        }

        #[test]
        fn raise_restores() {
            assert!(!interrupted());
            raise_interrupt();
            assert!(interrupted());
        }

        #[test]
        fn wakes_a_parked_thread() {
            let (tx, rx) = std::sync::mpsc::channel();
            let worker = thread::spawn(move || {
                tx.send(interrupt_handle()).unwrap();
                while !interrupted() {
                    thread::park();
                }
            });
            let handle = rx.recv().unwrap();
            handle.interrupt();
            worker.join().unwrap();
        }

        #[test]
        fn handle_survives_cloning() {
            let handle = interrupt_handle().clone();
            handle.interrupt();
            assert!(handle.is_interrupted());
            assert!(interrupted());
        }
    }

    // The parking facility itself belongs to std; this only pins down the
    // token semantics the wait loops rely on.
    #[test]
    fn unpark_token_outlives_the_next_park() {
        thread::current().unpark();
        let before = std::time::Instant::now();
        thread::park_timeout(Duration::from_secs(5));
        assert!(before.elapsed() < Duration::from_secs(5));
    }
}

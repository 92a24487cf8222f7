// SPDX-License-Identifier: MPL-2.0

//! Time-bounded acquisition.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use qlock::{LockBuilder, QueueKind, ReentrantLock, WaitKind};

/// A bounded try-lock on a held lock expires, and no earlier than its
/// budget; after the release the next bounded try-lock succeeds.
fn expires_then_succeeds(queue: QueueKind) {
    let lock = LockBuilder::new()
        .queue(queue)
        .wait(WaitKind::SpinThenPark { spins: 16 })
        .build()
        .unwrap();
    let (tx, rx) = mpsc::channel();

    lock.lock();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            let started = Instant::now();
            let acquired = lock.try_lock_for(Duration::from_millis(50)).unwrap();
            tx.send((acquired, started.elapsed())).unwrap();

            let acquired = lock.try_lock_for(Duration::from_secs(10)).unwrap();
            assert!(acquired);
            lock.unlock().unwrap();
            tx.send((acquired, Duration::ZERO)).unwrap();
        });

        let (acquired, elapsed) = rx.recv().unwrap();
        assert!(!acquired);
        assert!(
            elapsed >= Duration::from_millis(50),
            "timed out after only {:?}",
            elapsed
        );
        lock.unlock().unwrap();
        let (acquired, _) = rx.recv().unwrap();
        assert!(acquired);
    });

    assert!(!lock.is_locked());
    assert_eq!(lock.stats().timeouts, 1);
}

#[test]
fn clh_timed_acquire_expires_then_succeeds() {
    expires_then_succeeds(QueueKind::Clh);
}

#[test]
fn mcs_timed_acquire_expires_then_succeeds() {
    expires_then_succeeds(QueueKind::Mcs);
}

#[test]
fn timed_acquire_reenters_immediately() {
    let lock = ReentrantLock::with_defaults();
    lock.lock();
    assert!(lock.try_lock_for(Duration::from_millis(1)).unwrap());
    assert_eq!(lock.hold_count(), 2);
    lock.unlock().unwrap();
    lock.unlock().unwrap();
}

#[test]
fn fair_timed_acquire_goes_through_the_queue() {
    let lock = LockBuilder::new().fair(true).build().unwrap();
    assert!(lock.try_lock_for(Duration::from_secs(5)).unwrap());
    lock.unlock().unwrap();
    assert!(!lock.is_locked());
    assert_eq!(lock.stats().contended, 1);
}

/// A zero-length budget degrades to a try that fails while the lock is
/// held elsewhere.
#[test]
fn zero_budget_expires_on_a_held_lock() {
    let lock = ReentrantLock::with_defaults();
    lock.lock();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            assert!(!lock.try_lock_for(Duration::ZERO).unwrap());
        });
    });
    lock.unlock().unwrap();
}

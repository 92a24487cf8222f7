// SPDX-License-Identifier: MPL-2.0

//! Mutual-exclusion and reentry scenarios across every configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};

use qlock::{LockBuilder, QueueKind, ReentrantLock, WaitKind};

fn all_configurations() -> Vec<ReentrantLock> {
    let mut locks = Vec::new();
    for queue in [QueueKind::Clh, QueueKind::Mcs] {
        for wait in [
            WaitKind::BusySpin { max_spins: 32 },
            WaitKind::SpinThenPark { spins: 32 },
        ] {
            for fair in [false, true] {
                locks.push(
                    LockBuilder::new()
                        .queue(queue)
                        .wait(wait)
                        .fair(fair)
                        .build()
                        .unwrap(),
                );
            }
        }
    }
    locks
}

/// At every instant at most one thread sits between the lock and unlock of
/// a critical section.
#[test]
fn mutual_exclusion_holds_under_contention() {
    const THREADS: usize = 4;
    const ITERS: u64 = 200;

    for lock in all_configurations() {
        let in_critical = AtomicU64::new(0);
        let total = AtomicU64::new(0);
        let barrier = Barrier::new(THREADS);
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    barrier.wait();
                    for _ in 0..ITERS {
                        lock.lock();
                        assert_eq!(in_critical.fetch_add(1, Ordering::AcqRel), 0);
                        // Critical sections of uneven length.
                        for _ in 0..rand::random::<u8>() % 32 {
                            core::hint::spin_loop();
                        }
                        total.fetch_add(1, Ordering::Relaxed);
                        in_critical.fetch_sub(1, Ordering::AcqRel);
                        lock.unlock().unwrap();
                    }
                });
            }
        });
        assert_eq!(total.load(Ordering::Relaxed), (THREADS as u64) * ITERS);
        assert!(!lock.is_locked());
    }
}

/// Balanced nested acquisitions restore the pre-acquire state even while
/// other threads contend.
#[test]
fn reentry_is_preserved_under_contention() {
    let lock = ReentrantLock::with_defaults();
    let barrier = Barrier::new(3);
    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..100 {
                    lock.lock();
                    lock.lock();
                    lock.lock();
                    assert_eq!(lock.hold_count(), 3);
                    lock.unlock().unwrap();
                    assert_eq!(lock.hold_count(), 2);
                    lock.unlock().unwrap();
                    lock.unlock().unwrap();
                    assert_eq!(lock.hold_count(), 0);
                }
            });
        }
    });
    assert!(!lock.is_locked());
}

/// Eight threads hammer an MCS lock; every acquisition is accounted for
/// and the lock ends quiescent.
#[test]
fn mcs_stress_accounts_for_every_acquire() {
    const THREADS: usize = 8;
    const ITERS: u64 = 1000;

    let lock = Arc::new(
        LockBuilder::new()
            .queue(QueueKind::Mcs)
            .wait(WaitKind::SpinThenPark { spins: 16 })
            .build()
            .unwrap(),
    );
    let total = AtomicU64::new(0);
    let barrier = Barrier::new(THREADS);
    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                barrier.wait();
                for _ in 0..ITERS {
                    lock.lock();
                    total.fetch_add(1, Ordering::Relaxed);
                    lock.unlock().unwrap();
                }
            });
        }
    });
    assert_eq!(total.load(Ordering::Relaxed), (THREADS as u64) * ITERS);
    assert!(!lock.is_locked());
    assert_eq!(lock.stats().acquires, (THREADS as u64) * ITERS);
}

/// `try_lock` only ever succeeds on a free or self-owned lock.
#[test]
fn try_lock_respects_exclusion() {
    let lock = ReentrantLock::with_defaults();
    let total = AtomicU64::new(0);
    let barrier = Barrier::new(4);
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                barrier.wait();
                let mut acquired = 0u64;
                while acquired < 50 {
                    if lock.try_lock() {
                        acquired += 1;
                        total.fetch_add(1, Ordering::Relaxed);
                        lock.unlock().unwrap();
                    } else {
                        std::thread::yield_now();
                    }
                }
            });
        }
    });
    assert_eq!(total.load(Ordering::Relaxed), 200);
    assert!(!lock.is_locked());
}

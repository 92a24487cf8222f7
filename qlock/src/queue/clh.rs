// SPDX-License-Identifier: MPL-2.0

//! CLH queue policy.
//!
//! # Overview
//!
//! An implicit linked-list lock queue in the style of Craig, Landin and
//! Hagersten. Each waiter installs its node as the new tail with an atomic
//! exchange and then spins on the `locked` flag of its predecessor, the
//! node the exchange handed back. When a thread passes that gate it
//! contends for the owner word, and only after winning does it clear its
//! own `locked` flag, admitting the next waiter.
//!
//! # Node lifetime
//!
//! Nodes circulate instead of belonging to a fixed thread. The queue starts
//! with a sentinel node whose gate is open, so every enqueue observes a
//! predecessor. After acquiring, a thread abandons the node it enqueued
//! (its successor keeps spinning on it and later adopts it) and takes its
//! predecessor's node for the next acquisition. At that point the
//! predecessor's node is referenced by no one else: the exchange on `tail`
//! hands each node to exactly one successor, and that successor is done
//! with it. This keeps the node population at one per participating thread
//! plus the sentinel, with no per-acquire allocation.
//!
//! Every node is additionally pinned in a registry for the queue's
//! lifetime, so the raw link pointers stored in nodes always reference
//! live allocations.
//!
//! # Cancellation
//!
//! A timed-out or interrupted waiter unlinks itself: it restores the tail
//! if it was the last node, or splices its neighbors together, re-aiming
//! the successor's backward link at its own predecessor. Waiters re-read
//! their backward link on every spin iteration, so the relink redirects
//! the spin within one pacing round. The cancelled node's gate is also
//! opened so that a successor caught mid-iteration falls through to the
//! owner-word loop, where mutual exclusion is still enforced.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Instant;

use log::trace;

use super::{next_queue_id, QueuePolicy};
use crate::park;
use crate::prelude::*;
use crate::wait::WaitStrategy;

struct ClhNode {
    /// True while this node's holder has not yet admitted its successor.
    locked: AtomicBool,
    /// The node whose gate this waiter spins on. Re-read every iteration.
    prev: AtomicPtr<ClhNode>,
    /// Forward link for the release-side traversal.
    next: AtomicPtr<ClhNode>,
    /// The thread currently waiting on this node, for unparking. Rewritten
    /// on every reuse, hence the interior mutex.
    thread: spin::Mutex<Option<Thread>>,
}

impl ClhNode {
    fn new(locked: bool) -> Arc<Self> {
        Arc::new(Self {
            locked: AtomicBool::new(locked),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            thread: spin::Mutex::new(None),
        })
    }

    fn unpark(&self) {
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.unpark();
        }
    }
}

thread_local! {
    /// Per-thread node slots, keyed by queue identity. A slot holds the
    /// node this thread will enqueue next on that queue.
    static SLOTS: RefCell<HashMap<u64, Arc<ClhNode>>> = RefCell::new(HashMap::new());
}

/// CLH admission queue. See the module documentation.
pub(crate) struct ClhQueue {
    id: u64,
    tail: AtomicPtr<ClhNode>,
    /// Pins every node of this queue so link pointers stay valid.
    nodes: spin::Mutex<Vec<Arc<ClhNode>>>,
}

impl ClhQueue {
    pub(crate) fn new() -> Self {
        let sentinel = ClhNode::new(false);
        Self {
            id: next_queue_id(),
            tail: AtomicPtr::new(Arc::as_ptr(&sentinel).cast_mut()),
            nodes: spin::Mutex::new(vec![sentinel]),
        }
    }

    /// Returns the calling thread's node for this queue, allocating and
    /// registering one on first use.
    fn local_node(&self) -> Arc<ClhNode> {
        SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(node) = slots.get(&self.id) {
                return node.clone();
            }
            let node = ClhNode::new(true);
            self.nodes.lock().push(node.clone());
            slots.insert(self.id, node.clone());
            node
        })
    }

    /// Swaps the calling thread's slot to the node it just inherited from
    /// its predecessor.
    fn adopt(&self, pred: *mut ClhNode) {
        let adopted = self
            .nodes
            .lock()
            .iter()
            .find(|node| ptr::eq(Arc::as_ptr(node), pred))
            .cloned();
        let slot = match adopted {
            Some(node) => node,
            // Every gate pointer originates from a registered node. Were
            // one ever missing, the abandoned node must still not be
            // reused, so fall back to a fresh allocation.
            None => {
                debug_assert!(false, "gate node not in the registry");
                let node = ClhNode::new(true);
                self.nodes.lock().push(node.clone());
                node
            }
        };
        SLOTS.with(|slots| {
            slots.borrow_mut().insert(self.id, slot);
        });
    }

    fn do_acquire(
        &self,
        try_acquire: &dyn Fn() -> bool,
        strategy: &dyn WaitStrategy,
        deadline: Option<Instant>,
        interruptible: bool,
    ) -> Result<bool> {
        let node_arc = self.local_node();
        let node = Arc::as_ptr(&node_arc).cast_mut();
        // SAFETY: the node is pinned by this queue's registry, as is every
        // node reachable through link pointers below.
        let node_ref = unsafe { &*node };

        // The node is quiescent here: it has either never been enqueued or
        // its previous incarnation was fully consumed before adoption.
        *node_ref.thread.lock() = Some(thread::current());
        node_ref.locked.store(true, Ordering::Relaxed);
        node_ref.prev.store(ptr::null_mut(), Ordering::Relaxed);
        node_ref.next.store(ptr::null_mut(), Ordering::Relaxed);

        // Arrival order is fixed here. The sentinel guarantees a
        // predecessor.
        let pred = self.tail.swap(node, Ordering::SeqCst);
        node_ref.prev.store(pred, Ordering::Release);
        // SAFETY: registry-pinned; see above.
        unsafe { (*pred).next.store(node, Ordering::Release) };

        let mut deferred = false;

        // Wait for the predecessor gate. `prev` is re-read every iteration
        // so that a cancelling predecessor can redirect the spin; the node
        // we finally gate on is the one this thread adopts below.
        let gate = loop {
            let gate = node_ref.prev.load(Ordering::Acquire);
            debug_assert!(!gate.is_null());
            // SAFETY: registry-pinned.
            if !unsafe { (*gate).locked.load(Ordering::Acquire) } {
                break gate;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.cancel(node);
                    return Ok(false);
                }
            }
            if let Err(err) = strategy.wait() {
                if interruptible {
                    self.cancel(node);
                    return Err(err);
                }
                deferred = true;
            }
        };

        // Admitted: contend for the owner word. Interruption and the
        // deadline stay observable while the current owner holds on.
        loop {
            if try_acquire() {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.cancel(node);
                    return Ok(false);
                }
            }
            if let Err(err) = strategy.wait() {
                if interruptible {
                    self.cancel(node);
                    return Err(err);
                }
                deferred = true;
            }
        }

        // Acquired: detach so the release-side walk terminates here, open
        // the gate for the successor, and rotate onto the node we gated
        // on. Adopting the gate (rather than the enqueue-time predecessor)
        // matters after a cancellation relink: the cancelled thread keeps
        // its own node, and only this thread ever references the gate.
        node_ref.prev.store(ptr::null_mut(), Ordering::Release);
        node_ref.locked.store(false, Ordering::Release);
        self.adopt(gate);

        if deferred {
            park::raise_interrupt();
        }
        Ok(true)
    }

    /// Unlinks a waiter that timed out or was interrupted.
    fn cancel(&self, node: *mut ClhNode) {
        // SAFETY: registry-pinned.
        let node_ref = unsafe { &*node };
        let prev = node_ref.prev.load(Ordering::Acquire);
        if self
            .tail
            .compare_exchange(node, prev, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // We were the tail: the queue now ends at our predecessor.
            // Retract its forward link if it still names us.
            if !prev.is_null() {
                // SAFETY: registry-pinned.
                let _ = unsafe {
                    (*prev).next.compare_exchange(
                        node,
                        ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                };
            }
        } else {
            // A successor exists, though it may still be publishing its
            // link. Wait for it, then splice around this node.
            let mut next = node_ref.next.load(Ordering::Acquire);
            while next.is_null() {
                core::hint::spin_loop();
                next = node_ref.next.load(Ordering::Acquire);
            }
            // SAFETY: registry-pinned.
            unsafe {
                if !prev.is_null() {
                    let _ = (*prev).next.compare_exchange(
                        node,
                        next,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                }
                (*next).prev.store(prev, Ordering::Release);
            }
        }
        node_ref.prev.store(ptr::null_mut(), Ordering::Release);
        node_ref.next.store(ptr::null_mut(), Ordering::Release);
        // A successor caught mid-iteration on this node falls through to
        // the owner-word loop.
        node_ref.locked.store(false, Ordering::Release);
        trace!("clh queue {}: waiter cancelled", self.id);
    }
}

impl QueuePolicy for ClhQueue {
    fn acquire(&self, try_acquire: &dyn Fn() -> bool, strategy: &dyn WaitStrategy) {
        // No deadline and interruption deferred: cannot fail.
        let _ = self.do_acquire(try_acquire, strategy, None, false);
    }

    fn acquire_interruptibly(
        &self,
        try_acquire: &dyn Fn() -> bool,
        strategy: &dyn WaitStrategy,
    ) -> Result<()> {
        self.do_acquire(try_acquire, strategy, None, true).map(|_| ())
    }

    fn acquire_timed(
        &self,
        try_acquire: &dyn Fn() -> bool,
        strategy: &dyn WaitStrategy,
        deadline: Instant,
    ) -> Result<bool> {
        self.do_acquire(try_acquire, strategy, Some(deadline), true)
    }

    fn unpark_successor(&self) {
        let limit = self.nodes.lock().len();
        let mut cur = self.tail.load(Ordering::SeqCst);
        // Walk back to the head-most linked node. Concurrent
        // cancellations can transiently reshape the chain, so the walk is
        // bounded.
        for _ in 0..limit {
            // SAFETY: registry-pinned.
            let prev = unsafe { (*cur).prev.load(Ordering::Acquire) };
            if prev.is_null() {
                break;
            }
            cur = prev;
        }
        // SAFETY: registry-pinned.
        let cur_ref = unsafe { &*cur };
        let target = if cur_ref.locked.load(Ordering::Acquire) {
            // The head-most node is itself still waiting.
            cur
        } else {
            // The head-most node already acquired (or is the sentinel);
            // the node after it is the oldest waiter.
            cur_ref.next.load(Ordering::Acquire)
        };
        if !target.is_null() {
            // SAFETY: registry-pinned.
            unsafe { (*target).unpark() };
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::AtomicU64;
    use std::sync::Barrier;
    use std::time::Duration;

    use crate::wait::SpinThenPark;

    fn strategy() -> SpinThenPark {
        SpinThenPark::new(4).unwrap()
    }

    /// A miniature lock word driven through the queue, mirroring how the
    /// reentrant core uses it.
    struct Word(AtomicU64);

    impl Word {
        fn new() -> Self {
            Word(AtomicU64::new(0))
        }

        fn claim(&self) -> bool {
            let me = park::current_thread_id().get();
            self.0
                .compare_exchange(0, me, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        }

        fn release(&self) {
            self.0.store(0, Ordering::Release);
        }
    }

    #[test]
    fn uncontended_acquire_passes_the_sentinel_gate() {
        let queue = ClhQueue::new();
        let word = Word::new();
        queue.acquire(&|| word.claim(), &strategy());
        word.release();
        queue.unpark_successor();
    }

    #[test]
    fn nodes_circulate_without_growing() {
        let queue = ClhQueue::new();
        let word = Word::new();
        for _ in 0..16 {
            queue.acquire(&|| word.claim(), &strategy());
            word.release();
            queue.unpark_successor();
        }
        // One thread: the sentinel and at most one thread-allocated node.
        assert!(queue.nodes.lock().len() <= 2);
    }

    #[test]
    fn contended_admission_is_serialized() {
        let queue = ClhQueue::new();
        let word = Word::new();
        let in_critical = AtomicU64::new(0);
        let total = AtomicU64::new(0);
        let barrier = Barrier::new(4);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    barrier.wait();
                    for _ in 0..100 {
                        queue.acquire(&|| word.claim(), &strategy());
                        assert_eq!(in_critical.fetch_add(1, Ordering::AcqRel), 0);
                        total.fetch_add(1, Ordering::Relaxed);
                        in_critical.fetch_sub(1, Ordering::AcqRel);
                        word.release();
                        queue.unpark_successor();
                    }
                });
            }
        });
        assert_eq!(total.load(Ordering::Relaxed), 400);
    }

    #[test]
    fn timed_acquire_expires_while_the_word_is_held() {
        let queue = ClhQueue::new();
        let word = Word::new();
        let holder_id = 1u64;
        word.0.store(holder_id, Ordering::Release);
        let deadline = Instant::now() + Duration::from_millis(20);
        let acquired = queue
            .acquire_timed(&|| word.claim(), &strategy(), deadline)
            .unwrap();
        assert!(!acquired);
        // The queue must be reusable after the cancellation.
        word.release();
        let deadline = Instant::now() + Duration::from_secs(5);
        let acquired = queue
            .acquire_timed(&|| word.claim(), &strategy(), deadline)
            .unwrap();
        assert!(acquired);
    }

    #[test]
    fn interruption_cancels_a_queued_waiter() {
        let queue = ClhQueue::new();
        let word = Word::new();
        word.0.store(1, Ordering::Release); // held by a fictitious owner
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                tx.send(park::interrupt_handle()).unwrap();
                let err = queue
                    .acquire_interruptibly(&|| word.claim(), &strategy())
                    .unwrap_err();
                assert_eq!(err, Error::Interrupted);
            });
            rx.recv().unwrap().interrupt();
        });
        // The cancelled waiter must have left the queue walkable.
        queue.unpark_successor();
        word.release();
        queue.acquire(&|| word.claim(), &strategy());
    }
}

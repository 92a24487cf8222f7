// SPDX-License-Identifier: MPL-2.0

//! MCS queue policy.
//!
//! # Overview
//!
//! An explicit linked-list lock queue in the style of Mellor-Crummey and
//! Scott. Each waiter spins on the admission gate of its *own* node, which
//! keeps the spin traffic on a cache line local to the waiter. A thread
//! with no predecessor contends for the owner word immediately; otherwise
//! it publishes itself as its predecessor's successor and waits for the
//! predecessor to open its gate.
//!
//! The gate handoff happens on the acquire side: once a thread wins the
//! owner word it leaves the queue, opening its successor's gate (and
//! unparking it) or resetting the tail if it was last. A successor that is
//! mid-enqueue is briefly waited for, so the direct handoff always lands
//! in the incarnation that published the link.
//!
//! # Node reuse and generations
//!
//! Nodes are allocated once per (thread, queue) pair, cached in a
//! thread-local map, and pinned by a per-queue registry for the queue's
//! lifetime. A node has no backward link, so a cancelled waiter cannot
//! retract the `next` pointer its predecessor still holds; that
//! predecessor may fire its handoff at the node arbitrarily later, after
//! the node has been re-enqueued for a new acquisition. Every use of a
//! node therefore bumps its generation, the successor publishes that
//! generation alongside the link, and the handoff writes the published
//! generation into the gate. The waiter only passes a gate naming its own
//! generation, so a handoff aimed at a cancelled incarnation evaporates
//! instead of admitting the node out of arrival order.
//!
//! # Cancellation
//!
//! A cancelled tail restores the queue with a compare-exchange to empty;
//! the information needed to restore an interior predecessor does not
//! exist in this discipline, so a cancelled interior waiter instead
//! transfers its admission to its successor. The successor then contends
//! on the owner word; mutual exclusion is unaffected, and arrival order is
//! perturbed only around the cancellation.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
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

struct McsNode {
    /// Bumped once per acquisition attempt. Handoffs are tagged with the
    /// generation the link was published for.
    generation: AtomicU64,
    /// Admission gate: holds the generation that has been admitted. The
    /// waiter passes once it names the waiter's own generation.
    gate: AtomicU64,
    /// The successor, published by the successor itself after the tail
    /// exchange, together with the generation it enqueued with.
    next: AtomicPtr<McsNode>,
    next_generation: AtomicU64,
    /// The owning thread. An MCS node never changes hands.
    thread: Thread,
}

thread_local! {
    /// Per-thread nodes, keyed by queue identity.
    static NODES: RefCell<HashMap<u64, Arc<McsNode>>> = RefCell::new(HashMap::new());
}

/// MCS admission queue. See the module documentation.
pub(crate) struct McsQueue {
    id: u64,
    /// The most recently enqueued node; null when the queue is idle.
    tail: AtomicPtr<McsNode>,
    /// Pins every node of this queue so link pointers stay valid.
    nodes: spin::Mutex<Vec<Arc<McsNode>>>,
}

impl McsQueue {
    pub(crate) fn new() -> Self {
        Self {
            id: next_queue_id(),
            tail: AtomicPtr::new(ptr::null_mut()),
            nodes: spin::Mutex::new(Vec::new()),
        }
    }

    fn local_node(&self) -> Arc<McsNode> {
        NODES.with(|nodes| {
            let mut nodes = nodes.borrow_mut();
            if let Some(node) = nodes.get(&self.id) {
                return node.clone();
            }
            let node = Arc::new(McsNode {
                generation: AtomicU64::new(0),
                gate: AtomicU64::new(0),
                next: AtomicPtr::new(ptr::null_mut()),
                next_generation: AtomicU64::new(0),
                thread: thread::current(),
            });
            self.nodes.lock().push(node.clone());
            nodes.insert(self.id, node.clone());
            node
        })
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

        // New incarnation. A former predecessor may still hold a link to
        // this node and fire a handoff at it, but that handoff carries the
        // old generation and cannot open the gate below.
        let generation = node_ref.generation.fetch_add(1, Ordering::Relaxed) + 1;
        node_ref.next.store(ptr::null_mut(), Ordering::Relaxed);

        let pred = self.tail.swap(node, Ordering::SeqCst);
        let mut deferred = false;

        if !pred.is_null() {
            // Publish the link and the generation it admits. The
            // generation store is ordered before the link store, so a
            // consumer of `next` always sees the matching pair.
            // SAFETY: registry-pinned.
            unsafe {
                (*pred).next_generation.store(generation, Ordering::Release);
                (*pred).next.store(node, Ordering::Release);
            }
            // Wait on our own gate until the predecessor admits this
            // generation.
            while node_ref.gate.load(Ordering::Acquire) != generation {
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
        }

        // Admitted: contend for the owner word.
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

        self.leave(node);

        if deferred {
            park::raise_interrupt();
        }
        Ok(true)
    }

    /// Leaves the queue after a successful acquire, admitting the
    /// successor if one exists.
    fn leave(&self, node: *mut McsNode) {
        // SAFETY: registry-pinned.
        let node_ref = unsafe { &*node };
        let mut next = node_ref.next.load(Ordering::Acquire);
        if next.is_null() {
            if self
                .tail
                .compare_exchange(node, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
            // A successor swapped the tail but has not published its link
            // yet; it is imminent.
            while next.is_null() {
                core::hint::spin_loop();
                next = node_ref.next.load(Ordering::Acquire);
            }
        }
        self.admit(node_ref, next);
    }

    /// Unlinks a waiter that timed out or was interrupted.
    fn cancel(&self, node: *mut McsNode) {
        // SAFETY: registry-pinned.
        let node_ref = unsafe { &*node };
        let mut next = node_ref.next.load(Ordering::Acquire);
        if next.is_null() {
            if self
                .tail
                .compare_exchange(node, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                trace!("mcs queue {}: tail waiter cancelled", self.id);
                return;
            }
            while next.is_null() {
                core::hint::spin_loop();
                next = node_ref.next.load(Ordering::Acquire);
            }
        }
        // Transfer our admission to the successor; it contends on the
        // owner word in our stead.
        self.admit(node_ref, next);
        trace!("mcs queue {}: waiter cancelled, admission transferred", self.id);
    }

    /// Opens the successor's gate for the generation it published with
    /// its link, then consumes the link.
    fn admit(&self, node_ref: &McsNode, next: *mut McsNode) {
        let next_generation = node_ref.next_generation.load(Ordering::Acquire);
        // SAFETY: registry-pinned.
        let next_ref = unsafe { &*next };
        next_ref.gate.store(next_generation, Ordering::Release);
        next_ref.thread.unpark();
        node_ref.next.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

impl QueuePolicy for McsQueue {
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
        // Wakeup aid only: the admission handoff happens when the previous
        // winner leaves the queue.
        let tail = self.tail.load(Ordering::SeqCst);
        if !tail.is_null() {
            // SAFETY: registry-pinned.
            unsafe { (*tail).thread.unpark() };
        }
    }
}

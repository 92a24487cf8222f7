// SPDX-License-Identifier: MPL-2.0

//! Reentrant queued locks.
//!
//! This crate builds a reentrant mutual-exclusion lock out of two
//! orthogonal, swappable pieces:
//!
//! - a **queueing discipline** that fixes the order in which contending
//!   threads are admitted: [`QueueKind::Clh`] (each waiter spins on its
//!   predecessor's node) or [`QueueKind::Mcs`] (each waiter spins on its
//!   own node);
//! - a **waiting discipline** that decides how a waiter burns time between
//!   re-checks: [`BusySpin`] (pause hints and a yield) or [`SpinThenPark`]
//!   (pause hints, then a one-microsecond park).
//!
//! On top of these, [`ReentrantLock`] offers the full lock surface:
//! blocking, interruptible, non-blocking and time-bounded acquisition,
//! reentrant release, and [`Condition`] variables that atomically give up
//! and later restore the whole reentry depth.
//!
//! Interruption is cooperative: a thread exposes its flag through
//! [`park::interrupt_handle`], and blocking operations observe the flag
//! with test-and-clear semantics.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use qlock::{Preset, ReentrantLock};
//!
//! let lock = Arc::new(Preset::ClhFairSpinPark.build());
//! let total = {
//!     let lock = lock.clone();
//!     std::thread::spawn(move || {
//!         lock.lock();
//!         let n = 21 * 2;
//!         lock.unlock().unwrap();
//!         n
//!     })
//! }
//! .join()
//! .unwrap();
//! assert_eq!(total, 42);
//! assert!(!lock.is_locked());
//! ```

mod builder;
mod condition;
mod error;
mod lock;
pub mod park;
mod prelude;
mod queue;
mod stats;
mod wait;

pub use self::{
    builder::{LockBuilder, Preset, QueueKind, WaitKind},
    condition::Condition,
    error::Error,
    lock::ReentrantLock,
    park::InterruptHandle,
    prelude::Result,
    stats::StatsSnapshot,
    wait::{BusySpin, SpinThenPark, WaitStrategy},
};

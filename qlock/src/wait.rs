// SPDX-License-Identifier: MPL-2.0

//! Wait strategies.
//!
//! A wait strategy burns a bounded amount of real time between re-checks of
//! a spin predicate. The caller owns the recheck loop; the strategy is only
//! responsible for pacing and for observing cooperative interruption. One
//! call to [`WaitStrategy::wait`] never blocks indefinitely.

use core::time::Duration;
use std::thread;

use crate::park;
use crate::prelude::*;

/// Policy object consulted between re-checks of a spin predicate.
pub trait WaitStrategy: Send + Sync {
    /// Consumes some real time, then checks the calling thread's
    /// interruption flag with test-and-clear semantics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Interrupted`] if the flag was set; the flag is
    /// cleared as part of raising the error.
    fn wait(&self) -> Result<()>;
}

/// Pure spinning: emit pause hints, yield the thread once, re-check.
///
/// Keeps the waiter on-core and is the lowest-latency choice when critical
/// sections are short and there are spare cores to burn.
#[derive(Clone, Copy, Debug)]
pub struct BusySpin {
    max_spins: u32,
}

impl BusySpin {
    /// Creates a busy-spin strategy emitting `max_spins` pause hints per
    /// round.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgs`] if `max_spins` is zero.
    pub fn new(max_spins: u32) -> Result<Self> {
        if max_spins == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(Self { max_spins })
    }

    pub(crate) const fn with_default_spins() -> Self {
        Self { max_spins: 64 }
    }
}

impl WaitStrategy for BusySpin {
    fn wait(&self) -> Result<()> {
        for _ in 0..self.max_spins {
            core::hint::spin_loop();
        }
        thread::yield_now();
        if park::interrupted() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}

/// Spin briefly, then park for one microsecond.
///
/// The park is a timed sleep rather than a scheduler yield, so a waiter
/// releases its core under sustained contention. An unpark (from a release
/// or an interruption) ends the park early.
#[derive(Clone, Copy, Debug)]
pub struct SpinThenPark {
    spins: u32,
}

impl SpinThenPark {
    /// Creates a spin-then-park strategy emitting `spins` pause hints before
    /// each park.
    ///
    /// The full `u32` range is accepted; the constructor is fallible for
    /// uniformity with [`BusySpin::new`].
    pub fn new(spins: u32) -> Result<Self> {
        Ok(Self { spins })
    }

    pub(crate) const fn with_default_spins() -> Self {
        Self { spins: 64 }
    }
}

impl WaitStrategy for SpinThenPark {
    fn wait(&self) -> Result<()> {
        for _ in 0..self.spins {
            core::hint::spin_loop();
        }
        thread::park_timeout(Duration::from_micros(1));
        if park::interrupted() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}

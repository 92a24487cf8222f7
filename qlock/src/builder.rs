// SPDX-License-Identifier: MPL-2.0

//! Lock configuration: queue and wait-strategy selection, named presets.

use core::fmt;
use core::str::FromStr;

use crate::lock::ReentrantLock;
use crate::prelude::*;
use crate::queue::{ClhQueue, McsQueue, QueuePolicy};
use crate::wait::{BusySpin, SpinThenPark, WaitStrategy};

/// The admission-queue discipline of a lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// Waiters spin on their predecessor's node.
    Clh,
    /// Waiters spin on their own node.
    Mcs,
}

/// The waiting discipline of a lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitKind {
    /// Pure spinning; see [`BusySpin`].
    BusySpin {
        /// Pause hints emitted per round; must be at least 1.
        max_spins: u32,
    },
    /// Spin briefly, then park for a microsecond; see [`SpinThenPark`].
    SpinThenPark {
        /// Pause hints emitted before each park.
        spins: u32,
    },
}

/// Configures and builds a [`ReentrantLock`].
///
/// # Example
///
/// ```
/// use qlock::{LockBuilder, QueueKind, WaitKind};
///
/// let lock = LockBuilder::new()
///     .queue(QueueKind::Mcs)
///     .wait(WaitKind::SpinThenPark { spins: 32 })
///     .fair(true)
///     .build()
///     .unwrap();
/// assert!(lock.is_fair());
/// ```
#[derive(Clone, Copy, Debug)]
pub struct LockBuilder {
    queue: QueueKind,
    wait: WaitKind,
    fair: bool,
}

impl LockBuilder {
    /// Starts from the defaults: CLH, spin-then-park, non-fair.
    pub fn new() -> Self {
        Self {
            queue: QueueKind::Clh,
            wait: WaitKind::SpinThenPark { spins: 64 },
            fair: false,
        }
    }

    /// Selects the admission queue.
    pub fn queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    /// Selects the wait strategy.
    pub fn wait(mut self, wait: WaitKind) -> Self {
        self.wait = wait;
        self
    }

    /// Selects fair (strict-FIFO, no barging) admission.
    pub fn fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    /// Builds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgs`] if the wait-strategy parameters are
    /// out of range.
    pub fn build(self) -> Result<ReentrantLock> {
        let strategy: Box<dyn WaitStrategy> = match self.wait {
            WaitKind::BusySpin { max_spins } => Box::new(BusySpin::new(max_spins)?),
            WaitKind::SpinThenPark { spins } => Box::new(SpinThenPark::new(spins)?),
        };
        let queue: Box<dyn QueuePolicy> = match self.queue {
            QueueKind::Clh => Box::new(ClhQueue::new()),
            QueueKind::Mcs => Box::new(McsQueue::new()),
        };
        Ok(ReentrantLock::from_parts(queue, strategy, self.fair))
    }

    /// Builds with known-good strategy parameters, for the presets and the
    /// default constructor.
    pub(crate) fn build_infallible(self) -> ReentrantLock {
        let strategy: Box<dyn WaitStrategy> = match self.wait {
            WaitKind::BusySpin { .. } => Box::new(BusySpin::with_default_spins()),
            WaitKind::SpinThenPark { .. } => Box::new(SpinThenPark::with_default_spins()),
        };
        let queue: Box<dyn QueuePolicy> = match self.queue {
            QueueKind::Clh => Box::new(ClhQueue::new()),
            QueueKind::Mcs => Box::new(McsQueue::new()),
        };
        ReentrantLock::from_parts(queue, strategy, self.fair)
    }
}

impl Default for LockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Named lock configurations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Preset {
    /// CLH queue, fair admission, spin-then-park waiting.
    ClhFairSpinPark,
    /// MCS queue, fair admission, spin-then-park waiting.
    McsFairSpinPark,
    /// CLH queue, barging admission, busy-spin waiting.
    ClhBusySpin,
}

impl Preset {
    /// Builds a lock with this preset's configuration.
    pub fn build(self) -> ReentrantLock {
        let builder = LockBuilder::new();
        match self {
            Preset::ClhFairSpinPark => builder
                .queue(QueueKind::Clh)
                .wait(WaitKind::SpinThenPark { spins: 64 })
                .fair(true),
            Preset::McsFairSpinPark => builder
                .queue(QueueKind::Mcs)
                .wait(WaitKind::SpinThenPark { spins: 64 })
                .fair(true),
            Preset::ClhBusySpin => builder
                .queue(QueueKind::Clh)
                .wait(WaitKind::BusySpin { max_spins: 64 })
                .fair(false),
        }
        .build_infallible()
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Preset::ClhFairSpinPark => "clh-fair-spin-park",
            Preset::McsFairSpinPark => "mcs-fair-spin-park",
            Preset::ClhBusySpin => "clh-busy-spin",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Preset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clh-fair-spin-park" => Ok(Preset::ClhFairSpinPark),
            "mcs-fair-spin-park" => Ok(Preset::McsFairSpinPark),
            "clh-busy-spin" => Ok(Preset::ClhBusySpin),
            _ => Err(Error::InvalidArgs),
        }
    }
}

//! Sampled logging for high-frequency error paths.
//!
//! Frame-level faults (socket write drops, short reads) can fire dozens of
//! times per second; logging each one would drown every other signal. Error
//! sites wrap their log call in a [`LogSampler`] so a sustained fault logs
//! a bounded fraction of occurrences while still counting all of them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts events and admits every N-th one for logging.
#[derive(Debug)]
pub struct LogSampler {
    every: u64,
    count: AtomicU64,
}

impl LogSampler {
    /// Admits one in `every` events. `every = 10` caps logging at 10 %.
    #[must_use]
    pub const fn one_in(every: u64) -> Self {
        Self {
            every,
            count: AtomicU64::new(0),
        }
    }

    /// Records one event; returns `true` when this one should be logged.
    /// The first event always logs, so a fault is visible immediately.
    pub fn admit(&self) -> bool {
        self.count.fetch_add(1, Ordering::Relaxed) % self.every == 0
    }

    /// Total events recorded, logged or not.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

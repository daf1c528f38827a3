//! Wall-clock and uptime helpers shared by both processes.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen
/// in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Monotonic process uptime, the timestamp base for station events.
///
/// All timeouts and event ordering in the stack use this rather than
/// wall-clock readings, which can jump.
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    started: Instant,
}

impl Uptime {
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Seconds elapsed since the process started.
    #[must_use]
    pub fn seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Whole seconds elapsed, for status reporting.
    #[must_use]
    pub fn whole_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn uptime_is_monotonic() {
        let uptime = Uptime::start();
        let a = uptime.seconds();
        let b = uptime.seconds();
        assert!(b >= a);
    }
}

//! Injectable time sources
//!
//! All time-dependent logic goes through [`Clock`]: the time-window
//! buffers consume whole-second Unix timestamps, the cancellation source
//! consumes ticks (milliseconds since the Unix epoch). Persisted times
//! are recorded verbatim and replayed verbatim; only eviction boundaries
//! consult the current clock.
//!
//! [`TimerDriver`] is the one-shot alarm seam used solely by the durable
//! cancellation source. Production hosts install a thread-backed driver;
//! tests install a manual driver that fires when the test advances time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time.
///
/// Monotonicity is not required; callers must not produce negative
/// values.
pub trait Clock: Send + Sync {
    /// Whole seconds since the Unix epoch.
    fn unix_seconds(&self) -> i64;

    /// Ticks (milliseconds) since the Unix epoch.
    fn ticks(&self) -> i64;
}

/// Wall-clock time from the operating system.
///
/// Returns zero if the system clock reports a moment before the Unix
/// epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    fn epoch_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

impl Clock for SystemClock {
    fn unix_seconds(&self) -> i64 {
        Self::epoch_millis() / 1_000
    }

    fn ticks(&self) -> i64 {
        Self::epoch_millis()
    }
}

/// One-shot alarm scheduling.
///
/// The callback fires at most once, on an unspecified scheduler thread,
/// at or after `deadline_ticks`. Cancelling the returned handle prevents
/// a not-yet-fired callback from running.
pub trait TimerDriver: Send + Sync {
    /// Schedule `callback` to run once the clock reaches
    /// `deadline_ticks`.
    fn schedule(&self, deadline_ticks: i64, callback: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Cancellation handle for a scheduled alarm.
///
/// Drivers check [`TimerHandle::is_canceled`] immediately before firing.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    canceled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Create a live (not-yet-canceled) handle.
    pub fn new() -> Self {
        TimerHandle::default()
    }

    /// Prevent the alarm from firing if it has not fired yet.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// True when [`TimerHandle::cancel`] has been called.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_consistent() {
        let clock = SystemClock;
        let secs = clock.unix_seconds();
        let ticks = clock.ticks();
        assert!(secs > 0);
        // ticks and seconds read the same moment to within a few seconds
        assert!((ticks / 1_000 - secs).abs() <= 2);
    }

    #[test]
    fn test_timer_handle_cancellation() {
        let handle = TimerHandle::new();
        assert!(!handle.is_canceled());
        let alias = handle.clone();
        alias.cancel();
        assert!(handle.is_canceled());
    }
}

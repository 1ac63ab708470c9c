//! Clock and timer drivers.
//!
//! [`ManualClock`] and [`ManualTimer`] give tests full control of time:
//! advancing the clock fires due alarms synchronously on the advancing
//! thread. [`ThreadTimer`] backs production use with a single worker
//! thread parked on a condvar until the earliest deadline.

use parking_lot::{Condvar, Mutex};
use statelog_core::{Clock, TimerDriver, TimerHandle};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

// =============================================================================
// ManualClock
// =============================================================================

/// A test clock that only moves when told to.
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// Create a clock starting at the given milliseconds since the Unix
    /// epoch.
    pub fn new(start_millis: i64) -> Arc<Self> {
        Arc::new(ManualClock {
            millis: AtomicI64::new(start_millis),
        })
    }

    /// Move the clock forward.
    pub fn advance(&self, delta: Duration) {
        self.millis
            .fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute tick value.
    pub fn set_ticks(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_seconds(&self) -> i64 {
        self.millis.load(Ordering::SeqCst) / 1_000
    }

    fn ticks(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

// =============================================================================
// ManualTimer
// =============================================================================

type AlarmCallback = Box<dyn FnOnce() + Send>;

struct PendingAlarm {
    deadline: i64,
    handle: TimerHandle,
    callback: AlarmCallback,
}

/// A test timer driven by a [`ManualClock`].
///
/// Alarms fire synchronously from [`ManualTimer::advance`] (or
/// [`ManualTimer::fire_due`]) on the calling thread, in deadline order.
pub struct ManualTimer {
    clock: Arc<ManualClock>,
    pending: Mutex<Vec<PendingAlarm>>,
}

impl ManualTimer {
    /// Create a timer over the given clock.
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(ManualTimer {
            clock,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Advance the clock and fire every alarm that became due.
    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta);
        self.fire_due();
    }

    /// Fire every alarm whose deadline has passed.
    pub fn fire_due(&self) {
        // Alarms may re-arm from their callbacks, so collect-then-run
        // without holding the lock, and loop until nothing is due.
        loop {
            let now = self.clock.ticks();
            let mut due = Vec::new();
            {
                let mut pending = self.pending.lock();
                let mut index = 0;
                while index < pending.len() {
                    if pending[index].deadline <= now {
                        due.push(pending.remove(index));
                    } else {
                        index += 1;
                    }
                }
            }
            if due.is_empty() {
                return;
            }
            due.sort_by_key(|alarm| alarm.deadline);
            for alarm in due {
                if !alarm.handle.is_canceled() {
                    (alarm.callback)();
                }
            }
        }
    }

    /// Number of alarms not yet fired.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl TimerDriver for ManualTimer {
    fn schedule(&self, deadline_ticks: i64, callback: AlarmCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        self.pending.lock().push(PendingAlarm {
            deadline: deadline_ticks,
            handle: handle.clone(),
            callback,
        });
        handle
    }
}

// =============================================================================
// ThreadTimer
// =============================================================================

struct QueuedAlarm {
    deadline: i64,
    seq: u64,
    handle: TimerHandle,
    callback: AlarmCallback,
}

impl PartialEq for QueuedAlarm {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for QueuedAlarm {}

// Reversed: the earliest deadline must surface first on a max-heap.
impl Ord for QueuedAlarm {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedAlarm {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct TimerShared {
    clock: Arc<dyn Clock>,
    queue: Mutex<BinaryHeap<QueuedAlarm>>,
    alarm_ready: Condvar,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

/// A production one-shot alarm driver backed by a worker thread.
///
/// The worker parks until the earliest deadline (or a new alarm) and
/// fires callbacks off the host thread, matching the scheduling
/// contract of the cancellation source.
pub struct ThreadTimer {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTimer {
    /// Spawn the worker thread over the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        let shared = Arc::new(TimerShared {
            clock,
            queue: Mutex::new(BinaryHeap::new()),
            alarm_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("statelog-timer".to_string())
            .spawn(move || worker_loop(&worker_shared))
            .ok();
        Arc::new(ThreadTimer {
            shared,
            worker: Mutex::new(worker),
        })
    }
}

fn worker_loop(shared: &TimerShared) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = shared.clock.ticks();
        match queue.peek() {
            Some(next) if next.deadline <= now => {
                if let Some(alarm) = queue.pop() {
                    drop(queue);
                    if !alarm.handle.is_canceled() {
                        (alarm.callback)();
                    }
                    queue = shared.queue.lock();
                }
            }
            Some(next) => {
                let wait = Duration::from_millis((next.deadline - now).max(1) as u64);
                let _ = shared.alarm_ready.wait_for(&mut queue, wait);
            }
            None => {
                shared.alarm_ready.wait(&mut queue);
            }
        }
    }
}

impl TimerDriver for ThreadTimer {
    fn schedule(&self, deadline_ticks: i64, callback: AlarmCallback) -> TimerHandle {
        let handle = TimerHandle::new();
        {
            let mut queue = self.shared.queue.lock();
            queue.push(QueuedAlarm {
                deadline: deadline_ticks,
                seq: self.shared.seq.fetch_add(1, Ordering::SeqCst),
                handle: handle.clone(),
                callback,
            });
        }
        self.shared.alarm_ready.notify_one();
        handle
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.alarm_ready.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statelog_core::SystemClock;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_manual_clock_units() {
        let clock = ManualClock::new(5_000);
        assert_eq!(clock.unix_seconds(), 5);
        assert_eq!(clock.ticks(), 5_000);
        clock.advance(Duration::from_millis(1_500));
        assert_eq!(clock.unix_seconds(), 6);
        assert_eq!(clock.ticks(), 6_500);
    }

    #[test]
    fn test_manual_timer_fires_in_deadline_order() {
        let clock = ManualClock::new(0);
        let timer = ManualTimer::new(clock.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, deadline) in [("late", 2_000i64), ("early", 1_000)] {
            let order = order.clone();
            timer.schedule(
                deadline,
                Box::new(move || {
                    order.lock().push(label);
                }),
            );
        }

        timer.advance(Duration::from_secs(3));
        assert_eq!(*order.lock(), vec!["early", "late"]);
        assert_eq!(timer.pending_len(), 0);
    }

    #[test]
    fn test_manual_timer_skips_canceled() {
        let clock = ManualClock::new(0);
        let timer = ManualTimer::new(clock);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_ref = hits.clone();
        let handle = timer.schedule(
            100,
            Box::new(move || {
                hits_ref.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        timer.advance(Duration::from_secs(1));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_timer_rearm_from_callback() {
        let clock = ManualClock::new(0);
        let timer = ManualTimer::new(clock.clone());
        let hits = Arc::new(AtomicUsize::new(0));

        let timer_ref = Arc::downgrade(&timer);
        let hits_ref = hits.clone();
        timer.schedule(
            100,
            Box::new(move || {
                hits_ref.fetch_add(1, Ordering::SeqCst);
                if let Some(timer) = timer_ref.upgrade() {
                    let hits_ref = hits_ref.clone();
                    timer.schedule(
                        150,
                        Box::new(move || {
                            hits_ref.fetch_add(1, Ordering::SeqCst);
                        }),
                    );
                }
            }),
        );

        // One advance past both deadlines runs the chain to completion.
        timer.advance(Duration::from_millis(200));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_thread_timer_fires() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let timer = ThreadTimer::new(clock.clone());
        let (tx, rx) = mpsc::channel();
        timer.schedule(
            clock.ticks() + 20,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_thread_timer_cancellation() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let timer = ThreadTimer::new(clock.clone());
        let (tx, rx) = mpsc::channel();
        let handle = timer.schedule(
            clock.ticks() + 50,
            Box::new(move || {
                let _ = tx.send(());
            }),
        );
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}

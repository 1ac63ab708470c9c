//! Durable cancellation source: two-phase cancellation whose committed
//! state survives restarts.
//!
//! ## Pending versus committed
//!
//! `is_cancellation_pending` reads in-memory intent and turns true the
//! moment `cancel` is called or a scheduled expiration passes. The token
//! signals only *after* the state has been durably persisted: either the
//! host called `write_state`, or the internal timer fired and persisted
//! on its own (auto-persistence).
//!
//! ## Commit protocol (timer path)
//!
//! 1. snapshot `(canceled, schedule)` for rollback,
//! 2. set `canceled = true`, clear the schedule,
//! 3. invoke the host's `write_state` with no lock held,
//! 4. on success the host's `on_write_completed` hook signals the token,
//! 5. on failure, roll back to the snapshot, but only when the state is
//!    still exactly the one step 2 produced, so a concurrent
//!    `cancel_after` with an earlier deadline is never clobbered.
//!
//! ## Wire form
//!
//! `version, canceled_byte, scheduled_byte` and, when scheduled,
//! `request_ticks, delay_ticks` as signed varints. Ticks are
//! milliseconds since the Unix epoch. There is no command tag.

use crate::support::encode_entry;
use parking_lot::{Mutex, RwLock};
use statelog_core::{
    Clock, JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine,
    TimerDriver, TimerHandle, WriteState,
};
use statelog_wire::{EntryReader, SessionPool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

const MACHINE: &str = "cancellation-source";

/// An observable, at-most-once-signaling cancellation handle.
///
/// Callbacks run on whatever thread completes the durable write (or the
/// registering thread when the token is already signaled); they must not
/// assume any host-thread affinity.
#[derive(Clone, Default)]
pub struct CancellationToken {
    shared: Arc<TokenShared>,
}

#[derive(Default)]
struct TokenShared {
    signaled: AtomicBool,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CancellationToken {
    /// Create an unsignaled token.
    pub fn new() -> Self {
        CancellationToken::default()
    }

    /// True once the token has signaled. Signaled tokens never reset.
    pub fn is_canceled(&self) -> bool {
        self.shared.signaled.load(Ordering::SeqCst)
    }

    /// Register a callback to run when the token signals. A callback
    /// registered after signaling runs immediately.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) {
        if self.is_canceled() {
            callback();
            return;
        }
        let mut callbacks = self.shared.callbacks.lock();
        // Re-check under the lock so a racing signal cannot strand us.
        if self.shared.signaled.load(Ordering::SeqCst) {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(Box::new(callback));
    }

    fn signal(&self) {
        if self.shared.signaled.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.shared.callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Schedule {
    request_ticks: i64,
    delay_ticks: i64,
}

impl Schedule {
    fn expiration(&self) -> i64 {
        self.request_ticks.saturating_add(self.delay_ticks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct CancelState {
    canceled: bool,
    schedule: Option<Schedule>,
}

impl CancelState {
    fn is_default(&self) -> bool {
        !self.canceled && self.schedule.is_none()
    }

    fn is_pending(&self, now_ticks: i64) -> bool {
        self.canceled
            || self
                .schedule
                .map_or(false, |schedule| schedule.expiration() <= now_ticks)
    }
}

/// A durable cancellation source.
pub struct DurableCancellationSource {
    key: StateKey,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn TimerDriver>,
    write_state: Weak<dyn WriteState>,
    sessions: SessionPool,
    state: RwLock<CancelState>,
    token: Mutex<CancellationToken>,
    armed: Mutex<Option<TimerHandle>>,
    self_ref: Weak<DurableCancellationSource>,
}

impl DurableCancellationSource {
    /// Create a source bound to `key`.
    ///
    /// `write_state` is the host's durable-write callback; the source
    /// holds it weakly and invokes it when its timer commits a scheduled
    /// cancellation.
    pub fn new(
        key: StateKey,
        clock: Arc<dyn Clock>,
        timer: Arc<dyn TimerDriver>,
        write_state: Weak<dyn WriteState>,
        sessions: SessionPool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| DurableCancellationSource {
            key,
            clock,
            timer,
            write_state,
            sessions,
            state: RwLock::new(CancelState::default()),
            token: Mutex::new(CancellationToken::new()),
            armed: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// The current token. Clones observe the same signal.
    pub fn token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// True as soon as `cancel` was called or a scheduled expiration has
    /// passed, independent of persistence.
    pub fn is_cancellation_pending(&self) -> bool {
        self.state.read().is_pending(self.clock.ticks())
    }

    /// Cancel now, in memory: sets `canceled`, drops any schedule and
    /// disarms the timer. Durable only once the host writes state.
    pub fn cancel(&self) {
        {
            let mut state = self.state.write();
            state.canceled = true;
            state.schedule = None;
        }
        self.disarm();
    }

    /// Schedule cancellation after `delay`.
    ///
    /// The schedule is recorded only when none exists or the new
    /// expiration is earlier; the earlier deadline always wins. The
    /// in-memory timer is armed so the token fires at the scheduled
    /// time even if the host never writes in between; the timer
    /// persists the state itself when it fires.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the delay overflows the tick range.
    pub fn cancel_after(&self, delay: Duration) -> Result<()> {
        let delay_ticks = i64::try_from(delay.as_millis())
            .map_err(|_| JournalError::invalid_argument("delay exceeds the tick range"))?;
        let expiration = {
            let mut state = self.state.write();
            if state.canceled {
                // Cancellation already pending; a schedule adds nothing.
                return Ok(());
            }
            let request_ticks = self.clock.ticks();
            let candidate = Schedule {
                request_ticks,
                delay_ticks,
            };
            if let Some(existing) = state.schedule {
                if existing.expiration() <= candidate.expiration() {
                    return Ok(());
                }
            }
            state.schedule = Some(candidate);
            candidate.expiration()
        };
        self.arm(expiration);
        Ok(())
    }

    fn arm(&self, deadline_ticks: i64) {
        let weak = self.self_ref.clone();
        let handle = self.timer.schedule(
            deadline_ticks,
            Box::new(move || {
                if let Some(source) = weak.upgrade() {
                    source.timer_fired();
                }
            }),
        );
        if let Some(previous) = self.armed.lock().replace(handle) {
            previous.cancel();
        }
    }

    fn disarm(&self) {
        if let Some(handle) = self.armed.lock().take() {
            handle.cancel();
        }
    }

    /// Timer callback: commit the scheduled cancellation durably.
    ///
    /// Runs on the timer thread. The state lock is never held across the
    /// host's write.
    fn timer_fired(&self) {
        let rollback = {
            let mut state = self.state.write();
            if !state.is_pending(self.clock.ticks()) {
                // A newer, later schedule replaced the one this timer
                // belonged to.
                return;
            }
            let snapshot = *state;
            state.canceled = true;
            state.schedule = None;
            snapshot
        };
        let committed = CancelState {
            canceled: true,
            schedule: None,
        };

        let Some(host) = self.write_state.upgrade() else {
            return;
        };
        if let Err(error) = host.write_state() {
            warn!(key = %self.key, %error, "auto-persist of scheduled cancellation failed; rolling back");
            let rearm = {
                let mut state = self.state.write();
                if *state == committed {
                    *state = rollback;
                    rollback.schedule
                } else {
                    // A concurrent cancel_after took an earlier deadline;
                    // leave its state alone.
                    None
                }
            };
            if let Some(schedule) = rearm {
                self.arm(schedule.expiration());
            }
        }
        // On success the host's on_write_completed hook signaled the
        // token.
    }

    fn encode_state(&self, state: CancelState) -> Result<LogEntry> {
        encode_entry(&self.sessions, |w| {
            w.write_version();
            w.write_u8(u8::from(state.canceled));
            match state.schedule {
                Some(schedule) => {
                    w.write_u8(1);
                    w.write_vari64(schedule.request_ticks);
                    w.write_vari64(schedule.delay_ticks);
                }
                None => w.write_u8(0),
            }
            Ok(())
        })
    }

    fn signal_token(&self) {
        self.token.lock().clone().signal();
    }
}

impl StateMachine for DurableCancellationSource {
    fn reset(&self, _writer: LogWriter) {
        self.disarm();
        *self.state.write() = CancelState::default();
        let mut token = self.token.lock();
        // A signaled token can never un-signal; hand out a fresh one.
        if token.is_canceled() {
            *token = CancellationToken::new();
        }
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        reader.read_version()?;
        let canceled = reader.read_u8()? != 0;
        let scheduled = reader.read_u8()? != 0;
        let schedule = if scheduled {
            let request_ticks = reader.read_vari64()?;
            let delay_ticks = reader.read_vari64()?;
            Some(Schedule {
                request_ticks,
                delay_ticks,
            })
        } else {
            None
        };
        reader.finish(MACHINE)?;
        *self.state.write() = CancelState { canceled, schedule };
        Ok(())
    }

    fn on_recovery_completed(&self) -> Result<()> {
        let state = *self.state.read();
        let now = self.clock.ticks();
        if state.is_pending(now) {
            self.signal_token();
            return Ok(());
        }
        if let Some(schedule) = state.schedule {
            let remaining = schedule.delay_ticks - (now - schedule.request_ticks);
            if remaining <= 0 {
                self.signal_token();
            } else {
                self.arm(schedule.expiration());
            }
        }
        Ok(())
    }

    fn append_entries(&self, batch: &mut LogBatch) -> Result<()> {
        let state = *self.state.read();
        if state.is_default() {
            return Ok(());
        }
        batch.push(self.encode_state(state)?);
        Ok(())
    }

    fn append_snapshot(&self, batch: &mut LogBatch) -> Result<()> {
        let state = *self.state.read();
        batch.push(self.encode_state(state)?);
        Ok(())
    }

    fn on_write_completed(&self) {
        if self.is_cancellation_pending() {
            self.signal_token();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize};

    struct TestClock {
        millis: AtomicI64,
    }

    impl TestClock {
        fn new(start_millis: i64) -> Arc<Self> {
            Arc::new(TestClock {
                millis: AtomicI64::new(start_millis),
            })
        }

        fn advance(&self, delta: Duration) {
            self.millis
                .fetch_add(delta.as_millis() as i64, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn unix_seconds(&self) -> i64 {
            self.millis.load(Ordering::SeqCst) / 1_000
        }

        fn ticks(&self) -> i64 {
            self.millis.load(Ordering::SeqCst)
        }
    }

    type PendingAlarm = (i64, TimerHandle, Box<dyn FnOnce() + Send>);

    struct TestTimer {
        clock: Arc<TestClock>,
        pending: Mutex<Vec<PendingAlarm>>,
    }

    impl TestTimer {
        fn new(clock: Arc<TestClock>) -> Arc<Self> {
            Arc::new(TestTimer {
                clock,
                pending: Mutex::new(Vec::new()),
            })
        }

        fn fire_due(&self) {
            let now = self.clock.ticks();
            let due: Vec<PendingAlarm> = {
                let mut pending = self.pending.lock();
                let mut due = Vec::new();
                let mut index = 0;
                while index < pending.len() {
                    if pending[index].0 <= now {
                        due.push(pending.remove(index));
                    } else {
                        index += 1;
                    }
                }
                due
            };
            for (_, handle, callback) in due {
                if !handle.is_canceled() {
                    callback();
                }
            }
        }
    }

    impl TimerDriver for TestTimer {
        fn schedule(&self, deadline_ticks: i64, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
            let handle = TimerHandle::new();
            self.pending
                .lock()
                .push((deadline_ticks, handle.clone(), callback));
            handle
        }
    }

    #[derive(Default)]
    struct TestHost {
        source: Mutex<Option<Arc<DurableCancellationSource>>>,
        fail_next: AtomicBool,
        writes: AtomicUsize,
        log: Mutex<Vec<LogEntry>>,
    }

    impl TestHost {
        fn attach(&self, source: Arc<DurableCancellationSource>) {
            *self.source.lock() = Some(source);
        }

        fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    impl WriteState for TestHost {
        fn write_state(&self) -> Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(JournalError::storage("injected write failure"));
            }
            let source = {
                let guard = self.source.lock();
                guard.clone()
            };
            let Some(source) = source else {
                return Ok(());
            };
            let mut batch = LogBatch::new();
            source.append_entries(&mut batch)?;
            self.log.lock().extend(batch.into_entries());
            self.writes.fetch_add(1, Ordering::SeqCst);
            source.on_write_completed();
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<TestClock>,
        timer: Arc<TestTimer>,
        host: Arc<TestHost>,
        source: Arc<DurableCancellationSource>,
    }

    fn fixture() -> Fixture {
        let clock = TestClock::new(1_000_000);
        let timer = TestTimer::new(clock.clone());
        let host = Arc::new(TestHost::default());
        let host_dyn: Arc<dyn WriteState> = host.clone();
        let host_ref: Weak<dyn WriteState> = Arc::downgrade(&host_dyn);
        let source = DurableCancellationSource::new(
            StateKey::new("cancel").unwrap(),
            clock.clone(),
            timer.clone(),
            host_ref,
            SessionPool::new(),
        );
        host.attach(source.clone());
        source.reset(LogWriter::new());
        Fixture {
            clock,
            timer,
            host,
            source,
        }
    }

    fn advance(fixture: &Fixture, delta: Duration) {
        fixture.clock.advance(delta);
        fixture.timer.fire_due();
    }

    #[test]
    fn test_cancel_is_pending_but_token_waits_for_write() {
        let fx = fixture();
        let token = fx.source.token();
        fx.source.cancel();
        assert!(fx.source.is_cancellation_pending());
        assert!(!token.is_canceled());

        fx.host.write_state().unwrap();
        assert!(token.is_canceled());
    }

    #[test]
    fn test_scheduled_cancellation_auto_persists() {
        let fx = fixture();
        let token = fx.source.token();
        fx.source.cancel_after(Duration::from_secs(1)).unwrap();
        assert!(!fx.source.is_cancellation_pending());

        advance(&fx, Duration::from_millis(1_250));
        assert!(fx.source.is_cancellation_pending());
        assert!(token.is_canceled());
        assert_eq!(fx.host.writes(), 1);
    }

    #[test]
    fn test_rollback_on_write_failure() {
        let fx = fixture();
        let token = fx.source.token();
        fx.source.cancel_after(Duration::from_secs(1)).unwrap();
        fx.host.fail_next.store(true, Ordering::SeqCst);

        advance(&fx, Duration::from_millis(1_100));
        assert!(!token.is_canceled());
        assert_eq!(fx.host.writes(), 0);
        // The schedule was restored, so pending still reads true.
        assert!(fx.source.is_cancellation_pending());

        // The re-armed timer retries and succeeds.
        advance(&fx, Duration::from_millis(1));
        assert!(token.is_canceled());
        assert_eq!(fx.host.writes(), 1);
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let fx = fixture();
        let token = fx.source.token();
        fx.source.cancel_after(Duration::from_secs(10)).unwrap();
        fx.source.cancel_after(Duration::from_secs(1)).unwrap();

        advance(&fx, Duration::from_millis(1_250));
        assert!(token.is_canceled());
    }

    #[test]
    fn test_later_deadline_is_ignored() {
        let fx = fixture();
        let token = fx.source.token();
        fx.source.cancel_after(Duration::from_secs(1)).unwrap();
        fx.source.cancel_after(Duration::from_secs(10)).unwrap();

        advance(&fx, Duration::from_millis(1_250));
        assert!(token.is_canceled());
    }

    #[test]
    fn test_cancel_overrides_pending_schedule() {
        let fx = fixture();
        fx.source.cancel_after(Duration::from_secs(30)).unwrap();
        fx.source.cancel();
        assert!(fx.source.is_cancellation_pending());

        // The disarmed timer never fires.
        advance(&fx, Duration::from_secs(31));
        assert_eq!(fx.host.writes(), 0);
    }

    #[test]
    fn test_recovery_rearms_remaining_delay() {
        let fx = fixture();
        fx.source.cancel_after(Duration::from_secs(4)).unwrap();
        fx.host.write_state().unwrap();
        let persisted = fx.host.log.lock().last().cloned().unwrap();

        // Reactivate 1s later on a fresh source sharing the clock/timer.
        fx.clock.advance(Duration::from_secs(1));
        let host2 = Arc::new(TestHost::default());
        let host2_dyn: Arc<dyn WriteState> = host2.clone();
        let host2_ref: Weak<dyn WriteState> = Arc::downgrade(&host2_dyn);
        let source2 = DurableCancellationSource::new(
            StateKey::new("cancel").unwrap(),
            fx.clock.clone(),
            fx.timer.clone(),
            host2_ref,
            SessionPool::new(),
        );
        host2.attach(source2.clone());
        source2.reset(LogWriter::new());
        source2.apply(&persisted).unwrap();
        source2.on_recovery_completed().unwrap();

        let token = source2.token();
        assert!(!source2.is_cancellation_pending());
        assert!(!token.is_canceled());

        fx.clock.advance(Duration::from_millis(3_500));
        fx.timer.fire_due();
        assert!(token.is_canceled());
        assert_eq!(host2.writes(), 1);
    }

    #[test]
    fn test_recovery_of_expired_schedule_signals_immediately() {
        let fx = fixture();
        fx.source.cancel_after(Duration::from_secs(2)).unwrap();
        fx.host.write_state().unwrap();
        let persisted = fx.host.log.lock().last().cloned().unwrap();

        fx.clock.advance(Duration::from_millis(2_250));
        let host_dyn: Arc<dyn WriteState> = fx.host.clone();
        let host_ref: Weak<dyn WriteState> = Arc::downgrade(&host_dyn);
        let source2 = DurableCancellationSource::new(
            StateKey::new("cancel").unwrap(),
            fx.clock.clone(),
            fx.timer.clone(),
            host_ref,
            SessionPool::new(),
        );
        source2.reset(LogWriter::new());
        source2.apply(&persisted).unwrap();
        let token = source2.token();
        source2.on_recovery_completed().unwrap();
        assert!(token.is_canceled());
    }

    #[test]
    fn test_reset_replaces_signaled_token() {
        let fx = fixture();
        let old_token = fx.source.token();
        fx.source.cancel();
        fx.host.write_state().unwrap();
        assert!(old_token.is_canceled());

        fx.source.reset(LogWriter::new());
        let new_token = fx.source.token();
        assert!(!new_token.is_canceled());
        assert!(old_token.is_canceled());
        assert!(!fx.source.is_cancellation_pending());
    }

    #[test]
    fn test_append_entries_skips_default_state() {
        let fx = fixture();
        let mut batch = LogBatch::new();
        fx.source.append_entries(&mut batch).unwrap();
        assert!(batch.is_empty());

        let mut snapshot = LogBatch::new();
        fx.source.append_snapshot(&mut snapshot).unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_registered_callback_runs_on_signal() {
        let fx = fixture();
        let token = fx.source.token();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_ref = hits.clone();
        token.register(move || {
            hits_ref.fetch_add(1, Ordering::SeqCst);
        });

        fx.source.cancel();
        fx.host.write_state().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Late registration fires immediately.
        let hits_ref = hits.clone();
        token.register(move || {
            hits_ref.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

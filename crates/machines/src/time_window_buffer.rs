//! Durable time-window buffer: FIFO entries stamped with whole-second
//! Unix timestamps, purged once they fall out of the window.
//!
//! ## Time discipline
//!
//! Timestamps are recorded verbatim in the journal and replayed
//! verbatim. Eviction happens only on `enqueue` and `set_window`:
//! - an `Enqueue` replays its recorded timestamp as the eviction
//!   boundary, which equals the write-time clock;
//! - a `SetWindow` replays against the *current* clock, matching the
//!   original write-time semantics.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{
    Clock, JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine,
};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const MACHINE: &str = "time-window-buffer";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const SET_WINDOW: u32 = 2;
const ENQUEUE: u32 = 3;
const DEQUEUE: u32 = 4;

struct WindowInner<T> {
    window_seconds: u64,
    items: VecDeque<(T, i64)>,
    writer: Option<LogWriter>,
}

impl<T> WindowInner<T> {
    /// Drop entries stamped before `now - window`.
    fn purge(&mut self, now_seconds: i64) {
        let boundary = now_seconds - self.window_seconds as i64;
        while self
            .items
            .front()
            .map_or(false, |(_, stamp)| *stamp < boundary)
        {
            self.items.pop_front();
        }
    }

    fn apply_enqueue(&mut self, item: T, stamp: i64) {
        self.purge(stamp);
        self.items.push_back((item, stamp));
    }

    fn apply_set_window(&mut self, window_seconds: u64, now_seconds: i64) {
        self.window_seconds = window_seconds;
        self.purge(now_seconds);
    }
}

fn window_seconds(window: Duration) -> Result<u64> {
    let seconds = window.as_secs();
    if seconds == 0 {
        return Err(JournalError::invalid_argument(
            "window must be at least one second",
        ));
    }
    Ok(seconds)
}

/// A durable FIFO of `(item, timestamp)` pairs bounded by a sliding time
/// window.
pub struct DurableTimeWindowBuffer<T> {
    key: StateKey,
    clock: Arc<dyn Clock>,
    codec: Arc<dyn FieldCodec<T>>,
    sessions: SessionPool,
    inner: Mutex<WindowInner<T>>,
}

impl<T: Send + 'static> DurableTimeWindowBuffer<T> {
    /// Create an empty buffer bound to `key` with the given window.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the window is shorter than one second.
    pub fn new(
        key: StateKey,
        window: Duration,
        clock: Arc<dyn Clock>,
        codec: Arc<dyn FieldCodec<T>>,
        sessions: SessionPool,
    ) -> Result<Arc<Self>> {
        let seconds = window_seconds(window)?;
        Ok(Arc::new(DurableTimeWindowBuffer {
            key,
            clock,
            codec,
            sessions,
            inner: Mutex::new(WindowInner {
                window_seconds: seconds,
                items: VecDeque::new(),
                writer: None,
            }),
        }))
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// The current window.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.inner.lock().window_seconds)
    }

    /// Number of buffered entries.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Change the window (whole seconds, minimum one) and journal the
    /// command; entries now outside the window are purged. Returns false
    /// (and journals nothing) when the window is unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the window is shorter than one second.
    pub fn set_window(&self, window: Duration) -> Result<bool> {
        let seconds = window_seconds(window)?;
        let mut inner = self.inner.lock();
        if inner.window_seconds == seconds {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(SET_WINDOW);
            w.write_varu64(seconds);
            Ok(())
        })?;
        inner.apply_set_window(seconds, self.clock.unix_seconds());
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Stamp an item with the current time, purge expired entries, and
    /// journal the command with the recorded timestamp.
    pub fn enqueue(&self, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        let stamp = self.clock.unix_seconds();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ENQUEUE);
            self.codec.write(w, 0, &item)?;
            w.write_vari64(stamp);
            Ok(())
        })?;
        inner.apply_enqueue(item, stamp);
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Dequeue the oldest entry, or `None` when empty.
    ///
    /// Dequeue does not purge; eviction happens only on `enqueue` and
    /// `set_window`.
    pub fn try_dequeue(&self) -> Result<Option<(T, i64)>> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            return Ok(None);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(DEQUEUE);
            Ok(())
        })?;
        let item = match inner.items.pop_front() {
            Some(item) => item,
            None => return Ok(None),
        };
        require_writer(&inner.writer)?.append(entry);
        Ok(Some(item))
    }

    /// The buffered items, oldest to newest, without their stamps.
    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner
            .lock()
            .items
            .iter()
            .map(|(item, _)| item.clone())
            .collect()
    }

    /// The buffered `(item, timestamp)` pairs, oldest to newest.
    pub fn stamped_items(&self) -> Vec<(T, i64)>
    where
        T: Clone,
    {
        self.inner.lock().items.iter().cloned().collect()
    }

    /// Copy the items oldest-to-newest into `dst` starting at `offset`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the slice cannot hold them.
    pub fn copy_to(&self, dst: &mut [T], offset: usize) -> Result<()>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        let needed = offset.saturating_add(inner.items.len());
        if dst.len() < needed {
            return Err(JournalError::invalid_argument(format!(
                "destination needs {} slots, has {}",
                needed,
                dst.len()
            )));
        }
        for (index, (item, _)) in inner.items.iter().enumerate() {
            dst[offset + index] = item.clone();
        }
        Ok(())
    }

    /// Copy the items into `dst`, then clear the buffer (journaling the
    /// clear).
    pub fn drain_to(&self, dst: &mut Vec<T>) -> Result<()>
    where
        T: Clone,
    {
        let mut inner = self.inner.lock();
        dst.extend(inner.items.iter().map(|(item, _)| item.clone()));
        if inner.items.is_empty() {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR);
            Ok(())
        })?;
        inner.items.clear();
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Remove every entry and journal the command.
    ///
    /// Clearing an empty buffer changes nothing and journals nothing.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR);
            Ok(())
        })?;
        inner.items.clear();
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }
}

impl<T: Send + 'static> StateMachine for DurableTimeWindowBuffer<T> {
    fn reset(&self, writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.writer = Some(writer);
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        let tag = reader.read_header()?;
        let mut inner = self.inner.lock();
        match tag {
            CLEAR => inner.items.clear(),
            SET_WINDOW => {
                let seconds = reader.read_varu64()?;
                if seconds == 0 {
                    return Err(JournalError::codec("window entry with zero seconds"));
                }
                // Eviction boundary comes from the current provider, the
                // same source the original write consulted.
                inner.apply_set_window(seconds, self.clock.unix_seconds());
            }
            ENQUEUE => {
                let item = self.codec.read(&mut reader, 0)?;
                let stamp = reader.read_vari64()?;
                inner.apply_enqueue(item, stamp);
            }
            DEQUEUE => {
                if inner.items.pop_front().is_none() {
                    return Err(JournalError::codec(
                        "dequeue entry applied to an empty window buffer",
                    ));
                }
            }
            SNAPSHOT => {
                let seconds = reader.read_varu64()?;
                if seconds == 0 {
                    return Err(JournalError::codec("snapshot with zero-second window"));
                }
                inner.items.clear();
                inner.window_seconds = seconds;
                let count = reader.read_varu64()? as usize;
                for _ in 0..count {
                    let item = self.codec.read(&mut reader, 0)?;
                    let stamp = reader.read_vari64()?;
                    inner.items.push_back((item, stamp));
                }
            }
            other => return Err(JournalError::unsupported_command(MACHINE, other)),
        }
        reader.finish(MACHINE)
    }

    fn append_snapshot(&self, batch: &mut LogBatch) -> Result<()> {
        let inner = self.inner.lock();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(SNAPSHOT);
            w.write_varu64(inner.window_seconds);
            w.write_varu64(inner.items.len() as u64);
            for (item, stamp) in &inner.items {
                self.codec.write(w, 0, item)?;
                w.write_vari64(*stamp);
            }
            Ok(())
        })?;
        batch.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statelog_wire::BincodeCodec;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct TestClock {
        seconds: AtomicI64,
    }

    impl TestClock {
        fn new(start: i64) -> Arc<Self> {
            Arc::new(TestClock {
                seconds: AtomicI64::new(start),
            })
        }

        fn set(&self, seconds: i64) {
            self.seconds.store(seconds, Ordering::SeqCst);
        }
    }

    impl Clock for TestClock {
        fn unix_seconds(&self) -> i64 {
            self.seconds.load(Ordering::SeqCst)
        }

        fn ticks(&self) -> i64 {
            self.unix_seconds() * 1_000
        }
    }

    fn buffer(
        window: u64,
        clock: Arc<TestClock>,
    ) -> (Arc<DurableTimeWindowBuffer<String>>, LogWriter) {
        let machine = DurableTimeWindowBuffer::new(
            StateKey::new("window").unwrap(),
            Duration::from_secs(window),
            clock,
            Arc::new(BincodeCodec::new()),
            SessionPool::new(),
        )
        .unwrap();
        let writer = LogWriter::new();
        machine.reset(writer.clone());
        (machine, writer)
    }

    #[test]
    fn test_purge_on_enqueue() {
        let clock = TestClock::new(0);
        let (buffer, _) = buffer(10, clock.clone());

        buffer.enqueue("A".into()).unwrap();
        clock.set(6);
        buffer.enqueue("B".into()).unwrap();
        clock.set(11);
        buffer.enqueue("C".into()).unwrap();

        assert_eq!(buffer.items(), vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_shrinking_window_purges() {
        let clock = TestClock::new(0);
        let (buffer, _) = buffer(30, clock.clone());

        buffer.enqueue("t0".into()).unwrap();
        clock.set(10);
        buffer.enqueue("t10".into()).unwrap();
        clock.set(20);
        buffer.enqueue("t20".into()).unwrap();

        assert!(buffer.set_window(Duration::from_secs(15)).unwrap());
        assert_eq!(buffer.items(), vec!["t10".to_string(), "t20".to_string()]);
    }

    #[test]
    fn test_window_minimum_and_no_op() {
        let clock = TestClock::new(0);
        let (buffer, writer) = buffer(10, clock);
        assert!(buffer.set_window(Duration::from_millis(500)).is_err());
        assert!(!buffer.set_window(Duration::from_secs(10)).unwrap());
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn test_replay_uses_recorded_stamps() {
        let clock = TestClock::new(0);
        let (buffer, writer) = buffer(10, clock.clone());
        buffer.enqueue("A".into()).unwrap();
        clock.set(6);
        buffer.enqueue("B".into()).unwrap();

        let replay_clock = TestClock::new(6);
        let (recovered, _) = self::buffer(10, replay_clock);
        for entry in writer.drain() {
            recovered.apply(&entry).unwrap();
        }
        assert_eq!(
            recovered.stamped_items(),
            vec![("A".to_string(), 0), ("B".to_string(), 6)]
        );
    }

    #[test]
    fn test_snapshot_preserves_window_and_stamps() {
        let clock = TestClock::new(5);
        let (buffer, _) = buffer(20, clock.clone());
        buffer.enqueue("x".into()).unwrap();
        clock.set(9);
        buffer.enqueue("y".into()).unwrap();

        let mut batch = LogBatch::new();
        buffer.append_snapshot(&mut batch).unwrap();

        let (recovered, _) = self::buffer(1, TestClock::new(9));
        for entry in batch.into_entries() {
            recovered.apply(&entry).unwrap();
        }
        assert_eq!(recovered.window(), Duration::from_secs(20));
        assert_eq!(
            recovered.stamped_items(),
            vec![("x".to_string(), 5), ("y".to_string(), 9)]
        );
    }
}

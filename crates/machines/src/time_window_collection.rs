//! Durable collection of independently-keyed time-window buffers.
//!
//! Mirrors the ring-buffer collection with windows instead of
//! capacities: one journal serves every buffer, per-buffer commands
//! carry the buffer key, and `ensure_buffer` overwrites the window on an
//! existing key.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{
    Clock, JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine,
};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

const MACHINE: &str = "time-window-collection";

const SNAPSHOT: u32 = 0;
const CLEAR_ALL: u32 = 1;
const CLEAR_BUFFER: u32 = 2;
const REMOVE_BUFFER: u32 = 3;
const SET_WINDOW: u32 = 4;
const ENQUEUE_ITEM: u32 = 5;
const DEQUEUE_ITEM: u32 = 6;

struct BufferState<T> {
    window_seconds: u64,
    items: VecDeque<(T, i64)>,
}

impl<T> BufferState<T> {
    fn new(window_seconds: u64) -> Self {
        BufferState {
            window_seconds,
            items: VecDeque::new(),
        }
    }

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

struct CollectionInner<K, T> {
    buffers: HashMap<K, BufferState<T>>,
    writer: Option<LogWriter>,
}

/// A durable mapping from `K` to an independent time-window buffer of
/// `T`.
pub struct DurableTimeWindowBufferCollection<K, T> {
    key: StateKey,
    clock: Arc<dyn Clock>,
    key_codec: Arc<dyn FieldCodec<K>>,
    item_codec: Arc<dyn FieldCodec<T>>,
    sessions: SessionPool,
    inner: Mutex<CollectionInner<K, T>>,
}

impl<K, T> DurableTimeWindowBufferCollection<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    /// Create an empty collection bound to `key`.
    pub fn new(
        key: StateKey,
        clock: Arc<dyn Clock>,
        key_codec: Arc<dyn FieldCodec<K>>,
        item_codec: Arc<dyn FieldCodec<T>>,
        sessions: SessionPool,
    ) -> Arc<Self> {
        Arc::new(DurableTimeWindowBufferCollection {
            key,
            clock,
            key_codec,
            item_codec,
            sessions,
            inner: Mutex::new(CollectionInner {
                buffers: HashMap::new(),
                writer: None,
            }),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    /// True when the collection holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().buffers.is_empty()
    }

    /// Every buffer key, in arbitrary order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().buffers.keys().cloned().collect()
    }

    /// True when a buffer exists under `key`.
    pub fn contains_buffer(&self, key: &K) -> bool {
        self.inner.lock().buffers.contains_key(key)
    }

    /// Create the buffer if absent, or overwrite its window if present;
    /// either way a window command is journaled. Returns a proxy for
    /// per-buffer operations.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the window is shorter than one second.
    pub fn ensure_buffer(
        &self,
        key: K,
        window: Duration,
    ) -> Result<TimeWindowBufferRef<'_, K, T>> {
        let seconds = window.as_secs();
        if seconds == 0 {
            return Err(JournalError::invalid_argument(
                "window must be at least one second",
            ));
        }
        let mut inner = self.inner.lock();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(SET_WINDOW);
            self.key_codec.write(w, 0, &key)?;
            w.write_varu64(seconds);
            Ok(())
        })?;
        let now = self.clock.unix_seconds();
        match inner.buffers.get_mut(&key) {
            Some(buffer) => buffer.apply_set_window(seconds, now),
            None => {
                inner.buffers.insert(key.clone(), BufferState::new(seconds));
            }
        }
        require_writer(&inner.writer)?.append(entry);
        drop(inner);
        Ok(TimeWindowBufferRef { owner: self, key })
    }

    /// Remove a buffer and its contents; returns false (and journals
    /// nothing) when absent.
    pub fn remove_buffer(&self, key: &K) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.buffers.contains_key(key) {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(REMOVE_BUFFER);
            self.key_codec.write(w, 0, key)
        })?;
        inner.buffers.remove(key);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Empty one buffer, keeping it registered; returns false (and
    /// journals nothing) when the buffer is absent or already empty.
    pub fn clear_buffer(&self, key: &K) -> Result<bool> {
        let mut inner = self.inner.lock();
        let has_items = inner
            .buffers
            .get(key)
            .map_or(false, |buffer| !buffer.items.is_empty());
        if !has_items {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR_BUFFER);
            self.key_codec.write(w, 0, key)
        })?;
        if let Some(buffer) = inner.buffers.get_mut(key) {
            buffer.items.clear();
        }
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Remove every buffer and journal the command.
    ///
    /// Clearing an empty collection changes nothing and journals
    /// nothing.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.buffers.is_empty() {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR_ALL);
            Ok(())
        })?;
        inner.buffers.clear();
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Stamp an item with the current time and enqueue it into the keyed
    /// buffer, purging that buffer's expired entries.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the buffer does not exist.
    pub fn enqueue_item(&self, key: &K, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.buffers.contains_key(key) {
            return Err(JournalError::invalid_argument("no buffer under this key"));
        }
        let stamp = self.clock.unix_seconds();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ENQUEUE_ITEM);
            self.key_codec.write(w, 0, key)?;
            self.item_codec.write(w, 1, &item)?;
            w.write_vari64(stamp);
            Ok(())
        })?;
        if let Some(buffer) = inner.buffers.get_mut(key) {
            buffer.apply_enqueue(item, stamp);
        }
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Dequeue the keyed buffer's oldest entry, or `None` when the
    /// buffer is absent or empty.
    pub fn try_dequeue_item(&self, key: &K) -> Result<Option<(T, i64)>> {
        let mut inner = self.inner.lock();
        let has_items = inner
            .buffers
            .get(key)
            .map_or(false, |buffer| !buffer.items.is_empty());
        if !has_items {
            return Ok(None);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(DEQUEUE_ITEM);
            self.key_codec.write(w, 0, key)
        })?;
        let item = inner
            .buffers
            .get_mut(key)
            .and_then(|buffer| buffer.items.pop_front());
        require_writer(&inner.writer)?.append(entry);
        Ok(item)
    }

    /// Number of entries in the keyed buffer; zero when absent.
    pub fn buffer_len(&self, key: &K) -> usize {
        self.inner
            .lock()
            .buffers
            .get(key)
            .map_or(0, |buffer| buffer.items.len())
    }

    /// The keyed buffer's window, if it exists.
    pub fn buffer_window(&self, key: &K) -> Option<Duration> {
        self.inner
            .lock()
            .buffers
            .get(key)
            .map(|buffer| Duration::from_secs(buffer.window_seconds))
    }

    /// The keyed buffer's items, oldest to newest; empty when absent.
    pub fn buffer_items(&self, key: &K) -> Vec<T>
    where
        T: Clone,
    {
        self.inner
            .lock()
            .buffers
            .get(key)
            .map(|buffer| buffer.items.iter().map(|(item, _)| item.clone()).collect())
            .unwrap_or_default()
    }
}

impl<K, T> StateMachine for DurableTimeWindowBufferCollection<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    fn reset(&self, writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.buffers.clear();
        inner.writer = Some(writer);
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        let tag = reader.read_header()?;
        let mut inner = self.inner.lock();
        match tag {
            CLEAR_ALL => inner.buffers.clear(),
            CLEAR_BUFFER => {
                let key = self.key_codec.read(&mut reader, 0)?;
                if let Some(buffer) = inner.buffers.get_mut(&key) {
                    buffer.items.clear();
                }
            }
            REMOVE_BUFFER => {
                let key = self.key_codec.read(&mut reader, 0)?;
                inner.buffers.remove(&key);
            }
            SET_WINDOW => {
                let key = self.key_codec.read(&mut reader, 0)?;
                let seconds = reader.read_varu64()?;
                if seconds == 0 {
                    return Err(JournalError::codec("window entry with zero seconds"));
                }
                let now = self.clock.unix_seconds();
                match inner.buffers.get_mut(&key) {
                    Some(buffer) => buffer.apply_set_window(seconds, now),
                    None => {
                        inner.buffers.insert(key, BufferState::new(seconds));
                    }
                }
            }
            ENQUEUE_ITEM => {
                let key = self.key_codec.read(&mut reader, 0)?;
                let item = self.item_codec.read(&mut reader, 1)?;
                let stamp = reader.read_vari64()?;
                match inner.buffers.get_mut(&key) {
                    Some(buffer) => buffer.apply_enqueue(item, stamp),
                    None => {
                        return Err(JournalError::codec(
                            "enqueue entry for an unknown window buffer",
                        ))
                    }
                }
            }
            DEQUEUE_ITEM => {
                let key = self.key_codec.read(&mut reader, 0)?;
                let popped = inner
                    .buffers
                    .get_mut(&key)
                    .and_then(|buffer| buffer.items.pop_front());
                if popped.is_none() {
                    return Err(JournalError::codec(
                        "dequeue entry applied to a missing or empty window buffer",
                    ));
                }
            }
            SNAPSHOT => {
                inner.buffers.clear();
                let buffer_count = reader.read_varu64()? as usize;
                for _ in 0..buffer_count {
                    let key = self.key_codec.read(&mut reader, 0)?;
                    let seconds = reader.read_varu64()?;
                    if seconds == 0 {
                        return Err(JournalError::codec("snapshot with zero-second window"));
                    }
                    let item_count = reader.read_varu64()? as usize;
                    let mut buffer = BufferState::new(seconds);
                    for _ in 0..item_count {
                        let item = self.item_codec.read(&mut reader, 1)?;
                        let stamp = reader.read_vari64()?;
                        buffer.items.push_back((item, stamp));
                    }
                    inner.buffers.insert(key, buffer);
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
            w.write_varu64(inner.buffers.len() as u64);
            for (key, buffer) in &inner.buffers {
                self.key_codec.write(w, 0, key)?;
                w.write_varu64(buffer.window_seconds);
                w.write_varu64(buffer.items.len() as u64);
                for (item, stamp) in &buffer.items {
                    self.item_codec.write(w, 1, item)?;
                    w.write_vari64(*stamp);
                }
            }
            Ok(())
        })?;
        batch.push(entry);
        Ok(())
    }
}

/// Per-buffer proxy returned by
/// [`DurableTimeWindowBufferCollection::ensure_buffer`].
pub struct TimeWindowBufferRef<'a, K, T> {
    owner: &'a DurableTimeWindowBufferCollection<K, T>,
    key: K,
}

impl<'a, K, T> TimeWindowBufferRef<'a, K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    /// The buffer's key within the collection.
    pub fn buffer_key(&self) -> &K {
        &self.key
    }

    /// Enqueue an item into this buffer.
    pub fn enqueue(&self, item: T) -> Result<()> {
        self.owner.enqueue_item(&self.key, item)
    }

    /// Dequeue this buffer's oldest entry.
    pub fn try_dequeue(&self) -> Result<Option<(T, i64)>> {
        self.owner.try_dequeue_item(&self.key)
    }

    /// Number of entries in this buffer.
    pub fn len(&self) -> usize {
        self.owner.buffer_len(&self.key)
    }

    /// True when this buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This buffer's window.
    pub fn window(&self) -> Option<Duration> {
        self.owner.buffer_window(&self.key)
    }

    /// This buffer's items, oldest to newest.
    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.owner.buffer_items(&self.key)
    }

    /// Empty this buffer.
    pub fn clear(&self) -> Result<bool> {
        self.owner.clear_buffer(&self.key)
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

    fn collection(
        clock: Arc<TestClock>,
    ) -> (
        Arc<DurableTimeWindowBufferCollection<String, String>>,
        LogWriter,
    ) {
        let machine = DurableTimeWindowBufferCollection::new(
            StateKey::new("windows").unwrap(),
            clock,
            Arc::new(BincodeCodec::new()),
            Arc::new(BincodeCodec::new()),
            SessionPool::new(),
        );
        let writer = LogWriter::new();
        machine.reset(writer.clone());
        (machine, writer)
    }

    #[test]
    fn test_per_buffer_windows_and_purge() {
        let clock = TestClock::new(0);
        let (collection, _) = collection(clock.clone());
        collection
            .ensure_buffer("short".into(), Duration::from_secs(5))
            .unwrap();
        collection
            .ensure_buffer("long".into(), Duration::from_secs(60))
            .unwrap();

        collection.enqueue_item(&"short".to_string(), "a".into()).unwrap();
        collection.enqueue_item(&"long".to_string(), "b".into()).unwrap();

        clock.set(10);
        collection.enqueue_item(&"short".to_string(), "c".into()).unwrap();
        collection.enqueue_item(&"long".to_string(), "d".into()).unwrap();

        assert_eq!(
            collection.buffer_items(&"short".to_string()),
            vec!["c".to_string()]
        );
        assert_eq!(
            collection.buffer_items(&"long".to_string()),
            vec!["b".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn test_ensure_overwrites_window() {
        let clock = TestClock::new(0);
        let (collection, _) = collection(clock.clone());
        collection
            .ensure_buffer("k".into(), Duration::from_secs(60))
            .unwrap();
        collection.enqueue_item(&"k".to_string(), "old".into()).unwrap();
        clock.set(30);
        collection.enqueue_item(&"k".to_string(), "new".into()).unwrap();

        // Shrinking the window through ensure_buffer purges with current time.
        let buffer = collection
            .ensure_buffer("k".into(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(buffer.items(), vec!["new".to_string()]);
        assert_eq!(buffer.window(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_replay_fidelity() {
        let clock = TestClock::new(0);
        let (collection, writer) = collection(clock.clone());
        collection
            .ensure_buffer("k".into(), Duration::from_secs(30))
            .unwrap();
        collection.enqueue_item(&"k".to_string(), "x".into()).unwrap();
        clock.set(3);
        collection.enqueue_item(&"k".to_string(), "y".into()).unwrap();
        collection.try_dequeue_item(&"k".to_string()).unwrap();

        let (recovered, _) = self::collection(TestClock::new(3));
        for entry in writer.drain() {
            recovered.apply(&entry).unwrap();
        }
        assert_eq!(
            recovered.buffer_items(&"k".to_string()),
            vec!["y".to_string()]
        );
        assert_eq!(
            recovered.buffer_window(&"k".to_string()),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_snapshot_fidelity() {
        let clock = TestClock::new(7);
        let (collection, _) = collection(clock.clone());
        collection
            .ensure_buffer("a".into(), Duration::from_secs(15))
            .unwrap();
        collection.enqueue_item(&"a".to_string(), "v".into()).unwrap();

        let mut batch = LogBatch::new();
        collection.append_snapshot(&mut batch).unwrap();

        let (recovered, _) = self::collection(TestClock::new(7));
        for entry in batch.into_entries() {
            recovered.apply(&entry).unwrap();
        }
        assert_eq!(
            recovered.buffer_items(&"a".to_string()),
            vec!["v".to_string()]
        );
        assert_eq!(
            recovered.buffer_window(&"a".to_string()),
            Some(Duration::from_secs(15))
        );
    }
}

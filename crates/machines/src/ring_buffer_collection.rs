//! Durable collection of independently-keyed ring buffers.
//!
//! One journal serves every buffer; per-buffer commands carry the buffer
//! key. No operation on one buffer may alter any other.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

const MACHINE: &str = "ring-buffer-collection";

const SNAPSHOT: u32 = 0;
const CLEAR_ALL: u32 = 1;
const CLEAR_BUFFER: u32 = 2;
const REMOVE_BUFFER: u32 = 3;
const SET_CAPACITY: u32 = 4;
const ENQUEUE_ITEM: u32 = 5;
const DEQUEUE_ITEM: u32 = 6;

struct BufferState<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BufferState<T> {
    fn new(capacity: usize) -> Self {
        BufferState {
            capacity,
            items: VecDeque::new(),
        }
    }

    fn apply_enqueue(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    fn apply_set_capacity(&mut self, capacity: usize) {
        while self.items.len() > capacity {
            self.items.pop_front();
        }
        self.capacity = capacity;
    }
}

struct CollectionInner<K, T> {
    buffers: HashMap<K, BufferState<T>>,
    writer: Option<LogWriter>,
}

/// A durable mapping from `K` to an independent ring buffer of `T`.
pub struct DurableRingBufferCollection<K, T> {
    key: StateKey,
    key_codec: Arc<dyn FieldCodec<K>>,
    item_codec: Arc<dyn FieldCodec<T>>,
    sessions: SessionPool,
    inner: Mutex<CollectionInner<K, T>>,
}

impl<K, T> DurableRingBufferCollection<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    /// Create an empty collection bound to `key`.
    pub fn new(
        key: StateKey,
        key_codec: Arc<dyn FieldCodec<K>>,
        item_codec: Arc<dyn FieldCodec<T>>,
        sessions: SessionPool,
    ) -> Arc<Self> {
        Arc::new(DurableRingBufferCollection {
            key,
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

    /// Create the buffer if absent, or overwrite its capacity if
    /// present; either way a capacity command is journaled. Returns a
    /// proxy for per-buffer operations.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `capacity` is zero.
    pub fn ensure_buffer(&self, key: K, capacity: usize) -> Result<RingBufferRef<'_, K, T>> {
        if capacity == 0 {
            return Err(JournalError::invalid_argument(
                "ring buffer capacity must be at least 1",
            ));
        }
        let mut inner = self.inner.lock();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(SET_CAPACITY);
            self.key_codec.write(w, 0, &key)?;
            w.write_varu64(capacity as u64);
            Ok(())
        })?;
        match inner.buffers.get_mut(&key) {
            Some(buffer) => buffer.apply_set_capacity(capacity),
            None => {
                inner.buffers.insert(key.clone(), BufferState::new(capacity));
            }
        }
        require_writer(&inner.writer)?.append(entry);
        drop(inner);
        Ok(RingBufferRef { owner: self, key })
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

    /// Enqueue into the keyed buffer and journal the command.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the buffer does not exist.
    pub fn enqueue_item(&self, key: &K, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.buffers.contains_key(key) {
            return Err(JournalError::invalid_argument("no buffer under this key"));
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ENQUEUE_ITEM);
            self.key_codec.write(w, 0, key)?;
            self.item_codec.write(w, 1, &item)
        })?;
        if let Some(buffer) = inner.buffers.get_mut(key) {
            buffer.apply_enqueue(item);
        }
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Dequeue the keyed buffer's oldest item, or `None` when the buffer
    /// is absent or empty.
    pub fn try_dequeue_item(&self, key: &K) -> Result<Option<T>> {
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

    /// Number of items in the keyed buffer; zero when absent.
    pub fn buffer_len(&self, key: &K) -> usize {
        self.inner
            .lock()
            .buffers
            .get(key)
            .map_or(0, |buffer| buffer.items.len())
    }

    /// The keyed buffer's capacity, if it exists.
    pub fn buffer_capacity(&self, key: &K) -> Option<usize> {
        self.inner
            .lock()
            .buffers
            .get(key)
            .map(|buffer| buffer.capacity)
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
            .map(|buffer| buffer.items.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl<K, T> StateMachine for DurableRingBufferCollection<K, T>
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
            SET_CAPACITY => {
                let key = self.key_codec.read(&mut reader, 0)?;
                let capacity = reader.read_varu64()? as usize;
                if capacity == 0 {
                    return Err(JournalError::codec("capacity entry with zero capacity"));
                }
                match inner.buffers.get_mut(&key) {
                    Some(buffer) => buffer.apply_set_capacity(capacity),
                    None => {
                        inner.buffers.insert(key, BufferState::new(capacity));
                    }
                }
            }
            ENQUEUE_ITEM => {
                let key = self.key_codec.read(&mut reader, 0)?;
                let item = self.item_codec.read(&mut reader, 1)?;
                match inner.buffers.get_mut(&key) {
                    Some(buffer) => buffer.apply_enqueue(item),
                    None => {
                        return Err(JournalError::codec(
                            "enqueue entry for an unknown ring buffer",
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
                        "dequeue entry applied to a missing or empty ring buffer",
                    ));
                }
            }
            SNAPSHOT => {
                inner.buffers.clear();
                let buffer_count = reader.read_varu64()? as usize;
                for _ in 0..buffer_count {
                    let key = self.key_codec.read(&mut reader, 0)?;
                    let capacity = reader.read_varu64()? as usize;
                    if capacity == 0 {
                        return Err(JournalError::codec("snapshot with zero capacity"));
                    }
                    let item_count = reader.read_varu64()? as usize;
                    let mut buffer = BufferState::new(capacity);
                    for _ in 0..item_count {
                        buffer.apply_enqueue(self.item_codec.read(&mut reader, 1)?);
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
                w.write_varu64(buffer.capacity as u64);
                w.write_varu64(buffer.items.len() as u64);
                for item in &buffer.items {
                    self.item_codec.write(w, 1, item)?;
                }
            }
            Ok(())
        })?;
        batch.push(entry);
        Ok(())
    }
}

/// Per-buffer proxy returned by
/// [`DurableRingBufferCollection::ensure_buffer`].
pub struct RingBufferRef<'a, K, T> {
    owner: &'a DurableRingBufferCollection<K, T>,
    key: K,
}

impl<'a, K, T> RingBufferRef<'a, K, T>
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

    /// Dequeue this buffer's oldest item.
    pub fn try_dequeue(&self) -> Result<Option<T>> {
        self.owner.try_dequeue_item(&self.key)
    }

    /// Number of items in this buffer.
    pub fn len(&self) -> usize {
        self.owner.buffer_len(&self.key)
    }

    /// True when this buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// This buffer's capacity.
    pub fn capacity(&self) -> Option<usize> {
        self.owner.buffer_capacity(&self.key)
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

//! Durable ring buffer: fixed-capacity FIFO that evicts the oldest item
//! when full.
//!
//! Capacity changes are journaled commands, so a shrink that discards
//! items replays identically: the newest items survive, the oldest are
//! dropped. The snapshot applies its recorded capacity before
//! re-enqueuing items.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::collections::VecDeque;
use std::sync::Arc;

const MACHINE: &str = "ring-buffer";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const SET_CAPACITY: u32 = 2;
const ENQUEUE: u32 = 3;
const DEQUEUE: u32 = 4;

struct RingInner<T> {
    capacity: usize,
    items: VecDeque<T>,
    writer: Option<LogWriter>,
}

impl<T> RingInner<T> {
    fn apply_enqueue(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    fn apply_set_capacity(&mut self, capacity: usize) {
        // Shrinking discards the oldest items, keeping the newest in order.
        while self.items.len() > capacity {
            self.items.pop_front();
        }
        self.capacity = capacity;
    }
}

/// A durable FIFO ring buffer of `T` with a journaled capacity.
pub struct DurableRingBuffer<T> {
    key: StateKey,
    codec: Arc<dyn FieldCodec<T>>,
    sessions: SessionPool,
    inner: Mutex<RingInner<T>>,
}

impl<T: Send + 'static> DurableRingBuffer<T> {
    /// Create an empty buffer bound to `key` with the given capacity.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `capacity` is zero.
    pub fn new(
        key: StateKey,
        capacity: usize,
        codec: Arc<dyn FieldCodec<T>>,
        sessions: SessionPool,
    ) -> Result<Arc<Self>> {
        if capacity == 0 {
            return Err(JournalError::invalid_argument(
                "ring buffer capacity must be at least 1",
            ));
        }
        Ok(Arc::new(DurableRingBuffer {
            key,
            codec,
            sessions,
            inner: Mutex::new(RingInner {
                capacity,
                items: VecDeque::new(),
                writer: None,
            }),
        }))
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// True when the next enqueue would evict.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.items.len() == inner.capacity
    }

    /// Change the capacity and journal the command.
    ///
    /// Shrinking below the current count discards the oldest items.
    /// Returns false (and journals nothing) when the capacity is
    /// unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `capacity` is zero.
    pub fn set_capacity(&self, capacity: usize) -> Result<bool> {
        if capacity == 0 {
            return Err(JournalError::invalid_argument(
                "ring buffer capacity must be at least 1",
            ));
        }
        let mut inner = self.inner.lock();
        if inner.capacity == capacity {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(SET_CAPACITY);
            w.write_varu64(capacity as u64);
            Ok(())
        })?;
        inner.apply_set_capacity(capacity);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Enqueue an item, evicting the oldest when full, and journal the
    /// command.
    pub fn enqueue(&self, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ENQUEUE);
            self.codec.write(w, 0, &item)
        })?;
        inner.apply_enqueue(item);
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Dequeue the oldest item, or `None` when empty.
    pub fn try_dequeue(&self) -> Result<Option<T>> {
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

    /// Membership test.
    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.inner.lock().items.contains(item)
    }

    /// The items, oldest to newest.
    pub fn items(&self) -> Vec<T>
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
        for (index, item) in inner.items.iter().enumerate() {
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
        dst.extend(inner.items.iter().cloned());
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

    /// Remove every item and journal the command.
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

impl<T: Send + 'static> StateMachine for DurableRingBuffer<T> {
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
            SET_CAPACITY => {
                let capacity = reader.read_varu64()? as usize;
                if capacity == 0 {
                    return Err(JournalError::codec("capacity entry with zero capacity"));
                }
                inner.apply_set_capacity(capacity);
            }
            ENQUEUE => {
                let item = self.codec.read(&mut reader, 0)?;
                inner.apply_enqueue(item);
            }
            DEQUEUE => {
                if inner.items.pop_front().is_none() {
                    return Err(JournalError::codec(
                        "dequeue entry applied to an empty ring buffer",
                    ));
                }
            }
            SNAPSHOT => {
                let count = reader.read_varu64()? as usize;
                let capacity = reader.read_varu64()? as usize;
                if capacity == 0 {
                    return Err(JournalError::codec("snapshot with zero capacity"));
                }
                inner.items.clear();
                inner.capacity = capacity;
                for _ in 0..count {
                    let item = self.codec.read(&mut reader, 0)?;
                    inner.apply_enqueue(item);
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
            w.write_varu64(inner.items.len() as u64);
            w.write_varu64(inner.capacity as u64);
            for item in &inner.items {
                self.codec.write(w, 0, item)?;
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

    fn ring(capacity: usize) -> (Arc<DurableRingBuffer<i64>>, LogWriter) {
        let machine = DurableRingBuffer::new(
            StateKey::new("ring").unwrap(),
            capacity,
            Arc::new(BincodeCodec::new()),
            SessionPool::new(),
        )
        .unwrap();
        let writer = LogWriter::new();
        machine.reset(writer.clone());
        (machine, writer)
    }

    #[test]
    fn test_overwrite_when_full() {
        let (ring, _) = ring(3);
        for item in 1..=4 {
            ring.enqueue(item).unwrap();
        }
        assert_eq!(ring.items(), vec![2, 3, 4]);
        assert!(ring.is_full());
    }

    #[test]
    fn test_shrink_keeps_newest() {
        let (ring, _) = ring(3);
        for item in 1..=4 {
            ring.enqueue(item).unwrap();
        }
        assert!(ring.set_capacity(2).unwrap());
        assert_eq!(ring.items(), vec![3, 4]);
        assert_eq!(ring.capacity(), 2);
    }

    #[test]
    fn test_grow_preserves_items() {
        let (ring, _) = ring(3);
        for item in 1..=3 {
            ring.enqueue(item).unwrap();
        }
        assert!(ring.set_capacity(5).unwrap());
        ring.enqueue(4).unwrap();
        ring.enqueue(5).unwrap();
        assert_eq!(ring.items(), vec![1, 2, 3, 4, 5]);
        assert!(ring.set_capacity(2).unwrap());
        assert_eq!(ring.items(), vec![4, 5]);
    }

    #[test]
    fn test_unchanged_capacity_is_silent() {
        let (ring, writer) = ring(3);
        assert!(!ring.set_capacity(3).unwrap());
        assert_eq!(writer.pending_len(), 0);
        assert!(ring.set_capacity(0).is_err());
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn test_replay_honors_capacity_entries() {
        let (ring, writer) = ring(4);
        for item in 1..=4 {
            ring.enqueue(item).unwrap();
        }
        ring.set_capacity(2).unwrap();

        let (recovered, _) = self::ring(4);
        for entry in writer.drain() {
            recovered.apply(&entry).unwrap();
        }
        assert_eq!(recovered.items(), vec![3, 4]);
        assert_eq!(recovered.capacity(), 2);
    }

    #[test]
    fn test_snapshot_applies_capacity_first() {
        let (ring, _) = ring(5);
        for item in 1..=3 {
            ring.enqueue(item).unwrap();
        }
        let mut batch = LogBatch::new();
        ring.append_snapshot(&mut batch).unwrap();

        let (recovered, _) = self::ring(1);
        for entry in batch.into_entries() {
            recovered.apply(&entry).unwrap();
        }
        assert_eq!(recovered.capacity(), 5);
        assert_eq!(recovered.items(), vec![1, 2, 3]);
    }

    #[test]
    fn test_drain_to_copies_then_clears() {
        let (ring, _) = ring(3);
        ring.enqueue(1).unwrap();
        ring.enqueue(2).unwrap();
        let mut out = Vec::new();
        ring.drain_to(&mut out).unwrap();
        assert_eq!(out, vec![1, 2]);
        assert!(ring.is_empty());
    }
}

//! Durable ordered set: unique values with preserved insertion order.
//!
//! Membership tests hit a hash set; ordered iteration walks a vector.
//! Both sides always hold the same values, so the count reads
//! identically from either.

use crate::support::{encode_entry, require_writer, InsertionOrderSet};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::hash::Hash;
use std::sync::Arc;

const MACHINE: &str = "ordered-set";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const ADD: u32 = 2;
const REMOVE: u32 = 3;

struct SetInner<T> {
    values: InsertionOrderSet<T>,
    writer: Option<LogWriter>,
}

/// A durable set of unique `T` iterated in insertion order.
pub struct DurableOrderedSet<T> {
    key: StateKey,
    codec: Arc<dyn FieldCodec<T>>,
    sessions: SessionPool,
    inner: Mutex<SetInner<T>>,
}

impl<T> DurableOrderedSet<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty set bound to `key`.
    pub fn new(key: StateKey, codec: Arc<dyn FieldCodec<T>>, sessions: SessionPool) -> Arc<Self> {
        Arc::new(DurableOrderedSet {
            key,
            codec,
            sessions,
            inner: Mutex::new(SetInner {
                values: InsertionOrderSet::default(),
                writer: None,
            }),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Number of values in the set.
    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    /// True when the set is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().values.is_empty()
    }

    /// Membership test.
    pub fn contains(&self, value: &T) -> bool {
        self.inner.lock().values.contains(value)
    }

    /// Add a value; returns false (and journals nothing) when already
    /// present.
    pub fn add(&self, value: T) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.values.contains(&value) {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ADD);
            self.codec.write(w, 0, &value)
        })?;
        inner.values.insert(value);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Remove a value; returns false (and journals nothing) when absent.
    pub fn remove(&self, value: &T) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.values.contains(value) {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(REMOVE);
            self.codec.write(w, 0, value)
        })?;
        inner.values.remove(value);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// The stored instance equal to `value`, if any.
    pub fn try_get_value(&self, value: &T) -> Option<T> {
        self.inner.lock().values.get(value).cloned()
    }

    /// The values in insertion order.
    pub fn ordered_items(&self) -> Vec<T> {
        self.inner.lock().values.iter().cloned().collect()
    }

    /// Copy the values in insertion order into `dst` starting at
    /// `offset`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the slice cannot hold them.
    pub fn copy_to(&self, dst: &mut [T], offset: usize) -> Result<()> {
        let inner = self.inner.lock();
        let needed = offset.saturating_add(inner.values.len());
        if dst.len() < needed {
            return Err(JournalError::invalid_argument(format!(
                "destination needs {} slots, has {}",
                needed,
                dst.len()
            )));
        }
        for (index, value) in inner.values.iter().enumerate() {
            dst[offset + index] = value.clone();
        }
        Ok(())
    }

    /// Remove every value and journal the command.
    ///
    /// Clearing an empty set changes nothing and journals nothing.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.values.is_empty() {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR);
            Ok(())
        })?;
        inner.values.clear();
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }
}

impl<T> StateMachine for DurableOrderedSet<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    fn reset(&self, writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.values.clear();
        inner.writer = Some(writer);
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        let tag = reader.read_header()?;
        let mut inner = self.inner.lock();
        match tag {
            CLEAR => inner.values.clear(),
            ADD => {
                let value = self.codec.read(&mut reader, 0)?;
                inner.values.insert(value);
            }
            REMOVE => {
                let value = self.codec.read(&mut reader, 0)?;
                inner.values.remove(&value);
            }
            SNAPSHOT => {
                inner.values.clear();
                let count = reader.read_varu64()? as usize;
                for _ in 0..count {
                    let value = self.codec.read(&mut reader, 0)?;
                    inner.values.insert(value);
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
            w.write_varu64(inner.values.len() as u64);
            for value in inner.values.iter() {
                self.codec.write(w, 0, value)?;
            }
            Ok(())
        })?;
        batch.push(entry);
        Ok(())
    }
}

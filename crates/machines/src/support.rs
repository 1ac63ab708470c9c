//! Shared plumbing for the durable structures.

use statelog_core::{JournalError, LogEntry, LogWriter, Result};
use statelog_wire::{EntryWriter, SessionPool};
use std::collections::HashSet;
use std::hash::Hash;

/// Encode one command into a pooled scratch buffer.
///
/// The session returns to the pool on every exit path, including encode
/// failures.
pub(crate) fn encode_entry(
    sessions: &SessionPool,
    encode: impl FnOnce(&mut EntryWriter<'_>) -> Result<()>,
) -> Result<LogEntry> {
    let mut session = sessions.acquire();
    let mut writer = EntryWriter::new(session.buffer());
    encode(&mut writer)?;
    Ok(LogEntry::from_bytes(session.take_bytes()))
}

/// Resolve the activation's log writer.
///
/// A structure only has a writer after the host called `reset`; mutating
/// an unregistered structure is an invalid operation.
pub(crate) fn require_writer(writer: &Option<LogWriter>) -> Result<&LogWriter> {
    writer
        .as_ref()
        .ok_or_else(|| JournalError::invalid_operation("structure is not attached to a host log"))
}

/// A set that remembers insertion order.
///
/// The hash set and the ordered vector always hold the same membership,
/// so `len` reads identically from either.
#[derive(Debug)]
pub(crate) struct InsertionOrderSet<T> {
    set: HashSet<T>,
    order: Vec<T>,
}

impl<T> Default for InsertionOrderSet<T> {
    fn default() -> Self {
        InsertionOrderSet {
            set: HashSet::new(),
            order: Vec::new(),
        }
    }
}

impl<T: Eq + Hash + Clone> InsertionOrderSet<T> {
    /// Insert a value; returns false (and changes nothing) when already
    /// present.
    pub fn insert(&mut self, value: T) -> bool {
        if !self.set.insert(value.clone()) {
            return false;
        }
        self.order.push(value);
        true
    }

    /// Remove a value; returns false when absent.
    pub fn remove(&mut self, value: &T) -> bool {
        if !self.set.remove(value) {
            return false;
        }
        self.order.retain(|v| v != value);
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        self.set.contains(value)
    }

    /// The stored instance equal to `value`, if any.
    pub fn get(&self, value: &T) -> Option<&T> {
        self.set.get(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.order.iter()
    }
}

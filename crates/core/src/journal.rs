//! Append-side journal surface
//!
//! A structure never talks to storage directly. During an activation it
//! holds a [`LogWriter`], a clonable handle onto its per-key pending
//! entry cell, and appends one encoded command per successful mutation.
//! The host drains the cell on `write_state` and hands the entries to the
//! storage backend.
//!
//! Batch-style structures instead receive a [`LogBatch`] in their
//! `append_entries` / `append_snapshot` hooks and push entries into it.

use parking_lot::Mutex;
use std::sync::Arc;

/// One opaque, framed journal entry.
///
/// The first byte is the entry version, followed by a varint command tag
/// and command-specific fields. Entry boundaries are preserved by the
/// host storage layer; this type never splits or concatenates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry(Vec<u8>);

impl LogEntry {
    /// Wrap an encoded entry.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        LogEntry(bytes)
    }

    /// The raw entry bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the entry, yielding its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Encoded length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the entry carries no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for LogEntry {
    fn from(bytes: Vec<u8>) -> Self {
        LogEntry(bytes)
    }
}

/// Clonable handle onto a per-key pending entry cell.
///
/// Mutations enqueue entries here in program order; the host drains the
/// cell when it performs a durable write. The handle is supplied to the
/// structure in `reset` and is valid for the rest of the activation.
#[derive(Debug, Clone, Default)]
pub struct LogWriter {
    pending: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogWriter {
    /// Create a writer with an empty pending cell.
    pub fn new() -> Self {
        LogWriter::default()
    }

    /// Enqueue one entry.
    pub fn append(&self, entry: LogEntry) {
        self.pending.lock().push(entry);
    }

    /// Number of entries waiting to be made durable.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Take every pending entry, leaving the cell empty.
    ///
    /// Host-side: called during `write_state`.
    pub fn drain(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Put entries back at the front of the cell.
    ///
    /// Host-side: called when a durable write failed after draining, so
    /// the entries are retried on the next write in their original order.
    pub fn restore(&self, entries: Vec<LogEntry>) {
        let mut pending = self.pending.lock();
        let newer = std::mem::replace(&mut *pending, entries);
        pending.extend(newer);
    }

    /// Discard every pending entry.
    ///
    /// Host-side: called before replay so stale pre-recovery appends never
    /// reach storage.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}

/// An ordered batch of entries collected from a batch-style structure.
///
/// Handed to `append_entries` and `append_snapshot`; the host turns the
/// collected entries into one durable write.
#[derive(Debug, Default)]
pub struct LogBatch {
    entries: Vec<LogEntry>,
}

impl LogBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        LogBatch::default()
    }

    /// Append one entry to the batch.
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Number of entries collected so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the batch, yielding its entries in append order.
    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8) -> LogEntry {
        LogEntry::from_bytes(vec![byte])
    }

    #[test]
    fn test_writer_append_and_drain() {
        let writer = LogWriter::new();
        writer.append(entry(1));
        writer.append(entry(2));
        assert_eq!(writer.pending_len(), 2);

        let drained = writer.drain();
        assert_eq!(drained, vec![entry(1), entry(2)]);
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn test_writer_restore_preserves_order() {
        let writer = LogWriter::new();
        writer.append(entry(1));
        let drained = writer.drain();

        // A new append lands while the failed batch is in flight.
        writer.append(entry(2));
        writer.restore(drained);

        assert_eq!(writer.drain(), vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_writer_clones_share_the_cell() {
        let writer = LogWriter::new();
        let alias = writer.clone();
        alias.append(entry(7));
        assert_eq!(writer.pending_len(), 1);
    }

    #[test]
    fn test_batch_collects_in_order() {
        let mut batch = LogBatch::new();
        assert!(batch.is_empty());
        batch.push(entry(3));
        batch.push(entry(4));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.into_entries(), vec![entry(3), entry(4)]);
    }
}

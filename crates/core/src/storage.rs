//! Host-collaborator seams
//!
//! These traits describe what statelog requires of its surroundings: a
//! storage backend that persists framed entries per key and replays them
//! in order, and a host callback that turns in-memory state into a
//! durable write. Swapping implementations must not affect any structure.

use crate::error::Result;
use crate::journal::LogEntry;
use crate::key::StateKey;

/// Per-key append-only entry storage.
///
/// Entry boundaries are preserved exactly: `read` yields the same framed
/// entries that were appended, in append order, with at most one leading
/// snapshot entry after a `replace`.
///
/// Thread safety: all methods must be safe to call concurrently
/// (requires `Send + Sync`).
pub trait LogStorage: Send + Sync {
    /// Durably append entries to the key's log, after any existing
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the write is rejected; in that case none of
    /// the entries may be visible to a later `read`.
    fn append(&self, key: &StateKey, entries: &[LogEntry]) -> Result<()>;

    /// Replace the key's entire log with the given entries.
    ///
    /// Used for snapshot compaction: the prior prefix is discarded and
    /// the new entries (typically a single snapshot) become the whole
    /// log.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the write is rejected; the previous log
    /// must remain intact in that case.
    fn replace(&self, key: &StateKey, entries: &[LogEntry]) -> Result<()>;

    /// Read back the key's replayable entry sequence, oldest first.
    /// A key that was never written yields an empty sequence.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the log cannot be read.
    fn read(&self, key: &StateKey) -> Result<Vec<LogEntry>>;

    /// Number of entries currently stored for the key.
    ///
    /// The host consults this for its compaction policy.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the log cannot be read.
    fn entry_count(&self, key: &StateKey) -> Result<usize>;
}

/// The host's durable-write callback.
///
/// Invoking it flushes every registered structure's pending entries and
/// batched state to storage, then delivers `on_write_completed`. The
/// cancellation source holds a weak reference to this and invokes it from
/// its timer for auto-persistence.
pub trait WriteState: Send + Sync {
    /// Perform one durable write covering all registered structures.
    ///
    /// # Errors
    ///
    /// Returns `Storage` when the backend rejected the write. Pending
    /// entries are retained for a retry.
    fn write_state(&self) -> Result<()>;
}

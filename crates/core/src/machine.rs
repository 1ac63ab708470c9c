//! The lifecycle contract between a structure and its host
//!
//! Every durable structure implements [`StateMachine`]. The host drives
//! the hooks in a fixed order:
//!
//! ```text
//! register → Reset(writer) → Apply(entry)* → OnRecoveryCompleted
//!          → (mutate → append)* → AppendEntries/AppendSnapshot
//!          → OnWriteCompleted
//! ```
//!
//! Methods take `&self`: structures guard their representation with
//! interior mutability so that handles stay cheap to clone and the host
//! can hold them as `Arc<dyn StateMachine>`.

use crate::error::Result;
use crate::journal::{LogBatch, LogEntry, LogWriter};

/// Lifecycle hooks the host invokes on every registered structure.
pub trait StateMachine: Send + Sync {
    /// Return the structure to its empty/default state and remember the
    /// writer for future appends. Called once per activation, before any
    /// entry is replayed.
    fn reset(&self, writer: LogWriter);

    /// Decode and apply one log entry. Called once per entry during
    /// recovery, in append order. A snapshot entry, when present, is
    /// always the first entry applied.
    ///
    /// # Errors
    ///
    /// `UnsupportedVersion`, `UnsupportedCommand` or `Codec` when the
    /// entry cannot be decoded; these abort recovery.
    fn apply(&self, entry: &LogEntry) -> Result<()>;

    /// Finalization after the last `apply`. Used by the structures that
    /// derive runtime state from their journal (the object container's
    /// existence latch, the cancellation source's timer re-arm).
    fn on_recovery_completed(&self) -> Result<()> {
        Ok(())
    }

    /// Contribute pending state to a durable write.
    ///
    /// Push-style structures already appended their commands on mutation
    /// and leave this as a no-op. Batch-style structures (object
    /// container, cancellation source) serialize their current state
    /// here.
    fn append_entries(&self, batch: &mut LogBatch) -> Result<()> {
        let _ = batch;
        Ok(())
    }

    /// Emit a single self-contained entry that rebuilds the current state
    /// from empty. The host uses it to compact the journal.
    fn append_snapshot(&self, batch: &mut LogBatch) -> Result<()>;

    /// Called after a durable write succeeded. Latches `record_exists`
    /// on the object container and signals the cancellation token when a
    /// cancellation is pending.
    fn on_write_completed(&self) {}
}

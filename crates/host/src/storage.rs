//! In-memory log storage.
//!
//! Per-key entry logs behind a mutex, with write failure injection so
//! tests can exercise the storage-failure paths (the cancellation
//! source's rollback in particular).

use parking_lot::Mutex;
use statelog_core::{JournalError, LogEntry, LogStorage, Result, StateKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory [`LogStorage`] with failure injection.
#[derive(Default)]
pub struct MemoryLogStorage {
    logs: Mutex<HashMap<StateKey, Vec<LogEntry>>>,
    fail_writes: AtomicUsize,
}

impl MemoryLogStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        MemoryLogStorage::default()
    }

    /// Make the next write (append or replace) fail with a `Storage`
    /// error.
    pub fn fail_next_write(&self) {
        self.fail_writes.store(1, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Total entries across every key.
    pub fn total_entries(&self) -> usize {
        self.logs.lock().values().map(Vec::len).sum()
    }

    fn check_failure(&self) -> Result<()> {
        let mut remaining = self.fail_writes.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.fail_writes.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(JournalError::storage("injected write failure")),
                Err(actual) => remaining = actual,
            }
        }
        Ok(())
    }
}

impl LogStorage for MemoryLogStorage {
    fn append(&self, key: &StateKey, entries: &[LogEntry]) -> Result<()> {
        self.check_failure()?;
        self.logs
            .lock()
            .entry(key.clone())
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    fn replace(&self, key: &StateKey, entries: &[LogEntry]) -> Result<()> {
        self.check_failure()?;
        self.logs.lock().insert(key.clone(), entries.to_vec());
        Ok(())
    }

    fn read(&self, key: &StateKey) -> Result<Vec<LogEntry>> {
        Ok(self.logs.lock().get(key).cloned().unwrap_or_default())
    }

    fn entry_count(&self, key: &StateKey) -> Result<usize> {
        Ok(self.logs.lock().get(key).map_or(0, Vec::len))
    }
}

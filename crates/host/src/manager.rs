//! The state-machine manager: registration, recovery, durable writes,
//! and snapshot compaction.
//!
//! One manager covers one host activation. Structures register under
//! unique keys; `recover` replays each key's journal in registration
//! order; `write_state` flushes every structure's pending and batched
//! entries in one pass and then delivers `on_write_completed`.

use parking_lot::Mutex;
use statelog_core::{
    JournalError, LogBatch, LogStorage, LogWriter, Result, StateKey, StateMachine, WriteState,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Host-side policy knobs.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Compact a key's journal into a single snapshot entry once it
    /// holds more than this many entries after a write. `None` disables
    /// automatic compaction; `take_snapshot` stays available either way.
    pub compact_after_entries: Option<usize>,
}

/// Statistics from one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Number of registered structures replayed.
    pub machines: usize,
    /// Total journal entries applied across all keys.
    pub entries_applied: usize,
}

#[derive(Clone)]
struct Registration {
    key: StateKey,
    machine: Arc<dyn StateMachine>,
    pending: LogWriter,
}

#[derive(Default)]
struct Registry {
    order: Vec<Registration>,
    index: HashMap<StateKey, usize>,
}

/// Registers structures and drives their journaling lifecycle.
pub struct StateMachineManager {
    storage: Arc<dyn LogStorage>,
    config: ManagerConfig,
    registry: Mutex<Registry>,
    // Serializes write_state/take_snapshot between the host thread and
    // the cancellation source's timer thread.
    write_lock: Mutex<()>,
}

impl StateMachineManager {
    /// Create a manager over the given storage with default config.
    pub fn new(storage: Arc<dyn LogStorage>) -> Arc<Self> {
        Self::with_config(storage, ManagerConfig::default())
    }

    /// Create a manager with an explicit config.
    pub fn with_config(storage: Arc<dyn LogStorage>, config: ManagerConfig) -> Arc<Self> {
        Arc::new(StateMachineManager {
            storage,
            config,
            registry: Mutex::new(Registry::default()),
            write_lock: Mutex::new(()),
        })
    }

    /// Register a structure under its key.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the key is already registered.
    pub fn register(&self, key: StateKey, machine: Arc<dyn StateMachine>) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.index.contains_key(&key) {
            return Err(JournalError::invalid_argument(format!(
                "key '{}' is already registered",
                key
            )));
        }
        let registration = Registration {
            key: key.clone(),
            machine,
            pending: LogWriter::new(),
        };
        let position = registry.order.len();
        registry.index.insert(key, position);
        registry.order.push(registration);
        Ok(())
    }

    /// Reset every registered structure and replay its journal.
    ///
    /// Per structure, in registration order: `reset` (which hands over
    /// the activation's writer), one `apply` per stored entry, then
    /// `on_recovery_completed`.
    ///
    /// # Errors
    ///
    /// Propagates storage errors and fatal replay errors
    /// (`UnsupportedVersion` / `UnsupportedCommand` / `Codec`).
    pub fn recover(&self) -> Result<RecoveryStats> {
        let registrations = self.registrations();
        let mut stats = RecoveryStats {
            machines: registrations.len(),
            ..RecoveryStats::default()
        };
        for registration in &registrations {
            registration.machine.reset(registration.pending.clone());
            // Appends made before recovery never reach storage.
            registration.pending.clear();
            let entries = self.storage.read(&registration.key)?;
            for entry in &entries {
                registration.machine.apply(entry)?;
            }
            registration.machine.on_recovery_completed()?;
            stats.entries_applied += entries.len();
            debug!(key = %registration.key, entries = entries.len(), "journal replayed");
        }
        Ok(stats)
    }

    /// Perform one durable write covering every registered structure,
    /// then deliver `on_write_completed` and apply the compaction
    /// policy.
    ///
    /// # Errors
    ///
    /// `Storage` when the backend rejects a write; pending entries are
    /// retained for a retry.
    pub fn write_state(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let registrations = self.registrations();

        // Collect first so a codec failure leaves storage untouched.
        let mut collected = Vec::with_capacity(registrations.len());
        for registration in &registrations {
            let mut batch = LogBatch::new();
            registration.machine.append_entries(&mut batch)?;
            let pending = registration.pending.drain();
            collected.push((registration, pending, batch.into_entries()));
        }

        for index in 0..collected.len() {
            let (registration, pending, batched) = &collected[index];
            if pending.is_empty() && batched.is_empty() {
                continue;
            }
            let mut entries = pending.clone();
            entries.extend(batched.iter().cloned());
            if let Err(error) = self.storage.append(&registration.key, &entries) {
                // Give every undrained pending entry back so the next
                // write retries it; batched entries are regenerated from
                // state.
                for (registration, pending, _) in &collected[index..] {
                    if !pending.is_empty() {
                        registration.pending.restore(pending.clone());
                    }
                }
                return Err(error);
            }
        }

        for registration in &registrations {
            registration.machine.on_write_completed();
        }

        if let Some(threshold) = self.config.compact_after_entries {
            for registration in &registrations {
                if self.storage.entry_count(&registration.key)? > threshold {
                    self.compact(registration)?;
                }
            }
        }
        Ok(())
    }

    /// Replace every key's journal with a single snapshot entry.
    ///
    /// Pending entries are discarded: the snapshot already captures the
    /// in-memory state they produced.
    ///
    /// # Errors
    ///
    /// Propagates snapshot encoding and storage errors.
    pub fn take_snapshot(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let registrations = self.registrations();
        for registration in &registrations {
            self.compact(registration)?;
            registration.pending.clear();
        }
        for registration in &registrations {
            registration.machine.on_write_completed();
        }
        Ok(())
    }

    fn compact(&self, registration: &Registration) -> Result<()> {
        let mut batch = LogBatch::new();
        registration.machine.append_snapshot(&mut batch)?;
        let entries = batch.into_entries();
        self.storage.replace(&registration.key, &entries)?;
        debug!(key = %registration.key, "journal compacted into snapshot");
        Ok(())
    }

    fn registrations(&self) -> Vec<Registration> {
        self.registry.lock().order.clone()
    }
}

impl WriteState for StateMachineManager {
    fn write_state(&self) -> Result<()> {
        StateMachineManager::write_state(self)
    }
}

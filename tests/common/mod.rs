//! Shared fixtures for the end-to-end scenarios.
//!
//! "Deactivate / reactivate" in these tests means: drop the old manager
//! and handles, build a fresh manager plus fresh structure handles over
//! the same storage, and run recovery.

use statelog::{MemoryLogStorage, StateKey, StateMachineManager};
use std::sync::Arc;

pub fn key(name: &str) -> StateKey {
    StateKey::new(name).unwrap()
}

/// Fresh storage plus a manager over it.
pub fn activate() -> (Arc<MemoryLogStorage>, Arc<StateMachineManager>) {
    let storage = Arc::new(MemoryLogStorage::new());
    let manager = StateMachineManager::new(storage.clone());
    (storage, manager)
}

/// A fresh manager over existing storage (a reactivation).
pub fn reactivate(storage: &Arc<MemoryLogStorage>) -> Arc<StateMachineManager> {
    StateMachineManager::new(storage.clone())
}

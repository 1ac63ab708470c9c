//! # statelog
//!
//! Durable, journaled in-memory state machines: rich data structures
//! whose full state survives host restarts by replaying an append-only
//! command log, optionally compacted into snapshots.
//!
//! Every structure is attached to a per-key log. Mutations apply in
//! memory first and append one framed command second; recovery replays
//! the stored entries (with at most one leading snapshot) to restore
//! the state byte for byte.
//!
//! # Quick Start
//!
//! ```no_run
//! use statelog::{
//!     BincodeCodec, DurableStack, MemoryLogStorage, SessionPool, StateKey,
//!     StateMachineManager,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> statelog::Result<()> {
//!     let storage = Arc::new(MemoryLogStorage::new());
//!     let manager = StateMachineManager::new(storage);
//!
//!     let stack: Arc<DurableStack<String>> = DurableStack::new(
//!         StateKey::new("cart")?,
//!         Arc::new(BincodeCodec::new()),
//!         SessionPool::new(),
//!     );
//!     manager.register(StateKey::new("cart")?, stack.clone())?;
//!     manager.recover()?;
//!
//!     stack.push("one".into())?;
//!     stack.push("two".into())?;
//!     manager.write_state()?; // entries are durable from here
//!
//!     assert_eq!(stack.peek()?, "two");
//!     Ok(())
//! }
//! ```
//!
//! # Structures
//!
//! | Structure | Highlights |
//! |-----------|------------|
//! | [`DurableStack`] | LIFO; snapshot stores elements bottom-to-top |
//! | [`DurablePriorityQueue`] | min by priority, FIFO tie-break |
//! | [`DurableOrderedSet`] | unique values, insertion-ordered iteration |
//! | [`DurableListLookup`] | key → list with duplicates |
//! | [`DurableSetLookup`] | key → unique set |
//! | [`DurableOrderedSetLookup`] | key → unique, insertion-ordered set |
//! | [`DurableRingBuffer`] | fixed capacity, evicts oldest, journaled resizes |
//! | [`DurableRingBufferCollection`] | key → independent ring buffer |
//! | [`DurableTimeWindowBuffer`] | timestamped FIFO with sliding-window purge |
//! | [`DurableTimeWindowBufferCollection`] | key → independent window buffer |
//! | [`DurableTree`] | rooted, acyclic, cascading removal, BFS snapshot |
//! | [`DurableGraph`] | directed, one edge per (src, dst), cycles allowed |
//! | [`DurableObject`] | single value, full-state write per host flush |
//! | [`DurableCancellationSource`] | two-phase durable cancellation |
//!
//! # Architecture
//!
//! The workspace splits along the protocol layers: `statelog-core`
//! holds the lifecycle and collaborator traits, `statelog-wire` the
//! entry framing and value codec seam, `statelog-machines` the
//! structures, and `statelog-host` a reference host (manager, in-memory
//! storage, clock/timer drivers). This crate re-exports the public
//! surface.

#![warn(clippy::all)]

pub use statelog_core::{
    Clock, JournalError, LogBatch, LogEntry, LogStorage, LogWriter, Result, StateKey,
    StateMachine, SystemClock, TimerDriver, TimerHandle, WriteState, ENTRY_VERSION,
};
pub use statelog_host::{
    ManagerConfig, ManualClock, ManualTimer, MemoryLogStorage, RecoveryStats, StateMachineManager,
    ThreadTimer,
};
pub use statelog_machines::{
    CancellationToken, DurableCancellationSource, DurableGraph, DurableListLookup, DurableObject,
    DurableOrderedSet, DurableOrderedSetLookup, DurablePriorityQueue, DurableRingBuffer,
    DurableRingBufferCollection, DurableSetLookup, DurableStack, DurableTimeWindowBuffer,
    DurableTimeWindowBufferCollection, DurableTree, RingBufferRef, TimeWindowBufferRef,
};
pub use statelog_wire::{BincodeCodec, EntryReader, EntryWriter, FieldCodec, Session, SessionPool};

//! Core types and contracts for statelog
//!
//! This crate defines the foundational types shared by every layer:
//! - StateKey: validated string key identifying a structure instance
//! - JournalError: the unified error type for all statelog APIs
//! - LogEntry / LogWriter / LogBatch: the append-side journal surface
//! - StateMachine: the lifecycle contract between a structure and its host
//! - LogStorage / WriteState: the host-collaborator seams
//! - Clock / TimerDriver: injectable time sources

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod journal;
pub mod key;
pub mod machine;
pub mod storage;
pub mod time;

pub use error::{JournalError, Result, ENTRY_VERSION};
pub use journal::{LogBatch, LogEntry, LogWriter};
pub use key::StateKey;
pub use machine::StateMachine;
pub use storage::{LogStorage, WriteState};
pub use time::{Clock, SystemClock, TimerDriver, TimerHandle};

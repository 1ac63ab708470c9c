//! Error types for statelog
//!
//! `JournalError` is the unified error type for all statelog APIs. We use
//! `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Error Classification
//!
//! - **Precondition failures** (`InvalidArgument`, `InvalidOperation`):
//!   raised *before* any mutation, so a failed call never pollutes the log.
//! - **Replay failures** (`UnsupportedVersion`, `UnsupportedCommand`,
//!   `Codec`): a log entry could not be decoded. These are fatal: the
//!   journal is unreadable and the activation must not proceed.
//! - **Storage failures** (`Storage`): the host rejected a durable write.
//!   Only the cancellation source reacts to these (rollback); every other
//!   structure propagates them.

use thiserror::Error;

/// Result type alias for statelog operations
pub type Result<T> = std::result::Result<T, JournalError>;

/// The log entry version every structure currently writes and accepts.
pub const ENTRY_VERSION: u8 = 0;

/// Unified error type for all statelog operations
#[derive(Debug, Error)]
pub enum JournalError {
    /// A public API argument failed validation.
    ///
    /// Examples: empty key, capacity of zero, a window shorter than one
    /// second, a missing endpoint on `add_edge`.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the argument
        message: String,
    },

    /// The operation is not valid for the structure's current state.
    ///
    /// Examples: `pop` on an empty stack, `set_root` on a non-empty tree,
    /// a `move` that would create a cycle.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Why the operation is invalid
        message: String,
    },

    /// A log entry carried a version byte this library does not understand.
    #[error("unsupported log entry version {found} (expected {expected})")]
    UnsupportedVersion {
        /// The version byte found in the entry
        found: u8,
        /// The version this library writes and accepts
        expected: u8,
    },

    /// A log entry carried a command tag outside the structure's closed set.
    #[error("unsupported command tag {tag} for {machine}")]
    UnsupportedCommand {
        /// Name of the structure that rejected the entry
        machine: &'static str,
        /// The offending tag
        tag: u32,
    },

    /// A log entry body was malformed (truncated, trailing bytes, or a
    /// field codec rejected its payload).
    #[error("codec failure: {message}")]
    Codec {
        /// What went wrong while encoding or decoding
        message: String,
    },

    /// The host storage rejected a durable write.
    #[error("storage failure: {message}")]
    Storage {
        /// Error message from the storage layer
        message: String,
    },
}

impl JournalError {
    /// Create an `InvalidArgument` error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        JournalError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an `InvalidOperation` error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        JournalError::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create an `UnsupportedVersion` error for a foreign version byte
    pub fn unsupported_version(found: u8) -> Self {
        JournalError::UnsupportedVersion {
            found,
            expected: ENTRY_VERSION,
        }
    }

    /// Create an `UnsupportedCommand` error
    pub fn unsupported_command(machine: &'static str, tag: u32) -> Self {
        JournalError::UnsupportedCommand { machine, tag }
    }

    /// Create a `Codec` error
    pub fn codec(message: impl Into<String>) -> Self {
        JournalError::Codec {
            message: message.into(),
        }
    }

    /// Create a `Storage` error
    pub fn storage(message: impl Into<String>) -> Self {
        JournalError::Storage {
            message: message.into(),
        }
    }

    /// Check if this error makes a journal unreadable.
    ///
    /// Fatal errors surface during replay and must abort recovery; they
    /// cannot be resolved by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JournalError::UnsupportedVersion { .. }
                | JournalError::UnsupportedCommand { .. }
                | JournalError::Codec { .. }
        )
    }

    /// Check if this error came from the host storage layer.
    ///
    /// The cancellation source uses this to decide whether to roll back a
    /// timer-initiated commit; other callers treat it as propagate-only.
    pub fn is_storage(&self) -> bool {
        matches!(self, JournalError::Storage { .. })
    }

    /// Check if this error is a precondition failure.
    ///
    /// Precondition failures are raised before any mutation, so the
    /// structure and its log are untouched.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            JournalError::InvalidArgument { .. } | JournalError::InvalidOperation { .. }
        )
    }
}

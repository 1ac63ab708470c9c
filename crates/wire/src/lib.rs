//! Log protocol layer for statelog
//!
//! Defines the byte layout of a command entry and the framing primitives
//! every structure shares:
//!
//! ```text
//! ┌────────────┬──────────────────┬──────────────────────────────┐
//! │ version u8 │ command varint32 │ command-specific fields      │
//! └────────────┴──────────────────┴──────────────────────────────┘
//! ```
//!
//! - Integer fields outside the field-framed codec use LEB128 varints
//!   (zigzag for signed values); see [`varint`].
//! - User-supplied values go through the injected [`FieldCodec`]; each
//!   value is a field header (`varint field id` + `varint length`)
//!   followed by its body, so write and read agree bit-exactly.
//! - Scratch buffers come from a [`SessionPool`] and are released on all
//!   exit paths.
//!
//! An entry produced by any version of this library can be read by any
//! other version with the same `(version, command_tag)` mapping.

#![warn(clippy::all)]

pub mod entry;
pub mod field;
pub mod session;
pub mod varint;

pub use entry::{EntryReader, EntryWriter};
pub use field::{BincodeCodec, FieldCodec};
pub use session::{Session, SessionPool};

//! Field-framed value codec seam.
//!
//! Structures never interpret the bytes of a user value. They hold an
//! injected `Arc<dyn FieldCodec<T>>` and delegate: the codec writes a
//! field header (varint field id, varint body length) followed by the
//! value body, and reads back with the exact same header. Field ids are
//! small integers assigned per command position (0, 1, 2…).
//!
//! [`BincodeCodec`] is the stock implementation for any
//! `Serialize + DeserializeOwned` type.

use crate::entry::{EntryReader, EntryWriter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use statelog_core::{JournalError, Result};
use std::marker::PhantomData;

/// Reads and writes one user value inside a journal entry.
///
/// Implementations must produce the same field header on write and read;
/// a field id mismatch on read is a `Codec` error, because it means the
/// entry was produced for a different command layout.
pub trait FieldCodec<T>: Send + Sync {
    /// Write the field header and the encoded value.
    ///
    /// # Errors
    ///
    /// `Codec` when the value cannot be serialized.
    fn write(&self, writer: &mut EntryWriter<'_>, field_id: u32, value: &T) -> Result<()>;

    /// Read and validate the field header, then decode the value.
    ///
    /// # Errors
    ///
    /// `Codec` for a header mismatch or a malformed body.
    fn read(&self, reader: &mut EntryReader<'_>, field_id: u32) -> Result<T>;
}

/// Stock codec backed by bincode.
///
/// The body is the bincode encoding of the value; the header is the
/// shared field-id + length form.
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    /// Create a codec instance.
    pub fn new() -> Self {
        BincodeCodec {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FieldCodec<T> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn write(&self, writer: &mut EntryWriter<'_>, field_id: u32, value: &T) -> Result<()> {
        let body = bincode::serialize(value)
            .map_err(|e| JournalError::codec(format!("bincode encode failed: {}", e)))?;
        writer.write_varu32(field_id);
        writer.write_bytes(&body);
        Ok(())
    }

    fn read(&self, reader: &mut EntryReader<'_>, field_id: u32) -> Result<T> {
        let found = reader.read_varu32()?;
        if found != field_id {
            return Err(JournalError::codec(format!(
                "field id mismatch: expected {}, got {}",
                field_id, found
            )));
        }
        let body = reader.read_bytes()?;
        bincode::deserialize(body)
            .map_err(|e| JournalError::codec(format!("bincode decode failed: {}", e)))
    }
}

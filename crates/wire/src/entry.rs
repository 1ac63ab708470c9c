//! Entry framing: writer and reader over a single journal entry.
//!
//! Every entry starts with the version byte and a varint command tag
//! (the two structures with a single entry form skip the tag). The
//! writer appends into a pooled scratch buffer; the reader is a cursor
//! over the entry bytes that must be fully consumed by a successful
//! apply.

use crate::varint;
use statelog_core::{JournalError, Result, ENTRY_VERSION};

/// Append-only writer for one journal entry.
pub struct EntryWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> EntryWriter<'a> {
    /// Wrap a (typically pooled) output buffer.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        EntryWriter { buf }
    }

    /// Write the entry header: version byte followed by the command tag.
    pub fn write_header(&mut self, tag: u32) {
        self.write_version();
        self.write_varu32(tag);
    }

    /// Write the version byte alone (single-entry-form structures).
    pub fn write_version(&mut self) {
        self.buf.push(ENTRY_VERSION);
    }

    /// Write one raw byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write an unsigned 32-bit varint.
    pub fn write_varu32(&mut self, value: u32) {
        varint::write_u32(self.buf, value);
    }

    /// Write an unsigned 64-bit varint.
    pub fn write_varu64(&mut self, value: u64) {
        varint::write_u64(self.buf, value);
    }

    /// Write a zigzag signed 64-bit varint.
    pub fn write_vari64(&mut self, value: i64) {
        varint::write_i64(self.buf, value);
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_varu64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }
}

/// Cursor over one journal entry's bytes.
pub struct EntryReader<'a> {
    input: &'a [u8],
}

impl<'a> EntryReader<'a> {
    /// Wrap the entry bytes.
    pub fn new(entry: &'a [u8]) -> Self {
        EntryReader { input: entry }
    }

    /// Read and validate the version byte, then the command tag.
    ///
    /// # Errors
    ///
    /// `UnsupportedVersion` for a foreign version byte; `Codec` for a
    /// truncated header.
    pub fn read_header(&mut self) -> Result<u32> {
        self.read_version()?;
        self.read_varu32()
    }

    /// Read and validate the version byte alone.
    ///
    /// # Errors
    ///
    /// `UnsupportedVersion` for a foreign version byte; `Codec` when the
    /// entry is empty.
    pub fn read_version(&mut self) -> Result<()> {
        let version = self.read_u8()?;
        if version != ENTRY_VERSION {
            return Err(JournalError::unsupported_version(version));
        }
        Ok(())
    }

    /// Read one raw byte.
    ///
    /// # Errors
    ///
    /// `Codec` at end of entry.
    pub fn read_u8(&mut self) -> Result<u8> {
        match self.input.split_first() {
            Some((&byte, rest)) => {
                self.input = rest;
                Ok(byte)
            }
            None => Err(JournalError::codec("truncated entry: expected byte")),
        }
    }

    /// Read an unsigned 32-bit varint.
    ///
    /// # Errors
    ///
    /// `Codec` for truncated or out-of-range input.
    pub fn read_varu32(&mut self) -> Result<u32> {
        varint::read_u32(&mut self.input)
    }

    /// Read an unsigned 64-bit varint.
    ///
    /// # Errors
    ///
    /// `Codec` for truncated input.
    pub fn read_varu64(&mut self) -> Result<u64> {
        varint::read_u64(&mut self.input)
    }

    /// Read a zigzag signed 64-bit varint.
    ///
    /// # Errors
    ///
    /// `Codec` for truncated input.
    pub fn read_vari64(&mut self) -> Result<i64> {
        varint::read_i64(&mut self.input)
    }

    /// Read a length-prefixed byte string, borrowing from the entry.
    ///
    /// # Errors
    ///
    /// `Codec` when fewer bytes remain than the prefix declares.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varu64()? as usize;
        if self.input.len() < len {
            return Err(JournalError::codec(format!(
                "truncated entry: need {} bytes, have {}",
                len,
                self.input.len()
            )));
        }
        let (bytes, rest) = self.input.split_at(len);
        self.input = rest;
        Ok(bytes)
    }

    /// Read a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// `Codec` for truncated input or invalid UTF-8.
    pub fn read_str(&mut self) -> Result<&'a str> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| JournalError::codec("string field is not UTF-8"))
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    /// Assert the whole entry was consumed.
    ///
    /// A fully-applied command must leave nothing behind; trailing bytes
    /// mean the entry and the decoder disagree about the format.
    ///
    /// # Errors
    ///
    /// `Codec` when bytes remain.
    pub fn finish(&self, machine: &'static str) -> Result<()> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(JournalError::codec(format!(
                "{} entry has {} trailing bytes",
                machine,
                self.input.len()
            )))
        }
    }
}

//! Durable stack: a LIFO collection journaled as push/pop commands.
//!
//! ## Journal
//!
//! - `Push` carries the value; `Pop` carries no payload. Replay pops
//!   whatever is on top, which is the same element the original pop
//!   removed because entries replay in append order.
//! - The snapshot writes the element count and then every element
//!   bottom-to-top, so replay re-pushes them in stored order and
//!   recovers the exact layout.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::sync::Arc;

const MACHINE: &str = "stack";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const PUSH: u32 = 2;
const POP: u32 = 3;

struct StackInner<T> {
    items: Vec<T>,
    writer: Option<LogWriter>,
}

/// A durable LIFO stack of `T`.
///
/// Handles are `Arc`-shared; all methods take `&self`.
pub struct DurableStack<T> {
    key: StateKey,
    codec: Arc<dyn FieldCodec<T>>,
    sessions: SessionPool,
    inner: Mutex<StackInner<T>>,
}

impl<T: Send + 'static> DurableStack<T> {
    /// Create an empty stack bound to `key`.
    pub fn new(key: StateKey, codec: Arc<dyn FieldCodec<T>>, sessions: SessionPool) -> Arc<Self> {
        Arc::new(DurableStack {
            key,
            codec,
            sessions,
            inner: Mutex::new(StackInner {
                items: Vec::new(),
                writer: None,
            }),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Number of elements on the stack.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when the stack holds no elements.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Push a value and journal the command.
    pub fn push(&self, value: T) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(PUSH);
            self.codec.write(w, 0, &value)
        })?;
        inner.items.push(value);
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Pop the top value.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the stack is empty; no entry is journaled.
    pub fn pop(&self) -> Result<T> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            return Err(JournalError::invalid_operation("pop on empty stack"));
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(POP);
            Ok(())
        })?;
        let value = inner
            .items
            .pop()
            .ok_or_else(|| JournalError::invalid_operation("pop on empty stack"))?;
        require_writer(&inner.writer)?.append(entry);
        Ok(value)
    }

    /// Pop the top value, or `None` when empty.
    pub fn try_pop(&self) -> Result<Option<T>> {
        if self.inner.lock().items.is_empty() {
            return Ok(None);
        }
        self.pop().map(Some)
    }

    /// The top value without removing it.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the stack is empty.
    pub fn peek(&self) -> Result<T>
    where
        T: Clone,
    {
        self.try_peek()
            .ok_or_else(|| JournalError::invalid_operation("peek on empty stack"))
    }

    /// The top value without removing it, or `None` when empty.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().items.last().cloned()
    }

    /// Snapshot of the elements, top to bottom.
    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        let inner = self.inner.lock();
        inner.items.iter().rev().cloned().collect()
    }

    /// Remove every element and journal the command.
    ///
    /// Clearing an empty stack changes nothing and journals nothing.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR);
            Ok(())
        })?;
        inner.items.clear();
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }
}

impl<T: Send + 'static> StateMachine for DurableStack<T> {
    fn reset(&self, writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.writer = Some(writer);
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        let tag = reader.read_header()?;
        let mut inner = self.inner.lock();
        match tag {
            CLEAR => inner.items.clear(),
            PUSH => {
                let value = self.codec.read(&mut reader, 0)?;
                inner.items.push(value);
            }
            POP => {
                if inner.items.pop().is_none() {
                    return Err(JournalError::codec("pop entry applied to an empty stack"));
                }
            }
            SNAPSHOT => {
                inner.items.clear();
                let count = reader.read_varu64()? as usize;
                inner.items.reserve(count);
                for _ in 0..count {
                    let value = self.codec.read(&mut reader, 0)?;
                    inner.items.push(value);
                }
            }
            other => return Err(JournalError::unsupported_command(MACHINE, other)),
        }
        reader.finish(MACHINE)
    }

    fn append_snapshot(&self, batch: &mut LogBatch) -> Result<()> {
        let inner = self.inner.lock();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(SNAPSHOT);
            w.write_varu64(inner.items.len() as u64);
            for item in &inner.items {
                self.codec.write(w, 0, item)?;
            }
            Ok(())
        })?;
        batch.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statelog_wire::BincodeCodec;

    fn stack() -> (Arc<DurableStack<String>>, LogWriter) {
        let machine = DurableStack::new(
            StateKey::new("stack").unwrap(),
            Arc::new(BincodeCodec::new()),
            SessionPool::new(),
        );
        let writer = LogWriter::new();
        machine.reset(writer.clone());
        (machine, writer)
    }

    fn replay(entries: &[LogEntry]) -> Arc<DurableStack<String>> {
        let (machine, _writer) = stack();
        for entry in entries {
            machine.apply(entry).unwrap();
        }
        machine
    }

    #[test]
    fn test_lifo_order() {
        let (stack, _) = stack();
        stack.push("a".into()).unwrap();
        stack.push("b".into()).unwrap();
        stack.push("c".into()).unwrap();
        assert_eq!(stack.pop().unwrap(), "c");
        assert_eq!(stack.items(), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_pop_empty_fails_without_entry() {
        let (stack, writer) = stack();
        assert!(stack.pop().is_err());
        assert!(stack.try_pop().unwrap().is_none());
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn test_clear_on_empty_is_silent() {
        let (stack, writer) = stack();
        stack.clear().unwrap();
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn test_replay_matches_live_state() {
        let (stack, writer) = stack();
        stack.push("one".into()).unwrap();
        stack.push("two".into()).unwrap();
        stack.pop().unwrap();
        stack.push("three".into()).unwrap();

        let recovered = replay(&writer.drain());
        assert_eq!(recovered.items(), stack.items());
        assert_eq!(recovered.peek().unwrap(), "three");
    }

    #[test]
    fn test_snapshot_rebuilds_exact_layout() {
        let (stack, _) = stack();
        for item in ["bottom", "middle", "top"] {
            stack.push(item.into()).unwrap();
        }

        let mut batch = LogBatch::new();
        stack.append_snapshot(&mut batch).unwrap();
        let recovered = replay(&batch.into_entries());

        assert_eq!(recovered.len(), 3);
        assert_eq!(
            recovered.items(),
            vec!["top".to_string(), "middle".to_string(), "bottom".to_string()]
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let (stack, _) = stack();
        let entry = LogEntry::from_bytes(vec![0, 9]);
        let err = stack.apply(&entry).unwrap_err();
        assert!(matches!(err, JournalError::UnsupportedCommand { tag: 9, .. }));
    }
}

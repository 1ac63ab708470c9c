//! Durable single-object container.
//!
//! Unlike the collections, direct mutation of the held object cannot be
//! tracked, so this structure batches: every host write serializes the
//! full current value. The entry form is just the version byte followed
//! by the value; there is no command tag.

use crate::support::encode_entry;
use parking_lot::Mutex;
use statelog_core::{LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::sync::Arc;

const MACHINE: &str = "object";

struct ObjectInner<T> {
    value: Option<T>,
    record_exists: bool,
}

/// A durable container holding a single `T`.
///
/// `record_exists` turns true after the first successful write or after
/// recovery found a persisted value.
pub struct DurableObject<T> {
    key: StateKey,
    codec: Arc<dyn FieldCodec<T>>,
    sessions: SessionPool,
    inner: Mutex<ObjectInner<T>>,
}

impl<T> DurableObject<T>
where
    T: Default + Clone + Send + 'static,
{
    /// Create an empty container bound to `key`.
    pub fn new(key: StateKey, codec: Arc<dyn FieldCodec<T>>, sessions: SessionPool) -> Arc<Self> {
        Arc::new(DurableObject {
            key,
            codec,
            sessions,
            inner: Mutex::new(ObjectInner {
                value: None,
                record_exists: false,
            }),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// True after the first successful write or a recovery that found a
    /// persisted value.
    pub fn record_exists(&self) -> bool {
        self.inner.lock().record_exists
    }

    /// The current value, lazily constructing a default instance the
    /// first time.
    pub fn value(&self) -> T {
        let mut inner = self.inner.lock();
        inner.value.get_or_insert_with(T::default).clone()
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        self.inner.lock().value = Some(value);
    }

    /// Mutate the value in place; a default instance is materialized
    /// first when none exists. The change persists on the next host
    /// write.
    pub fn with_value_mut<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> R {
        let mut inner = self.inner.lock();
        mutate(inner.value.get_or_insert_with(T::default))
    }

    fn encode_current(&self) -> Result<LogEntry> {
        let value = self.value();
        encode_entry(&self.sessions, |w| {
            w.write_version();
            self.codec.write(w, 0, &value)
        })
    }
}

impl<T> StateMachine for DurableObject<T>
where
    T: Default + Clone + Send + 'static,
{
    fn reset(&self, _writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.value = None;
        inner.record_exists = false;
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        reader.read_version()?;
        let value = self.codec.read(&mut reader, 0)?;
        reader.finish(MACHINE)?;
        let mut inner = self.inner.lock();
        inner.value = Some(value);
        inner.record_exists = true;
        Ok(())
    }

    fn append_entries(&self, batch: &mut LogBatch) -> Result<()> {
        batch.push(self.encode_current()?);
        Ok(())
    }

    fn append_snapshot(&self, batch: &mut LogBatch) -> Result<()> {
        batch.push(self.encode_current()?);
        Ok(())
    }

    fn on_write_completed(&self) {
        self.inner.lock().record_exists = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statelog_wire::BincodeCodec;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Settings {
        name: String,
        retries: u32,
    }

    fn object() -> Arc<DurableObject<Settings>> {
        DurableObject::new(
            StateKey::new("settings").unwrap(),
            Arc::new(BincodeCodec::new()),
            SessionPool::new(),
        )
    }

    #[test]
    fn test_getter_materializes_default() {
        let object = object();
        object.reset(LogWriter::new());
        assert_eq!(object.value(), Settings::default());
        assert!(!object.record_exists());
    }

    #[test]
    fn test_direct_mutation_is_serialized() {
        let object = object();
        object.reset(LogWriter::new());
        object.with_value_mut(|settings| {
            settings.name = "edge".into();
            settings.retries = 3;
        });

        let mut batch = LogBatch::new();
        object.append_entries(&mut batch).unwrap();
        let entries = batch.into_entries();
        assert_eq!(entries.len(), 1);

        let recovered = self::object();
        recovered.reset(LogWriter::new());
        recovered.apply(&entries[0]).unwrap();
        assert_eq!(recovered.value().name, "edge");
        assert_eq!(recovered.value().retries, 3);
        assert!(recovered.record_exists());
    }

    #[test]
    fn test_write_completed_latches_existence() {
        let object = object();
        object.reset(LogWriter::new());
        assert!(!object.record_exists());
        object.on_write_completed();
        assert!(object.record_exists());
    }

    #[test]
    fn test_reset_clears_state() {
        let object = object();
        object.reset(LogWriter::new());
        object.set(Settings {
            name: "x".into(),
            retries: 1,
        });
        object.on_write_completed();
        object.reset(LogWriter::new());
        assert!(!object.record_exists());
        assert_eq!(object.value(), Settings::default());
    }
}

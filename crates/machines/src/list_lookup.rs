//! Durable list lookup: a key to an ordered list of values, duplicates
//! allowed.
//!
//! Removing a value removes its first occurrence; a key whose list
//! becomes empty is removed entirely, so an existing key always has at
//! least one value.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

const MACHINE: &str = "list-lookup";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const ADD: u32 = 2;
const REMOVE_KEY: u32 = 3;
const REMOVE_ITEM: u32 = 4;

struct LookupInner<K, V> {
    map: HashMap<K, Vec<V>>,
    writer: Option<LogWriter>,
}

/// A durable mapping from `K` to an ordered list of `V` with duplicates.
pub struct DurableListLookup<K, V> {
    key: StateKey,
    key_codec: Arc<dyn FieldCodec<K>>,
    value_codec: Arc<dyn FieldCodec<V>>,
    sessions: SessionPool,
    inner: Mutex<LookupInner<K, V>>,
}

impl<K, V> DurableListLookup<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: PartialEq + Clone + Send + 'static,
{
    /// Create an empty lookup bound to `key`.
    pub fn new(
        key: StateKey,
        key_codec: Arc<dyn FieldCodec<K>>,
        value_codec: Arc<dyn FieldCodec<V>>,
        sessions: SessionPool,
    ) -> Arc<Self> {
        Arc::new(DurableListLookup {
            key,
            key_codec,
            value_codec,
            sessions,
            inner: Mutex::new(LookupInner {
                map: HashMap::new(),
                writer: None,
            }),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Number of keys with at least one value.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True when no key has a value.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// True when `key` has at least one value.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    /// Append a value to the key's list and journal the command.
    pub fn add(&self, key: K, value: V) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ADD);
            self.key_codec.write(w, 0, &key)?;
            self.value_codec.write(w, 1, &value)
        })?;
        inner.map.entry(key).or_default().push(value);
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Append every value in order; equivalent to repeated [`Self::add`]
    /// and journaled per item.
    pub fn add_range(&self, key: K, values: impl IntoIterator<Item = V>) -> Result<()> {
        for value in values {
            self.add(key.clone(), value)?;
        }
        Ok(())
    }

    /// Remove a key and all its values; returns false (and journals
    /// nothing) when the key is absent.
    pub fn remove_key(&self, key: &K) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.map.contains_key(key) {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(REMOVE_KEY);
            self.key_codec.write(w, 0, key)
        })?;
        inner.map.remove(key);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Remove the first occurrence of `value` under `key`; removes the
    /// key entirely when its list becomes empty. Returns false (and
    /// journals nothing) when no occurrence exists.
    pub fn remove_item(&self, key: &K, value: &V) -> Result<bool> {
        let mut inner = self.inner.lock();
        let has_occurrence = inner
            .map
            .get(key)
            .map_or(false, |values| values.contains(value));
        if !has_occurrence {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(REMOVE_ITEM);
            self.key_codec.write(w, 0, key)?;
            self.value_codec.write(w, 1, value)
        })?;
        remove_first_occurrence(&mut inner.map, key, value);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// The key's values in insertion order; empty when the key is absent.
    pub fn get(&self, key: &K) -> Vec<V> {
        self.inner.lock().map.get(key).cloned().unwrap_or_default()
    }

    /// Every key, in arbitrary order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().map.keys().cloned().collect()
    }

    /// Every `(key, values)` pair, in arbitrary key order.
    pub fn entries(&self) -> Vec<(K, Vec<V>)> {
        self.inner
            .lock()
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Remove every mapping and journal the command.
    ///
    /// Clearing an empty lookup changes nothing and journals nothing.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.map.is_empty() {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR);
            Ok(())
        })?;
        inner.map.clear();
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }
}

fn remove_first_occurrence<K, V>(map: &mut HashMap<K, Vec<V>>, key: &K, value: &V)
where
    K: Eq + Hash,
    V: PartialEq,
{
    if let Some(values) = map.get_mut(key) {
        if let Some(index) = values.iter().position(|v| v == value) {
            values.remove(index);
        }
        if values.is_empty() {
            map.remove(key);
        }
    }
}

impl<K, V> StateMachine for DurableListLookup<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: PartialEq + Clone + Send + 'static,
{
    fn reset(&self, writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.writer = Some(writer);
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        let tag = reader.read_header()?;
        let mut inner = self.inner.lock();
        match tag {
            CLEAR => inner.map.clear(),
            ADD => {
                let key = self.key_codec.read(&mut reader, 0)?;
                let value = self.value_codec.read(&mut reader, 1)?;
                inner.map.entry(key).or_default().push(value);
            }
            REMOVE_KEY => {
                let key = self.key_codec.read(&mut reader, 0)?;
                inner.map.remove(&key);
            }
            REMOVE_ITEM => {
                let key = self.key_codec.read(&mut reader, 0)?;
                let value = self.value_codec.read(&mut reader, 1)?;
                remove_first_occurrence(&mut inner.map, &key, &value);
            }
            SNAPSHOT => {
                inner.map.clear();
                let key_count = reader.read_varu64()? as usize;
                for _ in 0..key_count {
                    let key = self.key_codec.read(&mut reader, 0)?;
                    let value_count = reader.read_varu64()? as usize;
                    let mut values = Vec::with_capacity(value_count);
                    for _ in 0..value_count {
                        values.push(self.value_codec.read(&mut reader, 1)?);
                    }
                    inner.map.insert(key, values);
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
            w.write_varu64(inner.map.len() as u64);
            for (key, values) in &inner.map {
                self.key_codec.write(w, 0, key)?;
                w.write_varu64(values.len() as u64);
                for value in values {
                    self.value_codec.write(w, 1, value)?;
                }
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

    fn lookup() -> (Arc<DurableListLookup<String, String>>, LogWriter) {
        let machine = DurableListLookup::new(
            StateKey::new("lists").unwrap(),
            Arc::new(BincodeCodec::new()),
            Arc::new(BincodeCodec::new()),
            SessionPool::new(),
        );
        let writer = LogWriter::new();
        machine.reset(writer.clone());
        (machine, writer)
    }

    #[test]
    fn test_duplicates_and_first_occurrence_removal() {
        let (lookup, _) = lookup();
        lookup.add("k".into(), "a".into()).unwrap();
        lookup.add("k".into(), "b".into()).unwrap();
        lookup.add("k".into(), "a".into()).unwrap();
        assert!(lookup.remove_item(&"k".to_string(), &"a".to_string()).unwrap());
        assert_eq!(lookup.get(&"k".to_string()), vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_key_vanishes_when_last_value_removed() {
        let (lookup, _) = lookup();
        lookup.add("k".into(), "only".into()).unwrap();
        assert!(lookup.remove_item(&"k".to_string(), &"only".to_string()).unwrap());
        assert!(!lookup.contains_key(&"k".to_string()));
        assert_eq!(lookup.len(), 0);
    }

    #[test]
    fn test_missing_removals_are_silent() {
        let (lookup, writer) = lookup();
        assert!(!lookup.remove_key(&"ghost".to_string()).unwrap());
        assert!(!lookup
            .remove_item(&"ghost".to_string(), &"v".to_string())
            .unwrap());
        assert_eq!(writer.pending_len(), 0);
    }

    #[test]
    fn test_add_range_journals_per_item() {
        let (lookup, writer) = lookup();
        lookup
            .add_range("k".into(), ["x".to_string(), "y".to_string()])
            .unwrap();
        assert_eq!(writer.pending_len(), 2);
        assert_eq!(lookup.get(&"k".to_string()), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_replay_and_snapshot_fidelity() {
        let (lookup, writer) = lookup();
        lookup.add("a".into(), "1".into()).unwrap();
        lookup.add("a".into(), "2".into()).unwrap();
        lookup.add("b".into(), "3".into()).unwrap();
        lookup.remove_key(&"b".to_string()).unwrap();

        let (replayed, _) = self::lookup();
        for entry in writer.drain() {
            replayed.apply(&entry).unwrap();
        }
        assert_eq!(replayed.get(&"a".to_string()), lookup.get(&"a".to_string()));
        assert_eq!(replayed.len(), 1);

        let mut batch = LogBatch::new();
        lookup.append_snapshot(&mut batch).unwrap();
        let (snapshotted, _) = self::lookup();
        for entry in batch.into_entries() {
            snapshotted.apply(&entry).unwrap();
        }
        assert_eq!(snapshotted.get(&"a".to_string()), lookup.get(&"a".to_string()));
    }
}

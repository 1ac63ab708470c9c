//! Durable set lookup: a key to a unique set of values, insertion order
//! not preserved.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

const MACHINE: &str = "set-lookup";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const ADD: u32 = 2;
const REMOVE_KEY: u32 = 3;
const REMOVE_ITEM: u32 = 4;

struct LookupInner<K, V> {
    map: HashMap<K, HashSet<V>>,
    writer: Option<LogWriter>,
}

/// A durable mapping from `K` to a unique set of `V`.
pub struct DurableSetLookup<K, V> {
    key: StateKey,
    key_codec: Arc<dyn FieldCodec<K>>,
    value_codec: Arc<dyn FieldCodec<V>>,
    sessions: SessionPool,
    inner: Mutex<LookupInner<K, V>>,
}

impl<K, V> DurableSetLookup<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty lookup bound to `key`.
    pub fn new(
        key: StateKey,
        key_codec: Arc<dyn FieldCodec<K>>,
        value_codec: Arc<dyn FieldCodec<V>>,
        sessions: SessionPool,
    ) -> Arc<Self> {
        Arc::new(DurableSetLookup {
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

    /// True when `value` is present under `key`.
    pub fn contains(&self, key: &K, value: &V) -> bool {
        self.inner
            .lock()
            .map
            .get(key)
            .map_or(false, |set| set.contains(value))
    }

    /// Add a value under a key; returns false (and journals nothing)
    /// when the value is already present.
    pub fn add(&self, key: K, value: V) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner
            .map
            .get(&key)
            .map_or(false, |set| set.contains(&value))
        {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ADD);
            self.key_codec.write(w, 0, &key)?;
            self.value_codec.write(w, 1, &value)
        })?;
        inner.map.entry(key).or_default().insert(value);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
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

    /// Remove `value` from under `key`; removes the key entirely when
    /// its set becomes empty. Returns false (and journals nothing) when
    /// the value is absent.
    pub fn remove_item(&self, key: &K, value: &V) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner
            .map
            .get(key)
            .map_or(false, |set| set.contains(value))
        {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(REMOVE_ITEM);
            self.key_codec.write(w, 0, key)?;
            self.value_codec.write(w, 1, value)
        })?;
        remove_item(&mut inner.map, key, value);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// The key's values in arbitrary order; empty when the key is
    /// absent.
    pub fn get(&self, key: &K) -> Vec<V> {
        self.inner
            .lock()
            .map
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every key, in arbitrary order.
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().map.keys().cloned().collect()
    }

    /// Every `(key, values)` pair, in arbitrary order.
    pub fn entries(&self) -> Vec<(K, Vec<V>)> {
        self.inner
            .lock()
            .map
            .iter()
            .map(|(k, set)| (k.clone(), set.iter().cloned().collect()))
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

fn remove_item<K, V>(map: &mut HashMap<K, HashSet<V>>, key: &K, value: &V)
where
    K: Eq + Hash,
    V: Eq + Hash,
{
    if let Some(set) = map.get_mut(key) {
        set.remove(value);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

impl<K, V> StateMachine for DurableSetLookup<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Eq + Hash + Clone + Send + 'static,
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
                inner.map.entry(key).or_default().insert(value);
            }
            REMOVE_KEY => {
                let key = self.key_codec.read(&mut reader, 0)?;
                inner.map.remove(&key);
            }
            REMOVE_ITEM => {
                let key = self.key_codec.read(&mut reader, 0)?;
                let value = self.value_codec.read(&mut reader, 1)?;
                remove_item(&mut inner.map, &key, &value);
            }
            SNAPSHOT => {
                inner.map.clear();
                let key_count = reader.read_varu64()? as usize;
                for _ in 0..key_count {
                    let key = self.key_codec.read(&mut reader, 0)?;
                    let value_count = reader.read_varu64()? as usize;
                    let mut set = HashSet::with_capacity(value_count);
                    for _ in 0..value_count {
                        set.insert(self.value_codec.read(&mut reader, 1)?);
                    }
                    inner.map.insert(key, set);
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
            for (key, set) in &inner.map {
                self.key_codec.write(w, 0, key)?;
                w.write_varu64(set.len() as u64);
                for value in set {
                    self.value_codec.write(w, 1, value)?;
                }
            }
            Ok(())
        })?;
        batch.push(entry);
        Ok(())
    }
}

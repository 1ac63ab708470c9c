//! Durable rooted tree: unique node values, one parent per non-root
//! node, no cycles.
//!
//! ## Invariants
//!
//! - Children are kept in insertion order per node.
//! - `move` guards acyclicity with a BFS ancestor test before mutating.
//! - `remove` cascades to every descendant but journals one command;
//!   replay re-runs the cascade.
//!
//! ## Snapshot
//!
//! Node count, then the root value, then `(child, parent)` pairs in BFS
//! order from the root. BFS guarantees each parent appears before any of
//! its children, so replay can rebuild with plain adds.
//!
//! BFS traversals reuse a pooled scratch queue instead of allocating one
//! per call.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

const MACHINE: &str = "tree";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const ADD: u32 = 2;
const REMOVE: u32 = 3;
const MOVE: u32 = 4;
const SET_ROOT: u32 = 5;

struct TreeInner<T> {
    root: Option<T>,
    parents: HashMap<T, T>,
    children: HashMap<T, Vec<T>>,
    scratch: VecDeque<T>,
    writer: Option<LogWriter>,
}

impl<T: Eq + Hash + Clone> TreeInner<T> {
    fn contains(&self, value: &T) -> bool {
        self.root.as_ref() == Some(value) || self.parents.contains_key(value)
    }

    fn len(&self) -> usize {
        usize::from(self.root.is_some()) + self.parents.len()
    }

    fn clear(&mut self) {
        self.root = None;
        self.parents.clear();
        self.children.clear();
    }

    fn apply_add(&mut self, child: T, parent: T) {
        self.children
            .entry(parent.clone())
            .or_default()
            .push(child.clone());
        self.parents.insert(child, parent);
    }

    fn apply_move(&mut self, value: &T, new_parent: T) {
        if let Some(old_parent) = self.parents.get(value).cloned() {
            if let Some(siblings) = self.children.get_mut(&old_parent) {
                siblings.retain(|sibling| sibling != value);
            }
        }
        self.children
            .entry(new_parent.clone())
            .or_default()
            .push(value.clone());
        self.parents.insert(value.clone(), new_parent);
    }

    /// Remove `value` and every descendant.
    fn apply_remove(&mut self, value: &T) {
        let mut doomed = vec![value.clone()];
        let mut queue = std::mem::take(&mut self.scratch);
        queue.push_back(value.clone());
        while let Some(node) = queue.pop_front() {
            if let Some(children) = self.children.get(&node) {
                for child in children {
                    doomed.push(child.clone());
                    queue.push_back(child.clone());
                }
            }
        }
        queue.clear();
        self.scratch = queue;

        if let Some(parent) = self.parents.get(value).cloned() {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|sibling| sibling != value);
            }
        }
        for node in &doomed {
            self.parents.remove(node);
            self.children.remove(node);
        }
        if self.root.as_ref() == Some(value) {
            self.root = None;
        }
    }

    /// Collect the descendants of `value` in BFS order, excluding
    /// `value` itself.
    fn descendants(&mut self, value: &T) -> Vec<T> {
        let mut found = Vec::new();
        let mut queue = std::mem::take(&mut self.scratch);
        queue.push_back(value.clone());
        while let Some(node) = queue.pop_front() {
            if let Some(children) = self.children.get(&node) {
                for child in children {
                    found.push(child.clone());
                    queue.push_back(child.clone());
                }
            }
        }
        queue.clear();
        self.scratch = queue;
        found
    }

    /// BFS ancestor test: is `candidate` below `value`?
    fn is_descendant_of(&mut self, candidate: &T, value: &T) -> bool {
        let mut hit = false;
        let mut queue = std::mem::take(&mut self.scratch);
        queue.push_back(value.clone());
        while let Some(node) = queue.pop_front() {
            if let Some(children) = self.children.get(&node) {
                for child in children {
                    if child == candidate {
                        hit = true;
                        queue.clear();
                        break;
                    }
                    queue.push_back(child.clone());
                }
            }
            if hit {
                break;
            }
        }
        queue.clear();
        self.scratch = queue;
        hit
    }
}

/// A durable rooted tree of unique `T` values.
pub struct DurableTree<T> {
    key: StateKey,
    codec: Arc<dyn FieldCodec<T>>,
    sessions: SessionPool,
    inner: Mutex<TreeInner<T>>,
}

impl<T> DurableTree<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    /// Create an empty tree bound to `key`.
    pub fn new(key: StateKey, codec: Arc<dyn FieldCodec<T>>, sessions: SessionPool) -> Arc<Self> {
        Arc::new(DurableTree {
            key,
            codec,
            sessions,
            inner: Mutex::new(TreeInner {
                root: None,
                parents: HashMap::new(),
                children: HashMap::new(),
                scratch: VecDeque::new(),
                writer: None,
            }),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Number of nodes, the root included.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().len() == 0
    }

    /// Membership test.
    pub fn contains(&self, value: &T) -> bool {
        self.inner.lock().contains(value)
    }

    /// The root value.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the tree is empty.
    pub fn root(&self) -> Result<T> {
        self.try_root()
            .ok_or_else(|| JournalError::invalid_operation("root of an empty tree"))
    }

    /// The root value, or `None` when the tree is empty.
    pub fn try_root(&self) -> Option<T> {
        self.inner.lock().root.clone()
    }

    /// Set the root of an empty tree and journal the command.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the tree already has nodes.
    pub fn set_root(&self, value: T) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.len() != 0 {
            return Err(JournalError::invalid_operation(
                "set_root on a non-empty tree",
            ));
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(SET_ROOT);
            self.codec.write(w, 0, &value)
        })?;
        inner.root = Some(value);
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Add a value under an existing parent and journal the command.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the parent is missing or the value is
    /// already present.
    pub fn add(&self, parent: &T, value: T) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.contains(parent) {
            return Err(JournalError::invalid_argument("parent is not in the tree"));
        }
        if inner.contains(&value) {
            return Err(JournalError::invalid_argument(
                "value is already in the tree",
            ));
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ADD);
            self.codec.write(w, 0, &value)?;
            self.codec.write(w, 1, parent)
        })?;
        inner.apply_add(value, parent.clone());
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Re-parent `value` under `new_parent` and journal the command.
    ///
    /// Returns false (and journals nothing) when either node is missing,
    /// when `value == new_parent`, or when nothing would change.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when `new_parent` is a descendant of `value`
    /// (the move would create a cycle) or when `value` is the root of a
    /// tree with more than one node.
    pub fn move_node(&self, value: &T, new_parent: &T) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.contains(value) || !inner.contains(new_parent) || value == new_parent {
            return Ok(false);
        }
        if inner.root.as_ref() == Some(value) {
            return Err(JournalError::invalid_operation(
                "cannot move the root of a tree with other nodes",
            ));
        }
        if inner.parents.get(value) == Some(new_parent) {
            return Ok(false);
        }
        if inner.is_descendant_of(new_parent, value) {
            return Err(JournalError::invalid_operation(
                "move would create a cycle",
            ));
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(MOVE);
            self.codec.write(w, 0, value)?;
            self.codec.write(w, 1, new_parent)
        })?;
        inner.apply_move(value, new_parent.clone());
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Remove `value` and every descendant, journaling one command.
    ///
    /// Returns false (and journals nothing) when the value is absent.
    pub fn remove(&self, value: &T) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.contains(value) {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(REMOVE);
            self.codec.write(w, 0, value)
        })?;
        inner.apply_remove(value);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// The parent of `value`, or `None` for the root or a missing value.
    pub fn try_get_parent(&self, value: &T) -> Option<T> {
        self.inner.lock().parents.get(value).cloned()
    }

    /// The children of `value` in insertion order; empty for a leaf or a
    /// missing value.
    pub fn get_children(&self, value: &T) -> Vec<T> {
        self.inner
            .lock()
            .children
            .get(value)
            .cloned()
            .unwrap_or_default()
    }

    /// Every descendant of `value` in BFS order, excluding `value`.
    pub fn get_descendants(&self, value: &T) -> Vec<T> {
        self.inner.lock().descendants(value)
    }

    /// Every node in BFS order from the root.
    pub fn nodes(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        let Some(root) = inner.root.clone() else {
            return Vec::new();
        };
        let mut all = vec![root.clone()];
        all.extend(inner.descendants(&root));
        all
    }

    /// Remove every node and journal the command.
    ///
    /// Clearing an empty tree changes nothing and journals nothing.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.len() == 0 {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR);
            Ok(())
        })?;
        inner.clear();
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }
}

impl<T> StateMachine for DurableTree<T>
where
    T: Eq + Hash + Clone + Send + 'static,
{
    fn reset(&self, writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.clear();
        inner.writer = Some(writer);
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        let tag = reader.read_header()?;
        let mut inner = self.inner.lock();
        match tag {
            CLEAR => inner.clear(),
            SET_ROOT => {
                let value = self.codec.read(&mut reader, 0)?;
                inner.root = Some(value);
            }
            ADD => {
                let child = self.codec.read(&mut reader, 0)?;
                let parent = self.codec.read(&mut reader, 1)?;
                inner.apply_add(child, parent);
            }
            MOVE => {
                let value = self.codec.read(&mut reader, 0)?;
                let new_parent = self.codec.read(&mut reader, 1)?;
                inner.apply_move(&value, new_parent);
            }
            REMOVE => {
                let value = self.codec.read(&mut reader, 0)?;
                inner.apply_remove(&value);
            }
            SNAPSHOT => {
                inner.clear();
                let count = reader.read_varu64()? as usize;
                if count > 0 {
                    let root = self.codec.read(&mut reader, 0)?;
                    inner.root = Some(root);
                    // Parents always precede their children in the
                    // snapshot, so plain adds rebuild the tree.
                    for _ in 1..count {
                        let child = self.codec.read(&mut reader, 0)?;
                        let parent = self.codec.read(&mut reader, 1)?;
                        inner.apply_add(child, parent);
                    }
                }
            }
            other => return Err(JournalError::unsupported_command(MACHINE, other)),
        }
        reader.finish(MACHINE)
    }

    fn append_snapshot(&self, batch: &mut LogBatch) -> Result<()> {
        let mut inner = self.inner.lock();
        let count = inner.len();
        let root = inner.root.clone();
        let ordered = match &root {
            Some(root) => inner.descendants(root),
            None => Vec::new(),
        };
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(SNAPSHOT);
            w.write_varu64(count as u64);
            if let Some(root) = &root {
                self.codec.write(w, 0, root)?;
                for child in &ordered {
                    self.codec.write(w, 0, child)?;
                    let parent = inner
                        .parents
                        .get(child)
                        .ok_or_else(|| JournalError::codec("node without a recorded parent"))?;
                    self.codec.write(w, 1, parent)?;
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

    fn tree() -> (Arc<DurableTree<String>>, LogWriter) {
        let machine = DurableTree::new(
            StateKey::new("tree").unwrap(),
            Arc::new(BincodeCodec::new()),
            SessionPool::new(),
        );
        let writer = LogWriter::new();
        machine.reset(writer.clone());
        (machine, writer)
    }

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn test_set_root_preconditions() {
        let (tree, writer) = tree();
        tree.set_root(s("A")).unwrap();
        let err = tree.set_root(s("B")).unwrap_err();
        assert!(matches!(err, JournalError::InvalidOperation { .. }));
        assert_eq!(writer.pending_len(), 1);
    }

    #[test]
    fn test_add_preconditions() {
        let (tree, writer) = tree();
        tree.set_root(s("A")).unwrap();
        tree.add(&s("A"), s("B")).unwrap();

        assert!(tree.add(&s("ghost"), s("C")).is_err());
        assert!(tree.add(&s("A"), s("B")).is_err());
        assert_eq!(writer.pending_len(), 2);
    }

    #[test]
    fn test_cascading_removal() {
        let (tree, _) = tree();
        tree.set_root(s("A")).unwrap();
        tree.add(&s("A"), s("B")).unwrap();
        tree.add(&s("A"), s("C")).unwrap();
        tree.add(&s("B"), s("D")).unwrap();
        tree.add(&s("B"), s("E")).unwrap();

        assert!(tree.remove(&s("B")).unwrap());
        assert_eq!(tree.nodes(), vec![s("A"), s("C")]);
        assert!(!tree.contains(&s("D")));
        assert!(!tree.contains(&s("E")));
    }

    #[test]
    fn test_cycle_prevention() {
        let (tree, _) = tree();
        tree.set_root(s("A")).unwrap();
        tree.add(&s("A"), s("B")).unwrap();
        tree.add(&s("B"), s("C")).unwrap();
        tree.add(&s("C"), s("D")).unwrap();

        let err = tree.move_node(&s("A"), &s("D")).unwrap_err();
        assert!(matches!(err, JournalError::InvalidOperation { .. }));
    }

    #[test]
    fn test_move_false_versus_error_asymmetry() {
        let (tree, writer) = tree();
        tree.set_root(s("A")).unwrap();
        tree.add(&s("A"), s("B")).unwrap();
        tree.add(&s("A"), s("C")).unwrap();
        let baseline = writer.pending_len();

        // No-ops return false without journaling.
        assert!(!tree.move_node(&s("ghost"), &s("A")).unwrap());
        assert!(!tree.move_node(&s("B"), &s("ghost")).unwrap());
        assert!(!tree.move_node(&s("B"), &s("B")).unwrap());
        assert!(!tree.move_node(&s("B"), &s("A")).unwrap());
        assert_eq!(writer.pending_len(), baseline);

        // Moving the root of a populated tree is an error.
        assert!(tree.move_node(&s("A"), &s("B")).is_err());

        // A real move journals and re-parents.
        assert!(tree.move_node(&s("B"), &s("C")).unwrap());
        assert_eq!(tree.try_get_parent(&s("B")), Some(s("C")));
        assert_eq!(writer.pending_len(), baseline + 1);
    }

    #[test]
    fn test_children_keep_insertion_order() {
        let (tree, _) = tree();
        tree.set_root(s("A")).unwrap();
        for child in ["B", "C", "D"] {
            tree.add(&s("A"), s(child)).unwrap();
        }
        assert_eq!(tree.get_children(&s("A")), vec![s("B"), s("C"), s("D")]);
        assert_eq!(tree.get_descendants(&s("A")), vec![s("B"), s("C"), s("D")]);
    }

    #[test]
    fn test_replay_fidelity() {
        let (tree, writer) = tree();
        tree.set_root(s("A")).unwrap();
        tree.add(&s("A"), s("B")).unwrap();
        tree.add(&s("B"), s("C")).unwrap();
        tree.add(&s("A"), s("D")).unwrap();
        tree.move_node(&s("C"), &s("D")).unwrap();
        tree.remove(&s("B")).unwrap();

        let (recovered, _) = self::tree();
        for entry in writer.drain() {
            recovered.apply(&entry).unwrap();
        }
        assert_eq!(recovered.nodes(), tree.nodes());
        assert_eq!(recovered.try_get_parent(&s("C")), Some(s("D")));
        assert!(!recovered.contains(&s("B")));
    }

    #[test]
    fn test_snapshot_parents_precede_children() {
        let (tree, _) = tree();
        tree.set_root(s("N0")).unwrap();
        // Ternary tree: node i hangs under node (i - 1) / 3.
        for i in 1..40usize {
            let parent = format!("N{}", (i - 1) / 3);
            tree.add(&parent, format!("N{i}")).unwrap();
        }

        let mut batch = LogBatch::new();
        tree.append_snapshot(&mut batch).unwrap();
        let (recovered, _) = self::tree();
        for entry in batch.into_entries() {
            recovered.apply(&entry).unwrap();
        }
        assert_eq!(recovered.len(), 40);
        for i in 1..40usize {
            let parent = format!("N{}", (i - 1) / 3);
            assert_eq!(recovered.try_get_parent(&format!("N{i}")), Some(parent));
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let (tree, _) = tree();
        let mut batch = LogBatch::new();
        tree.append_snapshot(&mut batch).unwrap();
        let (recovered, _) = self::tree();
        for entry in batch.into_entries() {
            recovered.apply(&entry).unwrap();
        }
        assert!(recovered.is_empty());
    }
}

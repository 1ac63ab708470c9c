//! Durable directed graph: at most one edge per `(src, dst)`, cycles
//! and self-loops allowed.
//!
//! ## Representation
//!
//! The edge datum lives exactly once, in the source node's outgoing map;
//! the destination node carries only the source key in an incoming set.
//! That keeps node deletion O(degree) and avoids owning cycles between
//! node records.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

const MACHINE: &str = "graph";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const ADD_NODE: u32 = 2;
const REMOVE_NODE: u32 = 3;
const ADD_EDGE: u32 = 4;
const UPSERT_EDGE: u32 = 5;
const REMOVE_EDGE: u32 = 6;

struct NodeState<N, E> {
    outgoing: HashMap<N, E>,
    incoming: HashSet<N>,
}

impl<N: Eq + Hash, E> NodeState<N, E> {
    fn new() -> Self {
        NodeState {
            outgoing: HashMap::new(),
            incoming: HashSet::new(),
        }
    }
}

struct GraphInner<N, E> {
    nodes: HashMap<N, NodeState<N, E>>,
    writer: Option<LogWriter>,
}

impl<N: Eq + Hash + Clone, E> GraphInner<N, E> {
    fn apply_remove_node(&mut self, value: &N) {
        let Some(state) = self.nodes.remove(value) else {
            return;
        };
        for dst in state.outgoing.keys() {
            if let Some(other) = self.nodes.get_mut(dst) {
                other.incoming.remove(value);
            }
        }
        for src in &state.incoming {
            if let Some(other) = self.nodes.get_mut(src) {
                other.outgoing.remove(value);
            }
        }
    }

    fn apply_put_edge(&mut self, src: &N, dst: &N, edge: E) {
        if let Some(state) = self.nodes.get_mut(src) {
            state.outgoing.insert(dst.clone(), edge);
        }
        if let Some(state) = self.nodes.get_mut(dst) {
            state.incoming.insert(src.clone());
        }
    }

    fn apply_remove_edge(&mut self, src: &N, dst: &N) {
        if let Some(state) = self.nodes.get_mut(src) {
            state.outgoing.remove(dst);
        }
        if let Some(state) = self.nodes.get_mut(dst) {
            state.incoming.remove(src);
        }
    }
}

/// A durable directed graph with node values `N` and edge data `E`.
pub struct DurableGraph<N, E> {
    key: StateKey,
    node_codec: Arc<dyn FieldCodec<N>>,
    edge_codec: Arc<dyn FieldCodec<E>>,
    sessions: SessionPool,
    inner: Mutex<GraphInner<N, E>>,
}

impl<N, E> DurableGraph<N, E>
where
    N: Eq + Hash + Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create an empty graph bound to `key`.
    pub fn new(
        key: StateKey,
        node_codec: Arc<dyn FieldCodec<N>>,
        edge_codec: Arc<dyn FieldCodec<E>>,
        sessions: SessionPool,
    ) -> Arc<Self> {
        Arc::new(DurableGraph {
            key,
            node_codec,
            edge_codec,
            sessions,
            inner: Mutex::new(GraphInner {
                nodes: HashMap::new(),
                writer: None,
            }),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    /// True when the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }

    /// Node membership test.
    pub fn contains_node(&self, value: &N) -> bool {
        self.inner.lock().nodes.contains_key(value)
    }

    /// Add a node; returns false (and journals nothing) when already
    /// present.
    pub fn add_node(&self, value: N) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.nodes.contains_key(&value) {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ADD_NODE);
            self.node_codec.write(w, 0, &value)
        })?;
        inner.nodes.insert(value, NodeState::new());
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Remove a node and every incident edge; returns false (and
    /// journals nothing) when absent.
    pub fn remove_node(&self, value: &N) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.nodes.contains_key(value) {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(REMOVE_NODE);
            self.node_codec.write(w, 0, value)
        })?;
        inner.apply_remove_node(value);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Add an edge; returns false (and journals nothing) when the edge
    /// already exists.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when either endpoint is missing.
    pub fn add_edge(&self, src: &N, dst: &N, edge: E) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::require_endpoints(&inner, src, dst)?;
        if inner
            .nodes
            .get(src)
            .map_or(false, |state| state.outgoing.contains_key(dst))
        {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ADD_EDGE);
            self.node_codec.write(w, 0, src)?;
            self.node_codec.write(w, 1, dst)?;
            self.edge_codec.write(w, 2, &edge)
        })?;
        inner.apply_put_edge(src, dst, edge);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// Create or replace an edge and journal the command.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when either endpoint is missing.
    pub fn upsert_edge(&self, src: &N, dst: &N, edge: E) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::require_endpoints(&inner, src, dst)?;
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(UPSERT_EDGE);
            self.node_codec.write(w, 0, src)?;
            self.node_codec.write(w, 1, dst)?;
            self.edge_codec.write(w, 2, &edge)
        })?;
        inner.apply_put_edge(src, dst, edge);
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Remove an edge; returns false (and journals nothing) when absent.
    pub fn remove_edge(&self, src: &N, dst: &N) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner
            .nodes
            .get(src)
            .map_or(false, |state| state.outgoing.contains_key(dst))
        {
            return Ok(false);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(REMOVE_EDGE);
            self.node_codec.write(w, 0, src)?;
            self.node_codec.write(w, 1, dst)
        })?;
        inner.apply_remove_edge(src, dst);
        require_writer(&inner.writer)?.append(entry);
        Ok(true)
    }

    /// The edge datum from `src` to `dst`, if present.
    pub fn try_get_edge(&self, src: &N, dst: &N) -> Option<E> {
        self.inner
            .lock()
            .nodes
            .get(src)
            .and_then(|state| state.outgoing.get(dst).cloned())
    }

    /// Union of outgoing targets and incoming sources, de-duplicated;
    /// empty when the node is missing.
    pub fn get_neighbors(&self, value: &N) -> Vec<N> {
        let inner = self.inner.lock();
        let Some(state) = inner.nodes.get(value) else {
            return Vec::new();
        };
        let mut seen: HashSet<&N> = HashSet::new();
        let mut neighbors = Vec::new();
        for dst in state.outgoing.keys() {
            if seen.insert(dst) {
                neighbors.push(dst.clone());
            }
        }
        for src in &state.incoming {
            if seen.insert(src) {
                neighbors.push(src.clone());
            }
        }
        neighbors
    }

    /// The node's outgoing edges as `(dst, edge)` pairs; empty when the
    /// node is missing.
    pub fn get_outgoing(&self, value: &N) -> Vec<(N, E)> {
        self.inner
            .lock()
            .nodes
            .get(value)
            .map(|state| {
                state
                    .outgoing
                    .iter()
                    .map(|(dst, edge)| (dst.clone(), edge.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The node's incoming edges as `(src, edge)` pairs, reconstructed
    /// by following each incoming source back to its outgoing entry.
    pub fn get_incoming(&self, value: &N) -> Vec<(N, E)> {
        let inner = self.inner.lock();
        let Some(state) = inner.nodes.get(value) else {
            return Vec::new();
        };
        state
            .incoming
            .iter()
            .filter_map(|src| {
                inner
                    .nodes
                    .get(src)
                    .and_then(|source| source.outgoing.get(value))
                    .map(|edge| (src.clone(), edge.clone()))
            })
            .collect()
    }

    /// Every `(node, outgoing)` pair, in arbitrary node order.
    pub fn entries(&self) -> Vec<(N, Vec<(N, E)>)> {
        self.inner
            .lock()
            .nodes
            .iter()
            .map(|(node, state)| {
                let outgoing = state
                    .outgoing
                    .iter()
                    .map(|(dst, edge)| (dst.clone(), edge.clone()))
                    .collect();
                (node.clone(), outgoing)
            })
            .collect()
    }

    /// Remove every node and edge, journaling the command.
    ///
    /// Clearing an empty graph changes nothing and journals nothing.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.nodes.is_empty() {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR);
            Ok(())
        })?;
        inner.nodes.clear();
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    fn require_endpoints(inner: &GraphInner<N, E>, src: &N, dst: &N) -> Result<()> {
        if !inner.nodes.contains_key(src) {
            return Err(JournalError::invalid_argument(
                "edge source is not in the graph",
            ));
        }
        if !inner.nodes.contains_key(dst) {
            return Err(JournalError::invalid_argument(
                "edge destination is not in the graph",
            ));
        }
        Ok(())
    }
}

impl<N, E> StateMachine for DurableGraph<N, E>
where
    N: Eq + Hash + Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn reset(&self, writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.writer = Some(writer);
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        let tag = reader.read_header()?;
        let mut inner = self.inner.lock();
        match tag {
            CLEAR => inner.nodes.clear(),
            ADD_NODE => {
                let value = self.node_codec.read(&mut reader, 0)?;
                inner.nodes.entry(value).or_insert_with(NodeState::new);
            }
            REMOVE_NODE => {
                let value = self.node_codec.read(&mut reader, 0)?;
                inner.apply_remove_node(&value);
            }
            ADD_EDGE | UPSERT_EDGE => {
                let src = self.node_codec.read(&mut reader, 0)?;
                let dst = self.node_codec.read(&mut reader, 1)?;
                let edge = self.edge_codec.read(&mut reader, 2)?;
                inner.apply_put_edge(&src, &dst, edge);
            }
            REMOVE_EDGE => {
                let src = self.node_codec.read(&mut reader, 0)?;
                let dst = self.node_codec.read(&mut reader, 1)?;
                inner.apply_remove_edge(&src, &dst);
            }
            SNAPSHOT => {
                inner.nodes.clear();
                let node_count = reader.read_varu64()? as usize;
                for _ in 0..node_count {
                    let value = self.node_codec.read(&mut reader, 0)?;
                    inner.nodes.insert(value, NodeState::new());
                }
                let edge_count = reader.read_varu64()? as usize;
                for _ in 0..edge_count {
                    let src = self.node_codec.read(&mut reader, 0)?;
                    let dst = self.node_codec.read(&mut reader, 1)?;
                    let edge = self.edge_codec.read(&mut reader, 2)?;
                    inner.apply_put_edge(&src, &dst, edge);
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
            // Nodes first so every edge finds its endpoints on replay.
            w.write_varu64(inner.nodes.len() as u64);
            for node in inner.nodes.keys() {
                self.node_codec.write(w, 0, node)?;
            }
            let edge_count: usize = inner
                .nodes
                .values()
                .map(|state| state.outgoing.len())
                .sum();
            w.write_varu64(edge_count as u64);
            for (src, state) in &inner.nodes {
                for (dst, edge) in &state.outgoing {
                    self.node_codec.write(w, 0, src)?;
                    self.node_codec.write(w, 1, dst)?;
                    self.edge_codec.write(w, 2, edge)?;
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

    fn graph() -> (Arc<DurableGraph<String, u32>>, LogWriter) {
        let machine = DurableGraph::new(
            StateKey::new("graph").unwrap(),
            Arc::new(BincodeCodec::new()),
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
    fn test_edge_preconditions() {
        let (graph, writer) = graph();
        graph.add_node(s("A")).unwrap();
        assert!(graph.add_edge(&s("A"), &s("ghost"), 1).is_err());
        assert!(graph.add_edge(&s("ghost"), &s("A"), 1).is_err());
        assert!(graph.upsert_edge(&s("A"), &s("ghost"), 1).is_err());
        assert_eq!(writer.pending_len(), 1);
    }

    #[test]
    fn test_duplicate_edge_versus_upsert() {
        let (graph, _) = graph();
        graph.add_node(s("A")).unwrap();
        graph.add_node(s("B")).unwrap();
        assert!(graph.add_edge(&s("A"), &s("B"), 1).unwrap());
        assert!(!graph.add_edge(&s("A"), &s("B"), 2).unwrap());
        assert_eq!(graph.try_get_edge(&s("A"), &s("B")), Some(1));

        graph.upsert_edge(&s("A"), &s("B"), 9).unwrap();
        assert_eq!(graph.try_get_edge(&s("A"), &s("B")), Some(9));
    }

    #[test]
    fn test_node_removal_cleans_incident_edges() {
        let (graph, _) = graph();
        for node in ["A", "B", "C", "D"] {
            graph.add_node(s(node)).unwrap();
        }
        graph.add_edge(&s("A"), &s("B"), 1).unwrap();
        graph.add_edge(&s("B"), &s("A"), 2).unwrap();
        graph.add_edge(&s("B"), &s("C"), 3).unwrap();
        graph.add_edge(&s("D"), &s("A"), 4).unwrap();

        assert!(graph.remove_node(&s("A")).unwrap());
        assert!(graph.try_get_edge(&s("D"), &s("A")).is_none());
        assert!(graph.try_get_edge(&s("B"), &s("A")).is_none());
        assert_eq!(graph.try_get_edge(&s("B"), &s("C")), Some(3));
        assert!(graph.get_outgoing(&s("D")).is_empty());
    }

    #[test]
    fn test_cycles_and_neighbors() {
        let (graph, _) = graph();
        for node in ["A", "B", "C"] {
            graph.add_node(s(node)).unwrap();
        }
        graph.add_edge(&s("A"), &s("B"), 1).unwrap();
        graph.add_edge(&s("B"), &s("C"), 2).unwrap();
        graph.add_edge(&s("C"), &s("A"), 3).unwrap();

        let mut neighbors = graph.get_neighbors(&s("A"));
        neighbors.sort();
        assert_eq!(neighbors, vec![s("B"), s("C")]);
    }

    #[test]
    fn test_self_loop_counts_once() {
        let (graph, _) = graph();
        graph.add_node(s("A")).unwrap();
        graph.add_edge(&s("A"), &s("A"), 0).unwrap();
        assert_eq!(graph.get_neighbors(&s("A")), vec![s("A")]);
        assert_eq!(graph.get_incoming(&s("A")), vec![(s("A"), 0)]);
    }

    #[test]
    fn test_incoming_reconstruction() {
        let (graph, _) = graph();
        for node in ["A", "B", "C"] {
            graph.add_node(s(node)).unwrap();
        }
        graph.add_edge(&s("A"), &s("C"), 10).unwrap();
        graph.add_edge(&s("B"), &s("C"), 20).unwrap();

        let mut incoming = graph.get_incoming(&s("C"));
        incoming.sort();
        assert_eq!(incoming, vec![(s("A"), 10), (s("B"), 20)]);
    }

    #[test]
    fn test_replay_and_snapshot_fidelity() {
        let (graph, writer) = graph();
        for node in ["A", "B", "C"] {
            graph.add_node(s(node)).unwrap();
        }
        graph.add_edge(&s("A"), &s("B"), 1).unwrap();
        graph.upsert_edge(&s("A"), &s("B"), 5).unwrap();
        graph.add_edge(&s("B"), &s("C"), 2).unwrap();
        graph.remove_edge(&s("B"), &s("C")).unwrap();
        graph.remove_node(&s("C")).unwrap();

        let (replayed, _) = self::graph();
        for entry in writer.drain() {
            replayed.apply(&entry).unwrap();
        }
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed.try_get_edge(&s("A"), &s("B")), Some(5));

        let mut batch = LogBatch::new();
        graph.append_snapshot(&mut batch).unwrap();
        let (snapshotted, _) = self::graph();
        for entry in batch.into_entries() {
            snapshotted.apply(&entry).unwrap();
        }
        assert_eq!(snapshotted.len(), 2);
        assert_eq!(snapshotted.try_get_edge(&s("A"), &s("B")), Some(5));
        assert_eq!(snapshotted.get_incoming(&s("B")), vec![(s("A"), 5)]);
    }
}

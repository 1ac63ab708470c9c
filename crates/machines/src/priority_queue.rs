//! Durable priority queue: lowest priority value dequeues first.
//!
//! Ties are broken by arrival order. The tie-break sequence is not
//! journaled; replay re-enqueues in append order, which reproduces the
//! same sequence numbers and therefore the same dequeue order.
//!
//! The snapshot emits the `(element, priority)` pairs in heap order,
//! which is deliberately unspecified: replay rebuilds the heap by
//! re-enqueuing every pair.

use crate::support::{encode_entry, require_writer};
use parking_lot::Mutex;
use statelog_core::{JournalError, LogBatch, LogEntry, LogWriter, Result, StateKey, StateMachine};
use statelog_wire::{EntryReader, FieldCodec, SessionPool};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

const MACHINE: &str = "priority-queue";

const CLEAR: u32 = 0;
const SNAPSHOT: u32 = 1;
const ENQUEUE: u32 = 2;
const DEQUEUE: u32 = 3;

struct HeapEntry<E, P> {
    priority: P,
    seq: u64,
    element: E,
}

impl<E, P: Ord> PartialEq for HeapEntry<E, P> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<E, P: Ord> Eq for HeapEntry<E, P> {}

// Reversed comparison: BinaryHeap is a max-heap, so the smallest
// (priority, seq) pair must compare greatest.
impl<E, P: Ord> Ord for HeapEntry<E, P> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<E, P: Ord> PartialOrd for HeapEntry<E, P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner<E, P> {
    heap: BinaryHeap<HeapEntry<E, P>>,
    next_seq: u64,
    writer: Option<LogWriter>,
}

/// A durable min-priority queue of `(element, priority)` pairs.
pub struct DurablePriorityQueue<E, P> {
    key: StateKey,
    element_codec: Arc<dyn FieldCodec<E>>,
    priority_codec: Arc<dyn FieldCodec<P>>,
    sessions: SessionPool,
    inner: Mutex<QueueInner<E, P>>,
}

impl<E, P> DurablePriorityQueue<E, P>
where
    E: Send + 'static,
    P: Ord + Send + 'static,
{
    /// Create an empty queue bound to `key`.
    pub fn new(
        key: StateKey,
        element_codec: Arc<dyn FieldCodec<E>>,
        priority_codec: Arc<dyn FieldCodec<P>>,
        sessions: SessionPool,
    ) -> Arc<Self> {
        Arc::new(DurablePriorityQueue {
            key,
            element_codec,
            priority_codec,
            sessions,
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                writer: None,
            }),
        })
    }

    /// The structure's key within its host.
    pub fn key(&self) -> &StateKey {
        &self.key
    }

    /// Number of queued pairs.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Queue an element with a priority and journal the command.
    pub fn enqueue(&self, element: E, priority: P) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(ENQUEUE);
            self.element_codec.write(w, 0, &element)?;
            self.priority_codec.write(w, 1, &priority)
        })?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(HeapEntry {
            priority,
            seq,
            element,
        });
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }

    /// Remove and return the element with the lowest priority.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the queue is empty; no entry is journaled.
    pub fn dequeue(&self) -> Result<E> {
        let mut inner = self.inner.lock();
        if inner.heap.is_empty() {
            return Err(JournalError::invalid_operation("dequeue on empty queue"));
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(DEQUEUE);
            Ok(())
        })?;
        let popped = inner
            .heap
            .pop()
            .ok_or_else(|| JournalError::invalid_operation("dequeue on empty queue"))?;
        require_writer(&inner.writer)?.append(entry);
        Ok(popped.element)
    }

    /// Remove and return the lowest pair, or `None` when empty.
    pub fn try_dequeue(&self) -> Result<Option<(E, P)>> {
        let mut inner = self.inner.lock();
        if inner.heap.is_empty() {
            return Ok(None);
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(DEQUEUE);
            Ok(())
        })?;
        let popped = match inner.heap.pop() {
            Some(p) => p,
            None => return Ok(None),
        };
        require_writer(&inner.writer)?.append(entry);
        Ok(Some((popped.element, popped.priority)))
    }

    /// The lowest pair without removing it.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the queue is empty.
    pub fn peek(&self) -> Result<(E, P)>
    where
        E: Clone,
        P: Clone,
    {
        self.try_peek()
            .ok_or_else(|| JournalError::invalid_operation("peek on empty queue"))
    }

    /// The lowest pair without removing it, or `None` when empty.
    pub fn try_peek(&self) -> Option<(E, P)>
    where
        E: Clone,
        P: Clone,
    {
        let inner = self.inner.lock();
        inner
            .heap
            .peek()
            .map(|e| (e.element.clone(), e.priority.clone()))
    }

    /// Remove every pair and journal the command.
    ///
    /// Clearing an empty queue changes nothing and journals nothing.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.heap.is_empty() {
            return Ok(());
        }
        let entry = encode_entry(&self.sessions, |w| {
            w.write_header(CLEAR);
            Ok(())
        })?;
        inner.heap.clear();
        inner.next_seq = 0;
        require_writer(&inner.writer)?.append(entry);
        Ok(())
    }
}

impl<E, P> StateMachine for DurablePriorityQueue<E, P>
where
    E: Send + 'static,
    P: Ord + Send + 'static,
{
    fn reset(&self, writer: LogWriter) {
        let mut inner = self.inner.lock();
        inner.heap.clear();
        inner.next_seq = 0;
        inner.writer = Some(writer);
    }

    fn apply(&self, entry: &LogEntry) -> Result<()> {
        let mut reader = EntryReader::new(entry.as_bytes());
        let tag = reader.read_header()?;
        let mut inner = self.inner.lock();
        match tag {
            CLEAR => {
                inner.heap.clear();
                inner.next_seq = 0;
            }
            ENQUEUE => {
                let element = self.element_codec.read(&mut reader, 0)?;
                let priority = self.priority_codec.read(&mut reader, 1)?;
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.heap.push(HeapEntry {
                    priority,
                    seq,
                    element,
                });
            }
            DEQUEUE => {
                if inner.heap.pop().is_none() {
                    return Err(JournalError::codec(
                        "dequeue entry applied to an empty queue",
                    ));
                }
            }
            SNAPSHOT => {
                inner.heap.clear();
                inner.next_seq = 0;
                let count = reader.read_varu64()? as usize;
                for _ in 0..count {
                    let element = self.element_codec.read(&mut reader, 0)?;
                    let priority = self.priority_codec.read(&mut reader, 1)?;
                    let seq = inner.next_seq;
                    inner.next_seq += 1;
                    inner.heap.push(HeapEntry {
                        priority,
                        seq,
                        element,
                    });
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
            w.write_varu64(inner.heap.len() as u64);
            for item in inner.heap.iter() {
                self.element_codec.write(w, 0, &item.element)?;
                self.priority_codec.write(w, 1, &item.priority)?;
            }
            Ok(())
        })?;
        batch.push(entry);
        Ok(())
    }
}

//! Durable, journaled in-memory structures
//!
//! Each structure keeps its full state in memory, applies every mutation
//! there first, and then appends one framed command to its host-provided
//! log. Recovery replays the log (with at most one leading snapshot) to
//! restore the state byte for byte.
//!
//! | Structure | Journal policy | Module |
//! |-----------|----------------|--------|
//! | `DurableStack` | push-on-mutate | [`stack`] |
//! | `DurablePriorityQueue` | push-on-mutate | [`priority_queue`] |
//! | `DurableOrderedSet` | push-on-mutate | [`ordered_set`] |
//! | `DurableListLookup` | push-on-mutate | [`list_lookup`] |
//! | `DurableSetLookup` | push-on-mutate | [`set_lookup`] |
//! | `DurableOrderedSetLookup` | push-on-mutate | [`ordered_set_lookup`] |
//! | `DurableRingBuffer` | push-on-mutate | [`ring_buffer`] |
//! | `DurableRingBufferCollection` | push-on-mutate | [`ring_buffer_collection`] |
//! | `DurableTimeWindowBuffer` | push-on-mutate | [`time_window_buffer`] |
//! | `DurableTimeWindowBufferCollection` | push-on-mutate | [`time_window_collection`] |
//! | `DurableTree` | push-on-mutate | [`tree`] |
//! | `DurableGraph` | push-on-mutate | [`graph`] |
//! | `DurableObject` | batch-on-write | [`object`] |
//! | `DurableCancellationSource` | batch-on-write | [`cancellation`] |
//!
//! Command tags are closed per structure and interpreted only by that
//! structure's decoder; an unknown tag or version byte aborts recovery.

#![warn(clippy::all)]

pub mod cancellation;
pub mod graph;
pub mod list_lookup;
pub mod object;
pub mod ordered_set;
pub mod ordered_set_lookup;
pub mod priority_queue;
pub mod ring_buffer;
pub mod ring_buffer_collection;
pub mod set_lookup;
pub mod stack;
pub mod time_window_buffer;
pub mod time_window_collection;
pub mod tree;

mod support;

pub use cancellation::{CancellationToken, DurableCancellationSource};
pub use graph::DurableGraph;
pub use list_lookup::DurableListLookup;
pub use object::DurableObject;
pub use ordered_set::DurableOrderedSet;
pub use ordered_set_lookup::DurableOrderedSetLookup;
pub use priority_queue::DurablePriorityQueue;
pub use ring_buffer::DurableRingBuffer;
pub use ring_buffer_collection::{DurableRingBufferCollection, RingBufferRef};
pub use set_lookup::DurableSetLookup;
pub use stack::DurableStack;
pub use time_window_buffer::DurableTimeWindowBuffer;
pub use time_window_collection::{DurableTimeWindowBufferCollection, TimeWindowBufferRef};
pub use tree::DurableTree;

//! Per-stream sequence numbers.
//!
//! Every node numbers the ordered operations it sends to each destination
//! (puts, gets, relays, work) starting at 1, one counter per destination.
//! The receiver applies them through a `SequenceGate`, which releases events
//! of one source strictly in sequence order and holds early arrivals back
//! until the gap is filled.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::transport::NodeId;

/// Sender side: one counter per destination.
#[derive(Debug)]
pub struct SequenceCounter {
    next: Vec<AtomicU64>,
}

impl SequenceCounter {
    pub fn new(num_nodes: usize) -> Self {
        Self {
            next: (0..num_nodes).map(|_| AtomicU64::new(1)).collect(),
        }
    }

    /// Take the next sequence number for `dest`.
    ///
    /// # Panics
    /// If `dest` is outside the job.
    #[inline]
    pub fn next(
        &self,
        dest: NodeId,
    ) -> u64 {
        self.next[dest.index()].fetch_add(1, Ordering::SeqCst)
    }

    /// The number `next` would return, without taking it.
    #[inline]
    pub fn peek(
        &self,
        dest: NodeId,
    ) -> u64 {
        self.next[dest.index()].load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Stream<T> {
    expected: u64,
    held: BTreeMap<u64, T>,
}

impl<T> Default for Stream<T> {
    fn default() -> Self {
        Self {
            expected: 1,
            held: BTreeMap::new(),
        }
    }
}

/// Receiver side reorder buffer.
#[derive(Debug)]
pub struct SequenceGate<T> {
    streams: Mutex<HashMap<NodeId, Stream<T>>>,
}

impl<T> SequenceGate<T> {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Offer event `seq` from `source`; returns every event now releasable, in order.
    ///
    /// A sequence number that was already released is dropped with a warning.
    pub fn admit(
        &self,
        source: NodeId,
        seq: u64,
        event: T,
    ) -> Vec<T> {
        let mut streams = self.streams.lock();
        let stream = streams.entry(source).or_default();

        if seq < stream.expected || stream.held.contains_key(&seq) {
            tracing::warn!(%source, seq, expected = stream.expected, "duplicate sequence number dropped");
            return Vec::new();
        }
        stream.held.insert(seq, event);

        let mut ready = Vec::new();
        while let Some(event) = stream.held.remove(&stream.expected) {
            ready.push(event);
            stream.expected += 1;
        }
        ready
    }

    /// Next sequence number expected from `source`.
    pub fn expected(
        &self,
        source: NodeId,
    ) -> u64 {
        self.streams
            .lock()
            .get(&source)
            .map_or(1, |stream| stream.expected)
    }

    /// Events held back waiting for a gap to fill.
    pub fn held(&self) -> usize {
        self.streams.lock().values().map(|s| s.held.len()).sum()
    }
}

impl<T> Default for SequenceGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

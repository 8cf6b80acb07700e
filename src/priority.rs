//! Priority queue keyed by caller-supplied priority.
//!
//! Higher priority dequeues first; entries with equal priority come out in
//! insertion order, tracked by a monotonically increasing sequence number.
//! Like the FIFO queue, dequeue on empty is an immediate error.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::error::QueueError;

struct Entry<T> {
    priority: i32,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Max-heap: highest priority first, then lowest sequence (FIFO on ties).
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Heap<T> {
    heap: BinaryHeap<Entry<T>>,
    seq: u64,
}

/// Thread-safe binary max-heap queue.
pub struct PriorityQueue<T> {
    inner: Mutex<Heap<T>>,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Heap {
                heap: BinaryHeap::new(),
                seq: 0,
            }),
        }
    }

    /// Inserts `item`; higher `priority` sorts earlier.
    pub fn enqueue(&self, ctx: &CancellationToken, item: T, priority: i32) -> Result<(), QueueError> {
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let mut inner = self.inner.lock().expect("priority queue lock poisoned");
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(Entry { priority, seq, item });
        Ok(())
    }

    /// Removes and returns the highest-priority pending item, or
    /// [`QueueError::Empty`] immediately when nothing is queued.
    pub fn dequeue(&self, ctx: &CancellationToken) -> Result<T, QueueError> {
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let mut inner = self.inner.lock().expect("priority queue lock poisoned");
        match inner.heap.pop() {
            Some(entry) => Ok(entry.item),
            None => Err(QueueError::Empty),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("priority queue lock poisoned").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

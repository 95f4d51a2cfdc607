//! The shared-memory command and completion rings.
//!
//! `op.c` implements these as a pair of lock-free SPSC ring buffers over a
//! raw shared-memory region. This crate reuses the teacher's
//! `crossbeam_queue::ArrayQueue`, which is the same bounded lock-free SPSC
//! (for the single-producer/single-consumer usage here) structure, rather
//! than hand-rolling the atomics again.

use crossbeam_queue::ArrayQueue;

/// A bounded ring of `T`, used for both the command queue (client pushes,
/// dispatcher pops) and the completion queue (dispatcher pushes, client
/// pops).
pub struct Ring<T> {
    inner: ArrayQueue<T>,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self { inner: ArrayQueue::new(capacity) }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Free slots remaining.
    pub fn space(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Pushes `item`. Fails and returns it back if the ring is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.inner.push(item)
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }
}

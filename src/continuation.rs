//! Fixed-size free-list allocator that threads a request identifier and a
//! small scratch area through an asynchronous NFS callback.
//!
//! Mirrors the teacher's `allocator` module in spirit (intrusive free list,
//! O(1) alloc/free) but the pooled records are plain-old-data continuations
//! rather than heap buffer chains, so the free list is index-based instead
//! of pointer-based: nothing here needs a raw pointer to stay sound.

use crate::command::RequestId;

/// Carrier threading per-request state through an async callback.
///
/// `data` is a small untyped scratch area (four words), used by handlers to
/// stash whatever they need to commit or roll back once the callback fires
/// (a descriptor, an output buffer pointer, a prior handle to restore).
#[derive(Debug, Clone, Copy, Default)]
pub struct Continuation {
    pub request_id: RequestId,
    pub data: [u64; 4],
}

/// Opaque handle naming an allocated continuation.
///
/// Intentionally carries no accessors beyond what the pool itself exposes —
/// holding one is proof the corresponding slot is allocated, but only the
/// pool that issued it can dereference or free it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationHandle(u32);

struct Slot {
    continuation: Continuation,
    in_use: bool,
    next_free: Option<u32>,
}

/// Fixed-capacity continuation pool.
///
/// Sized equal to the command-queue capacity so that admitting a command
/// guarantees a continuation is available (spec's back-pressure invariant
/// depends on this, not on the pool itself back-pressuring).
pub struct ContinuationPool {
    slots: Box<[Slot]>,
    first_free: Option<u32>,
}

impl ContinuationPool {
    /// Creates a pool of `capacity` continuations, all initially free.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next_free = if i + 1 < capacity { Some(i as u32 + 1) } else { None };
            slots.push(Slot {
                continuation: Continuation::default(),
                in_use: false,
                next_free,
            });
        }

        let first_free = if capacity > 0 { Some(0) } else { None };
        Self { slots: slots.into_boxed_slice(), first_free }
    }

    /// Total number of continuations the pool was constructed with.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Allocates a continuation and populates it with `request_id` and zeroed
    /// scratch data. Returns `None` if the pool is exhausted.
    pub fn alloc(&mut self, request_id: RequestId) -> Option<ContinuationHandle> {
        let index = self.first_free?;
        let slot = &mut self.slots[index as usize];
        debug_assert!(!slot.in_use, "free-list head pointed at an in-use slot");

        self.first_free = slot.next_free.take();
        slot.in_use = true;
        slot.continuation = Continuation { request_id, data: [0; 4] };

        Some(ContinuationHandle(index))
    }

    /// Returns a shared reference to the continuation behind `handle`.
    ///
    /// Panics if `handle` does not name a currently-allocated continuation —
    /// holding a stale handle past `free` is a programming error, same class
    /// as the double-free spec.md treats as a fatal assertion failure.
    pub fn get(&self, handle: ContinuationHandle) -> &Continuation {
        let slot = &self.slots[handle.0 as usize];
        assert!(slot.in_use, "continuation handle used after free");
        &slot.continuation
    }

    /// Returns a mutable reference to the continuation's scratch data.
    pub fn get_mut(&mut self, handle: ContinuationHandle) -> &mut Continuation {
        let slot = &mut self.slots[handle.0 as usize];
        assert!(slot.in_use, "continuation handle used after free");
        &mut slot.continuation
    }

    /// Returns `handle` to the pool.
    ///
    /// Panics on double-free, matching spec.md §4.1's "detect double-free ...
    /// reject out-of-range addresses": an out-of-range index can't even be
    /// constructed here (the only way to get a `ContinuationHandle` is from
    /// `alloc`), so the remaining fatal case is freeing an already-free slot.
    pub fn free(&mut self, handle: ContinuationHandle) {
        let index = handle.0 as usize;
        let slot = &mut self.slots[index];
        assert!(slot.in_use, "double-free of continuation {index}");

        slot.in_use = false;
        slot.next_free = self.first_free.take();
        self.first_free = Some(index as u32);
    }

    /// Number of continuations currently allocated.
    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}

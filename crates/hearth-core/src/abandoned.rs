//! The abandoned-heap stack.
//!
//! The only process-wide mutable variable of the subsystem: a lock-free
//! stack of heaps whose owning thread exited while live blocks remained.
//! Entries link through each heap's `abandoned_next` handle. The stack
//! exposes exactly two operations — prepend a chain, and claim the whole
//! stack — so consumers never observe a half-popped state (the structural
//! fix for the A-B-A problem).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::Runtime;

pub(crate) struct AbandonedStack {
    head: AtomicU64,
}

impl AbandonedStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    /// Cheap non-claiming read. Purely an optimization for callers; never
    /// rely on it for correctness.
    pub fn peek_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == 0
    }

    /// Claims the entire stack, leaving it empty. Returns the head heap id
    /// (0 when the stack was empty).
    pub fn claim_all(&self) -> u64 {
        self.head.swap(0, Ordering::AcqRel)
    }

    /// Atomically prepends the chain starting at `first` (linked through
    /// `abandoned_next`, already terminated). O(n) in the chain length.
    pub fn prepend(&self, rt: &Runtime, first: u64) {
        if first == 0 {
            return;
        }
        // fast path: the stack happens to be empty
        if self
            .head
            .compare_exchange(0, first, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        // find the end of the chain
        let mut last = first;
        loop {
            let next = match rt.heap(last) {
                Some(heap) => heap.abandoned_next.load(Ordering::Relaxed),
                None => {
                    debug_assert!(false, "abandoned chain entry {last} not registered");
                    return;
                }
            };
            if next == 0 {
                break;
            }
            last = next;
        }
        let Some(last_heap) = rt.heap(last) else {
            return;
        };
        // and prepend
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            last_heap.abandoned_next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }
}

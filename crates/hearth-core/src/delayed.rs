//! The delayed-free channel.
//!
//! A many-producer, single-consumer stack per heap. Remote threads prepend
//! blocks with a compare-and-swap; only the owning thread consumes, either
//! by draining the whole channel (exchange the head to empty) or by
//! stealing it during an absorb. Links run through the blocks' next-words,
//! XOR-folded under the owning heap's keys; the head itself is a plain
//! address.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::block::encode_link;
use crate::page::Page;

/// Sentinel head for a channel that was absorbed and will never accept
/// another block. Word alignment keeps it distinct from any block address.
const SEALED: usize = 1;

pub(crate) struct DelayedFree {
    head: AtomicUsize,
}

impl DelayedFree {
    pub const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.head.load(Ordering::Relaxed), 0 | SEALED)
    }

    /// Producer side: prepends `block` (which must be a block base of
    /// `page`) under the consumer heap's keys. Returns false when the
    /// channel is sealed; the caller must deliver through the page instead.
    #[must_use]
    pub fn push(&self, page: &Page, block: usize, keys: [usize; 2]) -> bool {
        let Some(idx) = page.block_index(block) else {
            return true;
        };
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            if head == SEALED {
                return false;
            }
            page.link_word(idx, encode_link(head, keys));
            match self
                .head
                .compare_exchange_weak(head, block, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => head = observed,
            }
        }
    }

    /// Consumer side: takes the entire channel, leaving it empty (and
    /// still open).
    pub fn take_all(&self) -> usize {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            if head == 0 || head == SEALED {
                return 0;
            }
            match self
                .head
                .compare_exchange(head, 0, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return head,
                Err(observed) => head = observed,
            }
        }
    }

    /// Steals the channel during an absorb and seals it: concurrent
    /// producers observe the seal, fail their push, and re-deliver through
    /// the page's own channel, so nothing is stranded on a dying heap.
    pub fn seal(&self) -> usize {
        let head = self.head.swap(SEALED, Ordering::AcqRel);
        if head == SEALED {
            0
        } else {
            head
        }
    }

    /// Prepends an already-linked chain starting at `first`. `rebind_tail`
    /// is called with the observed head before every attempt so the chain's
    /// tail link can be re-encoded against it.
    pub fn prepend_chain(&self, first: usize, rebind_tail: impl Fn(usize)) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            rebind_tail(head);
            match self
                .head
                .compare_exchange(head, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }
}

//! Per-heap page queues.
//!
//! A heap keeps one queue of pages per size class plus one queue for pages
//! with no free blocks left. The queue set maintains the heap's page count
//! as an invariant across every mutation, and supports splicing a whole
//! queue set into another heap (re-homing each spliced page's owner handle
//! on the way).

use std::sync::atomic::Ordering;

use crate::page::PageRef;
use crate::size_class::{bin_index, bin_size, BIN_FULL};

pub(crate) struct PageQueue {
    /// Block size served by pages in this queue; 0 for the full queue.
    pub block_size: usize,
    pub pages: Vec<PageRef>,
}

pub(crate) struct PageQueues {
    bins: Vec<PageQueue>,
    /// Total pages linked across all queues.
    pub page_count: usize,
}

impl PageQueues {
    pub fn new() -> Self {
        let bins = (0..=BIN_FULL)
            .map(|i| PageQueue {
                block_size: bin_size(i),
                pages: Vec::new(),
            })
            .collect();
        Self {
            bins,
            page_count: 0,
        }
    }

    pub fn bin(&self, i: usize) -> &PageQueue {
        &self.bins[i]
    }

    /// Links a page into the given queue.
    pub fn push(&mut self, bin: usize, pref: PageRef) {
        self.bins[bin].pages.push(pref);
        self.page_count += 1;
    }

    /// Unlinks a page wherever it is queued. Returns false if the page is
    /// not linked here.
    pub fn remove(&mut self, pref: &PageRef) -> bool {
        let page = pref.page();
        let likely = if page.in_full.load(Ordering::Relaxed) {
            BIN_FULL
        } else {
            bin_index(page.block_size().max(1))
        };
        if self.remove_from(likely, pref) {
            self.page_count -= 1;
            return true;
        }
        for bin in 0..=BIN_FULL {
            if bin != likely && self.remove_from(bin, pref) {
                self.page_count -= 1;
                return true;
            }
        }
        false
    }

    fn remove_from(&mut self, bin: usize, pref: &PageRef) -> bool {
        let pages = &mut self.bins[bin].pages;
        match pages.iter().position(|p| p.same(pref)) {
            Some(pos) => {
                pages.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Moves a page between queues without changing the page count.
    pub fn move_to(&mut self, pref: &PageRef, from_bin: usize, to_bin: usize) -> bool {
        if self.remove_from(from_bin, pref) {
            self.bins[to_bin].pages.push(pref.clone());
            true
        } else {
            false
        }
    }

    /// Splices every queue of `from` onto the tail of the matching queue
    /// here, re-homing each spliced page to `to_heap`. Returns the number
    /// of pages moved.
    pub fn append_from(&mut self, from: &mut PageQueues, to_heap: u64) -> usize {
        let mut moved = 0;
        for bin in 0..=BIN_FULL {
            for pref in from.bins[bin].pages.drain(..) {
                pref.page().heap.store(to_heap, Ordering::Release);
                self.bins[bin].pages.push(pref);
                moved += 1;
            }
        }
        self.page_count += moved;
        debug_assert_eq!(from.page_count, moved);
        from.page_count = from.page_count.saturating_sub(moved);
        moved
    }

    /// Clears all queues without freeing pages.
    pub fn reset(&mut self) {
        for bin in &mut self.bins {
            bin.pages.clear();
        }
        self.page_count = 0;
    }

    /// Copies out every linked page in bin order. Iterating a snapshot
    /// keeps the walk safe against pages being unlinked mid-visit.
    pub fn snapshot(&self) -> Vec<PageRef> {
        let mut pages = Vec::with_capacity(self.page_count);
        for bin in &self.bins {
            pages.extend(bin.pages.iter().cloned());
        }
        pages
    }
}

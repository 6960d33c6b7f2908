//! Pages and their block bookkeeping.
//!
//! A page serves blocks of a single size class. The owning thread works on
//! the `free`/`local_free` lists behind the page's local lock; other threads
//! only touch the atomic fields: the owning-heap handle used to route remote
//! frees, the full flag, and the `thread_free` stack of remotely freed
//! blocks. Free lists thread through per-block next-words, which double as
//! the storage for the obfuscated delayed-free links.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::segment::{Segment, PAGE_SHIFT, PAGE_SIZE};

/// Owner-thread page state.
#[derive(Debug, Default)]
pub(crate) struct PageLocal {
    /// Blocks handed out and not yet returned (remote returns count as used
    /// until collected).
    pub used: usize,
    /// Block slots reserved at init time.
    pub reserved: usize,
    /// Immediately allocatable block indices.
    pub free: Vec<usize>,
    /// Blocks freed locally since the last merge.
    pub local_free: Vec<usize>,
}

/// One page slot inside a segment.
pub(crate) struct Page {
    segment_base: usize,
    idx: usize,
    /// Handle of the owning heap; 0 while the slot is unused. Remote frees
    /// route on this value.
    pub heap: AtomicU64,
    /// Set while the page sits in the full queue; remote frees then go to
    /// the owning heap's delayed channel instead of `thread_free`.
    pub in_full: AtomicBool,
    thread_free: AtomicUsize,
    block_size: AtomicUsize,
    capacity: AtomicUsize,
    pub local: Mutex<PageLocal>,
    words: RwLock<Vec<AtomicUsize>>,
}

impl Page {
    pub fn new(segment_base: usize, idx: usize) -> Self {
        Self {
            segment_base,
            idx,
            heap: AtomicU64::new(0),
            in_full: AtomicBool::new(false),
            thread_free: AtomicUsize::new(0),
            block_size: AtomicUsize::new(0),
            capacity: AtomicUsize::new(0),
            local: Mutex::new(PageLocal::default()),
            words: RwLock::new(Vec::new()),
        }
    }

    pub fn start(&self) -> usize {
        self.segment_base + (self.idx << PAGE_SHIFT)
    }

    pub fn block_size(&self) -> usize {
        self.block_size.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Prepares the page to serve blocks of `block_size` for `heap_id`.
    pub fn init(&self, heap_id: u64, block_size: usize) {
        debug_assert!(block_size > 0 && block_size <= PAGE_SIZE);
        let capacity = (PAGE_SIZE / block_size).max(1);
        {
            let mut words = self.words.write();
            words.clear();
            words.extend((0..capacity).map(|_| AtomicUsize::new(0)));
        }
        {
            let mut local = self.local.lock();
            local.used = 0;
            local.reserved = capacity;
            local.free = (0..capacity).rev().collect();
            local.local_free.clear();
        }
        self.block_size.store(block_size, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.thread_free.store(0, Ordering::Relaxed);
        self.in_full.store(false, Ordering::Relaxed);
        self.heap.store(heap_id, Ordering::Release);
    }

    /// Clears all state; the slot no longer belongs to any heap.
    pub fn reset(&self) {
        self.heap.store(0, Ordering::Release);
        self.in_full.store(false, Ordering::Relaxed);
        self.thread_free.store(0, Ordering::Relaxed);
        self.block_size.store(0, Ordering::Relaxed);
        self.capacity.store(0, Ordering::Relaxed);
        self.words.write().clear();
        let mut local = self.local.lock();
        local.used = 0;
        local.reserved = 0;
        local.free.clear();
        local.local_free.clear();
    }

    /// Maps an address to its block index; `None` unless `p` is the exact
    /// base of a block in this page.
    pub fn block_index(&self, p: usize) -> Option<usize> {
        let block_size = self.block_size();
        if block_size == 0 {
            return None;
        }
        let start = self.start();
        if p < start {
            return None;
        }
        let offset = p - start;
        if offset >= self.capacity() * block_size || offset % block_size != 0 {
            return None;
        }
        Some(offset / block_size)
    }

    fn block_index_unchecked(&self, p: usize) -> usize {
        (p - self.start()) / self.block_size().max(1)
    }

    pub fn block_addr(&self, idx: usize) -> usize {
        self.start() + idx * self.block_size()
    }

    /// Stores a next-word for the block at `idx`.
    pub fn link_word(&self, idx: usize, value: usize) {
        let words = self.words.read();
        if let Some(word) = words.get(idx) {
            word.store(value, Ordering::Release);
        }
    }

    /// Reads the next-word of the block at `idx`.
    pub fn read_word(&self, idx: usize) -> usize {
        let words = self.words.read();
        words.get(idx).map_or(0, |w| w.load(Ordering::Acquire))
    }

    /// Prepends a remotely freed block onto the page's `thread_free` stack.
    /// Links are plain addresses through the block next-words.
    pub fn thread_free_push(&self, block: usize) {
        let Some(idx) = self.block_index(block) else {
            return;
        };
        let mut head = self.thread_free.load(Ordering::Relaxed);
        loop {
            self.link_word(idx, head);
            match self.thread_free.compare_exchange_weak(
                head,
                block,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Merges pending frees back into the allocatable list: the remote
    /// `thread_free` stack is drained unconditionally, `local_free` only
    /// when forced or when `free` ran dry. Returns the number of remote
    /// blocks merged.
    pub fn collect_free(&self, local: &mut PageLocal, force: bool) -> usize {
        let mut merged = 0;
        let mut head = self.thread_free.swap(0, Ordering::AcqRel);
        while head != 0 {
            let idx = self.block_index_unchecked(head);
            let next = self.read_word(idx);
            local.free.push(idx);
            merged += 1;
            head = next;
        }
        debug_assert!(merged <= local.used);
        local.used = local.used.saturating_sub(merged);
        if force || local.free.is_empty() {
            let mut drained = std::mem::take(&mut local.local_free);
            local.free.append(&mut drained);
        }
        merged
    }
}

/// A counted reference to one page slot.
#[derive(Clone)]
pub(crate) struct PageRef {
    pub segment: Arc<Segment>,
    pub idx: usize,
}

impl PageRef {
    pub fn new(segment: Arc<Segment>, idx: usize) -> Self {
        Self { segment, idx }
    }

    pub fn page(&self) -> &Page {
        &self.segment.pages[self.idx]
    }

    pub fn same(&self, other: &PageRef) -> bool {
        Arc::ptr_eq(&self.segment, &other.segment) && self.idx == other.idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_page() -> Page {
        let page = Page::new(PAGE_SIZE * 64, 2);
        page.init(9, 128);
        page
    }

    #[test]
    fn test_init_capacity_and_free_order() {
        let page = test_page();
        assert_eq!(page.capacity(), PAGE_SIZE / 128);
        let mut local = page.local.lock();
        assert_eq!(local.free.len(), page.capacity());
        // blocks come off the free list lowest-address first
        assert_eq!(local.free.pop(), Some(0));
        assert_eq!(local.free.pop(), Some(1));
    }

    #[test]
    fn test_single_block_page() {
        let page = Page::new(PAGE_SIZE * 64, 0);
        page.init(9, PAGE_SIZE);
        assert_eq!(page.capacity(), 1);
    }

    #[test]
    fn test_block_index_requires_exact_base() {
        let page = test_page();
        let start = page.start();
        assert_eq!(page.block_index(start), Some(0));
        assert_eq!(page.block_index(start + 128), Some(1));
        assert_eq!(page.block_index(start + 129), None);
        assert_eq!(page.block_index(start.wrapping_sub(128)), None);
        assert_eq!(page.block_index(start + PAGE_SIZE), None);
    }

    #[test]
    fn test_thread_free_push_and_collect() {
        let page = test_page();
        // hand out three blocks
        {
            let mut local = page.local.lock();
            for _ in 0..3 {
                local.free.pop();
            }
            local.used = 3;
        }
        let start = page.start();
        page.thread_free_push(start);
        page.thread_free_push(start + 256);
        let mut local = page.local.lock();
        let merged = page.collect_free(&mut local, false);
        assert_eq!(merged, 2);
        assert_eq!(local.used, 1);
        assert!(local.free.contains(&0));
        assert!(local.free.contains(&2));
    }

    #[test]
    fn test_collect_free_merges_local_free_when_dry() {
        let page = test_page();
        let mut local = page.local.lock();
        local.free.clear();
        local.used = page.capacity();
        local.local_free.push(4);
        page.collect_free(&mut local, false);
        assert_eq!(local.free, vec![4]);
        assert!(local.local_free.is_empty());
    }

    #[test]
    fn test_reset_clears_everything() {
        let page = test_page();
        page.thread_free_push(page.start());
        page.reset();
        assert_eq!(page.heap.load(Ordering::Relaxed), 0);
        assert_eq!(page.block_size(), 0);
        assert_eq!(page.capacity(), 0);
        assert_eq!(page.block_index(page.start()), None);
        assert_eq!(page.local.lock().reserved, 0);
    }
}

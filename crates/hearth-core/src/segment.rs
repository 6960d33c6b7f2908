//! Segments and the segment arena.
//!
//! A segment is an aligned slice of the logical address space carved into
//! fixed-size pages. The arena hands out segment ranges, resolves block
//! addresses back to segments, and keeps a cache of released regions. Each
//! thread additionally caches its own fully-free segments in its descriptor
//! so page churn does not round-trip through the process-wide maps.
//!
//! Segment ranges are validated by a cookie derived from the process cookie
//! and the segment base, so a dangling or fabricated address fails
//! resolution instead of yielding a bogus page.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::HeapError;
use crate::page::{Page, PageRef};

pub(crate) const SEGMENT_SHIFT: usize = 22;
/// Segment span in the logical address space (4 MiB).
pub(crate) const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;

pub(crate) const PAGE_SHIFT: usize = 16;
/// Page span in the logical address space (64 KiB).
pub(crate) const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub(crate) const PAGES_PER_SEGMENT: usize = SEGMENT_SIZE >> PAGE_SHIFT;

/// First segment base; the zero segment is never handed out so that 0 can
/// serve as the null block address.
const FIRST_SEGMENT_BASE: usize = SEGMENT_SIZE;

/// An aligned run of pages.
pub(crate) struct Segment {
    pub base: usize,
    /// `process_cookie ^ base`; checked on every address resolution.
    pub cookie: u64,
    /// Thread currently owning this segment's lifetime.
    pub thread_id: AtomicU64,
    used: AtomicUsize,
    free_slots: Mutex<Vec<usize>>,
    pub pages: Vec<Page>,
}

impl Segment {
    fn new(base: usize, process_cookie: u64, thread_id: u64) -> Self {
        Self {
            base,
            cookie: process_cookie ^ base as u64,
            thread_id: AtomicU64::new(thread_id),
            used: AtomicUsize::new(0),
            free_slots: Mutex::new((0..PAGES_PER_SEGMENT).rev().collect()),
            pages: (0..PAGES_PER_SEGMENT).map(|i| Page::new(base, i)).collect(),
        }
    }

    pub fn cookie_matches(&self, process_cookie: u64) -> bool {
        self.cookie == process_cookie ^ self.base as u64
    }

    pub fn page_index_of(&self, p: usize) -> usize {
        (p - self.base) >> PAGE_SHIFT
    }

    pub fn page_of(&self, p: usize) -> &Page {
        &self.pages[self.page_index_of(p)]
    }

    pub fn used_pages(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn claim_slot(&self) -> Option<usize> {
        let idx = self.free_slots.lock().pop()?;
        self.used.fetch_add(1, Ordering::Relaxed);
        Some(idx)
    }

    fn release_slot(&self, idx: usize) {
        self.free_slots.lock().push(idx);
        self.used.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Process-wide segment address space.
pub(crate) struct SegmentArena {
    segments: RwLock<BTreeMap<usize, Arc<Segment>>>,
    region_cache: Mutex<Vec<usize>>,
    next_base: AtomicUsize,
}

impl SegmentArena {
    pub fn new() -> Self {
        Self {
            segments: RwLock::new(BTreeMap::new()),
            region_cache: Mutex::new(Vec::new()),
            next_base: AtomicUsize::new(FIRST_SEGMENT_BASE),
        }
    }

    /// Resolves an address to its enclosing live segment.
    pub fn segment_of(&self, p: usize) -> Option<Arc<Segment>> {
        let base = p & !(SEGMENT_SIZE - 1);
        self.segments.read().get(&base).cloned()
    }

    fn reserve_base(&self) -> Result<usize, HeapError> {
        if let Some(base) = self.region_cache.lock().pop() {
            return Ok(base);
        }
        let mut cur = self.next_base.load(Ordering::Relaxed);
        loop {
            let next = cur
                .checked_add(SEGMENT_SIZE)
                .ok_or(HeapError::AddressSpaceExhausted)?;
            match self
                .next_base
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Ok(cur),
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn allocate_segment(
        &self,
        thread_id: u64,
        process_cookie: u64,
    ) -> Result<Arc<Segment>, HeapError> {
        let base = self.reserve_base()?;
        let segment = Arc::new(Segment::new(base, process_cookie, thread_id));
        self.segments.write().insert(base, segment.clone());
        Ok(segment)
    }

    /// Drops a fully-free segment from the resolution map and recycles its
    /// address range.
    pub fn release_region(&self, segment: &Arc<Segment>) {
        debug_assert_eq!(segment.used_pages(), 0);
        self.segments.write().remove(&segment.base);
        self.region_cache.lock().push(segment.base);
    }

    pub fn region_cache_len(&self) -> usize {
        self.region_cache.lock().len()
    }

    /// Releases all cached regions; the main-thread-only step of a forced
    /// collect. Returns how many regions were dropped.
    pub fn collect_regions(&self) -> usize {
        let mut cache = self.region_cache.lock();
        let n = cache.len();
        cache.clear();
        n
    }
}

/// Per-thread segment bookkeeping, shared by all heaps of one thread.
pub(crate) struct SegmentTld {
    /// Segments owned by this thread that still hold pages in use.
    pub live: Vec<Arc<Segment>>,
    /// Fully-free segments cached for reuse by this thread.
    pub cached: Vec<Arc<Segment>>,
}

impl SegmentTld {
    pub fn new() -> Self {
        Self {
            live: Vec::new(),
            cached: Vec::new(),
        }
    }
}

/// Claims a page slot for the given thread, preferring partially-used
/// segments, then cached ones, then a fresh segment from the arena.
///
/// The boolean is true when a fresh segment had to be allocated.
pub(crate) fn page_alloc(
    tld: &mut SegmentTld,
    arena: &SegmentArena,
    thread_id: u64,
    process_cookie: u64,
) -> Result<(PageRef, bool), HeapError> {
    for segment in &tld.live {
        if segment.used_pages() < PAGES_PER_SEGMENT {
            if let Some(idx) = segment.claim_slot() {
                return Ok((PageRef::new(segment.clone(), idx), false));
            }
        }
    }
    while let Some(segment) = tld.cached.pop() {
        if let Some(idx) = segment.claim_slot() {
            tld.live.push(segment.clone());
            return Ok((PageRef::new(segment, idx), false));
        }
    }
    let segment = arena.allocate_segment(thread_id, process_cookie)?;
    let idx = segment
        .claim_slot()
        .ok_or(HeapError::AddressSpaceExhausted)?;
    tld.live.push(segment.clone());
    Ok((PageRef::new(segment, idx), true))
}

/// Returns an empty page to its segment. A segment whose last page goes
/// free moves to the thread cache, or straight back to the arena's region
/// cache when `force` is set.
pub(crate) fn page_free(
    pref: &PageRef,
    force: bool,
    tld: &mut SegmentTld,
    arena: &SegmentArena,
) {
    pref.page().reset();
    let segment = &pref.segment;
    segment.release_slot(pref.idx);
    if segment.used_pages() == 0 {
        tld.live.retain(|s| !Arc::ptr_eq(s, segment));
        if force {
            arena.release_region(segment);
        } else {
            tld.cached.push(segment.clone());
        }
    }
}

/// Releases this thread's cached segments back to the arena's region cache.
/// Returns how many segments were released.
pub(crate) fn thread_collect(tld: &mut SegmentTld, arena: &SegmentArena) -> usize {
    let mut released = 0;
    while let Some(segment) = tld.cached.pop() {
        arena.release_region(&segment);
        released += 1;
    }
    released
}

/// Transfers segment ownership from one thread descriptor to another
/// (abandoned-heap reclamation). Returns how many segments moved.
pub(crate) fn absorb(thread_id: u64, to: &mut SegmentTld, from: &mut SegmentTld) -> usize {
    let mut moved = 0;
    for segment in from.live.drain(..) {
        segment.thread_id.store(thread_id, Ordering::Release);
        to.live.push(segment);
        moved += 1;
    }
    for segment in from.cached.drain(..) {
        segment.thread_id.store(thread_id, Ordering::Release);
        to.cached.push(segment);
        moved += 1;
    }
    moved
}

//! Heaps and their lifecycle.
//!
//! A heap owns a set of page queues, a delayed-free channel, and identity
//! (owner thread, cookie, link keys). The lifecycle operations compose the
//! smaller pieces: collect drains pending work, delete transfers live pages
//! to the thread's backing heap, destroy bulk-releases storage, thread exit
//! abandons populated backing heaps, and collect opportunistically reclaims
//! heaps other threads abandoned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{decode_link, WORD_SIZE};
use crate::config::{self, ReclaimMode};
use crate::delayed::DelayedFree;
use crate::error::HeapError;
use crate::page::PageRef;
use crate::queue::PageQueues;
use crate::random::RandomCtx;
use crate::runtime::runtime;
use crate::segment;
use crate::size_class::{bin_index, bin_size, BIN_COUNT, BIN_FULL};
use crate::stats::HeapStats;
use crate::thread::{self, Tld};
use crate::trace::HeapLogLevel;
use crate::visit::{self, BlockVisitor};

/// Collect depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Collect {
    Normal,
    Force,
    Abandon,
}

impl Collect {
    fn label(self) -> &'static str {
        match self {
            Collect::Normal => "normal",
            Collect::Force => "force",
            Collect::Abandon => "abandon",
        }
    }
}

/// A per-thread allocation heap.
pub struct Heap {
    pub(crate) id: u64,
    pub(crate) thread_id: AtomicU64,
    pub(crate) tld: Option<Arc<Tld>>,
    /// Refuses to absorb abandoned heaps; the precondition for `destroy`.
    pub(crate) no_reclaim: bool,
    pub(crate) cookie: u64,
    /// Obfuscation keys for the delayed-free links.
    pub(crate) keys: [usize; 2],
    pub(crate) random: Mutex<RandomCtx>,
    pub(crate) pages: Mutex<PageQueues>,
    pub(crate) delayed_free: DelayedFree,
    /// Link used only while this heap sits on the abandoned stack.
    pub(crate) abandoned_next: AtomicU64,
}

impl Heap {
    /// The canonical inert heap image: no descriptor, every operation a
    /// no-op.
    pub(crate) fn empty() -> Heap {
        Heap {
            id: 0,
            thread_id: AtomicU64::new(0),
            tld: None,
            no_reclaim: true,
            cookie: 0,
            keys: [0, 0],
            random: Mutex::new(RandomCtx::from_seed(0)),
            pages: Mutex::new(PageQueues::new()),
            delayed_free: DelayedFree::new(),
            abandoned_next: AtomicU64::new(0),
        }
    }

    fn create(tld: Arc<Tld>, random: RandomCtx, no_reclaim: bool) -> Arc<Heap> {
        let rt = runtime();
        let mut heap = Heap::empty();
        heap.id = rt.next_heap_id();
        heap.thread_id = AtomicU64::new(tld.thread_id);
        heap.tld = Some(tld);
        heap.no_reclaim = no_reclaim;
        heap.random = Mutex::new(random);
        heap.cookie = heap.random_next() | 1;
        heap.keys = [heap.random_next() as usize, heap.random_next() as usize];
        let heap = Arc::new(heap);
        rt.register_heap(&heap);
        heap
    }

    /// Creates a fresh heap for the calling thread.
    ///
    /// The new heap draws its PRNG state by splitting the backing heap's,
    /// and is marked `no_reclaim`: it never absorbs abandoned heaps, which
    /// is what makes a later [`destroy`](Heap::destroy) safe.
    pub fn new() -> Arc<Heap> {
        let backing = thread::get_backing();
        let tld = backing
            .tld
            .clone()
            .expect("backing heap is initialized");
        let random = backing.random.lock().split();
        let heap = Heap::create(tld.clone(), random, true);
        tld.stats.lock().heaps_created += 1;
        tld.record(
            HeapLogLevel::Trace,
            "create",
            "child",
            heap.id,
            0,
            "success",
            "",
        );
        heap
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// A heap is initialized iff its thread descriptor is bound.
    pub fn is_initialized(&self) -> bool {
        self.tld.is_some()
    }

    pub(crate) fn tld(&self) -> Option<&Arc<Tld>> {
        self.tld.as_ref()
    }

    /// Number of pages currently linked from this heap's queues.
    pub fn page_count(&self) -> usize {
        self.pages.lock().page_count
    }

    pub(crate) fn page_snapshot(&self) -> Vec<PageRef> {
        self.pages.lock().snapshot()
    }

    /// Draws the next value from this heap's PRNG.
    pub(crate) fn random_next(&self) -> u64 {
        self.random.lock().next_u64()
    }

    /// Drains pending work for this heap; with `force`, additionally
    /// releases cached segments (and cached regions on the main thread).
    pub fn collect(&self, force: bool) {
        collect_ex(self, if force { Collect::Force } else { Collect::Normal });
    }

    /// Allocates a block of at least `size` bytes from this heap.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        self.try_allocate(size).ok()
    }

    /// Allocation with an explicit failure reason.
    pub fn try_allocate(&self, size: usize) -> Result<usize, HeapError> {
        if self.tld.is_none() {
            return Err(HeapError::Uninitialized);
        }
        let bin = bin_index(size);
        if bin >= BIN_COUNT {
            return Err(HeapError::AllocationTooLarge { size });
        }
        if let Some(addr) = try_page_alloc(self, bin) {
            return Ok(addr);
        }
        // Slow path: drain pending work (this is also where abandoned heaps
        // get picked up), then retry before taking a fresh page.
        collect_ex(self, Collect::Normal);
        if let Some(addr) = try_page_alloc(self, bin) {
            return Ok(addr);
        }
        fresh_page_alloc(self, bin)
    }

    /// Safe delete: live pages move to the thread's backing heap (or are
    /// abandoned when this *is* the backing heap); outstanding blocks stay
    /// valid.
    pub fn delete(&self) {
        let Some(tld) = &self.tld else {
            return;
        };
        let is_backing = tld.heap_backing.load(Ordering::Relaxed) == self.id;
        if !is_backing {
            if let Some(backing) = runtime().heap(tld.heap_backing.load(Ordering::Relaxed)) {
                absorb(&backing, self);
            }
            debug_assert_eq!(self.page_count(), 0);
            tld.record(
                HeapLogLevel::Debug,
                "delete",
                "absorbed_into_backing",
                self.id,
                0,
                "success",
                "",
            );
        } else {
            collect_abandon(self);
        }
        heap_release(self);
    }

    /// Unsafe bulk destroy: every page's storage is revoked without regard
    /// to live blocks. Downgrades to a safe delete unless the heap was
    /// created `no_reclaim`.
    pub fn destroy(&self) {
        let Some(tld) = &self.tld else {
            return;
        };
        if !self.no_reclaim {
            // may contain pages reclaimed from other threads
            tld.record(
                HeapLogLevel::Warn,
                "destroy",
                "downgraded_to_delete",
                self.id,
                self.page_count(),
                "downgraded",
                "heap may hold reclaimed pages",
            );
            self.delete();
            return;
        }
        destroy_pages(self);
        tld.record(
            HeapLogLevel::Debug,
            "destroy",
            "pages_destroyed",
            self.id,
            0,
            "success",
            "",
        );
        heap_release(self);
    }

    /// True iff `p` lies in a page of this heap.
    pub fn contains_block(&self, p: usize) -> bool {
        if self.tld.is_none() {
            return false;
        }
        heap_of_block(p) == Some(self.id)
    }

    /// Stricter than [`contains_block`](Heap::contains_block): `p` must be
    /// the base of a currently allocated block of this heap. Only
    /// word-aligned pointers are ever reported owned; a block sitting on a
    /// free list is not.
    pub fn check_owned(&self, p: usize) -> bool {
        if self.tld.is_none() {
            return false;
        }
        if p == 0 || p % WORD_SIZE != 0 {
            return false;
        }
        for pref in self.page_snapshot() {
            let page = pref.page();
            let block_size = page.block_size();
            if block_size == 0 {
                continue;
            }
            let start = page.start();
            let end = start + page.capacity() * block_size;
            if p < start || p >= end {
                continue;
            }
            let offset = p - start;
            if offset % block_size != 0 {
                return false;
            }
            let idx = offset / block_size;
            let local = page.local.lock();
            let map = visit::free_bitmap(&local.free, &local.local_free, page.capacity());
            return (map[idx / 64] >> (idx % 64)) & 1 == 0;
        }
        false
    }

    /// Walks every heap area (one per page) and optionally every live block
    /// within. The walk stops early when the visitor returns false.
    pub fn visit_blocks(&self, visit_blocks: bool, visitor: &mut dyn BlockVisitor) -> bool {
        visit::visit_blocks(self, visit_blocks, visitor)
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.id)
            .field("thread_id", &self.thread_id.load(Ordering::Relaxed))
            .field("initialized", &self.is_initialized())
            .field("no_reclaim", &self.no_reclaim)
            .field("page_count", &self.page_count())
            .finish()
    }
}

/// Creates the backing heap for a fresh thread descriptor.
pub(crate) fn new_backing(tld: Arc<Tld>) -> Arc<Heap> {
    let random = runtime().root_random.lock().split();
    let heap = Heap::create(tld.clone(), random, false);
    tld.stats.lock().heaps_created += 1;
    tld.record(
        HeapLogLevel::Trace,
        "create",
        "backing",
        heap.id,
        0,
        "success",
        "",
    );
    heap
}

/// Frees a block through the generic path: local free on the owning
/// thread, otherwise delivery to whichever heap the page currently names.
/// Unknown or misaligned pointers are ignored.
pub fn free(p: usize) {
    if p == 0 {
        return;
    }
    let rt = runtime();
    let Some(segment) = rt.arena.segment_of(p) else {
        return;
    };
    if !segment.cookie_matches(rt.process_cookie) {
        return;
    }
    let pref = PageRef::new(segment.clone(), segment.page_index_of(p));
    let heap_id = pref.page().heap.load(Ordering::Acquire);
    let Some(heap) = rt.heap(heap_id) else {
        // the owner moved on mid-route; retry against the current owner
        let rehomed = pref.page().heap.load(Ordering::Acquire);
        if rehomed == heap_id {
            return;
        }
        if let Some(heap) = rt.heap(rehomed) {
            free_to_heap(&heap, &pref, p);
        }
        return;
    };
    free_to_heap(&heap, &pref, p);
}

fn free_to_heap(heap: &Arc<Heap>, pref: &PageRef, p: usize) {
    if heap.thread_id.load(Ordering::Relaxed) == thread::current_thread_id() {
        free_local(heap, pref, p);
    } else if pref.page().in_full.load(Ordering::Acquire) {
        // full pages need heap-level attention; queue on the delayed channel
        if !heap.delayed_free.push(pref.page(), p, heap.keys) {
            // the heap was absorbed mid-route; the page's own channel is
            // drained by whichever heap owns it now
            pref.page().thread_free_push(p);
        }
    } else {
        pref.page().thread_free_push(p);
    }
}

fn free_local(heap: &Heap, pref: &PageRef, p: usize) {
    let page = pref.page();
    let Some(idx) = page.block_index(p) else {
        return;
    };
    let (now_empty, was_full) = {
        let mut local = page.local.lock();
        if local.used == 0 {
            return;
        }
        local.used -= 1;
        local.local_free.push(idx);
        (local.used == 0, page.in_full.load(Ordering::Relaxed))
    };
    if was_full {
        page_unfull(heap, pref);
    }
    if now_empty {
        page_retire(heap, pref);
    }
}

fn try_page_alloc(heap: &Heap, bin: usize) -> Option<usize> {
    let mut queues = heap.pages.lock();
    let mut chosen = None;
    for pref in queues.bin(bin).pages.iter() {
        let page = pref.page();
        let mut local = page.local.lock();
        page.collect_free(&mut local, false);
        if let Some(idx) = local.free.pop() {
            local.used += 1;
            let became_full = local.free.is_empty()
                && local.local_free.is_empty()
                && local.used == page.capacity();
            chosen = Some((pref.clone(), page.block_addr(idx), became_full));
            break;
        }
    }
    let (pref, addr, became_full) = chosen?;
    if became_full {
        pref.page().in_full.store(true, Ordering::Release);
        queues.move_to(&pref, bin, BIN_FULL);
    }
    Some(addr)
}

fn fresh_page_alloc(heap: &Heap, bin: usize) -> Result<usize, HeapError> {
    let Some(tld) = &heap.tld else {
        return Err(HeapError::Uninitialized);
    };
    let rt = runtime();
    let (pref, fresh_segment) = {
        let mut segments = tld.segments.lock();
        segment::page_alloc(
            &mut segments,
            &rt.arena,
            heap.thread_id.load(Ordering::Relaxed),
            rt.process_cookie,
        )?
    };
    if fresh_segment {
        tld.stats.lock().segments_allocated += 1;
    }
    pref.page().init(heap.id, bin_size(bin));

    let mut queues = heap.pages.lock();
    queues.push(bin, pref.clone());
    let page = pref.page();
    let addr = {
        let mut local = page.local.lock();
        let Some(idx) = local.free.pop() else {
            return Err(HeapError::AddressSpaceExhausted);
        };
        local.used += 1;
        page.block_addr(idx)
    };
    if page.capacity() == 1 {
        // a single-block page is immediately full
        page.in_full.store(true, Ordering::Release);
        queues.move_to(&pref, bin, BIN_FULL);
    }
    Ok(addr)
}

fn page_unfull(heap: &Heap, pref: &PageRef) {
    let page = pref.page();
    let mut queues = heap.pages.lock();
    if !page.in_full.load(Ordering::Relaxed) {
        return;
    }
    let bin = bin_index(page.block_size().max(1));
    if queues.move_to(pref, BIN_FULL, bin) {
        page.in_full.store(false, Ordering::Release);
    }
}

fn page_retire(heap: &Heap, pref: &PageRef) {
    {
        let mut queues = heap.pages.lock();
        if !queues.remove(pref) {
            return;
        }
    }
    let Some(tld) = &heap.tld else {
        return;
    };
    {
        let mut segments = tld.segments.lock();
        segment::page_free(pref, false, &mut segments, &runtime().arena);
    }
    tld.stats.lock().pages_retired += 1;
}

/// Drains the heap's delayed-free channel back into its pages. Returns the
/// number of blocks recovered.
fn delayed_drain(heap: &Heap) -> usize {
    let rt = runtime();
    let mut block = heap.delayed_free.take_all();
    let mut drained = 0usize;
    while block != 0 {
        let Some(segment) = rt.arena.segment_of(block) else {
            debug_assert!(false, "delayed block {block:#x} lost its segment");
            break;
        };
        let pref = PageRef::new(segment.clone(), segment.page_index_of(block));
        let page = pref.page();
        let Some(idx) = page.block_index(block) else {
            debug_assert!(false, "delayed block {block:#x} is not a block base");
            break;
        };
        // read the link before the block is handed back
        let next = decode_link(page.read_word(idx), heap.keys);
        debug_assert_eq!(page.heap.load(Ordering::Relaxed), heap.id);
        free_local(heap, &pref, block);
        drained += 1;
        block = next;
    }
    if drained > 0 {
        if let Some(tld) = &heap.tld {
            tld.stats.lock().delayed_blocks += drained as u64;
        }
    }
    drained
}

fn collect_retired(heap: &Heap, force: bool) {
    for pref in heap.page_snapshot() {
        let page = pref.page();
        if page.heap.load(Ordering::Acquire) != heap.id {
            continue;
        }
        let (now_empty, was_full, has_space) = {
            let mut local = page.local.lock();
            page.collect_free(&mut local, force);
            (
                local.used == 0,
                page.in_full.load(Ordering::Relaxed),
                !local.free.is_empty(),
            )
        };
        if now_empty {
            page_retire(heap, &pref);
        } else if was_full && has_space {
            page_unfull(heap, &pref);
        }
    }
}

pub(crate) fn collect_ex(heap: &Heap, mode: Collect) {
    let Some(tld) = &heap.tld else {
        return;
    };
    let rt = runtime();

    // client deferred-free callback first
    let beat = rt.heartbeat.fetch_add(1, Ordering::Relaxed);
    let hook = rt.deferred.read().clone();
    if let Some(hook) = hook {
        hook(mode > Collect::Normal, beat);
    }

    // absorb outstanding abandoned heaps (but not when abandoning)
    if mode != Collect::Abandon && config::options().reclaim == ReclaimMode::Eager {
        try_reclaim_abandoned(heap, mode == Collect::Force);
    }

    // free delayed blocks, then retire pages that became empty
    delayed_drain(heap);
    collect_retired(heap, mode >= Collect::Force);
    debug_assert!(validate(heap));

    // collect segment caches
    if mode >= Collect::Force {
        let released = {
            let mut segments = tld.segments.lock();
            segment::thread_collect(&mut segments, &rt.arena)
        };
        if released > 0 {
            tld.stats.lock().segments_released += released as u64;
        }
    }

    // collect regions
    if mode >= Collect::Force && tld.is_main {
        rt.arena.collect_regions();
    }

    tld.record(
        HeapLogLevel::Trace,
        "collect",
        mode.label(),
        heap.id,
        heap.page_count(),
        "success",
        "",
    );
}

/// Transfers all pages and the delayed-free channel of `from` into `to`.
///
/// Pages move first: a remote free racing this call lands either on
/// `from`'s channel (captured by the steal below) or, once it observes the
/// re-homed page, on `to`'s — a later drain on `to` sweeps both sources.
pub(crate) fn absorb(to: &Heap, from: &Heap) {
    if from.page_count() == 0 {
        return;
    }
    {
        // lock order by heap id keeps concurrent absorbs deadlock-free
        let (mut to_queues, mut from_queues) = if to.id < from.id {
            let t = to.pages.lock();
            let f = from.pages.lock();
            (t, f)
        } else {
            let f = from.pages.lock();
            let t = to.pages.lock();
            (t, f)
        };
        to_queues.append_from(&mut from_queues, to.id);
    }

    // steal the delayed channel and re-encode it under our keys
    absorb_delayed(to, from);

    from.pages.lock().reset();
    if let Some(tld) = &to.tld {
        tld.stats.lock().heaps_absorbed += 1;
    }
    debug_assert!(validate(to));
}

/// Steals `from`'s delayed channel (sealing it against late producers),
/// re-encodes every link under `to`'s keys (walking under `from`'s), and
/// prepends the chain onto `to`'s channel. Tolerates concurrent remote
/// prepends on `to`.
fn absorb_delayed(to: &Heap, from: &Heap) {
    let first = from.delayed_free.seal();
    if first == 0 {
        return;
    }
    let rt = runtime();
    let mut chain: Vec<(PageRef, usize)> = Vec::new();
    let mut block = first;
    while block != 0 {
        let Some(segment) = rt.arena.segment_of(block) else {
            break;
        };
        let pref = PageRef::new(segment.clone(), segment.page_index_of(block));
        let Some(idx) = pref.page().block_index(block) else {
            break;
        };
        let next = decode_link(pref.page().read_word(idx), from.keys);
        chain.push((pref, idx));
        block = next;
    }
    for pair in chain.windows(2) {
        let (ref page_a, idx_a) = pair[0];
        let (ref page_b, idx_b) = pair[1];
        let next_block = page_b.page().block_addr(idx_b);
        page_a
            .page()
            .link_word(idx_a, crate::block::encode_link(next_block, to.keys));
    }
    if let Some((tail_pref, tail_idx)) = chain.last() {
        to.delayed_free.prepend_chain(first, |head| {
            tail_pref
                .page()
                .link_word(*tail_idx, crate::block::encode_link(head, to.keys));
        });
    }
}

/// Thread-exit path for a backing heap: final collect, stats
/// finalization, then immediate release or publication on the abandoned
/// stack.
pub(crate) fn collect_abandon(heap: &Heap) {
    let Some(tld) = &heap.tld else {
        return;
    };
    debug_assert_eq!(tld.heap_backing.load(Ordering::Relaxed), heap.id);
    collect_ex(heap, Collect::Abandon);

    let rt = runtime();
    {
        // finalize this thread's counters
        let mut stats = tld.stats.lock();
        rt.process_stats.lock().merge(&stats);
        *stats = HeapStats::default();
    }

    if heap.page_count() == 0 {
        backing_release(heap);
        return;
    }
    // still live blocks: publish on the abandoned stack; from here the heap
    // is read-only for this thread
    tld.record(
        HeapLogLevel::Info,
        "abandon",
        "published",
        heap.id,
        heap.page_count(),
        "success",
        "",
    );
    rt.process_stats.lock().heaps_abandoned += 1;
    heap.abandoned_next.store(0, Ordering::Relaxed);
    rt.abandoned.prepend(rt, heap.id);
}

/// Claims abandoned heaps and absorbs them into `heap`: one when `all` is
/// false, the entire stack otherwise.
pub(crate) fn try_reclaim_abandoned(heap: &Heap, all: bool) {
    if heap.no_reclaim {
        return;
    }
    let rt = runtime();
    // cheap pre-read; the claim below is what counts
    if rt.abandoned.peek_empty() {
        return;
    }
    let mut claim = rt.abandoned.claim_all();
    if claim == 0 {
        return;
    }
    if !all {
        // pop one and prepend the remainder; O(n) but the stack stays short
        if let Some(first) = rt.heap(claim) {
            let rest = first.abandoned_next.load(Ordering::Relaxed);
            first.abandoned_next.store(0, Ordering::Relaxed);
            rt.abandoned.prepend(rt, rest);
        }
    }
    let mut reclaimed = 0u64;
    while claim != 0 {
        let Some(other) = rt.heap(claim) else {
            debug_assert!(false, "abandoned heap {claim} not registered");
            break;
        };
        let next = other.abandoned_next.load(Ordering::Relaxed);
        other.abandoned_next.store(0, Ordering::Relaxed);
        absorb(heap, &other);
        if let (Some(to_tld), Some(from_tld)) = (&heap.tld, &other.tld) {
            {
                let mut to_segments = to_tld.segments.lock();
                let mut from_segments = from_tld.segments.lock();
                segment::absorb(
                    heap.thread_id.load(Ordering::Relaxed),
                    &mut to_segments,
                    &mut from_segments,
                );
            }
            // merge the dead thread's leftover counters
            let mut from_stats = from_tld.stats.lock();
            to_tld.stats.lock().merge(&from_stats);
            *from_stats = HeapStats::default();
        }
        other.thread_id.store(heap.thread_id.load(Ordering::Relaxed), Ordering::Release);
        backing_release(&other);
        reclaimed += 1;
        claim = next;
    }
    if reclaimed > 0 {
        if let Some(tld) = &heap.tld {
            tld.stats.lock().heaps_reclaimed += reclaimed;
            tld.record(
                HeapLogLevel::Info,
                "reclaim",
                if all { "all" } else { "one" },
                heap.id,
                heap.page_count(),
                "success",
                format!("reclaimed={reclaimed}"),
            );
        }
    }
}

/// Walks every page pretending it is empty and returns its storage to the
/// segment layer. Callers guarantee remote frees to this heap are quiescent.
pub(crate) fn destroy_pages(heap: &Heap) {
    let Some(tld) = &heap.tld else {
        return;
    };
    let snapshot = heap.page_snapshot();
    let mut destroyed = 0u64;
    for pref in &snapshot {
        let mut segments = tld.segments.lock();
        segment::page_free(pref, false, &mut segments, &runtime().arena);
        destroyed += 1;
    }
    heap.pages.lock().reset();
    if destroyed > 0 {
        tld.stats.lock().pages_destroyed += destroyed;
    }
}

/// Releases a non-backing heap's shell: resets the thread default if
/// needed and drops the registry entry. Backing heaps are released with
/// their thread instead.
fn heap_release(heap: &Heap) {
    let Some(tld) = &heap.tld else {
        return;
    };
    if tld.heap_backing.load(Ordering::Relaxed) == heap.id {
        return;
    }
    if heap.thread_id.load(Ordering::Relaxed) == thread::current_thread_id()
        && thread::is_current_default(heap.id)
    {
        if let Some(backing) = runtime().heap(tld.heap_backing.load(Ordering::Relaxed)) {
            thread::set_default_direct(backing);
        }
    }
    runtime().remove_heap(heap.id);
}

fn backing_release(heap: &Heap) {
    runtime().remove_heap(heap.id);
}

/// Thread-exit hook. A backing heap that was already released (deleted
/// empty mid-thread) is skipped.
pub(crate) fn thread_done(backing: &Arc<Heap>) {
    if runtime().heap(backing.id).is_none() {
        return;
    }
    collect_abandon(backing);
}

fn heap_of_block(p: usize) -> Option<u64> {
    if p == 0 {
        return None;
    }
    let rt = runtime();
    let segment = rt.arena.segment_of(p)?;
    if !segment.cookie_matches(rt.process_cookie) {
        return None;
    }
    let heap_id = segment.page_of(p).heap.load(Ordering::Acquire);
    if heap_id == 0 {
        None
    } else {
        Some(heap_id)
    }
}

/// Structural invariants: the page count matches the queues and every
/// linked page names this heap as its owner.
pub(crate) fn validate(heap: &Heap) -> bool {
    let queues = heap.pages.lock();
    let snapshot = queues.snapshot();
    if snapshot.len() != queues.page_count {
        return false;
    }
    snapshot
        .iter()
        .all(|pref| pref.page().heap.load(Ordering::Relaxed) == heap.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::MAX_BLOCK_SIZE;

    #[test]
    fn test_empty_template_is_inert() {
        let heap = Arc::new(Heap::empty());
        assert!(!heap.is_initialized());
        assert_eq!(heap.try_allocate(32), Err(HeapError::Uninitialized));
        heap.collect(true);
        heap.delete();
        heap.destroy();
        assert!(!heap.contains_block(0x1000));
        assert!(!heap.check_owned(0x1000));
        assert_eq!(heap.page_count(), 0);
    }

    #[test]
    fn test_new_heap_identity() {
        let heap = Heap::new();
        assert!(heap.is_initialized());
        assert!(heap.no_reclaim);
        assert_eq!(heap.cookie & 1, 1);
        assert_eq!(
            heap.thread_id.load(Ordering::Relaxed),
            thread::current_thread_id()
        );
        let sibling = Heap::new();
        assert_ne!(heap.id(), sibling.id());
        assert_ne!(heap.cookie, sibling.cookie);
        assert_ne!(heap.keys, sibling.keys);
        sibling.delete();
        heap.delete();
    }

    #[test]
    fn test_allocate_free_roundtrip() {
        let heap = Heap::new();
        let p = heap.allocate(32).unwrap();
        assert_eq!(heap.page_count(), 1);
        assert!(heap.contains_block(p));
        assert!(heap.check_owned(p));
        assert!(!heap.check_owned(p + 8));

        free(p);
        // the page emptied and was retired
        assert_eq!(heap.page_count(), 0);
        assert!(!heap.contains_block(p));
        heap.delete();
    }

    #[test]
    fn test_distinct_blocks_same_page() {
        let heap = Heap::new();
        let a = heap.allocate(48).unwrap();
        let b = heap.allocate(48).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.page_count(), 1);
        free(a);
        assert!(heap.check_owned(b));
        assert!(!heap.check_owned(a));
        free(b);
        heap.delete();
    }

    #[test]
    fn test_allocation_too_large() {
        let heap = Heap::new();
        assert_eq!(
            heap.try_allocate(MAX_BLOCK_SIZE + 1),
            Err(HeapError::AllocationTooLarge {
                size: MAX_BLOCK_SIZE + 1
            })
        );
        heap.delete();
    }

    #[test]
    fn test_single_block_page_goes_full() {
        let heap = Heap::new();
        let p = heap.allocate(MAX_BLOCK_SIZE).unwrap();
        assert_eq!(heap.page_count(), 1);
        {
            let queues = heap.pages.lock();
            assert_eq!(queues.bin(BIN_FULL).pages.len(), 1);
        }
        free(p);
        assert_eq!(heap.page_count(), 0);
        heap.delete();
    }

    #[test]
    fn test_full_page_unfulls_on_local_free() {
        let heap = Heap::new();
        // fill one page of the largest multi-block class exactly
        let bin = bin_index(32 * 1024);
        let capacity = crate::segment::PAGE_SIZE / bin_size(bin);
        let blocks: Vec<usize> = (0..capacity).map(|_| heap.allocate(32 * 1024).unwrap()).collect();
        assert_eq!(heap.page_count(), 1);
        {
            let queues = heap.pages.lock();
            assert_eq!(queues.bin(BIN_FULL).pages.len(), 1);
        }
        free(blocks[0]);
        {
            let queues = heap.pages.lock();
            assert!(queues.bin(BIN_FULL).pages.is_empty());
            assert_eq!(queues.bin(bin).pages.len(), 1);
        }
        for &b in &blocks[1..] {
            free(b);
        }
        assert_eq!(heap.page_count(), 0);
        heap.delete();
    }

    #[test]
    fn test_absorb_is_additive() {
        let a = Heap::new();
        let b = Heap::new();
        let pa = a.allocate(64).unwrap();
        let pb1 = b.allocate(64).unwrap();
        let pb2 = b.allocate(MAX_BLOCK_SIZE).unwrap();
        let before_a = a.page_count();
        let before_b = b.page_count();
        assert_eq!(before_b, 2);

        absorb(&a, &b);
        assert_eq!(a.page_count(), before_a + before_b);
        assert_eq!(b.page_count(), 0);
        assert!(a.contains_block(pa));
        assert!(a.contains_block(pb1));
        assert!(a.contains_block(pb2));
        assert!(!b.contains_block(pb1));
        assert!(validate(&a));
        assert!(validate(&b));

        for p in [pa, pb1, pb2] {
            free(p);
        }
        b.delete();
        a.delete();
    }

    #[test]
    fn test_absorb_reencodes_delayed_channel() {
        let child = Heap::new();
        let blocks: Vec<usize> = (0..3).map(|_| child.allocate(128).unwrap()).collect();
        let extra = child.allocate(128).unwrap();

        // queue three remote frees on the child's delayed channel
        let rt = runtime();
        for &b in &blocks {
            let segment = rt.arena.segment_of(b).unwrap();
            let pref = PageRef::new(segment.clone(), segment.page_index_of(b));
            assert!(child.delayed_free.push(pref.page(), b, child.keys));
        }
        assert!(!child.delayed_free.is_empty());

        let backing = thread::get_backing();
        let before = backing.page_count();
        child.delete();
        assert_eq!(backing.page_count(), before + 1);
        // deleted heap's channel moved to the backing heap
        assert!(child.delayed_free.is_empty());
        assert!(!backing.delayed_free.is_empty());

        // the drain recovers all three blocks, no loss, no double count
        backing.collect(false);
        assert!(backing.delayed_free.is_empty());
        for &b in &blocks {
            assert!(!backing.check_owned(b));
        }
        assert!(backing.check_owned(extra));
        free(extra);
        backing.collect(false);
    }

    #[test]
    fn test_delete_child_transfers_pages_to_backing() {
        let backing = thread::get_backing();
        let child = Heap::new();
        let keep = child.allocate(32).unwrap();
        let drop1 = child.allocate(32).unwrap();
        let drop2 = child.allocate(32).unwrap();
        free(drop1);
        free(drop2);
        let before = backing.page_count();

        child.delete();
        assert_eq!(child.page_count(), 0);
        assert_eq!(backing.page_count(), before + 1);
        assert!(backing.contains_block(keep));
        assert!(backing.check_owned(keep));
        free(keep);
    }

    #[test]
    fn test_destroy_revokes_storage_without_touching_blocks() {
        let heap = Heap::new();
        let p = heap.allocate(48).unwrap();
        let stats_before = thread::thread_stats();
        heap.destroy();
        let stats_after = thread::thread_stats();
        assert_eq!(heap.page_count(), 0);
        assert!(!heap.contains_block(p));
        assert_eq!(
            stats_after.pages_destroyed,
            stats_before.pages_destroyed + 1
        );
        // the page's segment space is reusable by later allocations
        let again = Heap::new();
        let q = again.allocate(48).unwrap();
        free(q);
        again.delete();
    }

    #[test]
    fn test_destroy_downgrades_without_no_reclaim() {
        let backing = thread::get_backing();
        let tld = backing.tld.clone().unwrap();
        let random = backing.random.lock().split();
        // a reclaim-capable child must not be bulk destroyed
        let heap = Heap::create(tld, random, false);
        let p = heap.allocate(64).unwrap();
        let destroyed_before = thread::thread_stats().pages_destroyed;
        let before = backing.page_count();

        heap.destroy();
        assert_eq!(thread::thread_stats().pages_destroyed, destroyed_before);
        assert_eq!(backing.page_count(), before + 1);
        assert!(backing.check_owned(p));
        free(p);
    }

    #[test]
    fn test_collect_drains_page_thread_free() {
        let heap = Heap::new();
        let keep = heap.allocate(64).unwrap();
        let remote = heap.allocate(64).unwrap();

        // simulate a remote free landing on the page's thread_free stack
        let rt = runtime();
        let segment = rt.arena.segment_of(remote).unwrap();
        let pref = PageRef::new(segment.clone(), segment.page_index_of(remote));
        pref.page().thread_free_push(remote);

        // pending remote returns still count as allocated
        assert!(heap.check_owned(remote));
        heap.collect(false);
        assert!(!heap.check_owned(remote));
        assert!(heap.check_owned(keep));

        free(keep);
        heap.delete();
    }

    #[test]
    fn test_set_default_roundtrip() {
        let original = thread::get_default();
        let heap = Heap::new();
        let prev = thread::set_default_direct(heap.clone());
        assert!(Arc::ptr_eq(&prev, &original));
        let prev2 = thread::set_default_direct(prev);
        assert!(Arc::ptr_eq(&prev2, &heap));
        assert!(Arc::ptr_eq(&thread::get_default(), &original));
        heap.delete();
    }

    #[test]
    fn test_delete_resets_default_to_backing() {
        let heap = Heap::new();
        thread::set_default_direct(heap.clone());
        heap.delete();
        let default = thread::get_default();
        let backing = thread::get_backing();
        assert!(Arc::ptr_eq(&default, &backing));
    }

    #[test]
    fn test_contains_block_rejects_foreign_pointers() {
        let heap = Heap::new();
        let p = heap.allocate(256).unwrap();
        assert!(!heap.contains_block(0));
        assert!(!heap.contains_block(0xDEAD_BEEF));
        assert!(!heap.contains_block(p ^ (1 << 60)));
        assert!(heap.contains_block(p + 5)); // interior pointers are contained
        assert!(!heap.check_owned(p + 5)); // but not owned
        free(p);
        heap.delete();
    }

    #[test]
    fn test_deterministic_stress_preserves_invariants() {
        fn lcg(state: &mut u64) -> u64 {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *state
        }

        let heap = Heap::new();
        let mut live: Vec<usize> = Vec::new();
        let mut rng = 0x5EED_CAFE_F00D_u64;

        for round in 0..2000 {
            let r = lcg(&mut rng);
            match r % 4 {
                0 | 1 => {
                    let size = ((r >> 8) as usize % 2048).max(1);
                    if let Some(p) = heap.allocate(size) {
                        live.push(p);
                    }
                }
                2 if !live.is_empty() => {
                    let idx = (r as usize >> 16) % live.len();
                    free(live.swap_remove(idx));
                }
                _ => {
                    if round % 64 == 0 {
                        heap.collect(r % 8 == 0);
                    }
                }
            }
            assert!(validate(&heap), "invariants violated at round {round}");
        }
        for p in live {
            free(p);
        }
        heap.collect(true);
        assert_eq!(heap.page_count(), 0);
        heap.delete();
    }
}

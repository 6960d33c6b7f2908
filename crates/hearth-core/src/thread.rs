//! Thread registration and the default-heap slot.
//!
//! Every thread that touches the allocator gets a small id, a descriptor
//! shared by all of its heaps, and a backing heap that doubles as the
//! initial default heap. When the thread exits, its backing heap either
//! frees immediately or is published on the abandoned stack.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::heap::{self, Heap};
use crate::runtime::runtime;
use crate::segment::SegmentTld;
use crate::stats::HeapStats;
use crate::trace::{HeapLogLevel, TraceLog};

/// Thread-local descriptor shared by every heap of one thread.
pub(crate) struct Tld {
    pub thread_id: u64,
    pub is_main: bool,
    /// Id of the first heap created for this thread; owns this descriptor's
    /// lifetime and receives safely-deleted child heaps' pages.
    pub heap_backing: AtomicU64,
    pub segments: Mutex<SegmentTld>,
    pub stats: Mutex<HeapStats>,
    pub trace: Mutex<TraceLog>,
}

impl Tld {
    pub fn record(
        &self,
        level: HeapLogLevel,
        op: &'static str,
        event: &'static str,
        heap: u64,
        page_count: usize,
        outcome: &'static str,
        details: impl Into<String>,
    ) {
        self.trace
            .lock()
            .record(level, op, event, heap, page_count, outcome, details);
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

struct ThreadState {
    backing: Arc<Heap>,
    default: Arc<Heap>,
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        // Thread termination: the backing heap frees immediately when empty
        // or moves to the abandoned stack otherwise.
        heap::thread_done(&self.backing);
    }
}

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
    static STATE: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

/// Small per-thread id; assigned on first use, never 0.
pub(crate) fn current_thread_id() -> u64 {
    THREAD_ID.with(|slot| {
        let id = slot.get();
        if id != 0 {
            return id;
        }
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        slot.set(id);
        id
    })
}

/// Creates this thread's descriptor and backing heap if absent.
pub(crate) fn ensure_thread_init() {
    STATE.with(|state| {
        if state.borrow().is_some() {
            return;
        }
        let thread_id = current_thread_id();
        let rt = runtime();
        let is_main = *rt.main_thread.get_or_init(|| thread_id) == thread_id;
        let tld = Arc::new(Tld {
            thread_id,
            is_main,
            heap_backing: AtomicU64::new(0),
            segments: Mutex::new(SegmentTld::new()),
            stats: Mutex::new(HeapStats::default()),
            trace: Mutex::new(TraceLog::new()),
        });
        let backing = heap::new_backing(tld.clone());
        tld.heap_backing.store(backing.id(), Ordering::Release);
        *state.borrow_mut() = Some(ThreadState {
            default: backing.clone(),
            backing,
        });
    });
}

/// The calling thread's current default heap.
pub(crate) fn get_default() -> Arc<Heap> {
    ensure_thread_init();
    STATE.with(|state| {
        state
            .borrow()
            .as_ref()
            .map(|st| st.default.clone())
            .expect("thread state initialized")
    })
}

/// The calling thread's backing heap.
pub(crate) fn get_backing() -> Arc<Heap> {
    ensure_thread_init();
    STATE.with(|state| {
        state
            .borrow()
            .as_ref()
            .map(|st| st.backing.clone())
            .expect("thread state initialized")
    })
}

/// Swaps the calling thread's default heap, returning the previous one.
pub(crate) fn set_default_direct(heap: Arc<Heap>) -> Arc<Heap> {
    ensure_thread_init();
    STATE.with(|state| {
        let mut borrow = state.borrow_mut();
        let st = borrow.as_mut().expect("thread state initialized");
        std::mem::replace(&mut st.default, heap)
    })
}

/// Whether `heap_id` is the calling thread's current default. Does not
/// initialize the thread.
pub(crate) fn is_current_default(heap_id: u64) -> bool {
    STATE.with(|state| {
        state
            .borrow()
            .as_ref()
            .is_some_and(|st| st.default.id() == heap_id)
    })
}

/// Clones the calling thread's counters.
pub(crate) fn thread_stats() -> HeapStats {
    ensure_thread_init();
    STATE.with(|state| {
        state
            .borrow()
            .as_ref()
            .and_then(|st| st.backing.tld().map(|tld| tld.stats.lock().clone()))
            .unwrap_or_default()
    })
}

/// Drains the calling thread's lifecycle records.
pub(crate) fn drain_thread_trace() -> Vec<crate::trace::HeapLogRecord> {
    ensure_thread_init();
    STATE.with(|state| {
        state
            .borrow()
            .as_ref()
            .and_then(|st| st.backing.tld().map(|tld| tld.trace.lock().drain()))
            .unwrap_or_default()
    })
}

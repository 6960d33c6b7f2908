//! Process-wide state.
//!
//! A single `Runtime` instance holds everything shared across threads: the
//! segment arena, the heap registry (heap ids are the atomic handles pages
//! and the abandoned stack route through), the abandoned-heap stack, the
//! process cookie and root PRNG, and the registered deferred-free hook.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};

use crate::abandoned::AbandonedStack;
use crate::heap::Heap;
use crate::random::RandomCtx;
use crate::segment::SegmentArena;
use crate::stats::HeapStats;

/// Client callback invoked at the start of every collect.
///
/// Arguments are the force flag and a heartbeat counter.
pub(crate) type DeferredHook = Arc<dyn Fn(bool, u64) + Send + Sync>;

pub(crate) struct Runtime {
    pub arena: SegmentArena,
    heaps: RwLock<HashMap<u64, Arc<Heap>>>,
    pub abandoned: AbandonedStack,
    pub process_stats: Mutex<HeapStats>,
    pub deferred: RwLock<Option<DeferredHook>>,
    pub root_random: Mutex<RandomCtx>,
    pub process_cookie: u64,
    pub heartbeat: AtomicU64,
    pub main_thread: OnceLock<u64>,
    next_heap_id: AtomicU64,
}

impl Runtime {
    fn new() -> Self {
        let mut root = RandomCtx::fresh();
        let process_cookie = root.next_u64() | 1;
        Self {
            arena: SegmentArena::new(),
            heaps: RwLock::new(HashMap::new()),
            abandoned: AbandonedStack::new(),
            process_stats: Mutex::new(HeapStats::default()),
            deferred: RwLock::new(None),
            root_random: Mutex::new(root),
            process_cookie,
            heartbeat: AtomicU64::new(0),
            main_thread: OnceLock::new(),
            next_heap_id: AtomicU64::new(1),
        }
    }

    pub fn next_heap_id(&self) -> u64 {
        self.next_heap_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_heap(&self, heap: &Arc<Heap>) {
        self.heaps.write().insert(heap.id(), heap.clone());
    }

    pub fn remove_heap(&self, id: u64) -> Option<Arc<Heap>> {
        self.heaps.write().remove(&id)
    }

    /// Resolves a heap id to its live registry entry.
    pub fn heap(&self, id: u64) -> Option<Arc<Heap>> {
        if id == 0 {
            return None;
        }
        self.heaps.read().get(&id).cloned()
    }
}

/// The process-wide runtime, created on first use.
pub(crate) fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(Runtime::new)
}

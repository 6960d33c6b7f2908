//! # hearth-core
//!
//! Thread-affine heap lifecycle and page-ownership core.
//!
//! Every thread gets its own heaps, so allocation and local free stay
//! uncontended; blocks freed from other threads travel back over lock-free
//! channels, and a thread that exits with live blocks parks its heap on a
//! process-wide abandoned stack for another thread to absorb. This crate
//! models blocks, pages, and segments over a logical address space; the
//! unsafe memory edge lives elsewhere. No `unsafe` code is permitted at the
//! crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod size_class;
pub mod stats;
pub mod trace;

mod abandoned;
mod block;
mod delayed;
mod heap;
mod page;
mod queue;
mod random;
mod runtime;
mod segment;
mod thread;
mod visit;

use std::sync::Arc;

pub use error::HeapError;
pub use heap::{free, Heap};
pub use stats::{HeapStats, SegmentCacheStats};
pub use trace::{HeapLogLevel, HeapLogRecord};
pub use visit::{BlockVisitor, HeapArea};

/// The calling thread's current default heap, initializing the thread on
/// first use.
pub fn default_heap() -> Arc<Heap> {
    thread::get_default()
}

/// The calling thread's backing heap: the first heap created for the
/// thread, and the one that adopts safely-deleted child heaps' pages.
pub fn backing_heap() -> Arc<Heap> {
    thread::get_backing()
}

/// Swaps the calling thread's default heap, returning the previous one.
/// Returns `None` (and changes nothing) for an uninitialized heap.
pub fn set_default(heap: &Arc<Heap>) -> Option<Arc<Heap>> {
    if !heap.is_initialized() {
        return None;
    }
    Some(thread::set_default_direct(heap.clone()))
}

/// Collects the calling thread's default heap. See [`Heap::collect`].
pub fn collect(force: bool) {
    default_heap().collect(force);
}

/// Whether `p` is the base of a currently allocated block of the calling
/// thread's default heap.
pub fn check_owned(p: usize) -> bool {
    default_heap().check_owned(p)
}

/// Registers the process-wide deferred-free hook, invoked at the start of
/// every collect with the force flag and a heartbeat counter.
pub fn register_deferred_free(hook: impl Fn(bool, u64) + Send + Sync + 'static) {
    *runtime::runtime().deferred.write() = Some(Arc::new(hook));
}

/// Clones the process-wide counters (threads merge theirs on exit).
pub fn process_stats() -> HeapStats {
    runtime::runtime().process_stats.lock().clone()
}

/// Clones the calling thread's counters.
pub fn thread_stats() -> HeapStats {
    thread::thread_stats()
}

/// Drains the calling thread's lifecycle records.
pub fn drain_thread_trace() -> Vec<HeapLogRecord> {
    thread::drain_thread_trace()
}

/// Snapshot of the segment caches visible to the calling thread.
pub fn segment_cache_stats() -> SegmentCacheStats {
    let backing = backing_heap();
    let thread_cached = backing
        .tld()
        .map(|tld| tld.segments.lock().cached.len())
        .unwrap_or(0);
    SegmentCacheStats {
        thread_cached,
        process_regions: runtime::runtime().arena.region_cache_len(),
    }
}

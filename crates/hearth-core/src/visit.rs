//! Heap area and block visiting.
//!
//! Diagnostics walk a heap one area (page) at a time, optionally stepping
//! over every live block inside. For multi-block pages the walk materializes
//! a bit-per-block free map from the page's free lists, then skips runs of
//! free blocks a word at a time; single-block pages short-circuit.

use crate::heap::Heap;

/// One heap area, backed by a single page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapArea {
    /// First block address of the area.
    pub start: usize,
    /// Bytes reserved for blocks.
    pub reserved: usize,
    /// Bytes committed to blocks.
    pub committed: usize,
    /// Blocks currently in use.
    pub used: usize,
    /// Size of each block in the area.
    pub block_size: usize,
}

/// Visitor over heap areas and blocks. The walk stops as soon as a method
/// returns false.
pub trait BlockVisitor {
    /// Called once per area.
    fn visit_area(&mut self, heap: &Heap, area: &HeapArea) -> bool {
        let _ = (heap, area);
        true
    }

    /// Called once per live block when block visiting is requested.
    fn visit_block(&mut self, heap: &Heap, area: &HeapArea, block: usize, block_size: usize)
        -> bool;
}

/// Builds a bit-per-block map of free blocks from the page's free lists.
/// Set bits mark free blocks.
pub(crate) fn free_bitmap(free: &[usize], local_free: &[usize], capacity: usize) -> Vec<u64> {
    let mut map = vec![0u64; capacity.div_ceil(64)];
    for &idx in free.iter().chain(local_free.iter()) {
        if idx < capacity {
            map[idx / 64] |= 1u64 << (idx % 64);
        }
    }
    map
}

pub(crate) fn visit_blocks(heap: &Heap, visit_blocks: bool, visitor: &mut dyn BlockVisitor) -> bool {
    if !heap.is_initialized() {
        return true;
    }
    for pref in heap.page_snapshot() {
        let page = pref.page();
        if page.heap.load(std::sync::atomic::Ordering::Acquire) != heap.id() {
            continue;
        }
        // Snapshot the page under its lock; the visitor runs without it.
        let (area, map, used) = {
            let mut local = page.local.lock();
            page.collect_free(&mut local, true);
            let block_size = page.block_size();
            let capacity = page.capacity();
            let area = HeapArea {
                start: page.start(),
                reserved: local.reserved * block_size,
                committed: capacity * block_size,
                used: local.used,
                block_size,
            };
            debug_assert!(local.local_free.is_empty());
            let map = free_bitmap(&local.free, &local.local_free, capacity);
            (area, map, local.used)
        };
        if !visitor.visit_area(heap, &area) {
            return false;
        }
        if !visit_blocks || used == 0 {
            continue;
        }
        let capacity = area.committed / area.block_size.max(1);
        if capacity == 1 {
            // single-block page: the one block is live
            if !visitor.visit_block(heap, &area, area.start, area.block_size) {
                return false;
            }
            continue;
        }
        let mut visited = 0usize;
        let mut i = 0usize;
        while i < capacity {
            let word = map[i / 64];
            if i % 64 == 0 && word == u64::MAX {
                // a whole word of free blocks; skip it
                i += 64;
                continue;
            }
            if (word >> (i % 64)) & 1 == 0 {
                visited += 1;
                if !visitor.visit_block(heap, &area, area.start + i * area.block_size, area.block_size)
                {
                    return false;
                }
            }
            i += 1;
        }
        debug_assert_eq!(visited, used);
    }
    true
}

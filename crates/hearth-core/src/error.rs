//! Error types for the heap core.
//!
//! Most public operations are deliberately infallible: predicates answer
//! `false` on corruption, lifecycle operations are no-ops on uninitialized
//! heaps. The cases below are the seams where a caller can meaningfully
//! react to failure.

use thiserror::Error;

/// Errors surfaced by the fallible allocation seams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The logical segment address space has been exhausted.
    #[error("segment address space exhausted")]
    AddressSpaceExhausted,

    /// The requested size exceeds the largest serviceable block size.
    #[error("allocation of {size} bytes exceeds the largest size class")]
    AllocationTooLarge {
        /// The rejected request size.
        size: usize,
    },

    /// The heap has no thread-local descriptor bound.
    #[error("heap is not initialized")]
    Uninitialized,
}

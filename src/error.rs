//! Errors reported by the heap.
//!
//! Every failure is detected before a single byte of the heap is touched,
//! so getting an error back always means the heap is exactly as it was
//! before the call.

use thiserror::Error;

/// Errors that can occur while initializing, allocating from or releasing
/// to a [`crate::Heap`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// The requested heap size is not positive or does not fit in a header.
    #[error("invalid heap size: {0} bytes")]
    InvalidHeapSize(i64),

    /// [`crate::Heap::init`] already succeeded once on this heap.
    #[error("heap already initialized")]
    AlreadyInitialized,

    /// The kernel could not give us the memory region.
    #[error("kernel could not map {0} bytes for the heap")]
    RegionUnavailable(usize),

    /// Allocation or release on a heap that was never initialized.
    #[error("heap is not initialized")]
    Uninitialized,

    /// The requested payload size is not positive or exceeds the heap capacity.
    #[error("invalid allocation request: {requested} bytes, capacity {capacity}")]
    InvalidRequest {
        /// Size asked for by the caller.
        requested: i32,
        /// Usable bytes of the heap.
        capacity: usize,
    },

    /// No free block is big enough.
    #[error("out of memory: no free block of {0} bytes")]
    OutOfMemory(usize),

    /// Tried to release a null pointer.
    #[error("cannot free a null pointer")]
    NullPointer,

    /// The pointer is not 8 byte aligned, so it was never returned by us.
    #[error("pointer {0:#x} is not 8 byte aligned")]
    Misaligned(usize),

    /// The pointer does not point into the payload area of the heap.
    #[error("pointer {0:#x} is outside of the heap")]
    OutOfRange(usize),

    /// The pointer is inside the heap but not at the start of a payload.
    #[error("pointer {0:#x} is not the start of a block")]
    NotABlock(usize),

    /// The block is already free.
    #[error("double free of pointer {0:#x}")]
    DoubleFree(usize),

    /// [`crate::Heap::verify`] found a broken invariant.
    #[error("heap corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Offset from the start of the mapping where the problem was found.
        offset: usize,
        /// What is wrong.
        reason: String,
    },
}

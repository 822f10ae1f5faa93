//! Explicit memory allocator that manages one single region of memory
//! requested from the kernel at startup.
//!
//! The region is split into blocks which carry all the bookkeeping in their
//! own bytes (see [`block`] for the exact format):
//!
//! ```text
//! +-----+--------------+------------+------------------+-------+----------+
//! | pad | Alloc        | Free       | Alloc            | Free  | END_MARK |
//! +-----+--------------+------------+------------------+-------+----------+
//! ```
//!
//! - Allocation uses next fit: searches resume at the last allocated block
//!   and wrap around. A free block larger than needed is split in two.
//! - Release coalesces the block right away with any free neighbour, so two
//!   free blocks are never adjacent.
//!
//! ```no_run
//! use heapalloc::Heap;
//!
//! let mut heap = Heap::new();
//! heap.init(4096).unwrap();
//!
//! let addr = heap.alloc(100).unwrap();
//! heap.free(addr.as_ptr()).unwrap();
//!
//! println!("{}", heap.inspect());
//! ```

pub mod block;
mod error;
mod freelist;
mod inspect;
mod kernel;
mod region;

use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

pub use block::{ALIGNMENT, END_MARK, HEADER_SIZE, MIN_BLOCK_SIZE};
pub use error::HeapError;
pub use inspect::{BlockRecord, HeapReport, Status};

use crate::{block::block_size_for, freelist::FreeList, region::Region};

/// The allocator. It owns the memory region once [`Heap::init`] succeeds
/// and gives it back to the kernel when dropped.
///
/// A `Heap` is meant to be used from one thread at a time. It can be moved
/// to another thread, but sharing it requires [`SharedHeap`].
pub struct Heap {
    /// Memory region. `None` until [`Heap::init`] succeeds.
    region: Option<Region>,
    /// Next fit cursor over the implicit list of free blocks.
    free_list: FreeList,
}

impl Heap {
    /// Creates a heap with no memory. Call [`Heap::init`] before using it.
    pub const fn new() -> Self {
        Self {
            region: None,
            free_list: FreeList::new(),
        }
    }

    /// Requests `requested` bytes (rounded up to the page size) from the
    /// kernel and prepares them as one big free block.
    ///
    /// This can only succeed once per heap. Later calls fail with
    /// [`HeapError::AlreadyInitialized`] and leave the heap untouched.
    pub fn init(&mut self, requested: i32) -> Result<(), HeapError> {
        if self.region.is_some() {
            tracing::warn!(requested, "heap already initialized");
            return Err(HeapError::AlreadyInitialized);
        }

        if requested <= 0 {
            tracing::warn!(requested, "requested heap size is not positive");
            return Err(HeapError::InvalidHeapSize(requested.into()));
        }

        let region = Region::map(requested as usize)
            .inspect_err(|err| tracing::warn!(%err, "could not map heap region"))?;

        tracing::info!(
            requested,
            len = region.len(),
            capacity = region.capacity(),
            "heap initialized"
        );

        self.region = Some(region);

        Ok(())
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    /// Usable bytes of the heap, headers included. `None` before
    /// [`Heap::init`].
    pub fn capacity(&self) -> Option<usize> {
        self.region.as_ref().map(Region::capacity)
    }

    /// Allocates `size` bytes and returns the address of the payload, or
    /// `None` if the size is invalid or no free block is big enough. See
    /// [`Heap::try_alloc`] for the reason of a failure.
    pub fn alloc(&mut self, size: i32) -> Option<NonNull<u8>> {
        self.try_alloc(size)
            .inspect_err(|err| tracing::debug!(%err, "allocation failed"))
            .ok()
    }

    /// Allocates `size` bytes. The returned address is 8 byte aligned and
    /// the payload is not zeroed unless it was never used before.
    ///
    /// ```text
    /// +--------+------------------------+---------+
    /// | Header |    Payload (size)      | Padding |
    /// +--------+------------------------+---------+
    ///          ^
    ///          |
    ///    returned address
    /// ```
    pub fn try_alloc(&mut self, size: i32) -> Result<NonNull<u8>, HeapError> {
        let region = self.region.as_mut().ok_or(HeapError::Uninitialized)?;
        let capacity = region.capacity();

        if size <= 0 || size as usize > capacity {
            return Err(HeapError::InvalidRequest {
                requested: size,
                capacity,
            });
        }

        let needed = block_size_for(size as usize);

        let offset = self
            .free_list
            .find_free_block(region, needed)
            .ok_or(HeapError::OutOfMemory(needed))?;

        region.reserve(offset, needed);
        self.free_list.advance_to(offset);

        Ok(region.payload(offset))
    }

    /// Releases the block whose payload starts at `address`.
    ///
    /// Fails without modifying anything if `address` is null, misaligned,
    /// outside of the heap, not the start of a block or already free.
    pub fn free(&mut self, address: *mut u8) -> Result<(), HeapError> {
        let region = self.region.as_mut().ok_or(HeapError::Uninitialized)?;

        let offset = Self::allocated_block(region, address)
            .inspect_err(|err| tracing::warn!(%err, "rejected free"))?;

        let freed = region.release(offset);
        self.free_list.released(region, freed);

        Ok(())
    }

    /// Checks that `address` is the payload of an allocated block and
    /// returns the offset of its header.
    fn allocated_block(region: &Region, address: *mut u8) -> Result<usize, HeapError> {
        if address.is_null() {
            return Err(HeapError::NullPointer);
        }

        let address = address.addr();
        if !address.is_multiple_of(ALIGNMENT) {
            return Err(HeapError::Misaligned(address));
        }

        let base = region.base().as_ptr().addr();
        let first_payload = base + region.first_block() + HEADER_SIZE;
        if address < first_payload || address >= base + region.end_mark() {
            return Err(HeapError::OutOfRange(address));
        }

        let offset = address - base - HEADER_SIZE;

        match region.blocks().find(|(block, _)| *block >= offset) {
            Some((block, header)) if block == offset => {
                if header.is_allocated() {
                    Ok(offset)
                } else {
                    Err(HeapError::DoubleFree(address))
                }
            }
            _ => Err(HeapError::NotABlock(address)),
        }
    }

    /// Snapshot of every block in the heap. Empty before [`Heap::init`].
    pub fn inspect(&self) -> HeapReport {
        self.region.as_ref().map(HeapReport::new).unwrap_or_default()
    }

    /// Logs the block list at debug level.
    pub fn dump(&self) {
        tracing::debug!("\n{}", self.inspect());
    }

    /// Walks the raw bytes of the heap and checks that the block format is
    /// consistent: sizes, status bits, footers, coalescing, total size, end
    /// mark and next fit cursor.
    pub fn verify(&self) -> Result<(), HeapError> {
        match &self.region {
            Some(region) => inspect::verify(region, self.free_list.cursor()),
            None => Ok(()),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Heap`] behind a lock, for when it has to be shared between threads.
///
/// ```no_run
/// use heapalloc::SharedHeap;
///
/// static HEAP: SharedHeap = SharedHeap::new();
///
/// HEAP.init(8192).unwrap();
/// let addr = HEAP.alloc(64).unwrap();
/// HEAP.free(addr.as_ptr()).unwrap();
/// ```
pub struct SharedHeap {
    heap: Mutex<Heap>,
}

impl SharedHeap {
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
        }
    }

    /// See [`Heap::init`].
    pub fn init(&self, requested: i32) -> Result<(), HeapError> {
        self.heap.lock().init(requested)
    }

    /// See [`Heap::alloc`].
    pub fn alloc(&self, size: i32) -> Option<NonNull<u8>> {
        self.heap.lock().alloc(size)
    }

    /// See [`Heap::free`].
    pub fn free(&self, address: *mut u8) -> Result<(), HeapError> {
        self.heap.lock().free(address)
    }

    /// See [`Heap::inspect`].
    pub fn inspect(&self) -> HeapReport {
        self.heap.lock().inspect()
    }

    /// Locks the heap for a sequence of operations.
    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock()
    }
}

impl Default for SharedHeap {
    fn default() -> Self {
        Self::new()
    }
}

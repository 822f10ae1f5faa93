use std::{ops::Range, ptr::NonNull};

use crate::{
    block::{ALIGNMENT, END_MARK, HEADER_SIZE, Header},
    error::HeapError,
    kernel,
};

/// Offset of the first block header from the start of the mapping. The
/// first [`HEADER_SIZE`] bytes are skipped so that every payload, which
/// starts right after a header, lands on an 8 byte boundary.
pub(crate) const FIRST_BLOCK: usize = HEADER_SIZE;

/// Bytes of the mapping that never belong to a block: the alignment pad in
/// front and the end mark at the back.
pub(crate) const RESERVED: usize = FIRST_BLOCK + HEADER_SIZE;

/// The single memory region managed by the heap. It is requested once from
/// the kernel and laid out like this:
///
/// ```text
///  base
///   |
///   v
/// +-----+--------+--------+-----+--------+----------+
/// | pad | Block  | Block  | ... | Block  | END_MARK |
/// +-----+--------+--------+-----+--------+----------+
///   4b  ^                                ^    4b
///       |                                |
///   FIRST_BLOCK                      end_mark()
/// ```
///
/// Blocks are not linked to each other. The next block is always found by
/// adding the size of the current one to its offset, and the previous one
/// (only when it is free) by reading its footer right before our header.
///
/// Every location inside the region is expressed as a byte offset from
/// `base`. This is the only place where offsets are turned into pointers.
pub(crate) struct Region {
    /// Start of the mapping returned by the kernel. Page aligned.
    base: NonNull<u8>,
    /// Length of the mapping. Multiple of the page size.
    len: usize,
}

impl Region {
    /// Requests a zero filled region of at least `requested` bytes from the
    /// kernel, rounded up to the page size, and lays down one free block that
    /// covers all of it followed by the end mark.
    pub fn map(requested: usize) -> Result<Self, HeapError> {
        let page_size = kernel::page_size();

        let len = requested
            .checked_next_multiple_of(page_size)
            .filter(|len| *len > RESERVED && *len - RESERVED <= i32::MAX as usize)
            .ok_or(HeapError::InvalidHeapSize(i64::try_from(requested).unwrap_or(i64::MAX)))?;

        let base = unsafe { kernel::request_memory(len) }.ok_or(HeapError::RegionUnavailable(len))?;

        let mut region = Self { base, len };

        region.set_word(region.end_mark(), END_MARK);
        // There is no block before the first one, so pretend it's allocated.
        region.write_free_block(FIRST_BLOCK, region.capacity(), true);

        Ok(region)
    }

    /// Length of the whole mapping.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes available for blocks, which is the size of the single free
    /// block right after bootstrap.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.len - RESERVED
    }

    #[inline]
    pub fn first_block(&self) -> usize {
        FIRST_BLOCK
    }

    /// Offset of the end mark.
    #[inline]
    pub fn end_mark(&self) -> usize {
        self.len - HEADER_SIZE
    }

    /// Address of the start of the mapping.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Reads the word stored at `offset`.
    #[inline]
    pub fn word(&self, offset: usize) -> i32 {
        debug_assert!(offset.is_multiple_of(HEADER_SIZE), "unaligned heap offset {offset}");
        debug_assert!(offset + HEADER_SIZE <= self.len, "heap offset {offset} out of bounds");

        unsafe { self.base.as_ptr().add(offset).cast::<i32>().read() }
    }

    #[inline]
    fn set_word(&mut self, offset: usize, value: i32) {
        debug_assert!(offset.is_multiple_of(HEADER_SIZE), "unaligned heap offset {offset}");
        debug_assert!(offset + HEADER_SIZE <= self.len, "heap offset {offset} out of bounds");

        unsafe { self.base.as_ptr().add(offset).cast::<i32>().write(value) }
    }

    #[inline]
    pub fn header(&self, offset: usize) -> Header {
        Header::from_raw(self.word(offset))
    }

    #[inline]
    pub fn set_header(&mut self, offset: usize, header: Header) {
        debug_assert!(offset < self.end_mark(), "writing a header over the end mark");
        self.set_word(offset, header.raw());
    }

    /// Size stored in the footer of the block that ends right where the
    /// block at `offset` starts. Only meaningful if that block is free.
    #[inline]
    pub fn footer_before(&self, offset: usize) -> usize {
        self.word(offset - HEADER_SIZE) as usize
    }

    /// Writes header and footer of a free block.
    fn write_free_block(&mut self, offset: usize, size: usize, prev_allocated: bool) {
        self.set_header(offset, Header::new(size, false, prev_allocated));
        self.set_word(offset + size - HEADER_SIZE, size as i32);
    }

    /// Address of the payload of the block at `offset`.
    #[inline]
    pub fn payload(&self, offset: usize) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset + HEADER_SIZE)) }
    }

    /// Iterates over every block in address order, stopping at the end mark.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            region: self,
            offset: FIRST_BLOCK,
        }
    }

    /// Marks the free block at `offset` as allocated using only `needed`
    /// bytes of it. If the block is bigger, the rest is split off as a new
    /// free block right after the allocated one.
    ///
    /// ```text
    /// +-----------------------------+      +------------+----------------+
    /// |         Free (size)         |  ->  | Alloc      | Free           |
    /// |                             |      | (needed)   | (size-needed)  |
    /// +-----------------------------+      +------------+----------------+
    /// ```
    ///
    /// Since sizes are multiples of [`ALIGNMENT`], a leftover is always at
    /// least [`crate::block::MIN_BLOCK_SIZE`] bytes, enough for header and footer.
    pub fn reserve(&mut self, offset: usize, needed: usize) {
        let header = self.header(offset);
        let size = header.size();

        debug_assert!(!header.is_allocated() && size >= needed && needed.is_multiple_of(ALIGNMENT));

        if size > needed {
            self.set_header(offset, Header::new(needed, true, header.is_prev_allocated()));
            // The block after the leftover already has its p-bit cleared.
            self.write_free_block(offset + needed, size - needed, true);

            tracing::debug!(offset, size, needed, leftover = size - needed, "split free block");
        } else {
            self.set_header(offset, header.with_allocated(true));

            let next = offset + size;
            let next_header = self.header(next);
            if !next_header.is_end_mark() {
                self.set_header(next, next_header.with_prev_allocated(true));
            }
        }
    }

    /// Frees the allocated block at `offset` and coalesces it with whichever
    /// of its neighbours are free. Returns the byte range of the resulting
    /// free block.
    ///
    /// ```text
    ///      prev       current      next
    /// +-----------+-----------+-----------+
    /// |   Free    |   Alloc   |   Free    |   Both neighbours free:
    /// +-----------+-----------+-----------+
    ///                   |
    ///                   v
    /// +-----------------------------------+
    /// |               Free                |   one block at prev's offset.
    /// +-----------------------------------+
    /// ```
    ///
    /// The previous block is found through its footer and the next one
    /// through our size. Whatever follows the merged block gets its p-bit
    /// cleared, unless it's the end mark.
    pub fn release(&mut self, offset: usize) -> Range<usize> {
        let header = self.header(offset);
        debug_assert!(header.is_allocated(), "releasing a free block at {offset}");

        let next = offset + header.size();
        let next_header = self.header(next);

        let prev_free = !header.is_prev_allocated();
        let next_free = !next_header.is_end_mark() && !next_header.is_allocated();

        let start = if prev_free { offset - self.footer_before(offset) } else { offset };
        let end = if next_free { next + next_header.size() } else { next };

        // When merging backwards the predecessor's p-bit survives, otherwise
        // ours does. A free block never follows another free block, so it
        // is set in both cases.
        let prev_allocated = self.header(start).is_prev_allocated();
        self.write_free_block(start, end - start, prev_allocated);

        let after = self.header(end);
        if !after.is_end_mark() {
            self.set_header(end, after.with_prev_allocated(false));
        }

        let case = match (prev_free, next_free) {
            (false, false) => "none",
            (true, false) => "prev",
            (false, true) => "next",
            (true, true) => "prev and next",
        };
        tracing::debug!(offset, start, size = end - start, merged_with = case, "released block");

        start..end
    }
}

// SAFETY: the mapping is owned by exactly one `Region` and is only reachable
// through it, so moving it to another thread is fine.
unsafe impl Send for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { kernel::return_memory(self.base, self.len) }
    }
}

/// Iterator over the blocks of a [`Region`], yielding the offset and header
/// of each one. See [`Region::blocks`].
pub(crate) struct Blocks<'a> {
    region: &'a Region,
    offset: usize,
}

impl Iterator for Blocks<'_> {
    type Item = (usize, Header);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.region.end_mark() {
            return None;
        }

        let header = self.region.header(self.offset);
        if header.is_end_mark() {
            return None;
        }

        let offset = self.offset;
        // A zero size would loop forever on a corrupted heap, stop instead.
        self.offset = match header.size() {
            0 => usize::MAX,
            size => offset.saturating_add(size),
        };

        Some((offset, header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::map(4096).expect("could not map test region")
    }

    #[test]
    fn bootstrap_lays_one_free_block_and_end_mark() {
        let region = region();
        let header = region.header(region.first_block());

        assert_eq!(header.size(), region.capacity());
        assert!(!header.is_allocated());
        assert!(header.is_prev_allocated());
        assert_eq!(region.footer_before(region.end_mark()), region.capacity());
        assert_eq!(region.word(region.end_mark()), END_MARK);
        assert_eq!(region.blocks().count(), 1);
    }

    #[test]
    fn map_rounds_up_to_page_size() {
        let page_size = kernel::page_size();
        let region = Region::map(page_size + 1).expect("could not map test region");

        assert_eq!(region.len(), 2 * page_size);
        assert_eq!(region.capacity(), 2 * page_size - RESERVED);
    }

    #[test]
    fn map_rejects_sizes_the_header_cannot_hold() {
        assert!(matches!(
            Region::map(usize::MAX),
            Err(HeapError::InvalidHeapSize(i64::MAX))
        ));
        assert!(matches!(Region::map(0), Err(HeapError::InvalidHeapSize(0))));
        assert!(matches!(
            Region::map(4 * i32::MAX as usize),
            Err(HeapError::InvalidHeapSize(_))
        ));
    }

    #[test]
    fn payloads_are_eight_byte_aligned() {
        let region = region();

        assert!((region.payload(region.first_block()).as_ptr() as usize).is_multiple_of(ALIGNMENT));
    }

    #[test]
    fn reserve_splits_bigger_blocks() {
        let mut region = region();
        let capacity = region.capacity();

        region.reserve(FIRST_BLOCK, 16);

        let blocks: Vec<_> = region.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].1, Header::new(16, true, true));
        assert_eq!(blocks[1], (FIRST_BLOCK + 16, Header::new(capacity - 16, false, true)));
        assert_eq!(region.footer_before(region.end_mark()), capacity - 16);
    }

    #[test]
    fn reserve_exact_fit_sets_next_p_bit() {
        let mut region = region();

        region.reserve(FIRST_BLOCK, 16);
        region.reserve(FIRST_BLOCK + 16, 16);
        region.release(FIRST_BLOCK);
        // First block is now a free 16 byte hole followed by an allocated block.
        assert!(!region.header(FIRST_BLOCK + 16).is_prev_allocated());

        region.reserve(FIRST_BLOCK, 16);

        assert_eq!(region.header(FIRST_BLOCK), Header::new(16, true, true));
        assert!(region.header(FIRST_BLOCK + 16).is_prev_allocated());
        assert_eq!(region.blocks().count(), 3);
    }

    #[test]
    fn release_merges_with_both_neighbours() {
        let mut region = region();
        let capacity = region.capacity();

        region.reserve(FIRST_BLOCK, 16);
        region.reserve(FIRST_BLOCK + 16, 24);
        region.reserve(FIRST_BLOCK + 40, 32);

        assert_eq!(region.release(FIRST_BLOCK), FIRST_BLOCK..FIRST_BLOCK + 16);
        assert_eq!(region.release(FIRST_BLOCK + 40), FIRST_BLOCK + 40..region.end_mark());
        assert_eq!(region.release(FIRST_BLOCK + 16), FIRST_BLOCK..region.end_mark());

        assert_eq!(region.blocks().count(), 1);
        assert_eq!(region.header(FIRST_BLOCK), Header::new(capacity, false, true));
        assert_eq!(region.footer_before(region.end_mark()), capacity);
    }

    #[test]
    fn release_clears_p_bit_of_following_block() {
        let mut region = region();

        region.reserve(FIRST_BLOCK, 16);
        region.reserve(FIRST_BLOCK + 16, 16);

        assert_eq!(region.release(FIRST_BLOCK), FIRST_BLOCK..FIRST_BLOCK + 16);
        assert_eq!(region.footer_before(FIRST_BLOCK + 16), 16);

        let next = region.header(FIRST_BLOCK + 16);
        assert!(next.is_allocated());
        assert!(!next.is_prev_allocated());
    }
}

use std::ops::Range;

use crate::region::Region;

/// The free list of this heap is implicit: free blocks are not linked
/// anywhere, they are found by walking every block and looking at the
/// allocated bit of its header.
///
/// ```text
///                       cursor
///                         |
///                         v
/// +-------+------+-------+-------+------+-------+----------+
/// | Alloc | Free | Alloc | Alloc | Free | Alloc | END_MARK |
/// +-------+------+-------+-------+------+-------+----------+
///                         ------------------------>   (1)
///  -------------------->                              (2)
/// ```
///
/// Searches use the next-fit policy. They start at the block we allocated
/// last (the cursor) and go up to the end mark (1). If nothing fits there
/// they wrap around and scan from the first block up to the cursor (2).
/// The first free block that is big enough wins.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    /// Offset of the most recently allocated block. `None` means searches
    /// start at the first block.
    cursor: Option<usize>,
}

impl FreeList {
    /// Creates a free list whose first search starts at the first block.
    pub const fn new() -> Self {
        Self { cursor: None }
    }

    #[inline]
    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Moves the cursor to the block we just allocated at `offset`.
    #[inline]
    pub fn advance_to(&mut self, offset: usize) {
        self.cursor = Some(offset);
    }

    /// Returns the offset of the first free block of at least `needed`
    /// bytes, scanning from the cursor to the end mark and then from the
    /// first block back to the cursor.
    pub fn find_free_block(&self, region: &Region, needed: usize) -> Option<usize> {
        let start = self.cursor.unwrap_or(region.first_block());

        Self::scan(region, start..region.end_mark(), needed)
            .or_else(|| Self::scan(region, region.first_block()..start, needed))
    }

    /// First fit inside `range`, which must start at a block boundary.
    fn scan(region: &Region, range: Range<usize>, needed: usize) -> Option<usize> {
        let mut offset = range.start;

        while offset < range.end {
            let header = region.header(offset);
            if header.is_end_mark() || header.size() == 0 {
                break;
            }

            if !header.is_allocated() && header.size() >= needed {
                tracing::trace!(offset, size = header.size(), needed, "found free block");
                return Some(offset);
            }

            offset += header.size();
        }

        None
    }

    /// Keeps the cursor pointing at a block that exists after the block at
    /// `freed` was released. If the cursor was anywhere inside the free
    /// block that resulted from the release (it could have been absorbed by
    /// coalescing) it moves to the block right after it. When that is the
    /// end mark the cursor is reset and the next search starts from the
    /// beginning.
    pub fn released(&mut self, region: &Region, freed: Range<usize>) {
        let Some(cursor) = self.cursor else {
            return;
        };

        if freed.contains(&cursor) {
            self.cursor = Some(freed.end).filter(|next| *next != region.end_mark());
            tracing::debug!(from = cursor, to = ?self.cursor, "moved cursor past released block");
        }
    }
}

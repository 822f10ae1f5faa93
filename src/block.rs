use std::fmt;

/// Size in bytes of a block header (and of a free block footer).
pub const HEADER_SIZE: usize = std::mem::size_of::<i32>();

/// Every block size and every payload address is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// Smallest block we can create. Enough room for a header and, once the
/// block is free, a footer.
pub const MIN_BLOCK_SIZE: usize = ALIGNMENT;

/// Value stored right after the last usable byte of the heap. Size 0 with
/// the allocated bit set, which no real block can ever look like.
pub const END_MARK: i32 = 1;

/// Bit 0 of the header: this block is allocated.
const A_BIT: i32 = 0b01;

/// Bit 1 of the header: the previous block (by address) is allocated.
const P_BIT: i32 = 0b10;

/// Low bits that never belong to the size because sizes are 8-aligned.
const STATUS_MASK: i32 = (ALIGNMENT as i32) - 1;

/// Block header. It is a single signed word where the size and the status
/// bits are packed together.
///
/// ```text
///  31                                  3   2   1   0
/// +--------------------------------------+---+---+---+
/// |             block size               | 0 | p | a |
/// +--------------------------------------+---+---+---+
/// ```
///
/// Every block in the heap starts with a header. Free blocks also carry a
/// footer in their last [`HEADER_SIZE`] bytes, which stores only the size so
/// that we can jump from a block to the one before it:
///
/// ```text
///        Allocated block                    Free block
/// +---------------------+ <--+      +---------------------+ <--+
/// | size | 0 | p | 1    |    |      | size | 0 | p | 0    |    |
/// +---------------------+    |      +---------------------+    |
/// |                     |    |      |                     |    |
/// |       Payload       |    |-size |       Unused        |    |-size
/// |         ...         |    |      |         ...         |    |
/// |                     |    |      +---------------------+    |
/// |                     |    |      |    size (footer)    |    |
/// +---------------------+ <--+      +---------------------+ <--+
/// ```
///
/// The rest of the crate reads and writes headers only through this type.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header(i32);

impl Header {
    /// Builds a header for a block of `size` bytes.
    #[inline]
    pub fn new(size: usize, allocated: bool, prev_allocated: bool) -> Self {
        debug_assert!(size.is_multiple_of(ALIGNMENT), "unaligned block size {size}");
        debug_assert!(size <= i32::MAX as usize, "block size {size} overflows header");

        let mut raw = size as i32;
        if allocated {
            raw |= A_BIT;
        }
        if prev_allocated {
            raw |= P_BIT;
        }

        Self(raw)
    }

    /// Decodes the word as stored in the heap.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Total size of the block in bytes, header included.
    #[inline]
    pub const fn size(self) -> usize {
        (self.0 & !STATUS_MASK) as usize
    }

    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & A_BIT != 0
    }

    #[inline]
    pub const fn is_prev_allocated(self) -> bool {
        self.0 & P_BIT != 0
    }

    /// Whether this word is the end mark and not a real block.
    #[inline]
    pub const fn is_end_mark(self) -> bool {
        self.0 == END_MARK
    }

    #[inline]
    pub const fn with_allocated(self, allocated: bool) -> Self {
        if allocated { Self(self.0 | A_BIT) } else { Self(self.0 & !A_BIT) }
    }

    #[inline]
    pub const fn with_prev_allocated(self, prev_allocated: bool) -> Self {
        if prev_allocated { Self(self.0 | P_BIT) } else { Self(self.0 & !P_BIT) }
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end_mark() {
            return f.write_str("Header(END)");
        }

        f.debug_struct("Header")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .field("prev_allocated", &self.is_prev_allocated())
            .finish()
    }
}

/// Rounds `size` up to the next multiple of `alignment`, which must be a
/// power of two.
#[inline]
pub(crate) const fn align(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

/// Total block size needed to hand out `payload` bytes: the header plus the
/// payload, rounded up to [`ALIGNMENT`].
#[inline]
pub(crate) const fn block_size_for(payload: usize) -> usize {
    align(payload + HEADER_SIZE, ALIGNMENT)
}

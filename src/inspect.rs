//! Read only views of the heap: the block report used for debugging and
//! the consistency checker used by the tests.

use std::fmt;

use crate::{
    block::{ALIGNMENT, END_MARK, HEADER_SIZE},
    error::HeapError,
    region::{FIRST_BLOCK, RESERVED, Region},
};

/// Status of a block as shown in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Handed out to a caller.
    Used,
    /// Available for allocation.
    Free,
}

impl Status {
    fn from_bit(allocated: bool) -> Self {
        if allocated { Self::Used } else { Self::Free }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Used => "used",
            Self::Free => "Free",
        })
    }
}

/// One block of the heap as decoded from its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Position of the block in the heap, starting at 1.
    pub index: usize,
    /// Address of the first byte of the block (its header).
    pub begin: usize,
    /// Address of the last byte of the block.
    pub end: usize,
    /// Total size of the block, header included.
    pub size: usize,
    /// Status of this block.
    pub status: Status,
    /// Status of the block right before this one.
    pub prev_status: Status,
}

/// Snapshot of every block in the heap, in address order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapReport {
    /// Blocks from the start of the heap up to the end mark.
    pub blocks: Vec<BlockRecord>,
    /// Bytes in allocated blocks.
    pub used: usize,
    /// Bytes in free blocks.
    pub free: usize,
}

impl HeapReport {
    pub(crate) fn new(region: &Region) -> Self {
        let base = region.base().as_ptr() as usize;
        let mut report = Self::default();

        for (index, (offset, header)) in region.blocks().enumerate() {
            let size = header.size();

            if header.is_allocated() {
                report.used += size;
            } else {
                report.free += size;
            }

            report.blocks.push(BlockRecord {
                index: index + 1,
                begin: base + offset,
                end: base + offset + size - 1,
                size,
                status: Status::from_bit(header.is_allocated()),
                prev_status: Status::from_bit(header.is_prev_allocated()),
            });
        }

        report
    }

    /// Used plus free bytes.
    pub fn total(&self) -> usize {
        self.used + self.free
    }

    pub fn free_blocks(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.iter().filter(|block| block.status == Status::Free)
    }
}

const RULE: &str = "---------------------------------------------------------------------------------";
const STARS: &str = "*********************************************************************************";

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{STARS}")?;
        writeln!(f, "No.\tStatus\tPrev\tt_Begin\t\tt_End\t\tt_Size")?;
        writeln!(f, "{RULE}")?;

        for block in &self.blocks {
            writeln!(
                f,
                "{}\t{}\t{}\t{:#010x}\t{:#010x}\t{}",
                block.index, block.status, block.prev_status, block.begin, block.end, block.size
            )?;
        }

        writeln!(f, "{RULE}")?;
        writeln!(f, "{STARS}")?;
        writeln!(f, "Total used size = {}", self.used)?;
        writeln!(f, "Total free size = {}", self.free)?;
        writeln!(f, "Total size = {}", self.total())?;
        write!(f, "{STARS}")
    }
}

fn corrupted(offset: usize, reason: impl Into<String>) -> HeapError {
    HeapError::Corrupted {
        offset,
        reason: reason.into(),
    }
}

/// Walks the raw bytes of `region` and checks every invariant of the block
/// format. `cursor` is the next fit cursor, which must sit on a block.
pub(crate) fn verify(region: &Region, cursor: Option<usize>) -> Result<(), HeapError> {
    let end_mark = region.end_mark();

    if region.word(end_mark) != END_MARK {
        return Err(corrupted(end_mark, "end mark overwritten"));
    }

    let mut offset = FIRST_BLOCK;
    // The first block has no real predecessor, so it is considered allocated.
    let mut prev_allocated = true;
    let mut cursor_found = cursor.is_none();
    let mut total = 0;

    while offset < end_mark {
        let header = region.header(offset);
        let size = header.size();

        if size < HEADER_SIZE || !size.is_multiple_of(ALIGNMENT) {
            return Err(corrupted(offset, format!("invalid block size {size}")));
        }
        if size > end_mark - offset {
            return Err(corrupted(offset, format!("block of {size} bytes runs past the end mark")));
        }
        if header.is_prev_allocated() != prev_allocated {
            return Err(corrupted(offset, "p-bit does not match previous block"));
        }
        if !header.is_allocated() {
            if !prev_allocated {
                return Err(corrupted(offset, "two adjacent free blocks"));
            }
            let footer = region.footer_before(offset + size);
            if footer != size {
                return Err(corrupted(offset, format!("footer {footer} does not match size {size}")));
            }
        }

        cursor_found |= cursor == Some(offset);
        prev_allocated = header.is_allocated();
        total += size;
        offset += size;
    }

    if total + RESERVED != region.len() {
        return Err(corrupted(offset, format!("blocks cover {total} of {} bytes", region.capacity())));
    }

    if !cursor_found {
        return Err(corrupted(cursor.unwrap_or_default(), "cursor does not point at a block"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> Region {
        Region::map(4096).expect("could not map test region")
    }

    #[test]
    fn fresh_region_reports_one_free_block() {
        let region = region();
        let report = HeapReport::new(&region);

        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.used, 0);
        assert_eq!(report.free, region.capacity());
        assert_eq!(report.total(), region.capacity());

        let block = &report.blocks[0];
        assert_eq!(block.index, 1);
        assert_eq!(block.begin, region.base().as_ptr() as usize + FIRST_BLOCK);
        assert_eq!(block.end - block.begin + 1, block.size);
        assert_eq!(block.status, Status::Free);
        assert_eq!(block.prev_status, Status::Used);
    }

    #[test]
    fn report_tracks_used_and_free() {
        let mut region = region();
        region.reserve(FIRST_BLOCK, 104);

        let report = HeapReport::new(&region);

        assert_eq!(report.used, 104);
        assert_eq!(report.free, region.capacity() - 104);
        assert_eq!(report.free_blocks().count(), 1);
        assert_eq!(report.blocks[1].prev_status, Status::Used);
    }

    #[test]
    fn display_lists_every_block_and_totals() {
        let mut region = region();
        region.reserve(FIRST_BLOCK, 16);

        let dump = HeapReport::new(&region).to_string();

        assert!(dump.contains("No.\tStatus\tPrev"));
        assert!(dump.contains("1\tused\tused\t"));
        assert!(dump.contains("2\tFree\tused\t"));
        assert!(dump.contains(&format!("Total size = {}", region.capacity())));
    }

    #[test]
    fn verify_accepts_valid_heaps() {
        let mut region = region();
        assert_eq!(verify(&region, None), Ok(()));

        region.reserve(FIRST_BLOCK, 16);
        region.reserve(FIRST_BLOCK + 16, 32);
        region.release(FIRST_BLOCK);

        assert_eq!(verify(&region, Some(FIRST_BLOCK + 16)), Ok(()));
    }

    #[test]
    fn verify_rejects_wrong_p_bit() {
        let mut region = region();
        let header = region.header(FIRST_BLOCK);
        region.set_header(FIRST_BLOCK, header.with_prev_allocated(false));

        assert!(matches!(
            verify(&region, None),
            Err(HeapError::Corrupted { offset: FIRST_BLOCK, .. })
        ));
    }

    #[test]
    fn verify_rejects_stray_cursor() {
        let region = region();

        assert!(matches!(
            verify(&region, Some(FIRST_BLOCK + 8)),
            Err(HeapError::Corrupted { .. })
        ));
    }
}

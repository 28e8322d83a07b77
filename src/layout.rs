//! Addressing of segment usage entries inside the metadata blocks.
//!
//! Entries are packed back to back. Block 0 starts with the file header,
//! which occupies the space of `first_entry_offset` entries, so segment
//! `n` is stored in the `(n + first_entry_offset)`th entry slot overall.

use crate::{Error, Result, SegmentId, HEADER_SIZE, MIN_SEGMENT_USAGE_SIZE};

/// Index of a block within the segment usage file.
pub type BlockIndex = u64;

/// Entry placement for one block size and entry size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    entry_size: usize,
    entries_per_block: u64,
    first_entry_offset: u64,
}

impl Layout {
    pub fn new(block_size: usize, entry_size: usize) -> Result<Layout> {
        if entry_size < MIN_SEGMENT_USAGE_SIZE || entry_size > block_size {
            return Err(Error::invalid(format!(
                "segment usage size {} is out of bounds for {} byte blocks",
                entry_size, block_size
            )));
        }

        let entries_per_block = (block_size / entry_size) as u64;
        let first_entry_offset = HEADER_SIZE.div_ceil(entry_size) as u64;

        if entries_per_block <= first_entry_offset {
            return Err(Error::invalid(format!(
                "{} byte blocks cannot hold the header and any {} byte entry",
                block_size, entry_size
            )));
        }

        Ok(Layout { entry_size, entries_per_block, first_entry_offset })
    }

    pub const fn entry_size(&self) -> usize {
        self.entry_size
    }

    pub const fn entries_per_block(&self) -> u64 {
        self.entries_per_block
    }

    /// Header footprint in block 0, counted in entries.
    pub const fn first_entry_offset(&self) -> u64 {
        self.first_entry_offset
    }

    pub const fn block_of(&self, segnum: SegmentId) -> BlockIndex {
        (segnum + self.first_entry_offset) / self.entries_per_block
    }

    /// Entry slot of `segnum` within its block.
    pub const fn slot_of(&self, segnum: SegmentId) -> u64 {
        (segnum + self.first_entry_offset) % self.entries_per_block
    }

    /// Byte offset of the entry for `segnum` within its block.
    pub const fn offset_of(&self, segnum: SegmentId) -> usize {
        self.slot_of(segnum) as usize * self.entry_size
    }

    /// How many consecutive segments starting at `curr`, and not past
    /// `max`, share the block holding `curr`.
    pub const fn entries_in_block(&self, curr: SegmentId, max: SegmentId) -> u64 {
        let left_in_block = self.entries_per_block - self.slot_of(curr);
        let left_in_range = max - curr + 1;
        if left_in_block < left_in_range { left_in_block } else { left_in_range }
    }

    /// The lowest segment whose entry is stored in `block`.
    pub const fn first_segnum_of(&self, block: BlockIndex) -> SegmentId {
        (block * self.entries_per_block).saturating_sub(self.first_entry_offset)
    }

    /// Number of blocks needed to hold `nsegs` entries and the header.
    pub const fn blocks_for(&self, nsegs: u64) -> u64 {
        (nsegs + self.first_entry_offset).div_ceil(self.entries_per_block)
    }
}

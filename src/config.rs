use crate::{Error, Result, SegmentId, MIN_SEGMENT_USAGE_SIZE};

/// Smallest number of segments always kept back from user data.
pub const MIN_RESERVED_SEGMENTS: u64 = 8;

/// Format and mount-time parameters of a segment usage file.
///
/// The entry size and block size are fixed when the file is formatted
/// and must be supplied identically on every subsequent open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    block_size: usize,
    entry_size: usize,
    segment_count: u64,
    blocks_per_segment: u64,
    first_data_block: u64,
    sector_size: usize,
    reserved_segments_percentage: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            block_size: 4096,
            entry_size: MIN_SEGMENT_USAGE_SIZE,
            segment_count: 1024,
            blocks_per_segment: 2048,
            first_data_block: 1,
            sector_size: 512,
            reserved_segments_percentage: 5,
        }
    }
}

macro_rules! builder {
    ($(($name:ident, $get:ident, $set:ident, $t:ty, $desc:expr)),*) => {
        $(
            #[doc="Get "]
            #[doc=$desc]
            pub fn $get(&self) -> $t {
                self.$name
            }

            #[doc="Set "]
            #[doc=$desc]
            pub fn $set(&mut self, to: $t) {
                self.$name = to;
            }

            #[doc="Builder, set "]
            #[doc=$desc]
            pub fn $name(&self, to: $t) -> Config {
                let mut ret = self.clone();
                ret.$name = to;
                ret
            }
        )*
    }
}

impl Config {
    builder!(
        (block_size, get_block_size, set_block_size, usize, "size in bytes of each metadata block"),
        (entry_size, get_entry_size, set_entry_size, usize, "size in bytes of each segment usage entry"),
        (segment_count, get_segment_count, set_segment_count, u64, "number of segments created at format time"),
        (blocks_per_segment, get_blocks_per_segment, set_blocks_per_segment, u64, "number of device blocks in each segment"),
        (first_data_block, get_first_data_block, set_first_data_block, u64, "first device block of segment 0"),
        (sector_size, get_sector_size, set_sector_size, usize, "logical sector size of the block device"),
        (reserved_segments_percentage, get_reserved_segments_percentage, set_reserved_segments_percentage, u64, "percentage of segments held in reserve")
    );

    /// Checks that the configured sizes describe a usable layout.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() {
            return Err(Error::invalid(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.entry_size > self.block_size {
            log::error!(
                "too large segment usage size: {} bytes",
                self.entry_size
            );
            return Err(Error::invalid(format!(
                "too large segment usage size: {} bytes",
                self.entry_size
            )));
        }
        if self.entry_size < MIN_SEGMENT_USAGE_SIZE {
            log::error!(
                "too small segment usage size: {} bytes",
                self.entry_size
            );
            return Err(Error::invalid(format!(
                "too small segment usage size: {} bytes",
                self.entry_size
            )));
        }
        if self.sector_size == 0
            || self.sector_size > self.block_size
            || self.block_size % self.sector_size != 0
        {
            return Err(Error::invalid(format!(
                "sector size {} does not divide block size {}",
                self.sector_size, self.block_size
            )));
        }
        if self.segment_count == 0 {
            return Err(Error::invalid("a file needs at least one segment"));
        }
        if self.blocks_per_segment == 0
            || self.first_data_block >= self.blocks_per_segment
        {
            return Err(Error::invalid(format!(
                "segments of {} blocks cannot start at block {}",
                self.blocks_per_segment, self.first_data_block
            )));
        }
        if self.reserved_segments_percentage > 100 {
            return Err(Error::invalid(format!(
                "reserved segment percentage {} exceeds 100",
                self.reserved_segments_percentage
            )));
        }
        Ok(())
    }

    /// The device geometry implied by this configuration.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size as u64,
            blocks_per_segment: self.blocks_per_segment,
            first_data_block: self.first_data_block,
            sectors_per_block: (self.block_size / self.sector_size.max(1))
                as u64,
        }
    }

    /// Number of segments that must stay clean for a filesystem
    /// of `nsegs` segments.
    pub fn reserved_segments(&self, nsegs: u64) -> u64 {
        reserved_segments(nsegs, self.reserved_segments_percentage)
    }
}

/// `percentage` percent of `nsegs`, rounded up, but never fewer than
/// `MIN_RESERVED_SEGMENTS`.
pub fn reserved_segments(nsegs: u64, percentage: u64) -> u64 {
    nsegs
        .saturating_mul(percentage)
        .div_ceil(100)
        .max(MIN_RESERVED_SEGMENTS)
}

/// Fixed mapping between segments and device blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u64,
    pub blocks_per_segment: u64,
    pub first_data_block: u64,
    pub sectors_per_block: u64,
}

impl Geometry {
    /// First and last device block (inclusive) of a segment. Segment 0
    /// is shortened by the blocks preceding the first data block.
    pub fn segment_range(&self, segnum: SegmentId) -> (u64, u64) {
        let start = segnum * self.blocks_per_segment;
        let end = start + self.blocks_per_segment - 1;
        if segnum == 0 { (self.first_data_block, end) } else { (start, end) }
    }

    pub fn segnum_of_block(&self, block: u64) -> SegmentId {
        block / self.blocks_per_segment
    }

    pub fn segment_bytes(&self) -> u64 {
        self.blocks_per_segment * self.block_size
    }
}

//! The on-disk records of the segment usage file and the public
//! snapshots built from them.
//!
//! A header of three little-endian `u64`s (clean count, dirty count,
//! last allocated segment) starts block 0. Each entry is a `u64`
//! modification time, a `u32` live block count and `u32` flags,
//! padded with zeroes to the configured entry size.

use serde::{Deserialize, Serialize};

use crate::{Result, SegmentId};

/// Encoded size of `Header`.
pub const HEADER_SIZE: usize = 24;

/// Encoded size of `SegmentUsage`, and the smallest entry size a
/// file may be formatted with.
pub const MIN_SEGMENT_USAGE_SIZE: usize = 16;

bitflags::bitflags! {
    /// Lifecycle flags of a segment.
    #[derive(Default, Serialize, Deserialize)]
    pub struct SegmentFlags: u32 {
        /// The segment is being written to. Never persisted, only
        /// projected into snapshots from the running filesystem.
        const ACTIVE = 1 << 0;
        /// The segment has been allocated.
        const DIRTY = 1 << 1;
        /// The segment is excluded from allocation.
        const ERROR = 1 << 2;
    }
}

impl SegmentFlags {
    /// Flags that are allowed to reach the disk.
    pub const PERSISTED: SegmentFlags = SegmentFlags::from_bits_truncate(
        SegmentFlags::DIRTY.bits() | SegmentFlags::ERROR.bits(),
    );
}

bitflags::bitflags! {
    /// Selects which fields of a `SegmentUsageUpdate` are applied.
    #[derive(Default, Serialize, Deserialize)]
    pub struct UpdateFields: u32 {
        const LASTMOD = 1 << 0;
        const NBLOCKS = 1 << 1;
        const FLAGS = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Header {
    pub clean: u64,
    pub dirty: u64,
    pub last_alloc: u64,
}

impl Header {
    pub(crate) fn read(block: &[u8]) -> Result<Header> {
        Ok(bincode::deserialize(&block[..HEADER_SIZE])?)
    }

    pub(crate) fn write(&self, block: &mut [u8]) -> Result<()> {
        bincode::serialize_into(&mut block[..HEADER_SIZE], self)?;
        Ok(())
    }

    /// Applies signed deltas to both counters.
    pub(crate) fn adjust(&mut self, clean_delta: i64, dirty_delta: i64) {
        self.clean = self.clean.wrapping_add_signed(clean_delta);
        self.dirty = self.dirty.wrapping_add_signed(dirty_delta);
    }
}

/// A segment usage entry as stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUsage {
    pub last_modified: u64,
    pub live_blocks: u32,
    flags: u32,
}

impl SegmentUsage {
    pub(crate) fn read(block: &[u8], offset: usize) -> Result<SegmentUsage> {
        Ok(bincode::deserialize(
            &block[offset..offset + MIN_SEGMENT_USAGE_SIZE],
        )?)
    }

    pub(crate) fn write(&self, block: &mut [u8], offset: usize) -> Result<()> {
        bincode::serialize_into(
            &mut block[offset..offset + MIN_SEGMENT_USAGE_SIZE],
            self,
        )?;
        Ok(())
    }

    pub fn flags(&self) -> SegmentFlags {
        SegmentFlags::from_bits_truncate(self.flags)
    }

    pub(crate) fn set_flags(&mut self, flags: SegmentFlags) {
        self.flags = (flags & SegmentFlags::PERSISTED).bits();
    }

    /// Cleanliness looks at the flags only. An entry with no flags but
    /// a stale live block count is still clean and can be allocated.
    pub fn is_clean(&self) -> bool {
        self.flags == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(SegmentFlags::DIRTY)
    }

    pub fn is_error(&self) -> bool {
        self.flags().contains(SegmentFlags::ERROR)
    }

    pub(crate) fn set_clean(&mut self) {
        *self = SegmentUsage::default();
    }

    pub(crate) fn set_dirty(&mut self) {
        self.flags |= SegmentFlags::DIRTY.bits();
    }

    pub(crate) fn set_error(&mut self) {
        self.flags |= SegmentFlags::ERROR.bits();
    }

    /// Allocated but holding nothing worth keeping.
    pub(crate) fn is_garbage(&self) -> bool {
        self.flags == SegmentFlags::DIRTY.bits() && self.live_blocks == 0
    }
}

/// A snapshot of one segment's usage, with `ACTIVE` projected in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUsageInfo {
    pub last_modified: u64,
    pub live_blocks: u32,
    pub flags: SegmentFlags,
}

impl SegmentUsageInfo {
    pub fn is_clean(&self) -> bool {
        (self.flags & SegmentFlags::PERSISTED).is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(SegmentFlags::DIRTY)
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(SegmentFlags::ACTIVE)
    }
}

/// A request to overwrite selected fields of a segment's entry.
///
/// `fields` is kept as raw bits because it is usually received from
/// outside the process; unknown bits are rejected when applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUsageUpdate {
    pub segnum: SegmentId,
    pub fields: u32,
    pub info: SegmentUsageInfo,
}

impl SegmentUsageUpdate {
    pub fn new(segnum: SegmentId) -> SegmentUsageUpdate {
        SegmentUsageUpdate {
            segnum,
            fields: 0,
            info: SegmentUsageInfo::default(),
        }
    }

    pub fn last_modified(mut self, lastmod: u64) -> SegmentUsageUpdate {
        self.fields |= UpdateFields::LASTMOD.bits();
        self.info.last_modified = lastmod;
        self
    }

    pub fn live_blocks(mut self, nblocks: u32) -> SegmentUsageUpdate {
        self.fields |= UpdateFields::NBLOCKS.bits();
        self.info.live_blocks = nblocks;
        self
    }

    pub fn flags(mut self, flags: SegmentFlags) -> SegmentUsageUpdate {
        self.fields |= UpdateFields::FLAGS.bits();
        self.info.flags = flags;
        self
    }

    pub(crate) fn selected(&self) -> Option<UpdateFields> {
        UpdateFields::from_bits(self.fields)
    }
}

/// Aggregate segment usage statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub segment_count: u64,
    pub clean_count: u64,
    pub dirty_count: u64,
    /// Creation time of the last segment written.
    pub creation_time: u64,
    /// Creation time of the last segment not written by the cleaner.
    pub nongc_creation_time: u64,
    pub protection_sequence: u64,
}

/// Counts recomputed from the entries themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub clean: u64,
    pub dirty: u64,
    pub error: u64,
}

impl std::ops::Add for Counts {
    type Output = Counts;

    fn add(self, other: Counts) -> Counts {
        Counts {
            clean: self.clean + other.clean,
            dirty: self.dirty + other.dirty,
            error: self.error + other.error,
        }
    }
}

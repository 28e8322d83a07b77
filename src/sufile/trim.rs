use super::SegmentUsageFile;
use crate::{
    block_store::{BlockStore, Fetch},
    context::FsContext,
    usage::SegmentUsage,
    Error, Result, SegmentId,
};

/// A byte range of the device whose clean segments should be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRange {
    pub start: u64,
    pub len: u64,
    /// Runs of clean space shorter than this many bytes are skipped.
    pub minlen: u64,
}

impl TrimRange {
    pub fn new(start: u64, len: u64, minlen: u64) -> TrimRange {
        TrimRange { start, len, minlen }
    }
}

/// A run of device blocks.
#[derive(Debug, Clone, Copy)]
struct Extent {
    start: u64,
    len: u64,
}

impl Extent {
    fn end(&self) -> u64 {
        self.start + self.len
    }
}

struct Trimmer<'a, S: BlockStore, C: FsContext> {
    sufile: &'a SegmentUsageFile<S, C>,
    start_block: u64,
    end_block: u64,
    minlen: u64,
    extent: Option<Extent>,
    discarded: u64,
}

impl<S: BlockStore, C: FsContext> Trimmer<'_, S, C> {
    fn push_clean(&mut self, segnum: SegmentId) -> Result<()> {
        let (seg_start, seg_end) = self.sufile.geometry.segment_range(segnum);
        let next = Extent { start: seg_start, len: seg_end - seg_start + 1 };

        match self.extent.as_mut() {
            Some(extent) if extent.end() == seg_start => {
                extent.len += next.len;
                return Ok(());
            }
            Some(extent) => {
                let done = *extent;
                self.discard(done, None)?;
            }
            None => {}
        }
        self.extent = Some(next);
        Ok(())
    }

    /// Clips `extent` to the trimmed range and discards it if it is
    /// still long enough.
    fn discard(&mut self, mut extent: Extent, ceiling: Option<u64>) -> Result<()> {
        if extent.start < self.start_block {
            extent.len = extent.end().saturating_sub(self.start_block);
            extent.start = self.start_block;
        }
        if let Some(end_block) = ceiling {
            if extent.end() > end_block + 1 {
                extent.len = (end_block + 1).saturating_sub(extent.start);
            }
        }
        if extent.len == 0 || extent.len < self.minlen {
            return Ok(());
        }

        let sectors_per_block = self.sufile.geometry.sectors_per_block;
        self.sufile
            .ctx
            .discard(
                extent.start * sectors_per_block,
                extent.len * sectors_per_block,
            )
            .map_err(|e| {
                log::warn!("discard of {:?} failed: {}", extent, e);
                Error::Io(e)
            })?;

        self.discarded += extent.len;
        Ok(())
    }

    fn finish(mut self) -> Result<u64> {
        if let Some(extent) = self.extent.take() {
            let end_block = self.end_block;
            self.discard(extent, Some(end_block))?;
        }
        Ok(self.discarded)
    }
}

impl<S: BlockStore, C: FsContext> SegmentUsageFile<S, C> {
    /// Discards the clean segments inside `range`, coalescing adjacent
    /// ones. Returns the number of bytes discarded.
    pub fn trim(&self, range: TrimRange) -> Result<u64> {
        let state = self.state.read();

        let block_size = self.geometry.block_size;
        let len = range.len / block_size;
        let max_blocks = state.segment_count * self.geometry.blocks_per_segment;

        if len == 0 || range.start >= max_blocks.saturating_mul(block_size) {
            return Err(Error::invalid(format!(
                "cannot trim {} bytes at {} of a {} block device",
                range.len, range.start, max_blocks
            )));
        }

        let start_block = range.start.div_ceil(block_size);
        let end_block = if max_blocks - start_block < len {
            max_blocks - 1
        } else {
            start_block + len - 1
        };

        let mut trimmer = Trimmer {
            sufile: self,
            start_block,
            end_block,
            minlen: range.minlen / block_size,
            extent: None,
            discarded: 0,
        };

        let mut segnum = self.geometry.segnum_of_block(start_block);
        let last = self.geometry.segnum_of_block(end_block);

        while segnum <= last {
            let n = self.layout.entries_in_block(segnum, last);
            let clean: Vec<SegmentId> = match self.entry_block(segnum, false)? {
                Fetch::Hole => (segnum..segnum + n).collect(),
                Fetch::Found(block) => {
                    let data = block.data();
                    let mut clean = Vec::with_capacity(n as usize);
                    for segnum in segnum..segnum + n {
                        let offset = self.layout.offset_of(segnum);
                        if SegmentUsage::read(&data, offset)?.is_clean() {
                            clean.push(segnum);
                        }
                    }
                    clean
                }
            };

            for segnum in clean {
                trimmer.push_clean(segnum)?;
            }
            segnum += n;
        }

        let discarded = trimmer.finish()? * block_size;
        log::debug!("trimmed {} bytes", discarded);
        Ok(discarded)
    }
}

use super::{SegmentUsageFile, State};
use crate::{
    block_store::{Block, BlockStore},
    context::FsContext,
    usage::{Header, SegmentFlags, SegmentUsage},
    Error, Result, SegmentId,
};

/// The part of a truncated range that shares one block.
struct Chunk {
    first: SegmentId,
    len: u64,
    block: Option<Block>,
}

impl<S: BlockStore, C: FsContext> SegmentUsageFile<S, C> {
    /// Changes the number of segments to `new_count`.
    ///
    /// Growing adds clean segments. Shrinking requires the removed tail
    /// to hold nothing but clean or errored, inactive segments, and
    /// enough clean segments to remain that the reserve is kept.
    pub fn resize(&self, new_count: u64) -> Result<()> {
        let mut state = self.state.write();
        let nsegs = state.segment_count;

        if new_count == nsegs {
            return Ok(());
        }
        if new_count == 0 {
            return Err(Error::invalid("cannot resize to zero segments"));
        }

        let header_block = self.header_block()?;

        if new_count > nsegs {
            state.clean_count += new_count - nsegs;
            state.alloc_max = new_count - 1;
        } else {
            let reserved = self.ctx.reserved_segments(new_count);
            let removed = nsegs - new_count;
            if removed + reserved > state.clean_count {
                log::debug!(
                    "cannot shrink to {} segments: {} clean, {} reserved",
                    new_count,
                    state.clean_count,
                    reserved
                );
                return Err(Error::OutOfSpace);
            }

            self.truncate(&mut state, &header_block, new_count, nsegs - 1)?;

            state.clean_count -= removed;
            state.alloc_min = 0;
            state.alloc_max = new_count - 1;
        }

        {
            let mut data = header_block.data();
            let mut header = Header::read(&data)?;
            header.clean = state.clean_count;
            header.write(&mut data)?;
        }
        state.segment_count = new_count;

        self.store.mark_dirty(&header_block);
        self.store.mark_file_dirty();

        log::debug!(
            "resized segment usage file from {} to {} segments",
            nsegs,
            new_count
        );
        Ok(())
    }

    /// Resets the segments in `[start, end]` to the unused state.
    ///
    /// Errored entries are cleared and blocks covered entirely by the
    /// range are deleted. If any segment in the range is dirty or
    /// active, nothing is changed.
    pub fn truncate_range(&self, start: SegmentId, end: SegmentId) -> Result<()> {
        let mut state = self.state.write();
        let header_block = self.header_block()?;
        self.truncate(&mut state, &header_block, start, end)
    }

    fn truncate(
        &self,
        state: &mut State,
        header_block: &Block,
        start: SegmentId,
        end: SegmentId,
    ) -> Result<()> {
        if start > end || end >= state.segment_count {
            return Err(Error::invalid(format!(
                "cannot truncate [{}, {}] of {} segments",
                start, end, state.segment_count
            )));
        }

        let mut chunks = vec![];
        let mut segnum = start;
        while segnum <= end {
            let len = self.layout.entries_in_block(segnum, end);
            let block = self.entry_block(segnum, false)?.found();
            self.check_truncatable(block.as_ref(), segnum, len)?;
            chunks.push(Chunk { first: segnum, len, block });
            segnum += len;
        }

        let mut cleaned = 0_u64;
        let mut res = Ok(());
        for chunk in chunks {
            let Some(block) = chunk.block else {
                continue;
            };
            let cleared =
                self.clear_chunk(&block, chunk.first, chunk.len, &mut cleaned);
            if let Err(e) = cleared {
                res = Err(e);
                break;
            }
        }

        // cleared entries are counted even if a later chunk failed
        if cleaned > 0 {
            self.adjust_counters(state, header_block, cleaned as i64, 0)?;
            self.store.mark_file_dirty();
            log::debug!(
                "cleared {} erroneous segments in [{}, {}]",
                cleaned,
                start,
                end
            );
        }
        res
    }

    /// Clears the errored entries of one chunk, adding them to `cleaned`
    /// as they are written, and deletes the block once it is all zero.
    fn clear_chunk(
        &self,
        block: &Block,
        first: SegmentId,
        len: u64,
        cleaned: &mut u64,
    ) -> Result<()> {
        let mut nc = 0;
        let res = {
            let mut data = block.data();
            let mut res = Ok(());
            for segnum in first..first + len {
                let offset = self.layout.offset_of(segnum);
                let mut su = match SegmentUsage::read(&data, offset) {
                    Ok(su) => su,
                    Err(e) => {
                        res = Err(e);
                        break;
                    }
                };
                if !su.is_error() {
                    continue;
                }
                su.set_clean();
                if let Err(e) = su.write(&mut data, offset) {
                    res = Err(e);
                    break;
                }
                nc += 1;
            }
            res
        };
        if nc > 0 {
            self.store.mark_dirty(block);
            *cleaned += nc;
        }
        res?;

        if len == self.layout.entries_per_block() && block.is_zeroed() {
            self.store.delete_block(block.index())?;
        }
        Ok(())
    }

    fn check_truncatable(
        &self,
        block: Option<&Block>,
        first: SegmentId,
        len: u64,
    ) -> Result<()> {
        let data = block.map(Block::data);
        for segnum in first..first + len {
            let busy_flags = match &data {
                Some(data) => {
                    let offset = self.layout.offset_of(segnum);
                    let su = SegmentUsage::read(data, offset)?;
                    !(su.flags() - SegmentFlags::ERROR).is_empty()
                }
                None => false,
            };
            if busy_flags || self.ctx.is_segment_active(segnum) {
                log::debug!("segment {} is busy, cannot truncate", segnum);
                return Err(Error::Busy { segnum });
            }
        }
        Ok(())
    }
}

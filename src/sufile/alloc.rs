use super::{created_block, SegmentUsageFile, State};
use crate::{
    block_store::{Block, BlockStore},
    context::FsContext,
    usage::{Header, SegmentUsage},
    Error, Result, SegmentId,
};

impl<S: BlockStore, C: FsContext> SegmentUsageFile<S, C> {
    /// Claims a clean segment for the segment writer.
    ///
    /// The search resumes after the last segment handed out, wrapping
    /// within the allocation window, and only then looks above and
    /// below the window. Each segment is visited at most once.
    pub fn allocate(&self) -> Result<SegmentId> {
        let mut state = self.state.write();

        if state.clean_count == 0 {
            log::debug!("no clean segment left to allocate");
            return Err(Error::OutOfSpace);
        }

        let header_block = self.header_block()?;
        let last_alloc = Header::read(&header_block.data())?.last_alloc;

        let nsegs = state.segment_count;
        let (min, max) = (state.alloc_min, state.alloc_max);

        let mut start = last_alloc.wrapping_add(1);
        if start < min || start > max {
            start = min;
        }

        let regions = [
            Some((start, max)),
            (start > min).then(|| (min, start - 1)),
            (max + 1 < nsegs).then(|| (max + 1, nsegs - 1)),
            (min > 0).then(|| (0, min - 1)),
        ];

        for (lo, hi) in regions.into_iter().flatten() {
            if let Some(segnum) =
                self.claim_first_clean(&mut state, &header_block, lo, hi)?
            {
                log::trace!("allocated segment {}", segnum);
                return Ok(segnum);
            }
        }

        log::warn!(
            "{} segments counted clean but none could be found",
            state.clean_count
        );
        Err(Error::OutOfSpace)
    }

    /// Scans `[lo, hi]` block by block and dirties the first clean
    /// entry found.
    fn claim_first_clean(
        &self,
        state: &mut State,
        header_block: &Block,
        lo: SegmentId,
        hi: SegmentId,
    ) -> Result<Option<SegmentId>> {
        let mut segnum = lo;
        while segnum <= hi {
            let n = self.layout.entries_in_block(segnum, hi);
            let block =
                created_block(&self.store, self.layout.block_of(segnum))?;

            let claimed = {
                let mut data = block.data();
                let mut claimed = None;
                for candidate in segnum..segnum + n {
                    let offset = self.layout.offset_of(candidate);
                    let mut su = SegmentUsage::read(&data, offset)?;
                    if !su.is_clean() {
                        continue;
                    }
                    su.set_dirty();
                    su.write(&mut data, offset)?;
                    claimed = Some(candidate);
                    break;
                }
                claimed
            };

            if let Some(claimed) = claimed {
                {
                    let mut data = header_block.data();
                    let mut header = Header::read(&data)?;
                    header.adjust(-1, 1);
                    header.last_alloc = claimed;
                    header.write(&mut data)?;
                }
                state.clean_count -= 1;

                self.store.mark_dirty(header_block);
                self.store.mark_dirty(&block);
                self.store.mark_file_dirty();
                return Ok(Some(claimed));
            }

            segnum += n;
        }
        Ok(None)
    }
}

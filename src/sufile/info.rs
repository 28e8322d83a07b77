use super::{created_block, SegmentUsageFile};
use crate::{
    block_store::{Block, BlockStore, Fetch},
    context::FsContext,
    layout::BlockIndex,
    usage::{
        Header, SegmentFlags, SegmentUsage, SegmentUsageInfo,
        SegmentUsageUpdate, Stats, UpdateFields,
    },
    Error, Result, SegmentId,
};

impl<S: BlockStore, C: FsContext> SegmentUsageFile<S, C> {
    /// Aggregate statistics read from the header.
    pub fn stat(&self) -> Result<Stats> {
        let state = self.state.read();
        let header_block = self.header_block()?;
        let header = Header::read(&header_block.data())?;

        Ok(Stats {
            segment_count: state.segment_count,
            clean_count: header.clean,
            dirty_count: header.dirty,
            creation_time: self.ctx.creation_time(),
            nongc_creation_time: self.ctx.nongc_creation_time(),
            protection_sequence: self.ctx.protection_sequence(),
        })
    }

    /// Snapshots up to `limit` consecutive entries starting at `start`.
    ///
    /// Entries in hole blocks read as all zero. Segments the writer
    /// currently owns carry `ACTIVE`.
    pub fn get_info(
        &self,
        start: SegmentId,
        limit: usize,
    ) -> Result<Vec<SegmentUsageInfo>> {
        let state = self.state.read();
        if start >= state.segment_count || limit == 0 {
            return Ok(vec![]);
        }

        let count = (state.segment_count - start).min(limit as u64);
        let last = start + count - 1;
        let mut ret = Vec::with_capacity(count as usize);

        let mut segnum = start;
        while segnum <= last {
            let n = self.layout.entries_in_block(segnum, last);
            match self.entry_block(segnum, false)? {
                Fetch::Hole => {
                    ret.extend((0..n).map(|_| SegmentUsageInfo::default()));
                }
                Fetch::Found(block) => {
                    let data = block.data();
                    for segnum in segnum..segnum + n {
                        let offset = self.layout.offset_of(segnum);
                        let su = SegmentUsage::read(&data, offset)?;
                        let mut flags = su.flags();
                        if self.ctx.is_segment_active(segnum) {
                            flags |= SegmentFlags::ACTIVE;
                        }
                        ret.push(SegmentUsageInfo {
                            last_modified: su.last_modified,
                            live_blocks: su.live_blocks,
                            flags,
                        });
                    }
                }
            }
            segnum += n;
        }

        Ok(ret)
    }

    /// Overwrites the selected fields of each update's entry.
    ///
    /// The whole batch is validated before anything is written.
    /// `ACTIVE`, and any flag this file does not know, are dropped
    /// from requested flags.
    pub fn set_info(&self, updates: &[SegmentUsageUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write();

        for update in updates {
            state.check_segnum(update.segnum)?;
            let Some(fields) = update.selected() else {
                return Err(Error::invalid(format!(
                    "unknown update fields {:#x} for segment {}",
                    update.fields, update.segnum
                )));
            };
            if fields.contains(UpdateFields::NBLOCKS)
                && u64::from(update.info.live_blocks)
                    > self.geometry.blocks_per_segment
            {
                return Err(Error::invalid(format!(
                    "{} live blocks do not fit a segment of {}",
                    update.info.live_blocks, self.geometry.blocks_per_segment
                )));
            }
        }

        let header_block = self.header_block()?;

        let mut clean_delta = 0_i64;
        let mut dirty_delta = 0_i64;
        let mut current: Option<(BlockIndex, Block)> = None;
        let mut res = Ok(());

        for update in updates {
            let index = self.layout.block_of(update.segnum);
            let block = match current.take() {
                Some((i, block)) if i == index => block,
                _ => match created_block(&self.store, index) {
                    Ok(block) => block,
                    Err(e) => {
                        res = Err(e);
                        break;
                    }
                },
            };

            match self.apply_update(&block, update) {
                Ok((clean, dirty)) => {
                    clean_delta += clean;
                    dirty_delta += dirty;
                }
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
            current = Some((index, block));
        }

        if clean_delta != 0 || dirty_delta != 0 {
            self.adjust_counters(
                &mut state,
                &header_block,
                clean_delta,
                dirty_delta,
            )?;
        }
        self.store.mark_file_dirty();

        res
    }

    /// Returns the clean and dirty counter deltas of one update.
    fn apply_update(
        &self,
        block: &Block,
        update: &SegmentUsageUpdate,
    ) -> Result<(i64, i64)> {
        let fields = update.selected().unwrap_or_default();
        let offset = self.layout.offset_of(update.segnum);

        let mut deltas = (0, 0);
        {
            let mut data = block.data();
            let mut su = SegmentUsage::read(&data, offset)?;

            if fields.contains(UpdateFields::LASTMOD) {
                su.last_modified = update.info.last_modified;
            }
            if fields.contains(UpdateFields::NBLOCKS) {
                su.live_blocks = update.info.live_blocks;
            }
            if fields.contains(UpdateFields::FLAGS) {
                let requested = update.info.flags - SegmentFlags::ACTIVE;
                let was_clean = su.is_clean();
                let was_dirty = su.is_dirty();

                su.set_flags(requested);

                deltas.0 = i64::from(su.is_clean()) - i64::from(was_clean);
                deltas.1 = i64::from(su.is_dirty()) - i64::from(was_dirty);
            }

            su.write(&mut data, offset)?;
        }
        self.store.mark_dirty(block);

        log::trace!("applied {:?} to segment {}", fields, update.segnum);
        Ok(deltas)
    }
}

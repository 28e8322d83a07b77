//! The segment usage file and its state-transition dispatcher.
//!
//! All mutation goes through a single `RwLock<State>`. Writers hold it
//! exclusively for the full read-modify-write of entries and header, so
//! the cached clean count, the header counters and the entries always
//! agree whenever the lock is free. Block contents have their own
//! mutexes, which are only ever taken while the state lock is held and
//! never more than one at a time: block 0 holds both the header and the
//! first entries.

use std::fmt;

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::{
    block_store::{Block, BlockStore, Fetch},
    config::{Config, Geometry},
    context::FsContext,
    layout::{BlockIndex, Layout},
    transition::Transition,
    usage::{Counts, Header, SegmentUsage},
    BatchError, Error, Result, SegmentId,
};

mod alloc;
mod info;
mod range;
mod trim;

pub use self::trim::TrimRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct State {
    segment_count: u64,
    /// Mirrors the header's clean counter.
    clean_count: u64,
    alloc_min: SegmentId,
    alloc_max: SegmentId,
}

impl State {
    fn check_segnum(&self, segnum: SegmentId) -> Result<()> {
        if segnum >= self.segment_count {
            log::warn!(
                "segment number {} out of range of {} segments",
                segnum,
                self.segment_count
            );
            return Err(Error::invalid(format!(
                "segment number {} out of range",
                segnum
            )));
        }
        Ok(())
    }
}

/// The segment usage file of one filesystem.
pub struct SegmentUsageFile<S: BlockStore, C: FsContext> {
    store: S,
    ctx: C,
    layout: Layout,
    geometry: Geometry,
    state: RwLock<State>,
}

impl<S: BlockStore, C: FsContext> fmt::Debug for SegmentUsageFile<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentUsageFile")
            .field("layout", &self.layout)
            .field("geometry", &self.geometry)
            .field("state", &*self.state.read())
            .finish()
    }
}

fn check_block_size<S: BlockStore>(store: &S, config: &Config) -> Result<()> {
    if store.block_size() != config.get_block_size() {
        return Err(Error::invalid(format!(
            "store has {} byte blocks but {} were configured",
            store.block_size(),
            config.get_block_size()
        )));
    }
    Ok(())
}

fn created_block<S: BlockStore>(store: &S, index: BlockIndex) -> Result<Block> {
    match store.get_block(index, true)? {
        Fetch::Found(block) => Ok(block),
        Fetch::Hole => Err(Error::corruption(format!(
            "block {} could not be materialized",
            index
        ))),
    }
}

/// Applies a transition to the clean entry a hole stands for. Only a
/// transition that leaves it untouched can succeed without a block.
fn apply_to_hole(segnum: SegmentId, transition: Transition) -> Result<()> {
    let mut su = SegmentUsage::default();
    if transition.apply(segnum, &mut su).changed {
        log::debug!("{:?} of segment {} hit a hole block", transition, segnum);
        return Err(Error::Hole { segnum });
    }
    Ok(())
}

impl<S: BlockStore, C: FsContext> SegmentUsageFile<S, C> {
    /// Writes a fresh file in which every segment is clean, and opens it.
    pub fn format(store: S, ctx: C, config: &Config) -> Result<Self> {
        config.validate()?;
        check_block_size(&store, config)?;
        let layout =
            Layout::new(config.get_block_size(), config.get_entry_size())?;
        let nsegs = config.get_segment_count();

        for index in 0..layout.blocks_for(nsegs) {
            let block = created_block(&store, index)?;
            block.data().fill(0);
            store.mark_dirty(&block);
        }

        let header_block = created_block(&store, 0)?;
        let header = Header { clean: nsegs, dirty: 0, last_alloc: u64::MAX };
        header.write(&mut header_block.data())?;
        store.mark_dirty(&header_block);
        store.mark_file_dirty();

        log::info!(
            "formatted segment usage file with {} segments in {} blocks",
            nsegs,
            layout.blocks_for(nsegs)
        );

        Self::open(store, ctx, config)
    }

    /// Opens an existing file for a filesystem of
    /// `config.get_segment_count()` segments.
    pub fn open(store: S, ctx: C, config: &Config) -> Result<Self> {
        config.validate()?;
        check_block_size(&store, config)?;
        let layout =
            Layout::new(config.get_block_size(), config.get_entry_size())?;

        let header_block = match store.get_block(0, false)? {
            Fetch::Found(block) => block,
            Fetch::Hole => {
                log::error!("missing header block in segment usage metadata");
                return Err(Error::invalid(
                    "missing header block in segment usage metadata",
                ));
            }
        };
        let header = Header::read(&header_block.data())?;

        let segment_count = config.get_segment_count();
        if header.clean.saturating_add(header.dirty) > segment_count {
            log::warn!(
                "header counts {} clean and {} dirty of {} segments",
                header.clean,
                header.dirty,
                segment_count
            );
        }

        let state = State {
            segment_count,
            clean_count: header.clean,
            alloc_min: 0,
            alloc_max: segment_count - 1,
        };

        log::info!("opened segment usage file: {:?}", state);

        Ok(SegmentUsageFile {
            store,
            ctx,
            layout,
            geometry: config.geometry(),
            state: RwLock::new(state),
        })
    }

    /// The block store holding the entries.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The runtime state of the owning filesystem.
    pub fn context(&self) -> &C {
        &self.ctx
    }

    /// How entries are placed in blocks.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// How segments map onto device blocks.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn segment_count(&self) -> u64 {
        self.state.read().segment_count
    }

    /// The cached number of clean segments.
    pub fn clean_count(&self) -> u64 {
        self.state.read().clean_count
    }

    /// The inclusive window allocation searches first.
    pub fn alloc_range(&self) -> (SegmentId, SegmentId) {
        let state = self.state.read();
        (state.alloc_min, state.alloc_max)
    }

    /// Restricts where allocation looks first. Both ends are inclusive.
    pub fn set_alloc_range(&self, start: SegmentId, end: SegmentId) -> Result<()> {
        let mut state = self.state.write();
        if start > end || end >= state.segment_count {
            return Err(Error::invalid(format!(
                "allocation range [{}, {}] does not fit {} segments",
                start, end, state.segment_count
            )));
        }
        state.alloc_min = start;
        state.alloc_max = end;
        Ok(())
    }

    fn header_block(&self) -> Result<Block> {
        match self.store.get_block(0, false)? {
            Fetch::Found(block) => Ok(block),
            Fetch::Hole => {
                log::error!("missing header block in segment usage metadata");
                Err(Error::corruption("missing header block"))
            }
        }
    }

    fn entry_block(&self, segnum: SegmentId, create: bool) -> Result<Fetch> {
        self.store.get_block(self.layout.block_of(segnum), create)
    }

    /// Moves the header counters and the cached clean count together.
    fn adjust_counters(
        &self,
        state: &mut State,
        header_block: &Block,
        clean_delta: i64,
        dirty_delta: i64,
    ) -> Result<()> {
        {
            let mut data = header_block.data();
            let mut header = Header::read(&data)?;
            header.adjust(clean_delta, dirty_delta);
            header.write(&mut data)?;
        }
        state.clean_count = state.clean_count.wrapping_add_signed(clean_delta);
        self.store.mark_dirty(header_block);
        Ok(())
    }

    fn apply_transition(
        &self,
        state: &mut State,
        header_block: &Block,
        block: &Block,
        segnum: SegmentId,
        transition: Transition,
    ) -> Result<()> {
        let offset = self.layout.offset_of(segnum);
        let outcome = {
            let mut data = block.data();
            let mut su = SegmentUsage::read(&data, offset)?;
            let outcome = transition.apply(segnum, &mut su);
            if outcome.changed {
                su.write(&mut data, offset)?;
            }
            outcome
        };

        if !outcome.changed {
            return Ok(());
        }
        if outcome.clean_delta != 0 || outcome.dirty_delta != 0 {
            self.adjust_counters(
                state,
                header_block,
                outcome.clean_delta,
                outcome.dirty_delta,
            )?;
        }
        self.store.mark_dirty(block);
        self.store.mark_file_dirty();
        Ok(())
    }

    /// Applies `transition` to a single segment. With `create` set, a
    /// hole block is materialized first.
    pub fn update(
        &self,
        segnum: SegmentId,
        create: bool,
        transition: Transition,
    ) -> Result<()> {
        let mut state = self.state.write();
        state.check_segnum(segnum)?;

        let header_block = self.header_block()?;
        match self.entry_block(segnum, create)? {
            Fetch::Found(block) => self.apply_transition(
                &mut state,
                &header_block,
                &block,
                segnum,
                transition,
            ),
            Fetch::Hole => apply_to_hole(segnum, transition),
        }
    }

    /// Applies `transition` to each of `segnums` in order.
    ///
    /// Every segment number is range-checked before anything is
    /// modified. On a later failure, the error carries how many
    /// leading segments were already processed.
    pub fn updatev(
        &self,
        segnums: &[SegmentId],
        create: bool,
        transition: Transition,
    ) -> std::result::Result<usize, BatchError> {
        if segnums.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.write();

        let invalid = segnums
            .iter()
            .filter(|segnum| state.check_segnum(**segnum).is_err())
            .count();
        if invalid > 0 {
            return Err(BatchError {
                done: 0,
                error: Error::invalid(format!(
                    "{} of {} segment numbers out of range",
                    invalid,
                    segnums.len()
                )),
            });
        }

        let header_block =
            self.header_block().map_err(|error| BatchError { done: 0, error })?;

        let mut current: Option<(BlockIndex, Fetch)> = None;
        for (done, &segnum) in segnums.iter().enumerate() {
            let index = self.layout.block_of(segnum);
            if current.as_ref().map(|(i, _)| *i) != Some(index) {
                let fetch = self
                    .store
                    .get_block(index, create)
                    .map_err(|error| BatchError { done, error })?;
                current = Some((index, fetch));
            }

            let res = match current.as_ref().map(|(_, fetch)| fetch) {
                Some(Fetch::Found(block)) => self.apply_transition(
                    &mut state,
                    &header_block,
                    block,
                    segnum,
                    transition,
                ),
                _ => apply_to_hole(segnum, transition),
            };
            res.map_err(|error| BatchError { done, error })?;
        }

        Ok(segnums.len())
    }

    /// Returns a segment to the clean pool.
    pub fn free(&self, segnum: SegmentId) -> Result<()> {
        self.update(segnum, false, Transition::Free)
    }

    /// Vector form of `free`.
    pub fn freev(
        &self,
        segnums: &[SegmentId],
    ) -> std::result::Result<usize, BatchError> {
        self.updatev(segnums, false, Transition::Free)
    }

    /// Rolls back the free of a segment that is still clean.
    pub fn cancel_free(&self, segnum: SegmentId) -> Result<()> {
        self.update(segnum, false, Transition::CancelFree)
    }

    /// Vector form of `cancel_free`.
    pub fn cancel_freev(
        &self,
        segnums: &[SegmentId],
    ) -> std::result::Result<usize, BatchError> {
        self.updatev(segnums, false, Transition::CancelFree)
    }

    /// Makes a segment allocated garbage, materializing its block.
    pub fn scrap(&self, segnum: SegmentId) -> Result<()> {
        self.update(segnum, true, Transition::Scrap)
    }

    /// Vector form of `scrap`. Hole blocks are materialized.
    pub fn scrapv(
        &self,
        segnums: &[SegmentId],
    ) -> std::result::Result<usize, BatchError> {
        self.updatev(segnums, true, Transition::Scrap)
    }

    /// Marks a segment as failed. It is never allocated again.
    pub fn set_error(&self, segnum: SegmentId) -> Result<()> {
        self.update(segnum, false, Transition::SetError)
    }

    /// Vector form of `set_error`.
    pub fn set_errorv(
        &self,
        segnums: &[SegmentId],
    ) -> std::result::Result<usize, BatchError> {
        self.updatev(segnums, false, Transition::SetError)
    }

    /// Records the outcome of writing a log into `segnum`. A zero
    /// `modtime` keeps the entry's modification time.
    pub fn set_segment_usage(
        &self,
        segnum: SegmentId,
        live_blocks: u32,
        modtime: u64,
    ) -> Result<()> {
        self.update(segnum, false, Transition::SetUsage { live_blocks, modtime })
    }

    /// Flags a segment as allocated before the segment writer reuses it.
    ///
    /// The entry's block must already exist. Errored segments are
    /// refused, and loudly so if the writer currently owns them.
    pub fn mark_dirty(&self, segnum: SegmentId) -> Result<()> {
        let mut state = self.state.write();
        state.check_segnum(segnum)?;

        let header_block = self.header_block()?;
        let block = match self.entry_block(segnum, false)? {
            Fetch::Found(block) => block,
            Fetch::Hole => {
                log::error!(
                    "segment usage of segment {} is in a hole block",
                    segnum
                );
                return Err(Error::corruption(format!(
                    "segment usage of segment {} is missing",
                    segnum
                )));
            }
        };

        let offset = self.layout.offset_of(segnum);
        let was_clean = {
            let mut data = block.data();
            let mut su = SegmentUsage::read(&data, offset)?;
            if su.is_error() {
                if self.ctx.is_segment_active(segnum) {
                    log::error!("active segment {} is erroneous", segnum);
                } else {
                    log::warn!("cannot dirty erroneous segment {}", segnum);
                }
                return Err(Error::corruption(format!(
                    "segment {} is marked in error",
                    segnum
                )));
            }
            let was_clean = su.is_clean();
            su.set_dirty();
            su.write(&mut data, offset)?;
            was_clean
        };

        if was_clean {
            self.adjust_counters(&mut state, &header_block, -1, 1)?;
        }
        self.store.mark_dirty(&block);
        self.store.mark_file_dirty();
        Ok(())
    }

    /// Recomputes the counts from the entries, scanning blocks in
    /// parallel. Holes count as clean.
    pub fn recount(&self) -> Result<Counts> {
        let state = self.state.read();
        let nsegs = state.segment_count;

        (0..self.layout.blocks_for(nsegs))
            .into_par_iter()
            .map(|index| self.count_block(index, nsegs))
            .try_reduce(Counts::default, |a, b| Ok(a + b))
    }

    fn count_block(&self, index: BlockIndex, nsegs: u64) -> Result<Counts> {
        let first = self.layout.first_segnum_of(index);
        if first >= nsegs {
            return Ok(Counts::default());
        }
        let n = self.layout.entries_in_block(first, nsegs - 1);

        let block = match self.store.get_block(index, false)? {
            Fetch::Found(block) => block,
            Fetch::Hole => return Ok(Counts { clean: n, ..Counts::default() }),
        };

        let data = block.data();
        let mut counts = Counts::default();
        for segnum in first..first + n {
            let su = SegmentUsage::read(&data, self.layout.offset_of(segnum))?;
            if su.is_clean() {
                counts.clean += 1;
            }
            if su.is_dirty() {
                counts.dirty += 1;
            }
            if su.is_error() {
                counts.error += 1;
            }
        }
        Ok(counts)
    }
}

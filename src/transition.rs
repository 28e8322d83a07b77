use crate::{usage::SegmentUsage, SegmentId};

/// A state change applied to one segment usage entry.
///
/// Transitions only rewrite the entry and report how the clean and
/// dirty counters must move. The dispatcher in `SegmentUsageFile`
/// owns everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Re-dirties a segment whose free is being rolled back.
    CancelFree,
    /// Turns a segment into allocated garbage: no live blocks, no
    /// modification time, only `DIRTY` set.
    Scrap,
    /// Returns a segment to the clean pool.
    Free,
    /// Excludes a segment from allocation until it is truncated away.
    SetError,
    /// Overwrites the live block count and, unless `modtime` is 0,
    /// the modification time. A zero `modtime` cancels a previous
    /// update and skips the error check.
    SetUsage { live_blocks: u32, modtime: u64 },
}

/// What a transition did to an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub changed: bool,
    pub clean_delta: i64,
    pub dirty_delta: i64,
}

impl Outcome {
    const UNCHANGED: Outcome =
        Outcome { changed: false, clean_delta: 0, dirty_delta: 0 };

    const fn changed(clean_delta: i64, dirty_delta: i64) -> Outcome {
        Outcome { changed: true, clean_delta, dirty_delta }
    }
}

impl Transition {
    pub(crate) fn apply(
        &self,
        segnum: SegmentId,
        su: &mut SegmentUsage,
    ) -> Outcome {
        match *self {
            Transition::CancelFree => cancel_free(segnum, su),
            Transition::Scrap => scrap(su),
            Transition::Free => free(segnum, su),
            Transition::SetError => set_error(su),
            Transition::SetUsage { live_blocks, modtime } => {
                set_usage(segnum, su, live_blocks, modtime)
            }
        }
    }
}

fn cancel_free(segnum: SegmentId, su: &mut SegmentUsage) -> Outcome {
    if !su.is_clean() {
        log::warn!("cancel_free: segment {} must be clean", segnum);
        return Outcome::UNCHANGED;
    }
    su.set_dirty();
    Outcome::changed(-1, 1)
}

fn scrap(su: &mut SegmentUsage) -> Outcome {
    if su.is_garbage() {
        return Outcome::UNCHANGED;
    }
    let clean = su.is_clean();
    let dirty = su.is_dirty();

    su.set_clean();
    su.set_dirty();

    Outcome::changed(if clean { -1 } else { 0 }, if dirty { 0 } else { 1 })
}

fn free(segnum: SegmentId, su: &mut SegmentUsage) -> Outcome {
    if su.is_clean() {
        log::warn!("free: segment {} is already clean", segnum);
        return Outcome::UNCHANGED;
    }
    if su.is_error() {
        log::warn!("free segment {} marked in error", segnum);
    }

    let dirty = su.is_dirty();
    if !dirty {
        log::warn!("free unallocated segment {}", segnum);
    }

    su.set_clean();
    log::trace!("freed segment {}", segnum);

    Outcome::changed(1, if dirty { -1 } else { 0 })
}

fn set_error(su: &mut SegmentUsage) -> Outcome {
    if su.is_error() {
        return Outcome::UNCHANGED;
    }
    let clean = su.is_clean();
    su.set_error();

    Outcome::changed(if clean { -1 } else { 0 }, 0)
}

fn set_usage(
    segnum: SegmentId,
    su: &mut SegmentUsage,
    live_blocks: u32,
    modtime: u64,
) -> Outcome {
    if modtime != 0 {
        if su.is_error() {
            log::warn!("setting usage of segment {} marked in error", segnum);
        }
        su.last_modified = modtime;
    }
    su.live_blocks = live_blocks;
    Outcome::changed(0, 0)
}

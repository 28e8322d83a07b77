//! Filesystem-wide runtime state consulted by the segment usage file.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::{config, Config, SegmentId};

/// What the segment usage file needs to know about the running
/// filesystem it belongs to.
pub trait FsContext: Send + Sync {
    /// Whether the segment writer currently owns `segnum`.
    fn is_segment_active(&self, segnum: SegmentId) -> bool;

    /// Number of segments that must remain clean for a filesystem
    /// of `nsegs` segments.
    fn reserved_segments(&self, nsegs: u64) -> u64;

    /// Discards a range of device sectors.
    fn discard(&self, start_sector: u64, nr_sectors: u64) -> io::Result<()>;

    fn creation_time(&self) -> u64;

    fn nongc_creation_time(&self) -> u64;

    fn protection_sequence(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
struct LastSegment {
    ctime: u64,
    nongc_ctime: u64,
}

/// An in-memory `FsContext`.
///
/// Tracks the pair of segments being written (the current one and the
/// one reserved to follow it) and records every discard it is asked
/// to perform.
#[derive(Debug)]
pub struct RuntimeState {
    active: Mutex<[Option<SegmentId>; 2]>,
    last_segment: Mutex<LastSegment>,
    protection_sequence: AtomicU64,
    reserved_segments_percentage: u64,
    discards: Mutex<Vec<(u64, u64)>>,
}

impl Default for RuntimeState {
    fn default() -> RuntimeState {
        RuntimeState::new(5)
    }
}

impl RuntimeState {
    pub fn new(reserved_segments_percentage: u64) -> RuntimeState {
        RuntimeState {
            active: Mutex::new([None, None]),
            last_segment: Mutex::default(),
            protection_sequence: AtomicU64::new(0),
            reserved_segments_percentage,
            discards: Mutex::default(),
        }
    }

    pub fn from_config(config: &Config) -> RuntimeState {
        RuntimeState::new(config.get_reserved_segments_percentage())
    }

    /// Sets the segment being written and the one to follow it.
    pub fn set_active(&self, current: Option<SegmentId>, next: Option<SegmentId>) {
        *self.active.lock() = [current, next];
    }

    /// Records the creation of a segment, as done when the segment
    /// writer finishes a log.
    pub fn record_segment_written(&self, ctime: u64, by_cleaner: bool) {
        let mut last = self.last_segment.lock();
        last.ctime = ctime;
        if !by_cleaner {
            last.nongc_ctime = ctime;
        }
    }

    pub fn advance_protection_sequence(&self) -> u64 {
        self.protection_sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Every `(start_sector, nr_sectors)` discarded so far.
    pub fn discards(&self) -> Vec<(u64, u64)> {
        self.discards.lock().clone()
    }
}

impl FsContext for RuntimeState {
    fn is_segment_active(&self, segnum: SegmentId) -> bool {
        self.active.lock().contains(&Some(segnum))
    }

    fn reserved_segments(&self, nsegs: u64) -> u64 {
        config::reserved_segments(nsegs, self.reserved_segments_percentage)
    }

    fn discard(&self, start_sector: u64, nr_sectors: u64) -> io::Result<()> {
        log::trace!("discarding {} sectors at {}", nr_sectors, start_sector);
        self.discards.lock().push((start_sector, nr_sectors));
        Ok(())
    }

    fn creation_time(&self) -> u64 {
        self.last_segment.lock().ctime
    }

    fn nongc_creation_time(&self) -> u64 {
        self.last_segment.lock().nongc_ctime
    }

    fn protection_sequence(&self) -> u64 {
        self.protection_sequence.load(Ordering::Acquire)
    }
}

impl<C: FsContext + ?Sized> FsContext for std::sync::Arc<C> {
    fn is_segment_active(&self, segnum: SegmentId) -> bool {
        (**self).is_segment_active(segnum)
    }

    fn reserved_segments(&self, nsegs: u64) -> u64 {
        (**self).reserved_segments(nsegs)
    }

    fn discard(&self, start_sector: u64, nr_sectors: u64) -> io::Result<()> {
        (**self).discard(start_sector, nr_sectors)
    }

    fn creation_time(&self) -> u64 {
        (**self).creation_time()
    }

    fn nongc_creation_time(&self) -> u64 {
        (**self).nongc_creation_time()
    }

    fn protection_sequence(&self) -> u64 {
        (**self).protection_sequence()
    }
}

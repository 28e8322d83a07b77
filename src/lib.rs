//! `sufile` keeps the segment usage file of a log-structured filesystem:
//! one fixed-size entry per segment recording when it was last written,
//! how many of its blocks are live, and whether it is allocated or
//! failed. It hands out clean segments to the segment writer, takes
//! them back from the cleaner, and maintains the persistent counters
//! used by space accounting.
//!
//! ```
//! use std::sync::Arc;
//!
//! use sufile::{Config, MemBlockStore, RuntimeState, SegmentUsageFile};
//!
//! let config = Config::default().segment_count(64);
//! let store = MemBlockStore::new(config.get_block_size());
//! let ctx = Arc::new(RuntimeState::from_config(&config));
//!
//! let sufile = SegmentUsageFile::format(store, ctx, &config)?;
//!
//! let segnum = sufile.allocate()?;
//! assert_eq!(sufile.clean_count(), 63);
//!
//! sufile.free(segnum)?;
//! assert_eq!(sufile.stat()?.clean_count, 64);
//! # Ok::<(), sufile::Error>(())
//! ```
//!
//! Entries live in the blocks of a `BlockStore`. Blocks that were never
//! written, or that were deleted by a truncation, are holes and read as
//! clean entries.
#![warn(rust_2018_idioms)]

mod block_store;
mod config;
mod context;
mod file_store;
mod layout;
mod result;
mod sufile;
mod transition;
mod usage;

pub use crate::{
    block_store::{Block, BlockStore, Fetch, MemBlockStore},
    config::{reserved_segments, Config, Geometry, MIN_RESERVED_SEGMENTS},
    context::{FsContext, RuntimeState},
    file_store::FileBlockStore,
    layout::{BlockIndex, Layout},
    result::{BatchError, Error, Result},
    sufile::{SegmentUsageFile, TrimRange},
    transition::Transition,
    usage::{
        Counts, SegmentFlags, SegmentUsage, SegmentUsageInfo,
        SegmentUsageUpdate, Stats, UpdateFields, HEADER_SIZE,
        MIN_SEGMENT_USAGE_SIZE,
    },
};

/// Number of a segment on the device.
pub type SegmentId = u64;

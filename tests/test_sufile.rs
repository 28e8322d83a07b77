mod common;

use std::sync::Arc;

use sufile::{
    BatchError, BlockStore, Config, Error, MemBlockStore, RuntimeState,
    SegmentFlags, SegmentUsageFile, SegmentUsageInfo, SegmentUsageUpdate,
    Transition,
};

use common::{assert_consistent, format, small_config};

#[test]
fn format_counts_every_segment_clean() {
    common::setup_logger();
    let (sufile, store, _) = format(&small_config(20));

    let stat = sufile.stat().unwrap();
    assert_eq!(stat.segment_count, 20);
    assert_eq!(stat.clean_count, 20);
    assert_eq!(stat.dirty_count, 0);
    assert_eq!(store.block_indices(), vec![0, 1, 2]);
    assert!(store.take_file_dirty());
    assert_consistent(&sufile);
}

#[test]
fn reopen_reads_clean_count_from_header() {
    common::setup_logger();
    let config = small_config(20);
    let (sufile, store, ctx) = format(&config);
    sufile.allocate().unwrap();
    sufile.allocate().unwrap();
    drop(sufile);

    let sufile = SegmentUsageFile::open(store, ctx, &config).unwrap();
    assert_eq!(sufile.clean_count(), 18);
    assert_eq!(sufile.alloc_range(), (0, 19));
    // allocation resumes after the last segment handed out
    assert_eq!(sufile.allocate().unwrap(), 2);
}

#[test]
fn open_without_header_is_rejected() {
    common::setup_logger();
    let config = small_config(20);
    let store = MemBlockStore::new(128);
    let res = SegmentUsageFile::open(store, RuntimeState::default(), &config);
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
}

#[test]
fn open_rejects_bad_entry_size() {
    common::setup_logger();
    let config = small_config(20).entry_size(8);
    let store = MemBlockStore::new(128);
    let res = SegmentUsageFile::format(store, RuntimeState::default(), &config);
    assert!(matches!(res, Err(Error::InvalidArgument(_))));

    let config = small_config(20).entry_size(256);
    let store = MemBlockStore::new(128);
    let res = SegmentUsageFile::format(store, RuntimeState::default(), &config);
    assert!(matches!(res, Err(Error::InvalidArgument(_))));
}

#[test]
fn wide_entries_keep_padding_zeroed() {
    common::setup_logger();
    let config = Config::default()
        .block_size(256)
        .sector_size(256)
        .entry_size(32)
        .segment_count(40)
        .blocks_per_segment(8)
        .first_data_block(0);
    let (sufile, store, _) = format(&config);

    for _ in 0..10 {
        sufile.allocate().unwrap();
    }
    sufile.set_segment_usage(3, 7, 1000).unwrap();

    let info = sufile.get_info(3, 1).unwrap();
    assert_eq!((info[0].live_blocks, info[0].last_modified), (7, 1000));

    // header takes one 32 byte slot, segment 3 is in slot 4 of block 0
    let block = sufile.store().get_block(0, false).unwrap().found().unwrap();
    let data = block.data();
    assert_eq!(&data[4 * 32 + 16..5 * 32], &[0_u8; 16]);
    drop(data);
    assert_eq!(store.block_indices().len(), 6);
    assert_consistent(&sufile);
}

#[test]
fn free_returns_segment_to_pool() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));

    assert_eq!(sufile.allocate().unwrap(), 0);
    assert_eq!(sufile.allocate().unwrap(), 1);
    let before = sufile.stat().unwrap().clean_count;

    sufile.free(0).unwrap();
    assert_eq!(sufile.stat().unwrap().clean_count, before + 1);
    assert_eq!(sufile.stat().unwrap().dirty_count, 1);
    assert_consistent(&sufile);
}

#[test]
fn double_free_is_tolerated() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));
    sufile.allocate().unwrap();
    sufile.free(0).unwrap();
    let stat = sufile.stat().unwrap();

    sufile.free(0).unwrap();
    assert_eq!(sufile.stat().unwrap(), stat);
}

#[test]
fn cancel_free_redirties() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));
    sufile.allocate().unwrap();
    sufile.free(0).unwrap();

    sufile.cancel_free(0).unwrap();
    let info = sufile.get_info(0, 1).unwrap();
    assert_eq!(info[0].flags, SegmentFlags::DIRTY);
    assert_eq!(sufile.clean_count(), 19);

    // cancelling on a dirty segment is a warning, not an error
    sufile.cancel_free(0).unwrap();
    assert_eq!(sufile.clean_count(), 19);
    assert_consistent(&sufile);
}

#[test]
fn scrap_makes_garbage() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));
    sufile.allocate().unwrap();
    sufile.set_segment_usage(0, 12, 555).unwrap();

    sufile.scrap(0).unwrap();
    let info = sufile.get_info(0, 1).unwrap()[0];
    assert_eq!(info.flags, SegmentFlags::DIRTY);
    assert_eq!((info.live_blocks, info.last_modified), (0, 0));

    sufile.scrap(5).unwrap();
    assert_eq!(sufile.clean_count(), 18);
    assert_eq!(sufile.stat().unwrap().dirty_count, 2);
    assert_consistent(&sufile);
}

#[test]
fn scrap_materializes_hole_blocks() {
    common::setup_logger();
    let (sufile, store, _) = format(&small_config(40));
    sufile.truncate_range(6, 13).unwrap();
    assert!(!store.contains(1));

    sufile.scrap(7).unwrap();
    assert!(store.contains(1));
    assert!(sufile.get_info(7, 1).unwrap()[0].is_dirty());
    assert_consistent(&sufile);
}

#[test]
fn set_error_leaves_clean_pool() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));

    sufile.set_error(4).unwrap();
    assert_eq!(sufile.clean_count(), 19);
    sufile.set_error(4).unwrap();
    assert_eq!(sufile.clean_count(), 19);

    let info = sufile.get_info(4, 1).unwrap()[0];
    assert_eq!(info.flags, SegmentFlags::ERROR);
    assert!(!info.is_clean());

    // freeing an errored segment clears it with a warning
    sufile.free(4).unwrap();
    assert_eq!(sufile.clean_count(), 20);
    assert_consistent(&sufile);
}

#[test]
fn out_of_range_segments_are_rejected() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));

    assert!(matches!(sufile.free(20), Err(Error::InvalidArgument(_))));
    assert!(matches!(sufile.scrap(99), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        sufile.set_segment_usage(20, 1, 1),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn vector_update_validates_before_touching_anything() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));
    for _ in 0..4 {
        sufile.allocate().unwrap();
    }
    let stat = sufile.stat().unwrap();

    let err = sufile.freev(&[0, 1, 25, 2, 30]).unwrap_err();
    assert_eq!(err.done, 0);
    assert!(matches!(err.error, Error::InvalidArgument(_)));
    assert_eq!(sufile.stat().unwrap(), stat);

    assert_eq!(sufile.freev(&[0, 1, 2]).unwrap(), 3);
    assert_eq!(sufile.clean_count(), 19);
    assert_eq!(sufile.freev(&[]).unwrap(), 0);
    assert_consistent(&sufile);
}

#[test]
fn vector_update_reuses_blocks() {
    common::setup_logger();
    let (sufile, store, _) = format(&small_config(40));

    let before = store.fetches();
    // 6..=13 share block 1, 14 starts block 2
    assert_eq!(sufile.scrapv(&[6, 7, 8, 9, 13, 14]).unwrap(), 6);
    // header, block 1, block 2
    assert_eq!(store.fetches() - before, 3);
    assert_consistent(&sufile);
}

#[test]
fn vector_update_reports_progress_on_hole() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(40));
    sufile.scrapv(&[0, 1]).unwrap();
    sufile.truncate_range(6, 13).unwrap();

    let err: BatchError = sufile.set_errorv(&[0, 1, 7, 2]).unwrap_err();
    assert_eq!(err.done, 2);
    assert_eq!(err.error, Error::Hole { segnum: 7 });

    let info = sufile.get_info(0, 3).unwrap();
    assert!(info[0].flags.contains(SegmentFlags::ERROR));
    assert!(info[1].flags.contains(SegmentFlags::ERROR));
    assert!(!info[2].flags.contains(SegmentFlags::ERROR));
    assert_consistent(&sufile);
}

#[test]
fn noop_transitions_on_holes_succeed() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(40));
    sufile.truncate_range(6, 13).unwrap();

    // a hole is clean, so freeing it changes nothing
    sufile.free(8).unwrap();
    assert_eq!(sufile.freev(&[6, 7, 8]).unwrap(), 3);
    assert_eq!(
        sufile.update(8, false, Transition::SetError),
        Err(Error::Hole { segnum: 8 })
    );
    assert_eq!(
        sufile.set_segment_usage(9, 3, 10),
        Err(Error::Hole { segnum: 9 })
    );
}

#[test]
fn set_segment_usage_keeps_timestamp_on_zero_modtime() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));
    sufile.allocate().unwrap();

    sufile.set_segment_usage(0, 10, 1234).unwrap();
    sufile.set_segment_usage(0, 4, 0).unwrap();

    let info = sufile.get_info(0, 1).unwrap()[0];
    assert_eq!((info.live_blocks, info.last_modified), (4, 1234));
    assert_consistent(&sufile);
}

#[test]
fn mark_dirty_refuses_errored_segments() {
    common::setup_logger();
    let (sufile, _, ctx) = format(&small_config(20));

    sufile.mark_dirty(3).unwrap();
    assert_eq!(sufile.clean_count(), 19);
    assert!(sufile.get_info(3, 1).unwrap()[0].is_dirty());

    sufile.set_error(5).unwrap();
    assert!(matches!(sufile.mark_dirty(5), Err(Error::Corruption(_))));

    ctx.set_active(Some(5), None);
    assert!(matches!(sufile.mark_dirty(5), Err(Error::Corruption(_))));
    assert_consistent(&sufile);
}

#[test]
fn mark_dirty_on_hole_is_corruption() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(40));
    sufile.truncate_range(6, 13).unwrap();
    assert!(matches!(sufile.mark_dirty(6), Err(Error::Corruption(_))));
}

#[test]
fn missing_header_is_corruption_at_runtime() {
    common::setup_logger();
    let (sufile, store, _) = format(&small_config(20));
    store.delete_block(0).unwrap();

    assert!(matches!(sufile.allocate(), Err(Error::Corruption(_))));
    assert!(matches!(sufile.free(3), Err(Error::Corruption(_))));
    assert!(matches!(sufile.stat(), Err(Error::Corruption(_))));
}

#[test]
fn get_info_projects_active_flag() {
    common::setup_logger();
    let (sufile, _, ctx) = format(&small_config(20));
    sufile.allocate().unwrap();
    sufile.allocate().unwrap();
    ctx.set_active(Some(0), Some(1));

    let info = sufile.get_info(0, 3).unwrap();
    assert_eq!(info.len(), 3);
    assert_eq!(info[0].flags, SegmentFlags::ACTIVE | SegmentFlags::DIRTY);
    assert!(info[1].is_active());
    assert!(!info[2].is_active());
    assert!(info[2].is_clean());
}

#[test]
fn get_info_is_capped_by_segment_count() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));

    assert_eq!(sufile.get_info(15, 100).unwrap().len(), 5);
    assert!(sufile.get_info(20, 10).unwrap().is_empty());
    assert!(sufile.get_info(3, 0).unwrap().is_empty());
}

#[test]
fn get_info_reads_holes_as_zero() {
    common::setup_logger();
    let (sufile, _, ctx) = format(&small_config(40));
    sufile.truncate_range(6, 13).unwrap();
    ctx.set_active(Some(7), None);

    let info = sufile.get_info(4, 12).unwrap();
    assert_eq!(info.len(), 12);
    for snapshot in &info[2..10] {
        assert_eq!(*snapshot, SegmentUsageInfo::default());
    }
}

#[test]
fn stat_reports_runtime_state() {
    common::setup_logger();
    let (sufile, _, ctx) = format(&small_config(20));
    ctx.record_segment_written(100, false);
    ctx.record_segment_written(150, true);
    ctx.advance_protection_sequence();

    let stat = sufile.stat().unwrap();
    assert_eq!(stat.creation_time, 150);
    assert_eq!(stat.nongc_creation_time, 100);
    assert_eq!(stat.protection_sequence, 1);
}

#[test]
fn set_info_updates_selected_fields() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));
    sufile.allocate().unwrap();
    sufile.set_segment_usage(0, 5, 77).unwrap();

    sufile
        .set_info(&[
            SegmentUsageUpdate::new(0).live_blocks(9),
            SegmentUsageUpdate::new(1)
                .last_modified(42)
                .flags(SegmentFlags::DIRTY | SegmentFlags::ACTIVE),
            SegmentUsageUpdate::new(0).flags(SegmentFlags::empty()),
        ])
        .unwrap();

    let info = sufile.get_info(0, 2).unwrap();
    assert_eq!(info[0].live_blocks, 9);
    assert_eq!(info[0].last_modified, 77);
    assert!(info[0].is_clean());
    assert_eq!(info[1].flags, SegmentFlags::DIRTY);
    assert_eq!(info[1].last_modified, 42);

    assert_eq!(sufile.clean_count(), 19);
    assert_eq!(sufile.stat().unwrap().dirty_count, 1);
    assert_consistent(&sufile);
}

#[test]
fn flagless_entry_with_live_blocks_is_clean() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));

    sufile.set_info(&[SegmentUsageUpdate::new(3).live_blocks(9)]).unwrap();
    let info = sufile.get_info(3, 1).unwrap()[0];
    assert_eq!(info.live_blocks, 9);
    assert!(info.is_clean());
    assert_eq!(sufile.clean_count(), 20);
    assert_eq!(sufile.recount().unwrap().clean, 20);

    sufile.set_alloc_range(3, 3).unwrap();
    assert_eq!(sufile.allocate().unwrap(), 3);
    assert_eq!(sufile.get_info(3, 1).unwrap()[0].flags, SegmentFlags::DIRTY);
    assert_consistent(&sufile);
}

#[test]
fn set_info_rejects_bad_batches_whole() {
    common::setup_logger();
    let (sufile, _, _) = format(&small_config(20));
    let stat = sufile.stat().unwrap();

    let too_many = SegmentUsageUpdate::new(1).live_blocks(17);
    let res =
        sufile.set_info(&[SegmentUsageUpdate::new(0).live_blocks(1), too_many]);
    assert!(matches!(res, Err(Error::InvalidArgument(_))));

    let mut unknown = SegmentUsageUpdate::new(1).live_blocks(1);
    unknown.fields |= 1 << 5;
    let res = sufile.set_info(&[unknown]);
    assert!(matches!(res, Err(Error::InvalidArgument(_))));

    let res = sufile.set_info(&[SegmentUsageUpdate::new(20).live_blocks(1)]);
    assert!(matches!(res, Err(Error::InvalidArgument(_))));

    assert_eq!(sufile.stat().unwrap(), stat);
    assert_eq!(sufile.get_info(0, 1).unwrap()[0].live_blocks, 0);

    // exactly a full segment is fine
    sufile.set_info(&[SegmentUsageUpdate::new(1).live_blocks(16)]).unwrap();
}

#[test]
fn set_info_materializes_holes() {
    common::setup_logger();
    let (sufile, store, _) = format(&small_config(40));
    sufile.truncate_range(6, 13).unwrap();

    sufile
        .set_info(&[SegmentUsageUpdate::new(10).flags(SegmentFlags::ERROR)])
        .unwrap();
    assert!(store.contains(1));
    assert_eq!(sufile.clean_count(), 39);
    assert_consistent(&sufile);
}

#[test]
fn shared_contexts_work_through_arcs() {
    common::setup_logger();
    let config = small_config(20);
    let store = Arc::new(MemBlockStore::new(128));
    let ctx = Arc::new(RuntimeState::from_config(&config));
    let sufile = SegmentUsageFile::format(store, ctx.clone(), &config).unwrap();

    ctx.set_active(Some(2), None);
    assert!(sufile.get_info(2, 1).unwrap()[0].is_active());
}

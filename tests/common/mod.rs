#![allow(dead_code)]

use std::sync::Arc;

use sufile::{
    BlockStore, Config, FsContext, MemBlockStore, RuntimeState,
    SegmentUsageFile,
};

pub type MemSufile = SegmentUsageFile<Arc<MemBlockStore>, Arc<RuntimeState>>;

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record
                    .module_path()
                    .and_then(|path| path.split("::").last())
                    .unwrap_or("?"),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

/// 128 byte blocks of 16 byte entries: block 0 holds segments 0..=5,
/// block `b > 0` holds the 8 segments starting at `8 * b - 2`.
pub fn small_config(segment_count: u64) -> Config {
    Config::default()
        .block_size(128)
        .sector_size(128)
        .segment_count(segment_count)
        .blocks_per_segment(16)
        .first_data_block(0)
}

pub fn format(config: &Config) -> (MemSufile, Arc<MemBlockStore>, Arc<RuntimeState>) {
    let store = Arc::new(MemBlockStore::new(config.get_block_size()));
    let ctx = Arc::new(RuntimeState::from_config(config));
    let sufile =
        SegmentUsageFile::format(store.clone(), ctx.clone(), config).unwrap();
    (sufile, store, ctx)
}

/// Checks that the header, the cache and the entries agree.
pub fn assert_consistent<S: BlockStore, C: FsContext>(
    sufile: &SegmentUsageFile<S, C>,
) {
    let stat = sufile.stat().unwrap();
    let counts = sufile.recount().unwrap();
    assert_eq!(stat.clean_count, sufile.clean_count(), "cache drifted");
    assert_eq!(stat.clean_count, counts.clean, "header clean count drifted");
    assert_eq!(stat.dirty_count, counts.dirty, "header dirty count drifted");
}

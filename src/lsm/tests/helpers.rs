use std::{
    ops::Range,
    path::Path,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use crate::lsm::{CompactionListener, Forest, ForestConfig, LsmEngine};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One partition, no automatic flush or compaction, 500 cells per
/// compaction output when values come from [`value_for`].
pub fn manual_config() -> ForestConfig {
    init_tracing();
    ForestConfig {
        partitions: 1,
        write_buffer_size: 16 * 1024 * 1024,
        l0_compaction_trigger: usize::MAX,
        target_file_size: 50_000,
        verify_checksums: true,
    }
}

pub const SCENARIO_THRESHOLD: u64 = 60_000;

pub fn key_for(i: u32) -> Vec<u8> {
    i.to_string().into_bytes()
}

/// 88-byte value: with a 4-byte key and the cell header a cell is 100 B.
pub fn value_for(i: u32) -> Vec<u8> {
    let mut value = format!("value-{i}").into_bytes();
    value.resize(88, b'.');
    value
}

pub fn fill(forest: &Forest, keys: Range<u32>) {
    for i in keys {
        forest.put(0, &key_for(i), &value_for(i)).unwrap();
    }
}

/// Keys `1000..2000` flushed and compacted into two bottom files:
/// `1000..1500` and `1500..2000`.
pub fn compacted_forest(dir: &Path) -> Forest {
    let forest = Forest::open(dir, manual_config()).unwrap();
    fill(&forest, 1000..2000);
    assert_eq!(forest.flush().unwrap(), 1);
    assert!(forest.compact(0).unwrap());
    assert_eq!(forest.bottom_files(0).unwrap().len(), 2);
    forest
}

/// Records every compaction notification.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<(u32, bool)>>,
}

impl CompactionListener for Recorder {
    fn on_compaction_completed(&self, partition: u32, reached_bottom: bool) {
        self.events.lock().unwrap().push((partition, reached_bottom));
    }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

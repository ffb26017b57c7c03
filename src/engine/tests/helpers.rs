use std::{ops::Range, path::Path};

use crate::engine::{EngineConfig, HybridEngine};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bottom-level bytes above which a partition migrates. Two ~51 KB files
/// exceed it, one does not.
pub const THRESHOLD: u64 = 60_000;

/// One partition, flushes and compactions only on request, 500 cells per
/// compaction output.
pub fn manual_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        partitions: 1,
        write_buffer_size: 16 * 1024 * 1024,
        l0_compaction_trigger: usize::MAX,
        target_file_size: 50_000,
        migration_threshold: THRESHOLD,
        verify_wal_checksums: true,
        learned_index_epsilon: 8,
        cold_buffer_pool: 4,
    }
}

pub fn key_for(i: u32) -> Vec<u8> {
    i.to_string().into_bytes()
}

/// 88-byte value: with a 4-byte key and the cell header a cell is 100 B.
pub fn value_for(i: u32) -> Vec<u8> {
    let mut value = format!("value-{i}").into_bytes();
    value.resize(88, b'.');
    value
}

pub fn fill(engine: &HybridEngine, keys: Range<u32>) {
    for i in keys {
        engine.put(&key_for(i), &value_for(i)).unwrap();
    }
}

/// Keys `1000..2000` written, flushed and compacted. The compaction
/// migrates the `1000..1500` file under id 1.
pub fn migrated_engine(root: &Path) -> HybridEngine {
    let engine = HybridEngine::open(root, manual_config()).unwrap();
    fill(&engine, 1000..2000);
    assert_eq!(engine.flush().unwrap(), 1);
    assert!(engine.compact(0).unwrap());
    assert_eq!(engine.stats().unwrap().files_migrated, 1);
    engine
}

use std::path::{Path, PathBuf};

use crate::sstable::SstWriter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `count` pairs `key-00000..` with values of `value_len` bytes.
pub fn pairs(count: usize, value_len: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count)
        .map(|i| {
            let key = format!("key-{i:05}").into_bytes();
            let value = vec![(i % 251) as u8; value_len];
            (key, value)
        })
        .collect()
}

pub fn build_sst(dir: &Path, name: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> PathBuf {
    let path = dir.join(name);
    let count = entries.len();
    SstWriter::new(&path).build(entries.into_iter(), count).unwrap();
    path
}

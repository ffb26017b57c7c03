use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::wal::{CorruptionReporter, LogReader, LogWriter};
use tracing_subscriber::EnvFilter;

/// Reporter that remembers every `(bytes, reason)` pair it receives.
#[derive(Debug, Default)]
pub struct Collector {
    pub events: Vec<(usize, String)>,
}

impl Collector {
    pub fn dropped(&self) -> usize {
        self.events.iter().map(|(b, _)| *b).sum()
    }

    pub fn reasons(&self) -> Vec<&str> {
        self.events.iter().map(|(_, r)| r.as_str()).collect()
    }
}

impl CorruptionReporter for Collector {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        self.events.push((bytes, reason.to_string()));
    }
}

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic payload of `len` bytes tagged with `seed`.
pub fn payload(seed: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((seed * 31 + i) % 251) as u8).collect()
}

/// Writes `records` to a fresh log at `path`.
pub fn write_log(path: &Path, records: &[Vec<u8>]) {
    let mut writer = LogWriter::create(path).unwrap();
    for r in records {
        writer.add_record(r).unwrap();
    }
    writer.sync().unwrap();
}

/// Reads every record starting at `initial_offset`.
pub fn read_from(path: &Path, verify: bool, initial_offset: u64) -> (Vec<Vec<u8>>, Collector) {
    let mut reader = LogReader::open(path, Collector::default(), verify, initial_offset).unwrap();
    let mut out = Vec::new();
    while let Some(r) = reader.read_record().unwrap() {
        out.push(r);
    }
    (out, reader.into_reporter())
}

pub fn read_all(path: &Path) -> (Vec<Vec<u8>>, Collector) {
    read_from(path, true, 0)
}

/// XORs the byte at `offset` with `0xFF`.
pub fn flip_byte(path: &Path, offset: u64) {
    let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut b = [0u8; 1];
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.read_exact(&mut b).unwrap();
    b[0] ^= 0xFF;
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(&b).unwrap();
    f.sync_all().unwrap();
}

/// Overwrites bytes at `offset`.
pub fn overwrite(path: &Path, offset: u64, bytes: &[u8]) {
    let mut f = OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(bytes).unwrap();
    f.sync_all().unwrap();
}

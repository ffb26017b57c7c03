use std::fs;
use std::path::{Path, PathBuf};

use crate::ledger::{Ledger, MigrationFlag, MigrationRecord};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh `Transferring` entry.
pub fn entry(migration_id: u64, source_file_id: u64) -> MigrationRecord {
    MigrationRecord {
        migration_id,
        source_file_id,
        partition: (migration_id % 4) as u32,
        smallest_key: migration_id * 1000,
        largest_key: migration_id * 1000 + 999,
        flag: MigrationFlag::Transferring,
    }
}

/// Replays an empty directory and opens a log in it.
pub fn fresh_ledger(root: &Path) -> (Ledger, PathBuf) {
    let (ledger, _) = Ledger::replay(root, true).unwrap();
    let log = ledger.rotate(root).unwrap();
    (ledger, log)
}

/// Copies `log` into a new directory and replays it there, leaving the
/// original untouched.
pub fn replay_copy(log: &Path) -> Ledger {
    let dir = TempDir::new().unwrap();
    fs::copy(log, dir.path().join(log.file_name().unwrap())).unwrap();
    let (ledger, _) = Ledger::replay(dir.path(), true).unwrap();
    ledger
}

pub fn log_files(root: &Path) -> Vec<PathBuf> {
    crate::ledger::list_logs(root).unwrap()
}

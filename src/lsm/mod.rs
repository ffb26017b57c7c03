//! # LSM Tier
//!
//! The write-optimized tier of the store. The rest of the crate uses it only
//! through the [`LsmEngine`] trait; [`Forest`] is the implementation shipped
//! with the crate.
//!
//! ## Forest layout
//!
//! A forest is `N` independent partitions sharing one directory (`<root>/LSM`).
//! Each partition has:
//!
//! 1. **Memtable**: a sorted in-memory map backed by `partition-<n>.log`.
//! 2. **Level 0**: SSTables flushed from the memtable, possibly overlapping.
//! 3. **Bottom level**: SSTables produced by compaction. These are the files
//!    that cold-data migration hands over to the learned index.
//!
//! Reads check the memtable, then level 0 newest first, then the bottom
//! level newest first.
//!
//! ## Migration hooks
//!
//! - [`LsmEngine::select_cold_file`] reserves the coldest bottom file of a
//!   partition once the partition's bottom level exceeds a size threshold.
//!   Reserved files are left out of compaction.
//! - [`LsmEngine::detach`] drops a reserved file from the tree and renames
//!   `<file_id>.sst` to its holding name `<migration_id>.tsst`. The bytes are
//!   untouched, so block locations recorded before the rename stay valid.
//! - A [`CompactionListener`] is told when a compaction into the bottom level
//!   finishes. It runs on the compacting thread, under the compaction lock,
//!   so migrations and compactions never overlap.
//!
//! ## Files
//!
//! ```text
//! LSM/MANIFEST.log       event log: flush, compaction, detach, snapshot
//! LSM/partition-<n>.log  memtable log of partition n
//! LSM/<000042>.sst       live (or repaired) SSTable with file id 42
//! LSM/<000007>.tsst      holding name of the file migrated under id 7
//! ```

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

mod forest;
mod manifest;
mod memtable;

pub use forest::{Forest, ForestConfig};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use crate::encoding::EncodingError;
use crate::sstable::{SSTable, SSTableError};
use crate::wal::WalError;
use thiserror::Error;

/// Extension of live SSTables.
pub const CANONICAL_EXTENSION: &str = "sst";

/// Extension of detached SSTables.
pub const HOLDING_EXTENSION: &str = "tsst";

/// File name of a live SSTable.
pub fn canonical_file_name(file_id: u64) -> String {
    format!("{file_id:06}.{CANONICAL_EXTENSION}")
}

/// File name a migrated SSTable is renamed to.
pub fn holding_file_name(migration_id: u64) -> String {
    format!("{migration_id:06}.{HOLDING_EXTENSION}")
}

pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the LSM tier.
#[derive(Debug, Error)]
pub enum LsmError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Memtable or manifest log failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// SSTable read or build failure.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Partition index out of range.
    #[error("partition {0} out of range")]
    UnknownPartition(u32),

    /// The engine has been closed.
    #[error("LSM engine is closed")]
    Closed,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Cold-file selection
// ------------------------------------------------------------------------------------------------

/// A bottom-level file reserved for migration.
#[derive(Debug, Clone)]
pub struct ColdFile {
    pub partition: u32,
    pub file_id: u64,
    /// Canonical path at the time of reservation.
    pub path: PathBuf,
    pub size: u64,
    /// Open handle; stays readable across the detach rename.
    pub table: Arc<SSTable>,
}

/// Outcome of [`LsmEngine::select_cold_file`].
#[derive(Debug, Clone)]
pub struct ColdFileSelection {
    /// Bytes in the partition's bottom level, reserved files excluded, as
    /// measured before this selection.
    pub total_size: u64,
    /// The reserved file, if the total exceeded the threshold.
    pub file: Option<ColdFile>,
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// Notified when a compaction finishes.
pub trait CompactionListener: Send + Sync {
    /// `reached_bottom` is true when the compaction wrote into the bottom
    /// level of `partition`.
    fn on_compaction_completed(&self, partition: u32, reached_bottom: bool);
}

/// The operations the hybrid store needs from an LSM engine.
pub trait LsmEngine: Send + Sync {
    fn put(&self, partition: u32, key: &[u8], value: &[u8]) -> Result<(), LsmError>;

    fn get(&self, partition: u32, key: &[u8]) -> Result<Option<Vec<u8>>, LsmError>;

    /// Measures the partition's bottom level and, when it holds more than
    /// `threshold` bytes, reserves its coldest file on behalf of
    /// `migration_id`. At or under the threshold nothing is reserved and
    /// `file` is `None`.
    fn select_cold_file(
        &self,
        threshold: u64,
        partition: u32,
        migration_id: u64,
    ) -> Result<ColdFileSelection, LsmError>;

    /// Reserves a specific live file. `None` when the file is not live in
    /// `partition`.
    fn reserve_file(
        &self,
        partition: u32,
        file_id: u64,
        migration_id: u64,
    ) -> Result<Option<ColdFile>, LsmError>;

    /// Drops a reservation without detaching.
    fn release(&self, partition: u32, file_id: u64) -> Result<(), LsmError>;

    /// Removes `file_id` from the tree and renames it to the holding name of
    /// `migration_id`. Calling it again for a detached file is a no-op.
    fn detach(&self, partition: u32, file_id: u64, migration_id: u64) -> Result<(), LsmError>;

    fn canonical_path(&self, file_id: u64) -> PathBuf;

    fn holding_path(&self, migration_id: u64) -> PathBuf;

    fn set_listener(&self, listener: Weak<dyn CompactionListener>);

    /// Flushes every non-empty memtable to level 0.
    fn flush(&self) -> Result<usize, LsmError>;

    /// Compacts level 0 of `partition` into its bottom level. Returns
    /// whether anything was compacted.
    fn compact(&self, partition: u32) -> Result<bool, LsmError>;

    fn close(&self) -> Result<(), LsmError>;
}

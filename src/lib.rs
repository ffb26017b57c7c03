//! # lixstore
//!
//! An embeddable, persistent key-value store that tiers data between a
//! write-optimized **LSM forest** and a read-optimized **learned index**.
//! Writes always go to the LSM tier. When compaction grows a partition's
//! bottom level past a threshold, its coldest files migrate: their keys are
//! indexed by a learned model that points straight at the data blocks, and
//! the files leave the forest under a holding name.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lixstore::{Store, StoreConfig};
//!
//! let store = Store::open("/tmp/my_store", StoreConfig::default()).unwrap();
//!
//! store.put(b"hello", b"world").unwrap();
//! assert_eq!(store.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // Push everything down and let cold files migrate.
//! store.flush().unwrap();
//! store.compact_all().unwrap();
//!
//! store.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Write-ahead logging**: memtables, the forest manifest and the
//!   migration ledger are all block-framed, checksummed logs.
//! - **Background compaction**: a dedicated thread merges level 0 into the
//!   bottom level and hands finished compactions to the migration
//!   coordinator.
//! - **Learned cold path**: migrated keys cost one index probe and one
//!   positioned block read.
//! - **Crash recovery**: interrupted migrations are redone or rolled
//!   forward on restart.

#![allow(dead_code)]

pub(crate) mod codec;
pub(crate) mod coldpath;
pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod ledger;
pub(crate) mod lix;
pub(crate) mod lsm;
pub(crate) mod migration;
pub(crate) mod recovery;
pub(crate) mod sstable;
pub(crate) mod wal;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use engine::{EngineConfig, EngineError, HybridEngine};
use thiserror::Error;
use tracing::{info, warn};

pub use engine::{EngineStats as StoreStats, LIX_DIR, LSM_DIR};
pub use recovery::RecoveryReport;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`] instance.
///
/// All fields have defaults via [`StoreConfig::default()`]. The
/// configuration is validated when passed to [`Store::open`].
///
/// # Example
///
/// ```rust
/// use lixstore::StoreConfig;
///
/// let config = StoreConfig {
///     partitions: 8,
///     migration_threshold: 16 * 1024 * 1024,
///     ..StoreConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of key-range partitions. Fixed once a directory is created;
    /// reopening with a different count fails.
    ///
    /// Default: 4. Must be in `1..=256`.
    pub partitions: u32,

    /// Memtable size in bytes at which it is flushed to level 0.
    ///
    /// Default: 4 MiB. Must be ≥ 1024.
    pub write_buffer_size: usize,

    /// Level-0 file count that schedules a background compaction.
    ///
    /// Default: 4. Must be ≥ 1.
    pub l0_compaction_trigger: usize,

    /// Compaction output files are cut at this many bytes of cells.
    ///
    /// Default: 2 MiB. Must be ≥ 1024.
    pub target_file_size: u64,

    /// Bottom-level bytes per partition above which files migrate.
    ///
    /// Default: 64 MiB. Must be > 0.
    pub migration_threshold: u64,

    /// Verify CRCs while replaying logs.
    ///
    /// Default: true.
    pub verify_wal_checksums: bool,

    /// Maximum position error of the learned index.
    ///
    /// Default: 32. Must be ≥ 1.
    pub learned_index_epsilon: usize,

    /// Idle read buffers kept by the cold path.
    ///
    /// Default: 16. Must be ≥ 1.
    pub cold_buffer_pool: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            write_buffer_size: 4 * 1024 * 1024,
            l0_compaction_trigger: 4,
            target_file_size: 2 * 1024 * 1024,
            migration_threshold: 64 * 1024 * 1024,
            verify_wal_checksums: true,
            learned_index_epsilon: 32,
            cold_buffer_pool: 16,
        }
    }
}

impl StoreConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), StoreError> {
        if !(1..=256).contains(&self.partitions) {
            return Err(StoreError::InvalidConfig(
                "partitions must be in 1..=256".into(),
            ));
        }
        if self.write_buffer_size < 1024 {
            return Err(StoreError::InvalidConfig(
                "write_buffer_size must be >= 1024".into(),
            ));
        }
        if self.l0_compaction_trigger < 1 {
            return Err(StoreError::InvalidConfig(
                "l0_compaction_trigger must be >= 1".into(),
            ));
        }
        if self.target_file_size < 1024 {
            return Err(StoreError::InvalidConfig(
                "target_file_size must be >= 1024".into(),
            ));
        }
        if self.migration_threshold == 0 {
            return Err(StoreError::InvalidConfig(
                "migration_threshold must be > 0".into(),
            ));
        }
        if self.learned_index_epsilon < 1 {
            return Err(StoreError::InvalidConfig(
                "learned_index_epsilon must be >= 1".into(),
            ));
        }
        if self.cold_buffer_pool < 1 {
            return Err(StoreError::InvalidConfig(
                "cold_buffer_pool must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            partitions: self.partitions,
            write_buffer_size: self.write_buffer_size,
            l0_compaction_trigger: self.l0_compaction_trigger,
            target_file_size: self.target_file_size,
            migration_threshold: self.migration_threshold,
            verify_wal_checksums: self.verify_wal_checksums,
            learned_index_epsilon: self.learned_index_epsilon,
            cold_buffer_pool: self.cold_buffer_pool,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(#[from] EngineError),
}

// ------------------------------------------------------------------------------------------------
// Store handle
// ------------------------------------------------------------------------------------------------

/// The main store handle.
///
/// `Store` is `Send + Sync` and can be shared across threads via
/// `Arc<Store>`.
///
/// # Shutdown
///
/// Call [`Store::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor attempts the same cleanup and
/// only logs failures.
pub struct Store {
    engine: HybridEngine,
    root: PathBuf,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens (or creates) a store at the given directory.
    ///
    /// Migrations interrupted by a crash are replayed before this returns;
    /// see [`Store::recovery_report`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if any configuration parameter
    /// is out of range.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let root = path.as_ref().to_path_buf();
        let engine = HybridEngine::open(&root, config.to_engine_config())?;

        info!(path = %root.display(), partitions = config.partitions, "store opened");

        Ok(Self {
            engine,
            root,
            closed: AtomicBool::new(false),
        })
    }

    /// Directory the store lives in.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Gracefully shuts down the store.
    ///
    /// Stops background compaction (waiting for an in-flight one and its
    /// migrations), then syncs memtable logs, the forest manifest and the
    /// migration ledger.
    ///
    /// Subsequent operations on this handle return [`StoreError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.engine.close()?;

        info!(path = %self.root.display(), "store closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Inserts or updates a key-value pair.
    ///
    /// The write is persisted to the partition's memtable log before being
    /// applied in memory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] if `key` is empty.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_open()?;

        if key.is_empty() {
            return Err(StoreError::InvalidArgument("key must not be empty".into()));
        }

        self.engine.put(key, value)?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Retrieves the value associated with a key, from whichever tier
    /// holds it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] if `key` is empty.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;

        if key.is_empty() {
            return Err(StoreError::InvalidArgument("key must not be empty".into()));
        }

        Ok(self.engine.get(key)?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Flushes every non-empty memtable to level 0. Returns how many
    /// partitions were flushed.
    pub fn flush(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.engine.flush()?)
    }

    /// Compacts one partition on the caller's thread; a migration check
    /// follows, as after a background compaction.
    ///
    /// Returns `false` when level 0 of the partition was empty.
    pub fn compact(&self, partition: u32) -> Result<bool, StoreError> {
        self.check_open()?;
        if partition >= self.engine.partitions() {
            return Err(StoreError::InvalidArgument(format!(
                "partition {partition} out of range"
            )));
        }
        Ok(self.engine.compact(partition)?)
    }

    /// Compacts every partition. Returns how many had anything to compact.
    pub fn compact_all(&self) -> Result<usize, StoreError> {
        self.check_open()?;
        Ok(self.engine.compact_all()?)
    }

    /// Migrates cold files of `partition` until its bottom level is under
    /// the threshold. Returns the number of files migrated.
    pub fn migrate_now(&self, partition: u32) -> Result<usize, StoreError> {
        self.check_open()?;
        if partition >= self.engine.partitions() {
            return Err(StoreError::InvalidArgument(format!(
                "partition {partition} out of range"
            )));
        }
        Ok(self.engine.migrate_now(partition)?)
    }

    /// Counters and sizes for diagnostics.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    /// What recovery replayed when this store was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        self.engine.recovery_report()
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StoreError::Closed)` if the store has been closed.
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel)
            && let Err(e) = self.engine.close()
        {
            warn!(error = %e, "close on drop failed");
        }
    }
}

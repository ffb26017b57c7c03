//! # Hybrid Engine
//!
//! Glue between the two tiers. Writes always land in the LSM forest; reads
//! try the forest first and fall back to the learned index, whose locations
//! are resolved through the migration ledger and served by the cold path.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   <timestamp>.mLOG     migration ledger
//!   LSM/                 forest: manifest, memtable logs, .sst and .tsst files
//!   LIX/INDEX            learned index snapshot
//! ```
//!
//! ## Opening
//!
//! [`HybridEngine::open`] runs recovery stage I before either tier opens
//! (ledger replay and interrupted renames), then opens the forest, the
//! index and the coordinator, runs stage II (ledger rotation, redo and
//! detach replay), and only then registers the coordinator as the forest's
//! compaction listener.
//!
//! ## Reads of migrated keys
//!
//! A location names a migration id, not a file. While the entry is
//! `Detaching` the block is read from the holding file. If that file turns
//! out stale the entry is repaired to `Normal` and the canonical file is
//! read instead; every later read goes straight to the canonical file.

#[cfg(test)]
mod tests;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::codec::{decode_location, dispatch, key_prefix};
use crate::coldpath::{BlockReader, ColdReadError};
use crate::ledger::{Ledger, LedgerError, MigrationFlag};
use crate::lix::{LearnedIndex, LixError, PiecewiseIndex};
use crate::lsm::{CompactionListener, Forest, ForestConfig, LsmEngine, LsmError};
use crate::migration::{Coordinator, MigrationError};
use crate::recovery::{self, RecoveryError, RecoveryReport};
use crate::sstable::BlockHandle;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Forest directory under the store root.
pub const LSM_DIR: &str = "LSM";
/// Learned index directory under the store root.
pub const LIX_DIR: &str = "LIX";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("LSM error: {0}")]
    Lsm(#[from] LsmError),

    #[error("Learned index error: {0}")]
    Index(#[from] LixError),

    #[error("Cold read error: {0}")]
    ColdRead(#[from] ColdReadError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    /// The index returned a location whose migration id the ledger does
    /// not know.
    #[error("Unknown migration id {0}")]
    UnknownMigration(u64),
}

// ------------------------------------------------------------------------------------------------
// Configuration & stats
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`HybridEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub partitions: u32,
    pub write_buffer_size: usize,
    pub l0_compaction_trigger: usize,
    pub target_file_size: u64,
    /// Bottom-level bytes per partition above which files migrate.
    pub migration_threshold: u64,
    pub verify_wal_checksums: bool,
    pub learned_index_epsilon: usize,
    /// Idle read buffers kept by the cold path.
    pub cold_buffer_pool: usize,
}

impl EngineConfig {
    fn forest(&self) -> ForestConfig {
        ForestConfig {
            partitions: self.partitions,
            write_buffer_size: self.write_buffer_size,
            l0_compaction_trigger: self.l0_compaction_trigger,
            target_file_size: self.target_file_size,
            verify_checksums: self.verify_wal_checksums,
        }
    }
}

/// Snapshot of engine statistics returned by [`HybridEngine::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Ledger entries, whatever their flag.
    pub ledger_entries: usize,
    /// Keys held by the learned index.
    pub index_keys: usize,
    /// Files moved out of the forest since open.
    pub files_migrated: u64,
    /// Pairs pushed into the index since open.
    pub pairs_extracted: u64,
    /// Reads answered by the cold path.
    pub cold_hits: u64,
    /// `Detaching` entries repaired to `Normal` by readers.
    pub repairs: u64,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

pub struct HybridEngine {
    partitions: u32,
    ledger: Arc<Ledger>,
    lsm: Arc<dyn LsmEngine>,
    index: Arc<dyn LearnedIndex>,
    coordinator: Arc<Coordinator>,
    reader: BlockReader,
    recovery: RecoveryReport,

    cold_hits: AtomicU64,
    repairs: AtomicU64,
}

impl HybridEngine {
    /// Opens (or creates) an engine rooted at `root`, replaying any
    /// migration a crash interrupted.
    pub fn open(root: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let lsm_dir = root.join(LSM_DIR);
        let lix_dir = root.join(LIX_DIR);

        // 1. Ledger replay and rename replay, before the forest scans its directory.
        let (ledger, plan) = recovery::stage_one(root, &lsm_dir, config.verify_wal_checksums)?;
        let ledger = Arc::new(ledger);

        // 2. Both tiers and the coordinator.
        let forest = Forest::open(&lsm_dir, config.forest())?;
        let lsm: Arc<dyn LsmEngine> = Arc::new(forest);
        let index: Arc<dyn LearnedIndex> =
            Arc::new(PiecewiseIndex::open(&lix_dir, config.learned_index_epsilon)?);
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&ledger),
            Arc::clone(&lsm),
            Arc::clone(&index),
            config.migration_threshold,
        )?);

        // 3. Ledger rotation, redo and detach replay.
        let report =
            recovery::stage_two(root, plan, &ledger, lsm.as_ref(), coordinator.as_ref())?;

        // 4. Only now may compactions start migrations.
        let listener: Weak<dyn CompactionListener> = Arc::<Coordinator>::downgrade(&coordinator);
        lsm.set_listener(listener);

        info!(
            root = %root.display(),
            partitions = config.partitions,
            migrations = report.entries,
            "hybrid engine opened"
        );

        Ok(Self {
            partitions: config.partitions,
            ledger,
            lsm,
            index,
            coordinator,
            reader: BlockReader::new(config.cold_buffer_pool),
            recovery: report,
            cold_hits: AtomicU64::new(0),
            repairs: AtomicU64::new(0),
        })
    }

    /// Inserts or overwrites `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), EngineError> {
        let partition = dispatch(key_prefix(key), self.partitions);
        trace!(partition, key_len = key.len(), value_len = value.len(), "put");
        self.lsm.put(partition, key, value)?;
        Ok(())
    }

    /// Point lookup: the forest first, then the cold path.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let prefix = key_prefix(key);
        let partition = dispatch(prefix, self.partitions);

        if let Some(value) = self.lsm.get(partition, key)? {
            return Ok(Some(value));
        }

        let Some(raw) = self.index.get(prefix)? else {
            return Ok(None);
        };
        let location = decode_location(raw);
        let entry = self
            .ledger
            .get(location.file_id)?
            .ok_or(EngineError::UnknownMigration(location.file_id))?;
        let handle = BlockHandle {
            offset: location.offset,
            size: location.size,
        };

        let value = if entry.flag == MigrationFlag::Detaching {
            let holding = self.lsm.holding_path(entry.migration_id);
            match self.reader.get(&holding, handle, key) {
                Ok(value) => value,
                Err(e) if e.is_stale() => {
                    warn!(
                        migration_id = entry.migration_id,
                        error = %e,
                        "holding file unusable"
                    );
                    if self.ledger.repair(entry.migration_id)? {
                        self.repairs.fetch_add(1, Ordering::Relaxed);
                    }
                    self.read_canonical(entry.source_file_id, handle, key)?
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            self.read_canonical(entry.source_file_id, handle, key)?
        };

        if value.is_some() {
            self.cold_hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    fn read_canonical(
        &self,
        file_id: u64,
        handle: BlockHandle,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let path = self.lsm.canonical_path(file_id);
        Ok(self.reader.get(&path, handle, key)?)
    }

    /// Flushes every non-empty memtable. Returns how many were flushed.
    pub fn flush(&self) -> Result<usize, EngineError> {
        Ok(self.lsm.flush()?)
    }

    /// Compacts one partition on the caller's thread, migrating afterwards
    /// like a background compaction would.
    pub fn compact(&self, partition: u32) -> Result<bool, EngineError> {
        Ok(self.lsm.compact(partition)?)
    }

    /// Compacts every partition. Returns how many had anything to compact.
    pub fn compact_all(&self) -> Result<usize, EngineError> {
        let mut compacted = 0;
        for partition in 0..self.partitions {
            if self.lsm.compact(partition)? {
                compacted += 1;
            }
        }
        Ok(compacted)
    }

    /// Runs the migration loop for `partition`.
    pub fn migrate_now(&self, partition: u32) -> Result<usize, EngineError> {
        Ok(self.coordinator.migrate_now(partition)?)
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            ledger_entries: self.ledger.len()?,
            index_keys: self.index.len()?,
            files_migrated: self.coordinator.files_migrated(),
            pairs_extracted: self.coordinator.pairs_extracted(),
            cold_hits: self.cold_hits.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
        })
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// What recovery replayed when this engine was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Path of the holding file of `migration_id`.
    pub fn holding_path(&self, migration_id: u64) -> PathBuf {
        self.lsm.holding_path(migration_id)
    }

    /// Path of the canonical file `file_id`.
    pub fn canonical_path(&self, file_id: u64) -> PathBuf {
        self.lsm.canonical_path(file_id)
    }

    /// Stops background compaction, then syncs the forest and the ledger.
    pub fn close(&self) -> Result<(), EngineError> {
        self.lsm.close()?;
        self.ledger.close()?;
        debug!("hybrid engine closed");
        Ok(())
    }
}

impl std::fmt::Debug for HybridEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridEngine")
            .field("partitions", &self.partitions)
            .field("coordinator", &self.coordinator)
            .field("reader", &self.reader)
            .finish()
    }
}

//! # Migration Coordinator
//!
//! Moves cold bottom-level files from the LSM tier into the learned index.
//!
//! ## Lifecycle of one file
//!
//! 1. Reserve the coldest bottom file of the partition once the bottom level
//!    exceeds the threshold ([`LsmEngine::select_cold_file`]).
//! 2. Extract `(key prefix, location)` pairs from the file's block handles.
//!    Every location names the new migration id as its file id.
//! 3. Ledger insert, flag `Transferring` (durable before visible).
//! 4. Push the pairs into the learned index: bulk load into an empty index,
//!    batch upsert otherwise.
//! 5. Ledger modify, flag `Detaching`.
//! 6. Detach the file from the LSM tier, which renames it to its holding
//!    name.
//!
//! Steps repeat until the partition falls under the threshold.
//!
//! A failure before step 3 releases the reservation. A failure after it
//! leaves the entry `Transferring` with the file still reserved and served
//! by the LSM tier; recovery redoes the migration on the next start.
//!
//! The coordinator is the forest's [`CompactionListener`]: the loop runs on
//! the compaction thread and blocks further compactions until it is done.

#[cfg(test)]
mod tests;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use crate::codec::{EncodedLocation, Location, encode_location, key_prefix};
use crate::ledger::{Ledger, LedgerError, MigrationFlag, MigrationRecord};
use crate::lix::{LearnedIndex, LixError};
use crate::lsm::{ColdFile, CompactionListener, LsmEngine, LsmError};
use crate::sstable::SSTableError;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("LSM error: {0}")]
    Lsm(#[from] LsmError),

    #[error("Learned index error: {0}")]
    Index(#[from] LixError),

    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// A block handle cannot be packed into a location word.
    #[error("location (file {file_id}, offset {offset}, size {size}) does not fit")]
    Unrepresentable { file_id: u64, offset: u64, size: u64 },

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Extraction
// ------------------------------------------------------------------------------------------------

/// Index entries for one migrated file.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub pairs: Vec<(u64, EncodedLocation)>,
    pub smallest_key: u64,
    pub largest_key: u64,
}

/// Turns every key of `file` into a `(prefix, location)` pair whose
/// location names `migration_id` as its file.
pub fn extract(file: &ColdFile, migration_id: u64) -> Result<Extraction, MigrationError> {
    let mut pairs = Vec::with_capacity(file.table.record_count() as usize);
    for entry in file.table.block_handles() {
        let (key, handle) = entry?;
        let location = Location::new(migration_id, handle.offset, handle.size);
        if !location.fits() {
            return Err(MigrationError::Unrepresentable {
                file_id: migration_id,
                offset: handle.offset,
                size: handle.size,
            });
        }
        pairs.push((key_prefix(&key), encode_location(&location)));
    }

    let smallest_key = pairs.first().map(|(k, _)| *k).unwrap_or_default();
    let largest_key = pairs.last().map(|(k, _)| *k).unwrap_or_default();
    Ok(Extraction {
        pairs,
        smallest_key,
        largest_key,
    })
}

// ------------------------------------------------------------------------------------------------
// Coordinator
// ------------------------------------------------------------------------------------------------

pub struct Coordinator {
    ledger: Arc<Ledger>,
    lsm: Arc<dyn LsmEngine>,
    index: Arc<dyn LearnedIndex>,
    threshold: u64,

    /// Next unused migration id.
    next_id: AtomicU64,
    /// Serializes migrations started from compactions, callers and recovery.
    migration_lock: Mutex<()>,

    pairs_extracted: AtomicU64,
    files_migrated: AtomicU64,
}

impl Coordinator {
    /// Seeds the id counter one past the highest id in `ledger` (never
    /// below 1).
    pub fn new(
        ledger: Arc<Ledger>,
        lsm: Arc<dyn LsmEngine>,
        index: Arc<dyn LearnedIndex>,
        threshold: u64,
    ) -> Result<Self, MigrationError> {
        let next_id = ledger.max_id()?.map_or(1, |id| id + 1).max(1);
        debug!(next_id, threshold, "migration coordinator ready");
        Ok(Self {
            ledger,
            lsm,
            index,
            threshold,
            next_id: AtomicU64::new(next_id),
            migration_lock: Mutex::new(()),
            pairs_extracted: AtomicU64::new(0),
            files_migrated: AtomicU64::new(0),
        })
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Id the next migration will use.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Pairs pushed into the learned index since start.
    pub fn pairs_extracted(&self) -> u64 {
        self.pairs_extracted.load(Ordering::Relaxed)
    }

    /// Files detached since start.
    pub fn files_migrated(&self) -> u64 {
        self.files_migrated.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, MigrationError> {
        self.migration_lock.lock().map_err(|_| {
            error!("migration mutex poisoned");
            MigrationError::Internal("Mutex poisoned".into())
        })
    }

    /// Migrates cold files of `partition` until its bottom level is under
    /// the threshold. Returns the number of files migrated.
    pub fn migrate_now(&self, partition: u32) -> Result<usize, MigrationError> {
        let _guard = self.lock()?;
        let mut migrated = 0;

        loop {
            // The id is only consumed once a file is reserved under it.
            let migration_id = self.next_id.load(Ordering::Acquire);
            let selection = self
                .lsm
                .select_cold_file(self.threshold, partition, migration_id)?;
            let Some(file) = selection.file else {
                trace!(partition, total_size = selection.total_size, "no cold file");
                break;
            };
            self.next_id.store(migration_id + 1, Ordering::Release);

            self.migrate_file(&file, migration_id)?;
            migrated += 1;
        }

        Ok(migrated)
    }

    fn migrate_file(&self, file: &ColdFile, migration_id: u64) -> Result<(), MigrationError> {
        let extraction = match extract(file, migration_id) {
            Ok(e) => e,
            Err(e) => {
                self.lsm.release(file.partition, file.file_id)?;
                return Err(e);
            }
        };

        let record = MigrationRecord {
            migration_id,
            source_file_id: file.file_id,
            partition: file.partition,
            smallest_key: extraction.smallest_key,
            largest_key: extraction.largest_key,
            flag: MigrationFlag::Transferring,
        };
        if let Err(e) = self.ledger.insert(record) {
            self.lsm.release(file.partition, file.file_id)?;
            return Err(e.into());
        }
        debug!(
            migration_id,
            file_id = file.file_id,
            partition = file.partition,
            pairs = extraction.pairs.len(),
            "migration transferring"
        );

        self.push(&extraction.pairs)?;
        self.ledger.set_flag(migration_id, MigrationFlag::Detaching)?;
        self.lsm.detach(file.partition, file.file_id, migration_id)?;

        self.pairs_extracted
            .fetch_add(extraction.pairs.len() as u64, Ordering::Relaxed);
        self.files_migrated.fetch_add(1, Ordering::Relaxed);

        info!(
            migration_id,
            file_id = file.file_id,
            partition = file.partition,
            bytes = file.size,
            pairs = extraction.pairs.len(),
            "file migrated"
        );
        Ok(())
    }

    fn push(&self, pairs: &[(u64, EncodedLocation)]) -> Result<(), MigrationError> {
        if self.index.is_empty()? {
            self.index.bulk_load(pairs)?;
        } else {
            self.index.put_batch(pairs)?;
        }
        Ok(())
    }

    /// Re-runs extraction and push for an entry left `Transferring`, then
    /// advances it to `Detaching`. The detach itself is left to the caller.
    ///
    /// Returns `false` when the source file is no longer live in the LSM
    /// tier; the entry is left as it is.
    pub fn redo(&self, record: &MigrationRecord) -> Result<bool, MigrationError> {
        let _guard = self.lock()?;

        let Some(file) =
            self.lsm
                .reserve_file(record.partition, record.source_file_id, record.migration_id)?
        else {
            warn!(
                migration_id = record.migration_id,
                file_id = record.source_file_id,
                "source file of transferring migration is gone"
            );
            return Ok(false);
        };

        let extraction = match extract(&file, record.migration_id) {
            Ok(e) => e,
            Err(e) => {
                self.lsm.release(file.partition, file.file_id)?;
                return Err(e);
            }
        };
        self.push(&extraction.pairs)?;
        self.ledger
            .set_flag(record.migration_id, MigrationFlag::Detaching)?;

        self.pairs_extracted
            .fetch_add(extraction.pairs.len() as u64, Ordering::Relaxed);
        info!(
            migration_id = record.migration_id,
            file_id = record.source_file_id,
            pairs = extraction.pairs.len(),
            "transferring migration redone"
        );
        Ok(true)
    }
}

impl CompactionListener for Coordinator {
    fn on_compaction_completed(&self, partition: u32, reached_bottom: bool) {
        if !reached_bottom {
            return;
        }
        match self.migrate_now(partition) {
            Ok(0) => {}
            Ok(files) => debug!(partition, files, "migration after compaction"),
            Err(e) => error!(partition, error = %e, "migration after compaction failed"),
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("threshold", &self.threshold)
            .field("next_id", &self.next_id())
            .field("files_migrated", &self.files_migrated())
            .finish()
    }
}

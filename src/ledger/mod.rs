//! # Migration Ledger
//!
//! The ledger is the store's record of which LSM files have been handed to
//! the learned index, and where each of them is in its migration lifecycle.
//! It is a small in-memory map keyed by migration id, made durable by a
//! dedicated log (see [`crate::wal`]).
//!
//! ## Lifecycle of an entry
//!
//! ```text
//!   Insert            Modify             Modify
//!  ────────► Transferring ────► Detaching ────► Gcing (reserved)
//!                                   │
//!                                   └─────► Normal   (holding file found stale)
//! ```
//!
//! ## Durability strategy
//!
//! 1. Each mutation is encoded as a [`LedgerRecord`], appended to the
//!    active `<timestamp>.mLOG` file and synced, **then** applied to the map.
//!    Both steps happen under the ledger's write lock, so a reader never
//!    sees state the log does not already hold.
//! 2. On startup the lexicographically last `.mLOG` file in the store root
//!    is replayed from the beginning ([`Ledger::replay`]).
//! 3. [`Ledger::rotate`] then writes one `Insert` per surviving entry to
//!    `<timestamp>.mLOG.tmp`, syncs it, renames it into place and only then
//!    removes the older logs. A crash mid-rotation leaves the previous log
//!    as the newest `.mLOG`; the orphaned `.tmp` is never replayed.
//!
//! Log file names are 20-digit, zero-padded Unix nanosecond timestamps, so
//! lexical order and creation order agree.
//!
//! ## Thread safety
//!
//! One `RwLock` guards the map together with the live log writer. Lookups
//! take the read lock; every mutation takes the write lock for the append
//! and the in-memory change.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

mod record;

pub use record::{LedgerRecord, MigrationFlag, MigrationRecord};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::encoding::EncodingError;
use crate::wal::{DropCounter, LogReader, LogWriter, WalError};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Extension of ledger log files.
pub const LOG_EXTENSION: &str = "mLOG";

/// Extension of a snapshot still being written by [`Ledger::rotate`].
const TMP_EXTENSION: &str = "mLOG.tmp";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Log append or scan failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// No entry with this migration id.
    #[error("unknown migration {0}")]
    UnknownMigration(u64),

    /// An entry with this migration id already exists.
    #[error("migration {0} already exists")]
    DuplicateMigration(u64),

    /// The requested flag change is not a lifecycle edge.
    #[error("migration {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: MigrationFlag,
        to: MigrationFlag,
    },

    /// Mutation attempted before [`Ledger::rotate`] opened a log.
    #[error("ledger has no active log")]
    NoActiveLog,

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Replay summary
// ------------------------------------------------------------------------------------------------

/// What [`Ledger::replay`] found.
#[derive(Debug, Default, Clone)]
pub struct ReplayStats {
    /// Log that was replayed, if any existed.
    pub source: Option<PathBuf>,
    /// Records applied.
    pub records: usize,
    /// Bytes skipped because of corruption.
    pub dropped_bytes: usize,
}

// ------------------------------------------------------------------------------------------------
// Ledger
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LedgerState {
    entries: BTreeMap<u64, MigrationRecord>,
    log: Option<LogWriter>,
}

impl LedgerState {
    /// Applies a record without validation, exactly as logged.
    fn apply(&mut self, record: &LedgerRecord) {
        match record {
            LedgerRecord::Insert(entry) => {
                self.entries.insert(entry.migration_id, entry.clone());
            }
            LedgerRecord::Modify {
                migration_id,
                flag,
                source_file_id,
            } => match self.entries.get_mut(migration_id) {
                Some(entry) => {
                    entry.flag = *flag;
                    if let Some(src) = source_file_id {
                        entry.source_file_id = *src;
                    }
                }
                None => warn!(migration_id, "modify for unknown migration ignored"),
            },
            LedgerRecord::Remove { migration_id } => {
                if self.entries.remove(migration_id).is_none() {
                    warn!(migration_id, "remove for unknown migration ignored");
                }
            }
        }
    }

    /// Logs `record` durably, then applies it.
    fn commit(&mut self, record: LedgerRecord) -> Result<(), LedgerError> {
        let log = self.log.as_mut().ok_or(LedgerError::NoActiveLog)?;
        log.add_encoded(&record)?;
        log.sync()?;
        trace!(?record, "ledger record committed");
        self.apply(&record);
        Ok(())
    }
}

/// The in-memory migration map plus its live log.
#[derive(Debug, Default)]
pub struct Ledger {
    state: RwLock<LedgerState>,
}

impl Ledger {
    /// Creates an empty ledger without a log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the ledger from the last `.mLOG` file under `root`.
    ///
    /// Corrupted regions of the log are skipped and counted in
    /// [`ReplayStats::dropped_bytes`]; they never fail the replay. The
    /// returned ledger has no active log until [`rotate`](Self::rotate).
    pub fn replay(root: &Path, verify_checksums: bool) -> Result<(Self, ReplayStats), LedgerError> {
        let mut state = LedgerState::default();
        let mut stats = ReplayStats::default();

        let logs = list_logs(root)?;
        if let Some(path) = logs.last() {
            let mut reader = LogReader::open(path, DropCounter::default(), verify_checksums, 0)?;
            while let Some(record) = reader.read_decoded::<LedgerRecord>()? {
                state.apply(&record);
                stats.records += 1;
            }
            stats.dropped_bytes = reader.reporter().bytes;
            stats.source = Some(path.clone());

            info!(
                path = %path.display(),
                records = stats.records,
                dropped_bytes = stats.dropped_bytes,
                entries = state.entries.len(),
                "ledger replayed"
            );
        } else {
            debug!(root = %root.display(), "no ledger log found");
        }

        Ok((
            Self {
                state: RwLock::new(state),
            },
            stats,
        ))
    }

    /// Starts a new log under `root` holding a snapshot of every entry,
    /// makes it the live log, and deletes older logs.
    ///
    /// Returns the path of the new log.
    pub fn rotate(&self, root: &Path) -> Result<PathBuf, LedgerError> {
        let mut state = self.write()?;

        // The snapshot only takes the final name once it is complete, so
        // the newest `.mLOG` is never a partial one.
        let path = next_log_path(root)?;
        let tmp_path = path.with_extension(TMP_EXTENSION);
        let mut tmp = LogWriter::create(&tmp_path)?;
        for entry in state.entries.values() {
            tmp.add_encoded(&LedgerRecord::Insert(entry.clone()))?;
        }
        tmp.sync()?;
        drop(tmp);

        fs::rename(&tmp_path, &path)?;
        fsync_dir(root)?;

        state.log = Some(LogWriter::open_append(&path)?);

        for old in list_logs(root)?.into_iter().chain(list_tmp_logs(root)?) {
            if old != path {
                if let Err(e) = fs::remove_file(&old) {
                    warn!(path = %old.display(), error = %e, "failed to remove stale ledger log");
                }
            }
        }

        info!(path = %path.display(), entries = state.entries.len(), "ledger log rotated");
        Ok(path)
    }

    // --------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>, LedgerError> {
        self.state.read().map_err(|_| {
            error!("ledger RwLock poisoned");
            LedgerError::Internal("RwLock poisoned".into())
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>, LedgerError> {
        self.state.write().map_err(|_| {
            error!("ledger RwLock poisoned");
            LedgerError::Internal("RwLock poisoned".into())
        })
    }

    // --------------------------------------------------------------------
    // Read accessors
    // --------------------------------------------------------------------

    /// Returns a copy of the entry for `migration_id`.
    pub fn get(&self, migration_id: u64) -> Result<Option<MigrationRecord>, LedgerError> {
        Ok(self.read()?.entries.get(&migration_id).cloned())
    }

    /// All entries in migration-id order.
    pub fn entries(&self) -> Result<Vec<MigrationRecord>, LedgerError> {
        Ok(self.read()?.entries.values().cloned().collect())
    }

    /// Ids of the entries currently at `flag`, ascending.
    #[cfg(test)]
    pub(crate) fn ids_with_flag(&self, flag: MigrationFlag) -> Result<Vec<u64>, LedgerError> {
        Ok(self
            .read()?
            .entries
            .values()
            .filter(|e| e.flag == flag)
            .map(|e| e.migration_id)
            .collect())
    }

    /// Highest migration id present, if any.
    pub fn max_id(&self) -> Result<Option<u64>, LedgerError> {
        Ok(self.read()?.entries.keys().next_back().copied())
    }

    pub fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.read()?.entries.is_empty())
    }

    // --------------------------------------------------------------------
    // Mutators
    // --------------------------------------------------------------------

    /// Adds a new entry. Entries are born `Transferring`.
    pub fn insert(&self, record: MigrationRecord) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        if state.entries.contains_key(&record.migration_id) {
            return Err(LedgerError::DuplicateMigration(record.migration_id));
        }
        if record.flag != MigrationFlag::Transferring {
            return Err(LedgerError::InvalidTransition {
                id: record.migration_id,
                from: record.flag,
                to: MigrationFlag::Transferring,
            });
        }
        debug!(
            migration_id = record.migration_id,
            source_file_id = record.source_file_id,
            partition = record.partition,
            "ledger insert"
        );
        state.commit(LedgerRecord::Insert(record))
    }

    /// Moves an entry to `flag`.
    pub fn set_flag(&self, migration_id: u64, flag: MigrationFlag) -> Result<(), LedgerError> {
        self.modify(migration_id, flag, None)
    }

    /// Moves an entry to `flag` and records a new source file id with it,
    /// writing the long `Modify` shape that replay also accepts.
    #[cfg(test)]
    pub(crate) fn set_flag_and_source(
        &self,
        migration_id: u64,
        flag: MigrationFlag,
        source_file_id: u64,
    ) -> Result<(), LedgerError> {
        self.modify(migration_id, flag, Some(source_file_id))
    }

    fn modify(
        &self,
        migration_id: u64,
        flag: MigrationFlag,
        source_file_id: Option<u64>,
    ) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        let current = state
            .entries
            .get(&migration_id)
            .ok_or(LedgerError::UnknownMigration(migration_id))?;
        if !current.flag.can_become(flag) {
            return Err(LedgerError::InvalidTransition {
                id: migration_id,
                from: current.flag,
                to: flag,
            });
        }
        debug!(migration_id, from = %current.flag, to = %flag, "ledger modify");
        state.commit(LedgerRecord::Modify {
            migration_id,
            flag,
            source_file_id,
        })
    }

    /// Falls back from `Detaching` to `Normal` after the holding file was
    /// found missing or stale.
    ///
    /// Returns `false` without logging when another reader already did it.
    pub fn repair(&self, migration_id: u64) -> Result<bool, LedgerError> {
        let mut state = self.write()?;
        let current = state
            .entries
            .get(&migration_id)
            .ok_or(LedgerError::UnknownMigration(migration_id))?;
        if current.flag != MigrationFlag::Detaching {
            return Ok(false);
        }
        warn!(migration_id, "holding file stale, falling back to canonical file");
        state.commit(LedgerRecord::Modify {
            migration_id,
            flag: MigrationFlag::Normal,
            source_file_id: None,
        })?;
        Ok(true)
    }

    /// Deletes an entry.
    pub fn remove(&self, migration_id: u64) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        if !state.entries.contains_key(&migration_id) {
            return Err(LedgerError::UnknownMigration(migration_id));
        }
        state.commit(LedgerRecord::Remove { migration_id })
    }

    /// Syncs the live log, if any.
    pub fn close(&self) -> Result<(), LedgerError> {
        let mut state = self.write()?;
        if let Some(log) = state.log.as_mut() {
            log.sync()?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Log discovery
// ------------------------------------------------------------------------------------------------

/// Every `.mLOG` file directly under `root`, in version order.
pub fn list_logs(root: &Path) -> Result<Vec<PathBuf>, LedgerError> {
    let mut logs = Vec::new();
    let dir = match fs::read_dir(root) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(logs),
        Err(e) => return Err(e.into()),
    };
    for entry in dir {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == LOG_EXTENSION) {
            logs.push(path);
        }
    }
    logs.sort_by(|a, b| version_key(a).cmp(&version_key(b)));
    Ok(logs)
}

/// Leftover `.mLOG.tmp` snapshots of rotations that never finished.
fn list_tmp_logs(root: &Path) -> Result<Vec<PathBuf>, LedgerError> {
    let mut tmps = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&format!(".{TMP_EXTENSION}")));
        if is_tmp && path.is_file() {
            tmps.push(path);
        }
    }
    Ok(tmps)
}

/// Numeric stems sort by value, anything else after them by name.
fn version_key(path: &Path) -> (u8, u128, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match stem.parse::<u128>() {
        Ok(n) => (0, n, stem),
        Err(_) => (1, 0, stem),
    }
}

fn next_log_path(root: &Path) -> Result<PathBuf, LedgerError> {
    let mut stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| LedgerError::Internal(format!("system clock before UNIX epoch: {e}")))?
        .as_nanos();
    if let Some(last) = list_logs(root)?.last() {
        let (_, n, _) = version_key(last);
        stamp = stamp.max(n + 1);
    }
    loop {
        let path = root.join(format!("{stamp:020}.{LOG_EXTENSION}"));
        if !path.exists() {
            return Ok(path);
        }
        stamp += 1;
    }
}

fn fsync_dir(dir: &Path) -> Result<(), LedgerError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

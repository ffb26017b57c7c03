//! # Recovery
//!
//! Startup replay of migrations interrupted by a crash, in two stages around
//! the opening of the engines.
//!
//! **Stage I** ([`stage_one`], before the LSM tier and the learned index
//! open):
//!
//! 1. Replay the ledger from the newest `.mLOG` file.
//! 2. For every `Detaching` entry, rename `<source>.sst` to
//!    `<migration>.tsst`. If the rename succeeds the crash came before the
//!    original rename was durable, so the id is queued for detach replay. A
//!    missing canonical file means the rename already happened.
//! 3. Queue every `Transferring` entry for migration replay.
//!
//! **Stage II** ([`stage_two`], after both engines are open):
//!
//! 1. Rotate the ledger: fresh log holding a compacted snapshot.
//! 2. Redo extraction and push for each migration-replay id (no new ledger
//!    insert) and queue it for detach.
//! 3. Detach every queued id. Detach is idempotent, so files detached before
//!    the crash are left alone.

#[cfg(test)]
mod tests;

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::ledger::{Ledger, LedgerError, MigrationFlag, ReplayStats};
use crate::lsm::{LsmEngine, LsmError, canonical_file_name, fsync_dir, holding_file_name};
use crate::migration::{Coordinator, MigrationError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("LSM error: {0}")]
    Lsm(#[from] LsmError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Work found by [`stage_one`] for [`stage_two`].
#[derive(Debug, Default)]
pub struct ReplayPlan {
    pub replay: ReplayStats,
    /// `Detaching` entries whose file had to be renamed again.
    pub renamed: Vec<u64>,
    /// Ids to detach in stage II.
    pub detach: Vec<u64>,
    /// `Transferring` ids to redo in stage II.
    pub migrate: Vec<u64>,
}

/// What recovery did, logged once the store is open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Ledger log replayed, if any.
    pub source: Option<PathBuf>,
    /// Fresh ledger log written by the rotation.
    pub log: PathBuf,
    pub entries: usize,
    pub dropped_bytes: usize,
    pub renamed: usize,
    pub redone: usize,
    /// `Transferring` entries that could not be redone and stay as they are.
    pub skipped: usize,
    pub detached: usize,
}

/// Stage I: ledger replay and rename replay. `lsm_dir` is the directory
/// holding canonical and holding files.
pub fn stage_one(
    root: &Path,
    lsm_dir: &Path,
    verify_checksums: bool,
) -> Result<(Ledger, ReplayPlan), RecoveryError> {
    let (ledger, replay) = Ledger::replay(root, verify_checksums)?;
    let mut plan = ReplayPlan {
        replay,
        ..ReplayPlan::default()
    };

    for entry in ledger.entries()? {
        match entry.flag {
            MigrationFlag::Detaching => {
                let canonical = lsm_dir.join(canonical_file_name(entry.source_file_id));
                let holding = lsm_dir.join(holding_file_name(entry.migration_id));
                if holding.exists() {
                    debug!(migration_id = entry.migration_id, "holding file present");
                    continue;
                }
                match fs::rename(&canonical, &holding) {
                    Ok(()) => {
                        fsync_dir(lsm_dir)?;
                        info!(
                            migration_id = entry.migration_id,
                            file_id = entry.source_file_id,
                            "interrupted rename replayed"
                        );
                        plan.renamed.push(entry.migration_id);
                        plan.detach.push(entry.migration_id);
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        warn!(
                            migration_id = entry.migration_id,
                            "neither canonical nor holding file present"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            MigrationFlag::Transferring => plan.migrate.push(entry.migration_id),
            MigrationFlag::Normal | MigrationFlag::Gcing => {}
        }
    }

    Ok((ledger, plan))
}

/// Stage II: fresh ledger log, migration redo and detach replay.
pub fn stage_two(
    root: &Path,
    plan: ReplayPlan,
    ledger: &Ledger,
    lsm: &dyn LsmEngine,
    coordinator: &Coordinator,
) -> Result<RecoveryReport, RecoveryError> {
    let log = ledger.rotate(root)?;
    let mut report = RecoveryReport {
        source: plan.replay.source.clone(),
        log,
        entries: ledger.len()?,
        dropped_bytes: plan.replay.dropped_bytes,
        renamed: plan.renamed.len(),
        ..RecoveryReport::default()
    };

    let mut detach = plan.detach;
    for id in plan.migrate {
        let Some(record) = ledger.get(id)? else {
            continue;
        };
        match coordinator.redo(&record) {
            Ok(true) => {
                report.redone += 1;
                detach.push(id);
            }
            Ok(false) => report.skipped += 1,
            Err(e) => {
                error!(migration_id = id, error = %e, "migration redo failed");
                report.skipped += 1;
            }
        }
    }

    for id in detach {
        let Some(record) = ledger.get(id)? else {
            continue;
        };
        lsm.detach(record.partition, record.source_file_id, id)?;
        report.detached += 1;
    }

    info!(
        entries = report.entries,
        dropped_bytes = report.dropped_bytes,
        renamed = report.renamed,
        redone = report.redone,
        skipped = report.skipped,
        detached = report.detached,
        "recovery finished"
    );
    Ok(report)
}

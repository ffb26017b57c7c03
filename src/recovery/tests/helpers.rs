use std::{path::Path, sync::Arc};

use crate::ledger::{Ledger, MigrationFlag, MigrationRecord};
use crate::lix::PiecewiseIndex;
use crate::lsm::{Forest, ForestConfig, LsmEngine};
use crate::migration::Coordinator;
use crate::recovery::{RecoveryReport, stage_one, stage_two};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const THRESHOLD: u64 = 60_000;

pub fn forest_config() -> ForestConfig {
    ForestConfig {
        partitions: 1,
        write_buffer_size: 16 * 1024 * 1024,
        l0_compaction_trigger: usize::MAX,
        target_file_size: 50_000,
        verify_checksums: true,
    }
}

pub fn key_for(i: u32) -> Vec<u8> {
    i.to_string().into_bytes()
}

pub fn value_for(i: u32) -> Vec<u8> {
    let mut value = format!("value-{i}").into_bytes();
    value.resize(88, b'.');
    value
}

pub struct Engines {
    pub ledger: Arc<Ledger>,
    pub forest: Arc<Forest>,
    pub index: Arc<PiecewiseIndex>,
    pub coordinator: Arc<Coordinator>,
}

impl Engines {
    /// Opens forest, index and coordinator around an already replayed
    /// ledger.
    pub fn open(root: &Path, ledger: Ledger) -> Self {
        let ledger = Arc::new(ledger);
        let forest = Arc::new(Forest::open(root.join("LSM"), forest_config()).unwrap());
        let index = Arc::new(PiecewiseIndex::open(root.join("LIX"), 8).unwrap());
        let coordinator = Arc::new(
            Coordinator::new(ledger.clone(), forest.clone(), index.clone(), THRESHOLD).unwrap(),
        );
        Self {
            ledger,
            forest,
            index,
            coordinator,
        }
    }

    /// A first session: fresh ledger log, keys `1000..2000` compacted into
    /// two bottom files.
    pub fn first_session(root: &Path) -> Self {
        init_tracing();
        let (ledger, _) = Ledger::replay(root, true).unwrap();
        ledger.rotate(root).unwrap();
        let engines = Self::open(root, ledger);
        for i in 1000..2000 {
            engines.forest.put(0, &key_for(i), &value_for(i)).unwrap();
        }
        engines.forest.flush().unwrap();
        engines.forest.compact(0).unwrap();
        engines
    }

    /// Ledger entry `migration_id` for the coldest bottom file, born
    /// `Transferring`.
    pub fn begin_migration(&self, migration_id: u64) -> MigrationRecord {
        let source = self.forest.bottom_files(0).unwrap()[0];
        let record = MigrationRecord {
            migration_id,
            source_file_id: source,
            partition: 0,
            smallest_key: crate::codec::key_prefix(b"1000"),
            largest_key: crate::codec::key_prefix(b"1499"),
            flag: MigrationFlag::Transferring,
        };
        self.ledger.insert(record.clone()).unwrap();
        record
    }
}

/// Runs both recovery stages the way the store does.
pub fn recover(root: &Path) -> (Engines, RecoveryReport, Vec<u64>, Vec<u64>) {
    init_tracing();
    let (ledger, plan) = stage_one(root, &root.join("LSM"), true).unwrap();
    let renamed = plan.renamed.clone();
    let migrate = plan.migrate.clone();
    let engines = Engines::open(root, ledger);
    let report = stage_two(
        root,
        plan,
        &engines.ledger,
        engines.forest.as_ref(),
        &engines.coordinator,
    )
    .unwrap();
    (engines, report, renamed, migrate)
}

use std::{path::Path, sync::Arc};

use crate::codec::EncodedLocation;
use crate::ledger::Ledger;
use crate::lix::{LearnedIndex, LixError, PiecewiseIndex};
use crate::lsm::{Forest, ForestConfig, LsmEngine};
use crate::migration::Coordinator;
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

pub struct Fixture {
    pub ledger: Arc<Ledger>,
    pub forest: Arc<Forest>,
    pub index: Arc<PiecewiseIndex>,
    pub coordinator: Arc<Coordinator>,
}

impl Fixture {
    /// Ledger in `root`, forest in `root/LSM`, index in `root/LIX`.
    pub fn open(root: &Path) -> Self {
        let index = Arc::new(PiecewiseIndex::open(root.join("LIX"), 8).unwrap());
        Self::open_with_index(root, index.clone(), index)
    }

    pub fn open_with_index(
        root: &Path,
        index: Arc<PiecewiseIndex>,
        learned: Arc<dyn LearnedIndex>,
    ) -> Self {
        init_tracing();
        let (ledger, _) = Ledger::replay(root, true).unwrap();
        ledger.rotate(root).unwrap();
        let ledger = Arc::new(ledger);
        let forest = Arc::new(Forest::open(root.join("LSM"), forest_config()).unwrap());
        let coordinator = Arc::new(
            Coordinator::new(ledger.clone(), forest.clone(), learned, THRESHOLD).unwrap(),
        );
        Self {
            ledger,
            forest,
            index,
            coordinator,
        }
    }

    /// Writes `keys`, flushes and compacts partition 0 without a listener.
    pub fn load(&self, keys: std::ops::Range<u32>) {
        for i in keys {
            self.forest.put(0, &key_for(i), &value_for(i)).unwrap();
        }
        self.forest.flush().unwrap();
        self.forest.compact(0).unwrap();
    }
}

/// Index whose writes always fail.
pub struct FailingIndex;

impl LearnedIndex for FailingIndex {
    fn get(&self, _key: u64) -> Result<Option<EncodedLocation>, LixError> {
        Ok(None)
    }

    fn put_batch(&self, _pairs: &[(u64, EncodedLocation)]) -> Result<(), LixError> {
        Err(LixError::Internal("injected failure".into()))
    }

    fn bulk_load(&self, _pairs: &[(u64, EncodedLocation)]) -> Result<(), LixError> {
        Err(LixError::Internal("injected failure".into()))
    }

    fn len(&self) -> Result<usize, LixError> {
        Ok(0)
    }
}

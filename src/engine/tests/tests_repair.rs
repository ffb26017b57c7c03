//! Fallback from a stale holding file to the canonical file.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::fs;

    use crate::engine::tests::helpers::*;
    use crate::engine::{EngineError, HybridEngine};
    use crate::ledger::MigrationFlag;
    use tempfile::TempDir;

    /// Renames the holding file of migration 1 back to its canonical name.
    fn undo_rename(engine: &HybridEngine) -> u64 {
        let source = engine.ledger.get(1).unwrap().unwrap().source_file_id;
        fs::rename(engine.holding_path(1), engine.canonical_path(source)).unwrap();
        source
    }

    /// # Scenario
    /// The holding file disappears while the entry is `Detaching`; the
    /// same bytes sit under the canonical name.
    ///
    /// # Expected behavior
    /// The first read repairs the entry to `Normal` and still returns the
    /// value; later reads go to the canonical file without repairing again.
    #[test]
    fn repair__stale_holding_falls_back_to_canonical() {
        let tmp = TempDir::new().unwrap();
        let engine = migrated_engine(tmp.path());
        undo_rename(&engine);

        assert_eq!(engine.get(&key_for(1234)).unwrap(), Some(value_for(1234)));
        assert_eq!(engine.ledger.get(1).unwrap().unwrap().flag, MigrationFlag::Normal);
        assert_eq!(engine.stats().unwrap().repairs, 1);

        for i in 1000..1500 {
            assert_eq!(engine.get(&key_for(i)).unwrap(), Some(value_for(i)));
        }
        let stats = engine.stats().unwrap();
        assert_eq!(stats.repairs, 1);
        assert_eq!(stats.cold_hits, 501);
    }

    /// # Scenario
    /// Restart after a repair.
    ///
    /// # Expected behavior
    /// The `Normal` flag was durable: stage I leaves the canonical file in
    /// place, the forest does not claim it back, and reads still work.
    #[test]
    fn repair__durable_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let source = {
            let engine = migrated_engine(tmp.path());
            let source = undo_rename(&engine);
            engine.get(&key_for(1000)).unwrap();
            engine.close().unwrap();
            source
        };

        let engine = HybridEngine::open(tmp.path(), manual_config()).unwrap();
        assert_eq!(engine.recovery_report().renamed, 0);
        assert_eq!(engine.ledger.get(1).unwrap().unwrap().flag, MigrationFlag::Normal);
        assert!(engine.canonical_path(source).exists());
        assert!(!engine.holding_path(1).exists());

        assert_eq!(engine.get(&key_for(1499)).unwrap(), Some(value_for(1499)));
        assert_eq!(engine.stats().unwrap().repairs, 0);
    }

    /// # Scenario
    /// Both the holding and the canonical file are gone.
    ///
    /// # Expected behavior
    /// The entry is still repaired, then the canonical read reports a
    /// stale location as an error.
    #[test]
    fn repair__both_files_missing_is_error() {
        let tmp = TempDir::new().unwrap();
        let engine = migrated_engine(tmp.path());
        fs::remove_file(engine.holding_path(1)).unwrap();

        match engine.get(&key_for(1100)) {
            Err(EngineError::ColdRead(e)) => assert!(e.is_stale()),
            other => panic!("expected stale cold read, got {other:?}"),
        }
        assert_eq!(engine.ledger.get(1).unwrap().unwrap().flag, MigrationFlag::Normal);
    }

    /// # Scenario
    /// The holding file is truncated so the indexed blocks no longer fit.
    ///
    /// # Expected behavior
    /// The short read counts as stale; with the canonical name restored as
    /// a copy, the value comes from there.
    #[test]
    fn repair__truncated_holding_is_stale() {
        let tmp = TempDir::new().unwrap();
        let engine = migrated_engine(tmp.path());
        let source = engine.ledger.get(1).unwrap().unwrap().source_file_id;
        fs::copy(engine.holding_path(1), engine.canonical_path(source)).unwrap();
        fs::OpenOptions::new()
            .write(true)
            .open(engine.holding_path(1))
            .unwrap()
            .set_len(16)
            .unwrap();

        assert_eq!(engine.get(&key_for(1300)).unwrap(), Some(value_for(1300)));
        assert_eq!(engine.stats().unwrap().repairs, 1);
    }
}

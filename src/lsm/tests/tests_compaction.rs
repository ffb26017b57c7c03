//! Compaction into the bottom level and compaction notifications.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::{
        fs,
        sync::{Arc, Weak},
        time::Duration,
    };

    use crate::lsm::tests::helpers::*;
    use crate::lsm::{CompactionListener, Forest, ForestConfig, LsmEngine, canonical_file_name};
    use tempfile::TempDir;

    /// # Scenario
    /// Compaction with nothing in level 0.
    ///
    /// # Expected behavior
    /// Returns `false` and notifies nobody.
    #[test]
    fn compact__empty_level0_is_noop() {
        let tmp = TempDir::new().unwrap();
        let forest = Forest::open(tmp.path(), manual_config()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn CompactionListener> = Arc::downgrade(&recorder) as Weak<dyn CompactionListener>;
        forest.set_listener(weak);

        assert!(!forest.compact(0).unwrap());
        assert!(recorder.events.lock().unwrap().is_empty());
    }

    /// # Scenario
    /// 1000 cells of 100 bytes are compacted with a 50 000-byte target.
    ///
    /// # Expected behavior
    /// Two bottom files of 500 keys each, level 0 emptied, the input file
    /// deleted, every key still readable.
    #[test]
    fn compact__splits_output_at_target_size() {
        let tmp = TempDir::new().unwrap();
        let forest = Forest::open(tmp.path(), manual_config()).unwrap();
        fill(&forest, 1000..2000);
        forest.flush().unwrap();
        let input = forest.level0_files(0).unwrap()[0];

        assert!(forest.compact(0).unwrap());

        assert!(forest.level0_files(0).unwrap().is_empty());
        let bottom = forest.bottom_files(0).unwrap();
        assert_eq!(bottom.len(), 2);
        assert!(!tmp.path().join(canonical_file_name(input)).exists());

        let first = crate::sstable::SSTable::open(tmp.path().join(canonical_file_name(bottom[0])))
            .unwrap();
        assert_eq!(first.record_count(), 500);
        assert_eq!(first.min_key(), b"1000");
        assert_eq!(first.max_key(), b"1499");

        for i in 1000..2000 {
            assert_eq!(forest.get(0, &key_for(i)).unwrap(), Some(value_for(i)));
        }
    }

    /// # Scenario
    /// A key already in the bottom level is overwritten and compacted again.
    ///
    /// # Expected behavior
    /// Only the overlapping bottom file is rewritten; the new value wins.
    #[test]
    fn compact__merges_newer_values_over_bottom() {
        let tmp = TempDir::new().unwrap();
        let forest = compacted_forest(tmp.path());
        let before = forest.bottom_files(0).unwrap();

        forest.put(0, &key_for(1200), b"fresh").unwrap();
        forest.flush().unwrap();
        assert!(forest.compact(0).unwrap());

        let after = forest.bottom_files(0).unwrap();
        assert_eq!(after.len(), 2);
        assert!(!after.contains(&before[0]));
        assert!(after.contains(&before[1]));
        assert_eq!(forest.get(0, &key_for(1200)).unwrap(), Some(b"fresh".to_vec()));
        assert_eq!(forest.get(0, &key_for(1201)).unwrap(), Some(value_for(1201)));
    }

    /// # Scenario
    /// A listener is registered and a compaction runs.
    ///
    /// # Expected behavior
    /// It is told once, for partition 0, that the bottom level was reached.
    /// After the listener is dropped, compactions still succeed.
    #[test]
    fn listener__notified_after_compaction() {
        let tmp = TempDir::new().unwrap();
        let forest = Forest::open(tmp.path(), manual_config()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn CompactionListener> = Arc::downgrade(&recorder) as Weak<dyn CompactionListener>;
        forest.set_listener(weak);

        fill(&forest, 0..10);
        forest.flush().unwrap();
        assert!(forest.compact(0).unwrap());
        assert_eq!(*recorder.events.lock().unwrap(), vec![(0, true)]);

        drop(recorder);
        fill(&forest, 10..20);
        forest.flush().unwrap();
        assert!(forest.compact(0).unwrap());
    }

    /// # Scenario
    /// Level 0 reaches the compaction trigger through automatic flushes.
    ///
    /// # Expected behavior
    /// The background thread compacts into the bottom level and notifies
    /// the listener.
    #[test]
    fn background__compaction_after_trigger() {
        let tmp = TempDir::new().unwrap();
        let config = ForestConfig {
            write_buffer_size: 4096,
            l0_compaction_trigger: 2,
            ..manual_config()
        };
        let forest = Forest::open(tmp.path(), config).unwrap();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn CompactionListener> = Arc::downgrade(&recorder) as Weak<dyn CompactionListener>;
        forest.set_listener(weak);

        fill(&forest, 0..200);

        assert!(wait_until(Duration::from_secs(10), || {
            !recorder.events.lock().unwrap().is_empty()
        }));
        assert!(!forest.bottom_files(0).unwrap().is_empty());
        for i in 0..200 {
            assert_eq!(forest.get(0, &key_for(i)).unwrap(), Some(value_for(i)));
        }
    }

    /// # Scenario
    /// Stray files are left in the directory: an unknown SSTable and a
    /// temporary file.
    ///
    /// # Expected behavior
    /// Reopening deletes both and keeps live files.
    #[test]
    fn reopen__removes_orphans() {
        let tmp = TempDir::new().unwrap();
        let live = {
            let forest = compacted_forest(tmp.path());
            let live = forest.bottom_files(0).unwrap();
            forest.close().unwrap();
            live
        };
        let stray = tmp.path().join(canonical_file_name(987_654));
        let tmp_file = tmp.path().join("000321.tmp");
        fs::write(&stray, b"garbage").unwrap();
        fs::write(&tmp_file, b"garbage").unwrap();

        let forest = Forest::open(tmp.path(), manual_config()).unwrap();

        assert!(!stray.exists());
        assert!(!tmp_file.exists());
        for id in &live {
            assert!(tmp.path().join(canonical_file_name(*id)).exists());
        }
        assert_eq!(forest.get(0, &key_for(1999)).unwrap(), Some(value_for(1999)));
    }
}

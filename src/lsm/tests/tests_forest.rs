//! Forest reads and writes across memtable, level 0 and reopen.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::lsm::tests::helpers::*;
    use crate::lsm::{Forest, ForestConfig, LsmEngine, LsmError};
    use tempfile::TempDir;

    /// # Scenario
    /// Puts are served from the memtable before any flush.
    ///
    /// # Expected behavior
    /// Written keys return their values; an unwritten key returns `None`.
    #[test]
    fn memtable__put_then_get() {
        let tmp = TempDir::new().unwrap();
        let forest = Forest::open(tmp.path(), manual_config()).unwrap();

        fill(&forest, 0..10);

        assert_eq!(forest.get(0, &key_for(3)).unwrap(), Some(value_for(3)));
        assert_eq!(forest.get(0, b"absent").unwrap(), None);
        assert!(forest.level0_files(0).unwrap().is_empty());
    }

    /// # Scenario
    /// An explicit flush moves the memtable into one level-0 file.
    ///
    /// # Expected behavior
    /// One level-0 file exists and every key is still readable. A second
    /// flush with an empty memtable does nothing.
    #[test]
    fn flush__moves_memtable_to_level0() {
        let tmp = TempDir::new().unwrap();
        let forest = Forest::open(tmp.path(), manual_config()).unwrap();

        fill(&forest, 0..100);
        assert_eq!(forest.flush().unwrap(), 1);
        assert_eq!(forest.flush().unwrap(), 0);

        assert_eq!(forest.level0_files(0).unwrap().len(), 1);
        for i in 0..100 {
            assert_eq!(forest.get(0, &key_for(i)).unwrap(), Some(value_for(i)));
        }
    }

    /// # Scenario
    /// The same key is written into two successive level-0 files.
    ///
    /// # Expected behavior
    /// The newer file wins; a value still in the memtable beats both.
    #[test]
    fn level0__newest_file_wins() {
        let tmp = TempDir::new().unwrap();
        let forest = Forest::open(tmp.path(), manual_config()).unwrap();

        forest.put(0, b"k", b"v1").unwrap();
        forest.flush().unwrap();
        forest.put(0, b"k", b"v2").unwrap();
        forest.flush().unwrap();
        assert_eq!(forest.get(0, b"k").unwrap(), Some(b"v2".to_vec()));

        forest.put(0, b"k", b"v3").unwrap();
        assert_eq!(forest.get(0, b"k").unwrap(), Some(b"v3".to_vec()));
    }

    /// # Scenario
    /// The forest is closed with unflushed writes and reopened.
    ///
    /// # Expected behavior
    /// The memtable log is replayed and nothing is lost.
    #[test]
    fn reopen__replays_memtable_log() {
        let tmp = TempDir::new().unwrap();
        {
            let forest = Forest::open(tmp.path(), manual_config()).unwrap();
            fill(&forest, 0..50);
            forest.close().unwrap();
        }

        let forest = Forest::open(tmp.path(), manual_config()).unwrap();
        assert!(forest.level0_files(0).unwrap().is_empty());
        for i in 0..50 {
            assert_eq!(forest.get(0, &key_for(i)).unwrap(), Some(value_for(i)));
        }
    }

    /// # Scenario
    /// Flushed and compacted files survive a reopen.
    ///
    /// # Expected behavior
    /// The same level-0 and bottom ids are restored, and writes made after
    /// the flush (memtable only) are replayed on top.
    #[test]
    fn reopen__restores_levels() {
        let tmp = TempDir::new().unwrap();
        let (bottom, level0) = {
            let forest = compacted_forest(tmp.path());
            fill(&forest, 3000..3010);
            forest.flush().unwrap();
            forest.put(0, b"late", b"write").unwrap();
            let ids = (
                forest.bottom_files(0).unwrap(),
                forest.level0_files(0).unwrap(),
            );
            forest.close().unwrap();
            ids
        };

        let forest = Forest::open(tmp.path(), manual_config()).unwrap();
        assert_eq!(forest.bottom_files(0).unwrap(), bottom);
        assert_eq!(forest.level0_files(0).unwrap(), level0);
        assert_eq!(forest.get(0, &key_for(1234)).unwrap(), Some(value_for(1234)));
        assert_eq!(forest.get(0, &key_for(3005)).unwrap(), Some(value_for(3005)));
        assert_eq!(forest.get(0, b"late").unwrap(), Some(b"write".to_vec()));
    }

    /// # Scenario
    /// A small write buffer makes puts flush on their own.
    ///
    /// # Expected behavior
    /// Level-0 files appear without an explicit flush and all keys remain
    /// readable.
    #[test]
    fn put__full_memtable_flushes() {
        let tmp = TempDir::new().unwrap();
        let config = ForestConfig {
            write_buffer_size: 2048,
            ..manual_config()
        };
        let forest = Forest::open(tmp.path(), config).unwrap();

        fill(&forest, 0..200);

        assert!(!forest.level0_files(0).unwrap().is_empty());
        for i in 0..200 {
            assert_eq!(forest.get(0, &key_for(i)).unwrap(), Some(value_for(i)));
        }
    }

    /// # Scenario
    /// Keys are routed to different partitions of a multi-partition forest.
    ///
    /// # Expected behavior
    /// Partitions are independent and an out-of-range partition is an
    /// error.
    #[test]
    fn partitions__are_independent() {
        let tmp = TempDir::new().unwrap();
        let config = ForestConfig {
            partitions: 3,
            ..manual_config()
        };
        let forest = Forest::open(tmp.path(), config).unwrap();

        forest.put(0, b"k", b"zero").unwrap();
        forest.put(2, b"k", b"two").unwrap();

        assert_eq!(forest.get(0, b"k").unwrap(), Some(b"zero".to_vec()));
        assert_eq!(forest.get(1, b"k").unwrap(), None);
        assert_eq!(forest.get(2, b"k").unwrap(), Some(b"two".to_vec()));
        assert!(matches!(
            forest.get(3, b"k"),
            Err(LsmError::UnknownPartition(3))
        ));
    }

    /// # Scenario
    /// A directory written with three partitions is reopened with one, then
    /// with four.
    ///
    /// # Expected behavior
    /// Both opens fail instead of routing keys to the wrong partitions.
    #[test]
    fn reopen__partition_count_change_rejected() {
        let tmp = TempDir::new().unwrap();
        {
            let config = ForestConfig {
                partitions: 3,
                ..manual_config()
            };
            let forest = Forest::open(tmp.path(), config).unwrap();
            forest.close().unwrap();
        }

        assert!(matches!(
            Forest::open(tmp.path(), manual_config()),
            Err(LsmError::Internal(_))
        ));
        let more = ForestConfig {
            partitions: 4,
            ..manual_config()
        };
        assert!(matches!(
            Forest::open(tmp.path(), more),
            Err(LsmError::Internal(_))
        ));
    }

    /// # Scenario
    /// Operations after `close`.
    ///
    /// # Expected behavior
    /// They fail with `Closed`; a second close is a no-op.
    #[test]
    fn close__rejects_further_operations() {
        let tmp = TempDir::new().unwrap();
        let forest = Forest::open(tmp.path(), manual_config()).unwrap();
        forest.close().unwrap();

        assert!(matches!(forest.put(0, b"k", b"v"), Err(LsmError::Closed)));
        assert!(matches!(forest.get(0, b"k"), Err(LsmError::Closed)));
        forest.close().unwrap();
    }
}

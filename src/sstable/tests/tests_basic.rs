//! SSTable build/open/read on well-formed files.
//!
//! Coverage:
//! - point lookups: hits, misses below, between and above the stored keys
//! - multi-block files and the per-key block handles used by migration
//! - properties and file size
//! - writer input validation and tmp-file cleanup

#[cfg(test)]
mod tests {
    use std::fs;

    use crate::sstable::tests::helpers::*;
    use crate::sstable::{
        BLOCK_CHECKSUM_SIZE, BLOCK_LEN_SIZE, SSTable, SSTableError, SstWriter, decode_block,
        unframe_block,
    };
    use tempfile::TempDir;

    #[test]
    fn single_entry_round_trip() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = build_sst(tmp.path(), "000001.sst", vec![(b"a".to_vec(), b"1".to_vec())]);

        let sst = SSTable::open(&path).unwrap();
        assert_eq!(sst.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(sst.get(b"b").unwrap(), None);
        assert_eq!(sst.record_count(), 1);
        assert_eq!(sst.min_key(), b"a");
        assert_eq!(sst.max_key(), b"a");
        assert_eq!(sst.file_size(), fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn lookups_across_many_blocks() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let entries = pairs(2000, 64);
        let path = build_sst(tmp.path(), "000002.sst", entries.clone());

        let sst = SSTable::open(&path).unwrap();
        assert!(sst.properties.data_block_count > 1);
        assert_eq!(sst.record_count(), 2000);

        for (k, v) in entries.iter().step_by(37) {
            assert_eq!(sst.get(k).unwrap().as_ref(), Some(v));
        }

        // Below the first key, between keys, above the last key.
        assert_eq!(sst.get(b"aaa").unwrap(), None);
        assert_eq!(sst.get(b"key-00010x").unwrap(), None);
        assert_eq!(sst.get(b"zzz").unwrap(), None);
    }

    #[test]
    fn iter_yields_everything_in_order() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let entries = pairs(700, 20);
        let path = build_sst(tmp.path(), "000003.sst", entries.clone());

        let sst = SSTable::open(&path).unwrap();
        let read: Vec<_> = sst.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(read, entries);
    }

    /// # Scenario
    /// A multi-block table is walked through `block_handles()`.
    ///
    /// # Expected behavior
    /// Every key appears once, in order, paired with the handle of a block
    /// that, read on its own from the raw file, contains that key.
    #[test]
    fn block_handles_point_at_the_right_block() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let entries = pairs(500, 100);
        let path = build_sst(tmp.path(), "000004.sst", entries.clone());

        let sst = SSTable::open(&path).unwrap();
        let raw = fs::read(&path).unwrap();
        let handles: Vec<_> = sst.block_handles().collect::<Result<_, _>>().unwrap();

        assert_eq!(handles.len(), entries.len());
        let keys: Vec<_> = handles.iter().map(|(k, _)| k.clone()).collect();
        let expected: Vec<_> = entries.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, expected);

        for (key, handle) in handles.iter().step_by(13) {
            let start = handle.offset as usize;
            let framed = &raw[start..start + handle.size as usize];
            let cells = decode_block(unframe_block(framed).unwrap()).unwrap();
            assert!(cells.iter().any(|(k, _)| k == key));
            assert!(handle.size as usize > BLOCK_LEN_SIZE + BLOCK_CHECKSUM_SIZE);
        }

        let distinct: Vec<_> = sst.data_block_handles().collect();
        assert_eq!(distinct.len() as u64, sst.properties.data_block_count);
        assert!(distinct.windows(2).all(|w| w[0].offset + w[0].size == w[1].offset));
    }

    #[test]
    fn empty_input_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000005.sst");

        let err = SstWriter::new(&path)
            .build(std::iter::empty(), 0)
            .unwrap_err();
        assert!(matches!(err, SSTableError::Internal(_)));
        assert!(!path.exists());
    }

    #[test]
    fn unsorted_input_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000006.sst");

        let entries = vec![
            (b"b".to_vec(), b"1".to_vec()),
            (b"a".to_vec(), b"2".to_vec()),
        ];
        assert!(SstWriter::new(&path).build(entries.into_iter(), 2).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        build_sst(tmp.path(), "000007.sst", pairs(10, 10));

        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["000007.sst".to_string()]);
    }

    #[test]
    fn bloom_rejects_most_absent_keys() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = build_sst(tmp.path(), "000008.sst", pairs(1000, 8));
        let sst = SSTable::open(&path).unwrap();

        for (k, _) in pairs(1000, 0) {
            assert!(sst.bloom_may_contain(&k));
        }
        let false_positives = (0..1000)
            .filter(|i| sst.bloom_may_contain(format!("absent-{i}").as_bytes()))
            .count();
        assert!(false_positives < 100, "{false_positives} false positives");
    }
}

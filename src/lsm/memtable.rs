//! Partition memtable: a sorted map mirrored by an append-only log.
//!
//! Every put is appended to `partition-<n>.log` before it lands in the map.
//! On open the log is replayed; after the memtable is flushed to an SSTable
//! the log is truncated.

use std::{
    collections::BTreeMap,
    mem,
    path::{Path, PathBuf},
};

use tracing::{info, trace};

use super::LsmError;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{DropCounter, LogReader, LogWriter};

/// Per-entry bookkeeping charged on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 32;

/// One logged put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemtableRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Encode for MemtableRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)
    }
}

impl Decode for MemtableRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let key = encoding::decode_at::<Vec<u8>>(buf, &mut offset)?;
        let value = encoding::decode_at::<Vec<u8>>(buf, &mut offset)?;
        Ok((Self { key, value }, offset))
    }
}

#[derive(Debug)]
pub(crate) struct Memtable {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    approximate_size: usize,
    path: PathBuf,
    log: LogWriter,
}

impl Memtable {
    /// Replays `path` if it exists and opens it for appending.
    pub fn open(path: impl AsRef<Path>, verify_checksums: bool) -> Result<Self, LsmError> {
        let path = path.as_ref().to_path_buf();
        let mut entries = BTreeMap::new();
        let mut approximate_size = 0;

        if path.exists() {
            let mut reader = LogReader::open(&path, DropCounter::default(), verify_checksums, 0)?;
            let mut records = 0usize;
            while let Some(record) = reader.read_decoded::<MemtableRecord>()? {
                approximate_size += entry_size(&record.key, &record.value);
                entries.insert(record.key, record.value);
                records += 1;
            }
            if records > 0 || reader.reporter().bytes > 0 {
                info!(
                    path = %path.display(),
                    records,
                    dropped_bytes = reader.reporter().bytes,
                    "memtable log replayed"
                );
            }
        }

        let log = LogWriter::open_append(&path)?;
        Ok(Self {
            entries,
            approximate_size,
            path,
            log,
        })
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), LsmError> {
        let record = MemtableRecord {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        self.log.add_encoded(&record)?;
        trace!(key_len = key.len(), value_len = value.len(), "memtable put");

        self.approximate_size += entry_size(&record.key, &record.value);
        self.entries.insert(record.key, record.value);
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    /// Sorted snapshot of the contents, used to build an SSTable.
    pub fn sorted_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Empties the map and truncates the log. Call only once the contents
    /// are durable elsewhere.
    pub fn reset(&mut self) -> Result<(), LsmError> {
        let fresh = LogWriter::create(&self.path)?;
        drop(mem::replace(&mut self.log, fresh));
        self.entries.clear();
        self.approximate_size = 0;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), LsmError> {
        self.log.sync()?;
        Ok(())
    }
}

fn entry_size(key: &[u8], value: &[u8]) -> usize {
    key.len() + value.len() + ENTRY_OVERHEAD
}

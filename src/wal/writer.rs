//! Append side of the log.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{trace, warn};

use super::{BLOCK_SIZE, HEADER_SIZE, RecordType, WRITE_BUFFER_SIZE, WalError, chunk_crc, mask_crc};
use crate::encoding::{self, Encode};

const ZEROES: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Single-writer appender producing the block format described in the
/// [module docs](super).
///
/// Every [`add_record`](Self::add_record) call hands its bytes to the OS
/// before returning. [`sync`](Self::sync) additionally forces them to
/// stable storage.
#[derive(Debug)]
pub struct LogWriter {
    file: File,
    path: PathBuf,

    /// Write position inside the current block.
    block_offset: usize,

    /// Pending bytes not yet handed to the OS.
    pending: Vec<u8>,

    /// Total bytes appended through this handle, padding included.
    bytes_written: u64,

    /// Set by the first failed write. The block layout on disk no longer
    /// matches `block_offset`, so every later append or sync is refused.
    failed: bool,
}

impl LogWriter {
    /// Creates a new, empty log at `path`, truncating any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        trace!(path = %path.display(), "log created");
        Ok(Self::with_file(file, path, 0))
    }

    /// Opens `path` for appending, creating it when missing.
    ///
    /// Writing resumes inside the block the file currently ends in.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        let block_offset = (len % BLOCK_SIZE as u64) as usize;
        trace!(path = %path.display(), len, "log opened for append");
        Ok(Self::with_file(file, path, block_offset))
    }

    fn with_file(file: File, path: PathBuf, block_offset: usize) -> Self {
        Self {
            file,
            path,
            block_offset,
            pending: Vec::with_capacity(WRITE_BUFFER_SIZE),
            bytes_written: 0,
            failed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether an earlier write failed. A failed writer refuses further
    /// appends and syncs; the log must be reopened.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Appends one logical record and flushes it to the file.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<(), WalError> {
        self.check_healthy()?;
        let result = self.append(payload);
        self.fail_on_error(result)
    }

    fn append(&mut self, payload: &[u8]) -> Result<(), WalError> {
        let mut left = payload;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Not even a header fits: pad out the block.
                if leftover > 0 {
                    self.write_raw(&ZEROES[..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = left.len().min(avail);
            let end = fragment_len == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };

            self.emit_chunk(record_type, &left[..fragment_len])?;
            left = &left[fragment_len..];
            begin = false;

            if end {
                break;
            }
        }

        self.flush()
    }

    /// Encodes `record` and appends it as one logical record.
    pub fn add_encoded<T: Encode>(&mut self, record: &T) -> Result<(), WalError> {
        let bytes = encoding::encode_to_vec(record)?;
        self.add_record(&bytes)
    }

    /// Flushes pending bytes and fdatasyncs the file.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.check_healthy()?;
        let result = self
            .flush()
            .and_then(|()| self.file.sync_data().map_err(WalError::from));
        self.fail_on_error(result)
    }

    fn check_healthy(&self) -> Result<(), WalError> {
        if self.failed {
            return Err(WalError::WriterFailed(self.path.clone()));
        }
        Ok(())
    }

    fn fail_on_error(&mut self, result: Result<(), WalError>) -> Result<(), WalError> {
        if let Err(e) = &result {
            warn!(path = %self.path.display(), error = %e, "log write failed, writer disabled");
            self.failed = true;
            self.pending.clear();
        }
        result
    }

    fn emit_chunk(&mut self, record_type: RecordType, payload: &[u8]) -> Result<(), WalError> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let crc = mask_crc(chunk_crc(record_type, payload));
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        header[6] = record_type as u8;

        self.write_raw(&header)?;
        self.write_raw(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<(), WalError> {
        self.bytes_written += data.len() as u64;
        if self.pending.len() + data.len() <= WRITE_BUFFER_SIZE {
            self.pending.extend_from_slice(data);
            return Ok(());
        }
        self.flush()?;
        if data.len() >= WRITE_BUFFER_SIZE {
            self.file.write_all(data)?;
        } else {
            self.pending.extend_from_slice(data);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WalError> {
        if !self.pending.is_empty() {
            self.file.write_all(&self.pending)?;
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if self.failed {
            return;
        }
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to flush log on drop");
        }
    }
}

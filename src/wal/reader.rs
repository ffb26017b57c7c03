//! Scan side of the log.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use tracing::warn;

use super::{BLOCK_SIZE, HEADER_SIZE, RecordType, WalError, chunk_crc, unmask_crc};
use crate::encoding::{self, Decode};

// ------------------------------------------------------------------------------------------------
// Corruption reporting
// ------------------------------------------------------------------------------------------------

/// Sink for bytes the reader had to skip.
pub trait CorruptionReporter {
    /// `bytes` were dropped for `reason`.
    fn corruption(&mut self, bytes: usize, reason: &str);
}

impl<R: CorruptionReporter + ?Sized> CorruptionReporter for &mut R {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        (**self).corruption(bytes, reason);
    }
}

/// Reporter that logs every drop and keeps a tally.
#[derive(Debug, Default)]
pub struct DropCounter {
    pub bytes: usize,
    pub reasons: Vec<String>,
}

impl CorruptionReporter for DropCounter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        warn!(bytes, reason, "log corruption, bytes dropped");
        self.bytes += bytes;
        self.reasons.push(reason.to_string());
    }
}

// ------------------------------------------------------------------------------------------------
// Physical chunk scan
// ------------------------------------------------------------------------------------------------

enum Physical {
    /// A verified chunk; payload is `block[start..end]`.
    Chunk {
        record_type: u8,
        start: usize,
        end: usize,
        offset: u64,
    },
    Eof,
    /// The chunk was skipped (already reported if it needed reporting).
    Bad,
}

/// Sequential reader over a log written by [`LogWriter`](super::LogWriter).
///
/// Not restartable: once [`read_record`](Self::read_record) returns
/// `Ok(None)` the scan is over.
pub struct LogReader<R: CorruptionReporter> {
    file: File,
    reporter: R,
    verify_checksums: bool,

    block: Box<[u8; BLOCK_SIZE]>,
    /// Unconsumed window of `block`.
    pos: usize,
    len: usize,
    eof: bool,

    /// File offset just past the bytes held in `block`.
    end_of_buffer_offset: u64,
    /// Offset of the last record returned.
    last_record_offset: u64,
    initial_offset: u64,
    /// Skipping continuation chunks after seeking into the middle of the log.
    resyncing: bool,
}

impl<R: CorruptionReporter> LogReader<R> {
    /// Opens `path` for a scan starting at the first record whose physical
    /// start is at or after `initial_offset`.
    pub fn open(
        path: impl AsRef<Path>,
        reporter: R,
        verify_checksums: bool,
        initial_offset: u64,
    ) -> Result<Self, WalError> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            reporter,
            verify_checksums,
            block: Box::new([0u8; BLOCK_SIZE]),
            pos: 0,
            len: 0,
            eof: false,
            end_of_buffer_offset: 0,
            last_record_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        })
    }

    /// Offset of the last record returned by [`read_record`](Self::read_record).
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn into_reporter(self) -> R {
        self.reporter
    }

    /// Returns the next logical record, or `Ok(None)` at end of log.
    ///
    /// Corruption never surfaces here; it goes to the reporter and the
    /// scan continues.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        if self.last_record_offset < self.initial_offset {
            self.skip_to_initial_block()?;
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        let mut prospective_offset = 0u64;

        loop {
            let (record_type, start, end, offset) = match self.read_physical() {
                Physical::Chunk {
                    record_type,
                    start,
                    end,
                    offset,
                } => (record_type, start, end, offset),
                Physical::Eof => {
                    // A fragment cut by the end of the file is a torn
                    // write, not corruption.
                    return Ok(None);
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_drop(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                    continue;
                }
            };
            let fragment_len = end - start;

            if self.resyncing {
                match RecordType::from_byte(record_type) {
                    Some(RecordType::Middle) => continue,
                    Some(RecordType::Last) => {
                        self.resyncing = false;
                        continue;
                    }
                    _ => self.resyncing = false,
                }
            }

            match RecordType::from_byte(record_type) {
                Some(RecordType::Full) => {
                    if in_fragmented_record && !scratch.is_empty() {
                        self.report_drop(scratch.len(), "partial record without end");
                    }
                    self.last_record_offset = offset;
                    return Ok(Some(self.block[start..end].to_vec()));
                }
                Some(RecordType::First) => {
                    if in_fragmented_record && !scratch.is_empty() {
                        self.report_drop(scratch.len(), "partial record without end");
                    }
                    prospective_offset = offset;
                    scratch.clear();
                    scratch.extend_from_slice(&self.block[start..end]);
                    in_fragmented_record = true;
                }
                Some(RecordType::Middle) => {
                    if in_fragmented_record {
                        scratch.extend_from_slice(&self.block[start..end]);
                    } else {
                        self.report_drop(
                            fragment_len,
                            "missing start of fragmented record (middle)",
                        );
                    }
                }
                Some(RecordType::Last) => {
                    if in_fragmented_record {
                        scratch.extend_from_slice(&self.block[start..end]);
                        self.last_record_offset = prospective_offset;
                        return Ok(Some(scratch));
                    }
                    self.report_drop(fragment_len, "missing start of fragmented record (last)");
                }
                Some(RecordType::Zero) | None => {
                    let dropped = fragment_len + if in_fragmented_record { scratch.len() } else { 0 };
                    self.report_drop(dropped, &format!("unknown record type {record_type}"));
                    in_fragmented_record = false;
                    scratch.clear();
                }
            }
        }
    }

    /// Reads records and decodes each as `T`.
    ///
    /// Records that fail to decode are reported and skipped.
    pub fn read_decoded<T: Decode>(&mut self) -> Result<Option<T>, WalError> {
        while let Some(raw) = self.read_record()? {
            match encoding::decode_from_slice::<T>(&raw) {
                Ok((value, _)) => return Ok(Some(value)),
                Err(e) => self.report_drop(raw.len(), &format!("undecodable record: {e}")),
            }
        }
        Ok(None)
    }

    fn skip_to_initial_block(&mut self) -> Result<(), WalError> {
        let block = BLOCK_SIZE as u64;
        let offset_in_block = self.initial_offset % block;
        let mut block_start = self.initial_offset - offset_in_block;

        // Inside the trailer: the first chunk can only start in the next block.
        if offset_in_block > block - (HEADER_SIZE as u64 - 1) {
            block_start += block;
        }

        self.end_of_buffer_offset = block_start;
        if block_start > 0 {
            self.file.seek(SeekFrom::Start(block_start))?;
        }
        Ok(())
    }

    fn read_physical(&mut self) -> Physical {
        loop {
            let available = self.len - self.pos;
            if available < HEADER_SIZE {
                if self.eof {
                    // Truncated header at the tail: writer died mid-chunk.
                    self.clear_block();
                    return Physical::Eof;
                }
                // Whatever is left is block trailer padding.
                self.clear_block();
                match read_full(&mut self.file, &mut self.block[..]) {
                    Ok(n) => {
                        self.end_of_buffer_offset += n as u64;
                        self.len = n;
                        if n < BLOCK_SIZE {
                            self.eof = true;
                        }
                    }
                    Err(e) => {
                        self.report_drop(BLOCK_SIZE, &e.to_string());
                        self.eof = true;
                        return Physical::Eof;
                    }
                }
                continue;
            }

            let header = &self.block[self.pos..self.pos + HEADER_SIZE];
            let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type = header[6];

            if HEADER_SIZE + length > available {
                self.clear_block();
                if !self.eof {
                    self.report_drop(available, "bad record length");
                    return Physical::Bad;
                }
                return Physical::Eof;
            }

            if record_type == RecordType::Zero as u8 && length == 0 {
                // Zero-filled region; nothing to report.
                self.clear_block();
                return Physical::Bad;
            }

            let start = self.pos + HEADER_SIZE;
            let end = start + length;

            if self.verify_checksums {
                let expected = unmask_crc(stored_crc);
                let actual = match RecordType::from_byte(record_type) {
                    Some(t) => chunk_crc(t, &self.block[start..end]),
                    None => {
                        let crc = crc32c::crc32c(&[record_type]);
                        crc32c::crc32c_append(crc, &self.block[start..end])
                    }
                };
                if actual != expected {
                    self.clear_block();
                    self.report_drop(available, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            self.pos = end;
            let remaining = (self.len - self.pos) as u64;
            let offset = self.end_of_buffer_offset - remaining - (HEADER_SIZE + length) as u64;

            if offset < self.initial_offset {
                return Physical::Bad;
            }

            return Physical::Chunk {
                record_type,
                start,
                end,
                offset,
            };
        }
    }

    fn clear_block(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    fn report_drop(&mut self, bytes: usize, reason: &str) {
        let buffered = (self.len - self.pos) as u64;
        let position = self
            .end_of_buffer_offset
            .saturating_sub(buffered)
            .saturating_sub(bytes as u64);
        if position >= self.initial_offset {
            self.reporter.corruption(bytes, reason);
        }
    }
}

/// Fills `buf` from `file`, stopping early only at end of file.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

//! Write-Ahead Log (WAL) Module
//!
//! A **block-structured**, **CRC32C-protected**, **append-only** record log.
//! It persists the migration ledger and is also used by the LSM tier for
//! its manifest and memtable logs.
//!
//! ## Design Overview
//!
//! The file is a sequence of fixed 4 KiB blocks. A logical record is cut
//! into one or more *chunks*; each chunk carries its own header and never
//! crosses a block boundary. Small records fit in a single [`RecordType::Full`]
//! chunk, larger ones are split into `First`, zero or more `Middle`, and a
//! `Last` chunk.
//!
//! # On-disk layout
//!
//! ```text
//! block 0                                  block 1
//! +-------+---------+-------+---------+---+-------+--------- ...
//! | hdr   | payload | hdr   | payload |pad| hdr   | payload
//! +-------+---------+-------+---------+---+-------+--------- ...
//!
//! hdr = [masked crc32c (4 B, LE)][length (2 B, LE)][type (1 B)]
//! ```
//!
//! - The checksum covers the type byte followed by the payload, and is
//!   stored masked (see [`mask_crc`]) so that a log embedded in another
//!   checksummed stream does not produce trivially valid CRCs.
//! - A block tail shorter than a header is zero-filled; the next chunk
//!   starts at the next block.
//!
//! # Failure model
//!
//! Damage is contained to a block. The [`LogReader`] skips the remainder
//! of a block whose chunk fails its checksum or carries an impossible
//! length, reports the dropped bytes to a [`CorruptionReporter`], and
//! carries on with the next block. A chunk cut short by the end of the file
//! is a torn write and reads as a clean end of log.
//!
//! # Concurrency model
//!
//! [`LogWriter`] is single-writer and takes `&mut self`; owners serialize
//! access (the ledger does it under its write lock). Readers are
//! independent of writers and are only used during recovery.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

mod reader;
mod writer;

pub use reader::{CorruptionReporter, DropCounter, LogReader};
pub use writer::LogWriter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{io, path::PathBuf};

use crate::encoding::EncodingError;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// Physical block size.
pub const BLOCK_SIZE: usize = 4096;

/// Chunk header: checksum (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 4 + 2 + 1;

/// Capacity of the writer's coalescing buffer.
pub(crate) const WRITE_BUFFER_SIZE: usize = 1024;

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be encoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// An earlier write through this writer failed.
    #[error("log writer for {} failed earlier", .0.display())]
    WriterFailed(PathBuf),

    /// Internal consistency error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Chunk types
// ------------------------------------------------------------------------------------------------

/// Type byte of a physical chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for preallocated (zeroed) regions.
    Zero = 0,
    /// A whole record in one chunk.
    Full = 1,
    /// First chunk of a fragmented record.
    First = 2,
    /// Interior chunk of a fragmented record.
    Middle = 3,
    /// Final chunk of a fragmented record.
    Last = 4,
}

impl RecordType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Zero),
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Checksums
// ------------------------------------------------------------------------------------------------

/// Rotates and offsets a CRC so that the CRC of data containing embedded
/// CRCs does not collapse to a fixed point.
#[inline]
pub fn mask_crc(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(CRC_MASK_DELTA)
}

/// Inverse of [`mask_crc`].
#[inline]
pub fn unmask_crc(masked: u32) -> u32 {
    masked.wrapping_sub(CRC_MASK_DELTA).rotate_left(15)
}

/// Unmasked CRC32C of a chunk: type byte first, then the payload.
#[inline]
pub(crate) fn chunk_crc(record_type: RecordType, payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&[record_type as u8]);
    crc32c::crc32c_append(crc, payload)
}

//! Cold read path.
//!
//! Once a file has been migrated, keys that miss the LSM tier are served
//! straight from disk: the learned index yields a [`Location`](crate::codec::Location)
//! naming a file and a block, and [`BlockReader`] fetches that single block
//! with one positioned read, verifies it and searches it.
//!
//! Read buffers come from a bounded pool and go back to it on every exit
//! path, errors included. When the pool is empty a fresh buffer is
//! allocated; when it is full a returned buffer is dropped.
//!
//! # Staleness
//!
//! A location is only meaningful while the file it points at still holds the
//! bytes that were indexed. A missing file, a short read or a block whose
//! length prefix or checksum does not match means the location is stale
//! ([`ColdReadError::Stale`]). The caller decides whether another name for
//! the same file is worth trying.


use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use crate::sstable::{BlockHandle, decode_block, unframe_block};
use crossbeam::queue::ArrayQueue;
use thiserror::Error;
use tracing::{debug, trace};

/// Pooled buffers are allocated in multiples of this.
const BUFFER_ALIGN: usize = 4096;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ColdReadError {
    /// The file no longer holds the indexed block.
    #[error("stale location in {path}: {reason}")]
    Stale { path: PathBuf, reason: String },

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ColdReadError {
    pub fn is_stale(&self) -> bool {
        matches!(self, ColdReadError::Stale { .. })
    }

    fn stale(path: &Path, reason: impl Into<String>) -> Self {
        ColdReadError::Stale {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Decoded block
// ------------------------------------------------------------------------------------------------

/// Cells of one verified data block, sorted by key.
#[derive(Debug, Clone)]
pub struct ColdBlock {
    cells: Vec<(Vec<u8>, Vec<u8>)>,
}

impl ColdBlock {
    /// Binary search for `key`.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.cells
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| self.cells[i].1.as_slice())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// Buffer pool
// ------------------------------------------------------------------------------------------------

/// A buffer borrowed from the pool, handed back on drop.
struct PooledBuffer<'a> {
    buf: Vec<u8>,
    pool: &'a ArrayQueue<Vec<u8>>,
}

impl PooledBuffer<'_> {
    fn as_mut_slice(&mut self, len: usize) -> &mut [u8] {
        if self.buf.len() < len {
            let rounded = len.div_ceil(BUFFER_ALIGN) * BUFFER_ALIGN;
            self.buf.resize(rounded, 0);
        }
        &mut self.buf[..len]
    }

    fn as_slice(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        // Full pool: let it go.
        let _ = self.pool.push(buf);
    }
}

// ------------------------------------------------------------------------------------------------
// Block reader
// ------------------------------------------------------------------------------------------------

/// Reads single data blocks by handle.
///
/// `BlockReader` is `Send + Sync`; one instance serves all readers.
pub struct BlockReader {
    pool: ArrayQueue<Vec<u8>>,
}

impl BlockReader {
    /// Creates a reader whose pool keeps at most `pool_size` idle buffers.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool: ArrayQueue::new(pool_size.max(1)),
        }
    }

    /// Number of idle buffers currently pooled.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    fn take_buffer(&self) -> PooledBuffer<'_> {
        let buf = self
            .pool
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BUFFER_ALIGN));
        PooledBuffer {
            buf,
            pool: &self.pool,
        }
    }

    /// Reads the block named by `handle` from `path`, verifies it and
    /// decodes its cells.
    pub fn read_block(&self, path: &Path, handle: BlockHandle) -> Result<ColdBlock, ColdReadError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "cold file missing");
                return Err(ColdReadError::stale(path, "file not found"));
            }
            Err(e) => return Err(e.into()),
        };

        let len = usize::try_from(handle.size)
            .map_err(|_| ColdReadError::stale(path, "block size out of range"))?;

        let mut buffer = self.take_buffer();
        match read_exact_at(&file, buffer.as_mut_slice(len), handle.offset) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ColdReadError::stale(
                    path,
                    format!("short read of {len} bytes at {}", handle.offset),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        let content = unframe_block(buffer.as_slice(len))
            .map_err(|e| ColdReadError::stale(path, format!("block at {}: {e}", handle.offset)))?;
        let cells = decode_block(content)
            .map_err(|e| ColdReadError::stale(path, format!("block at {}: {e}", handle.offset)))?;

        trace!(
            path = %path.display(),
            offset = handle.offset,
            size = handle.size,
            cells = cells.len(),
            "cold block read"
        );
        Ok(ColdBlock { cells })
    }

    /// Reads the block and looks `key` up in it.
    pub fn get(
        &self,
        path: &Path,
        handle: BlockHandle,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, ColdReadError> {
        let block = self.read_block(path, handle)?;
        Ok(block.get(key).map(<[u8]>::to_vec))
    }
}

impl std::fmt::Debug for BlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("capacity", &self.pool.capacity())
            .field("pooled", &self.pool.len())
            .finish()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let read = file.seek_read(buf, offset)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "positioned read returned zero",
            ));
        }
        let tmp = buf;
        buf = &mut tmp[read..];
        offset += read as u64;
    }
    Ok(())
}

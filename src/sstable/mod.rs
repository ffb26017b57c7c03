//! Sorted String Table (SSTable) Module
//!
//! This module implements the **immutable**, **disk-backed** sorted files of
//! the LSM tier. The same files later become the read-only data files of the
//! learned-index tier: once a file is migrated its bytes are never rewritten,
//! only renamed, and the learned index records the block each key lives in.
//!
//! ## Design Overview
//!
//! Key/value pairs are stored in **sorted data blocks** of roughly 4 KiB.
//! Every block is framed by a length prefix and a CRC32 trailer, so a single
//! block can be read and verified in isolation with one positioned read.
//! That property is what the cold read path ([`crate::coldpath`]) relies on.
//!
//! Data is serialized with the crate's [`encoding`] module (fixed-width
//! little-endian integers).
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! [DATA_BLOCK_LEN_LE][DATA_BLOCK_BYTES][DATA_BLOCK_CRC32_LE]
//! ...
//! [BLOOM_FILTER_LEN_LE][BLOOM_FILTER_BYTES][BLOOM_FILTER_CRC32_LE]
//! [PROPERTIES_LEN_LE][PROPERTIES_BYTES][PROPERTIES_CRC32_LE]
//! [METAINDEX_LEN_LE][METAINDEX_BYTES][METAINDEX_CRC32_LE]
//! [INDEX_LEN_LE][INDEX_BYTES][INDEX_CRC32_LE]
//! [FOOTER_BYTES]
//! ```
//!
//! - **Header**: magic, version and CRC32 of both.
//! - **Data blocks**: concatenated cells `[key_len u32][value_len u32][key][value]`
//!   in ascending key order, one cell per key.
//! - **Bloom filter block**: fast negative lookups.
//! - **Properties block**: min/max key, record count, creation time.
//! - **Metaindex block**: handles of the bloom and properties blocks.
//! - **Index block**: first key and [`BlockHandle`] of each data block.
//! - **Footer**: metaindex and index handles, file size, CRC32.
//!
//! A [`BlockHandle`] size always covers the framing (length prefix and
//! checksum), so `offset..offset + size` is exactly the bytes to read.
//!
//! # Concurrency model
//!
//! SSTables are immutable and memory-mapped; any number of threads may read
//! the same table without locking.
//!
//! # Guarantees
//!
//! - **Immutability:** Once written, an SSTable is never modified.
//! - **Integrity:** Each block and the footer carry CRC32 checksums.
//! - **Crash safety:** Files are written to a temporary path and renamed
//!   into place after an fsync.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::SstWriter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{fs::File, io, path::Path};

use crate::encoding::{self, Decode, Encode, EncodingError, decode_at};
use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

const SST_HDR_MAGIC: [u8; 4] = *b"SST0";
const SST_HDR_VERSION: u32 = 1;
const SST_BLOOM_FILTER_FALSE_POSITIVE_RATE: f64 = 0.01;
const SST_DATA_BLOCK_MAX_SIZE: usize = 4096;
const SST_FOOTER_SIZE: usize = 44;
const SST_HDR_SIZE: usize = 12;

/// Length prefix of a framed block.
pub const BLOCK_LEN_SIZE: usize = 4;

/// CRC32 trailer of a framed block.
pub const BLOCK_CHECKSUM_SIZE: usize = 4;

/// Fixed part of a cell: key length + value length.
pub const CELL_HEADER_SIZE: usize = 8;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SSTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal invariant violation or malformed file.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Checksum mismatch.
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// SSTable file header, written at the beginning of the SSTable.
#[derive(Default)]
pub(crate) struct SSTableHeader {
    /// Magic bytes to identify SSTable format (`b"SST0"`).
    magic: [u8; 4],

    /// SSTable format version.
    version: u32,

    /// CRC32 checksum of the header (excluding this field).
    header_crc: u32,
}

/// Metadata block containing SSTable-level properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SSTablePropertiesBlock {
    /// Creation timestamp (UNIX epoch nanos).
    pub creation_timestamp: u64,

    /// Total number of records in the SSTable.
    pub record_count: u64,

    /// Number of data blocks.
    pub data_block_count: u64,

    /// Minimum key in the SSTable.
    pub min_key: Vec<u8>,

    /// Maximum key in the SSTable.
    pub max_key: Vec<u8>,
}

/// Index entry pointing to a specific data block.
pub(crate) struct SSTableIndexEntry {
    /// First key stored in the block.
    pub(crate) separator_key: Vec<u8>,

    /// Block handle containing offset and size of the data block.
    pub(crate) handle: BlockHandle,
}

/// Handles of the auxiliary blocks.
pub(crate) struct MetaIndex {
    pub(crate) bloom: BlockHandle,
    pub(crate) properties: BlockHandle,
}

/// SSTable footer, stored at the very end of the file.
pub(crate) struct SSTableFooter {
    /// Handle of the metaindex block.
    pub(crate) metaindex: BlockHandle,

    /// Handle of the main index block, mapping separator keys to data blocks.
    pub(crate) index: BlockHandle,

    /// Total size of the SSTable file, including this footer.
    pub(crate) total_file_size: u64,

    /// CRC32 checksum computed over the footer fields except this one.
    pub(crate) footer_crc32: u32,
}

/// Handle to a block in the SSTable file, specifying its offset and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Offset of the block in the SSTable file.
    pub offset: u64,

    /// Size of the block in bytes, including length prefix and checksum.
    pub size: u64,
}

// ------------------------------------------------------------------------------------------------
// Encoding implementations
// ------------------------------------------------------------------------------------------------

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let offset = decode_at(buf, &mut off)?;
        let size = decode_at(buf, &mut off)?;
        Ok((Self { offset, size }, off))
    }
}

impl Encode for SSTableHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.header_crc.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let magic = decode_at(buf, &mut off)?;
        let version = decode_at(buf, &mut off)?;
        let header_crc = decode_at(buf, &mut off)?;
        Ok((
            Self {
                magic,
                version,
                header_crc,
            },
            off,
        ))
    }
}

impl Encode for SSTablePropertiesBlock {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.creation_timestamp.encode_to(buf)?;
        self.record_count.encode_to(buf)?;
        self.data_block_count.encode_to(buf)?;
        self.min_key.encode_to(buf)?;
        self.max_key.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTablePropertiesBlock {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let creation_timestamp = decode_at(buf, &mut off)?;
        let record_count = decode_at(buf, &mut off)?;
        let data_block_count = decode_at(buf, &mut off)?;
        let min_key = decode_at(buf, &mut off)?;
        let max_key = decode_at(buf, &mut off)?;
        Ok((
            Self {
                creation_timestamp,
                record_count,
                data_block_count,
                min_key,
                max_key,
            },
            off,
        ))
    }
}

impl Encode for SSTableIndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.separator_key.encode_to(buf)?;
        self.handle.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableIndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let separator_key = decode_at(buf, &mut off)?;
        let handle = decode_at(buf, &mut off)?;
        Ok((
            Self {
                separator_key,
                handle,
            },
            off,
        ))
    }
}

impl Encode for MetaIndex {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.bloom.encode_to(buf)?;
        self.properties.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for MetaIndex {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let bloom = decode_at(buf, &mut off)?;
        let properties = decode_at(buf, &mut off)?;
        Ok((Self { bloom, properties }, off))
    }
}

impl Encode for SSTableFooter {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.metaindex.encode_to(buf)?;
        self.index.encode_to(buf)?;
        self.total_file_size.encode_to(buf)?;
        self.footer_crc32.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SSTableFooter {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let metaindex = decode_at(buf, &mut off)?;
        let index = decode_at(buf, &mut off)?;
        let total_file_size = decode_at(buf, &mut off)?;
        let footer_crc32 = decode_at(buf, &mut off)?;
        Ok((
            Self {
                metaindex,
                index,
                total_file_size,
                footer_crc32,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Block framing and cells
// ------------------------------------------------------------------------------------------------

/// Validates a framed block `[len][content][crc32]` and returns its content.
///
/// `framed` must be exactly the bytes named by the block's handle.
pub fn unframe_block(framed: &[u8]) -> Result<&[u8], SSTableError> {
    if framed.len() < BLOCK_LEN_SIZE + BLOCK_CHECKSUM_SIZE {
        return Err(SSTableError::Internal("Short block".into()));
    }

    let (len_bytes, rest) = framed.split_at(BLOCK_LEN_SIZE);
    let content_len =
        u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;

    if content_len + BLOCK_CHECKSUM_SIZE != rest.len() {
        return Err(SSTableError::Internal(format!(
            "Block length {content_len} does not match handle size {}",
            framed.len()
        )));
    }

    let (content, checksum_bytes) = rest.split_at(content_len);
    let stored_checksum = u32::from_le_bytes([
        checksum_bytes[0],
        checksum_bytes[1],
        checksum_bytes[2],
        checksum_bytes[3],
    ]);

    let mut hasher = Crc32::new();
    hasher.update(content);
    if hasher.finalize() != stored_checksum {
        return Err(SSTableError::ChecksumMismatch);
    }

    Ok(content)
}

/// Appends one cell to a data block buffer.
pub(crate) fn encode_cell(key: &[u8], value: &[u8], buf: &mut Vec<u8>) -> Result<(), SSTableError> {
    let key_len = u32::try_from(key.len())
        .map_err(|_| SSTableError::Internal("key longer than u32::MAX".into()))?;
    let value_len = u32::try_from(value.len())
        .map_err(|_| SSTableError::Internal("value longer than u32::MAX".into()))?;
    key_len.encode_to(buf)?;
    value_len.encode_to(buf)?;
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    Ok(())
}

/// Iterates the `(key, value)` cells of an unframed data block.
pub struct BlockCells<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlockCells<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> BlockCells<'a> {
    fn next_cell(&mut self) -> Result<(&'a [u8], &'a [u8]), SSTableError> {
        let data = self.data;
        let key_len: u32 = decode_at(data, &mut self.pos)?;
        let value_len: u32 = decode_at(data, &mut self.pos)?;
        let key_end = self.pos + key_len as usize;
        let value_end = key_end + value_len as usize;
        if value_end > data.len() {
            return Err(SSTableError::Internal("Cell exceeds block".into()));
        }
        let key = &data[self.pos..key_end];
        let value = &data[key_end..value_end];
        self.pos = value_end;
        Ok((key, value))
    }
}

impl<'a> Iterator for BlockCells<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), SSTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let item = self.next_cell();
        if item.is_err() {
            // Stop after the first malformed cell.
            self.pos = self.data.len();
        }
        Some(item)
    }
}

/// Decodes every cell of an unframed data block into owned pairs.
pub fn decode_block(content: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, SSTableError> {
    BlockCells::new(content)
        .map(|cell| cell.map(|(k, v)| (k.to_vec(), v.to_vec())))
        .collect()
}

// ------------------------------------------------------------------------------------------------
// SSTable: immutable reader
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable **Sorted String Table (SSTable)**.
pub struct SSTable {
    /// File id assigned by the LSM tier.
    /// Set to 0 by `SSTable::open()`; the owner sets the correct value.
    pub id: u64,

    /// Memory-mapped file containing the full SSTable bytes.
    pub mmap: Mmap,

    /// Serialized bloom filter.
    bloom: Vec<u8>,

    /// Properties block with statistics and metadata.
    pub properties: SSTablePropertiesBlock,

    /// Index entries mapping key ranges to data blocks.
    pub(crate) index: Vec<SSTableIndexEntry>,

    /// Footer containing block handles and file integrity data.
    pub(crate) footer: SSTableFooter,
}

impl SSTable {
    /// Returns the on-disk file size of this SSTable in bytes.
    pub fn file_size(&self) -> u64 {
        self.footer.total_file_size
    }

    pub fn record_count(&self) -> u64 {
        self.properties.record_count
    }

    pub fn min_key(&self) -> &[u8] {
        &self.properties.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.properties.max_key
    }

    /// Checks whether `key` *might* exist in this SSTable according to the
    /// bloom filter.
    pub fn bloom_may_contain(&self, key: &[u8]) -> bool {
        if self.bloom.is_empty() {
            return true; // no bloom → cannot exclude
        }
        match Bloom::from_slice(&self.bloom) {
            Ok(bloom) => bloom.check(key),
            Err(_) => true, // corrupted bloom → assume present
        }
    }

    /// Opens an SSTable from disk, verifies its header and footer, and loads
    /// the bloom filter, properties and index.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::ChecksumMismatch`] if a checksum fails.
    /// - [`SSTableError::Internal`] for a bad magic or version, a truncated
    ///   file, or out-of-bounds block handles.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`. Files are never written after the
    /// rename that publishes them, and the map is read-only; every block
    /// boundary is checked before slicing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SSTableError> {
        let file = File::open(path)?;

        let mmap = unsafe { Mmap::map(&file)? };

        let file_len = mmap.len();
        if file_len < SST_HDR_SIZE + SST_FOOTER_SIZE {
            return Err(SSTableError::Internal("File too small".into()));
        }

        let (mut header, _) = encoding::decode_from_slice::<SSTableHeader>(&mmap[..SST_HDR_SIZE])?;
        let header_checksum = header.header_crc;
        header.header_crc = 0;

        let mut hasher = Crc32::new();
        hasher.update(&encoding::encode_to_vec(&header)?);
        if header_checksum != hasher.finalize() {
            return Err(SSTableError::ChecksumMismatch);
        }

        if header.magic != SST_HDR_MAGIC {
            return Err(SSTableError::Internal(
                "SSTable header magic mismatch".into(),
            ));
        }

        if header.version != SST_HDR_VERSION {
            return Err(SSTableError::Internal(
                "SSTable header version mismatch".into(),
            ));
        }

        let footer_start = file_len - SST_FOOTER_SIZE;
        let (mut footer, _) = encoding::decode_from_slice::<SSTableFooter>(&mmap[footer_start..])?;

        let footer_checksum = footer.footer_crc32;
        footer.footer_crc32 = 0;

        let mut hasher = Crc32::new();
        hasher.update(&encoding::encode_to_vec(&footer)?);
        if footer_checksum != hasher.finalize() {
            return Err(SSTableError::ChecksumMismatch);
        }
        footer.footer_crc32 = footer_checksum;

        if footer.total_file_size != file_len as u64 {
            return Err(SSTableError::Internal(format!(
                "SSTable size {file_len} does not match footer {}",
                footer.total_file_size
            )));
        }

        let meta_bytes = Self::read_block_bytes(&mmap, &footer.metaindex)?;
        let (meta, _) = encoding::decode_from_slice::<MetaIndex>(meta_bytes)?;

        let bloom = Self::read_block_bytes(&mmap, &meta.bloom)?.to_vec();

        let props_bytes = Self::read_block_bytes(&mmap, &meta.properties)?;
        let (properties, _) = encoding::decode_from_slice::<SSTablePropertiesBlock>(props_bytes)?;

        let index_bytes = Self::read_block_bytes(&mmap, &footer.index)?;
        let (index, _) = encoding::decode_vec::<SSTableIndexEntry>(index_bytes)?;

        Ok(Self {
            id: 0,
            mmap,
            bloom,
            properties,
            index,
            footer,
        })
    }

    /// Point lookup of `key` in this table alone.
    ///
    /// Bloom filter first, then binary search over the index for the only
    /// block that can hold the key, then a scan of that block.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SSTableError> {
        if self.index.is_empty() || !self.bloom_may_contain(key) {
            return Ok(None);
        }

        let Some(block_idx) = self.find_block_for_key(key) else {
            return Ok(None);
        };
        let content = Self::read_block_bytes(&self.mmap, &self.index[block_idx].handle)?;

        for cell in BlockCells::new(content) {
            let (k, v) = cell?;
            match k.cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(v.to_vec())),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Every `(key, value)` pair in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), SSTableError>> + '_ {
        self.blocks().flat_map(|block| match block {
            Ok((_, content)) => BlockCells::new(content)
                .map(|cell| cell.map(|(k, v)| (k.to_vec(), v.to_vec())))
                .collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })
    }

    /// Every key paired with the handle of the block that stores it, in
    /// ascending key order.
    ///
    /// This is what migration turns into learned-index locations.
    pub fn block_handles(
        &self,
    ) -> impl Iterator<Item = Result<(Vec<u8>, BlockHandle), SSTableError>> + '_ {
        self.blocks().flat_map(|block| match block {
            Ok((handle, content)) => BlockCells::new(content)
                .map(|cell| cell.map(|(k, _)| (k.to_vec(), handle)))
                .collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })
    }

    /// Handles of the data blocks in file order.
    #[cfg(test)]
    pub(crate) fn data_block_handles(&self) -> impl Iterator<Item = BlockHandle> + '_ {
        self.index.iter().map(|e| e.handle)
    }

    fn blocks(&self) -> impl Iterator<Item = Result<(BlockHandle, &[u8]), SSTableError>> + '_ {
        self.index.iter().map(|entry| {
            Self::read_block_bytes(&self.mmap, &entry.handle).map(|content| (entry.handle, content))
        })
    }

    /// Returns the verified content of the block named by `handle`.
    pub(crate) fn read_block_bytes<'m>(
        mmap: &'m Mmap,
        handle: &BlockHandle,
    ) -> Result<&'m [u8], SSTableError> {
        let start = usize::try_from(handle.offset)
            .map_err(|_| SSTableError::Internal("block offset exceeds addressable range".into()))?;
        let size = usize::try_from(handle.size)
            .map_err(|_| SSTableError::Internal("block size exceeds addressable range".into()))?;

        let end = start
            .checked_add(size)
            .filter(|end| *end <= mmap.len())
            .ok_or_else(|| SSTableError::Internal("Block out of range".into()))?;

        unframe_block(&mmap[start..end])
    }

    /// Locates the index entry whose block may contain `key`.
    ///
    /// Uses binary search over `separator_key`, the first key of each block.
    /// Keys below the first block's first key have no block.
    pub(crate) fn find_block_for_key(&self, key: &[u8]) -> Option<usize> {
        match self
            .index
            .binary_search_by(|entry| entry.separator_key.as_slice().cmp(key))
        {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }
}

impl std::fmt::Debug for SSTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTable")
            .field("id", &self.id)
            .field("file_size", &self.file_size())
            .field("record_count", &self.properties.record_count)
            .finish()
    }
}

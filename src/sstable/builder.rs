//! SSTable writer: builds a complete SSTable file from a sorted stream.
//!
//! The [`SstWriter`] accepts `(key, value)` pairs **sorted by key with no
//! duplicates** and writes header, data blocks, bloom filter, properties,
//! metaindex, index and footer.
//!
//! # Atomicity
//!
//! 1. Write everything to `path.tmp`.
//! 2. Flush and sync the file.
//! 3. Rename `path.tmp` → `path` atomically.
//!
//! A crash cannot produce a partially-written SSTable under its final name.

use std::{
    fs::{OpenOptions, rename},
    io::{BufWriter, Seek, Write},
    mem,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use tracing::trace;

use crate::encoding::{self, Encode};

use super::{
    BLOCK_CHECKSUM_SIZE, BLOCK_LEN_SIZE, BlockHandle, MetaIndex, SST_BLOOM_FILTER_FALSE_POSITIVE_RATE,
    SST_DATA_BLOCK_MAX_SIZE, SST_FOOTER_SIZE, SST_HDR_MAGIC, SST_HDR_VERSION, SSTableError,
    SSTableFooter, SSTableHeader, SSTableIndexEntry, SSTablePropertiesBlock, encode_cell,
};

// ------------------------------------------------------------------------------------------------
// BuildStats: accumulates metadata during SSTable construction
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct BuildStats {
    record_count: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
}

impl BuildStats {
    fn into_properties(self, data_block_count: usize) -> Result<SSTablePropertiesBlock, SSTableError> {
        let creation_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| SSTableError::Internal(format!("system clock before UNIX epoch: {e}")))?
            .as_nanos() as u64;
        Ok(SSTablePropertiesBlock {
            creation_timestamp,
            record_count: self.record_count,
            data_block_count: data_block_count as u64,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or_default(),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O helpers
// ------------------------------------------------------------------------------------------------

/// Writes a checksummed block: `[len_le (4 B)][data][crc32_le (4 B)]`.
///
/// Returns the handle of the framed block.
fn write_checksummed_block(
    writer: &mut (impl Write + Seek),
    data: &[u8],
) -> Result<BlockHandle, SSTableError> {
    let offset = writer.stream_position()?;
    let len = u32::try_from(data.len())
        .map_err(|_| SSTableError::Internal("block larger than u32::MAX".into()))?;

    let mut hasher = Crc32::new();
    hasher.update(data);
    let checksum = hasher.finalize();

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(data)?;
    writer.write_all(&checksum.to_le_bytes())?;

    Ok(BlockHandle {
        offset,
        size: (BLOCK_LEN_SIZE + data.len() + BLOCK_CHECKSUM_SIZE) as u64,
    })
}

/// Writes the SSTable header with its embedded CRC32.
fn write_header(writer: &mut impl Write) -> Result<(), SSTableError> {
    let mut header = SSTableHeader {
        magic: SST_HDR_MAGIC,
        version: SST_HDR_VERSION,
        header_crc: 0,
    };
    let mut hasher = Crc32::new();
    hasher.update(&encoding::encode_to_vec(&header)?);
    header.header_crc = hasher.finalize();

    writer.write_all(&encoding::encode_to_vec(&header)?)?;
    Ok(())
}

/// Writes the current data-block buffer and records its index entry.
fn flush_data_block(
    writer: &mut (impl Write + Seek),
    current_block: &mut Vec<u8>,
    block_first_key: &mut Option<Vec<u8>>,
    index_entries: &mut Vec<SSTableIndexEntry>,
) -> Result<(), SSTableError> {
    let data = mem::take(current_block);
    let handle = write_checksummed_block(writer, &data)?;

    let separator_key = block_first_key
        .take()
        .ok_or_else(|| SSTableError::Internal("data block without first key".into()))?;
    index_entries.push(SSTableIndexEntry {
        separator_key,
        handle,
    });

    Ok(())
}

/// Encodes entries into data blocks, populates the bloom filter and tracks
/// statistics.
fn write_data_blocks(
    writer: &mut (impl Write + Seek),
    entries: impl Iterator<Item = (Vec<u8>, Vec<u8>)>,
    bloom: &mut Bloom<Vec<u8>>,
) -> Result<(BuildStats, Vec<SSTableIndexEntry>), SSTableError> {
    let mut stats = BuildStats::default();
    let mut index_entries = Vec::new();
    let mut current_block = Vec::<u8>::with_capacity(SST_DATA_BLOCK_MAX_SIZE);
    let mut block_first_key: Option<Vec<u8>> = None;

    for (key, value) in entries {
        if let Some(prev) = &stats.max_key {
            if key <= *prev {
                return Err(SSTableError::Internal(
                    "SSTable input not strictly ascending".into(),
                ));
            }
        }

        stats.record_count += 1;
        if stats.min_key.is_none() {
            stats.min_key = Some(key.clone());
        }
        if block_first_key.is_none() {
            block_first_key = Some(key.clone());
        }
        bloom.set(&key);

        encode_cell(&key, &value, &mut current_block)?;
        stats.max_key = Some(key);

        if current_block.len() >= SST_DATA_BLOCK_MAX_SIZE {
            flush_data_block(
                writer,
                &mut current_block,
                &mut block_first_key,
                &mut index_entries,
            )?;
        }
    }

    if !current_block.is_empty() {
        flush_data_block(
            writer,
            &mut current_block,
            &mut block_first_key,
            &mut index_entries,
        )?;
    }

    Ok((stats, index_entries))
}

// ------------------------------------------------------------------------------------------------
// SstWriter: public entry point
// ------------------------------------------------------------------------------------------------

/// Builds a complete SSTable file on disk.
///
/// # Example
///
/// ```rust,ignore
/// let size = SstWriter::new(&path).build(pairs.into_iter(), pairs_len)?;
/// ```
pub struct SstWriter<P: AsRef<Path>> {
    path: P,
}

impl<P: AsRef<Path>> SstWriter<P> {
    /// Create a writer targeting the given output path.
    pub fn new(path: P) -> Self {
        Self { path }
    }

    /// Consumes a sorted stream and writes a complete SSTable.
    ///
    /// `expected_count` sizes the bloom filter. Returns the final file size.
    ///
    /// # Errors
    ///
    /// - [`SSTableError::Internal`] if the stream is empty or not strictly
    ///   ascending.
    /// - I/O errors from writing, syncing or renaming.
    pub fn build(
        self,
        entries: impl Iterator<Item = (Vec<u8>, Vec<u8>)>,
        expected_count: usize,
    ) -> Result<u64, SSTableError> {
        let mut entries = entries.peekable();
        if entries.peek().is_none() {
            return Err(SSTableError::Internal(
                "Empty iterator cannot build SSTable".into(),
            ));
        }

        let final_path = self.path.as_ref();
        let tmp_path = final_path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(&mut file);

        // 1. Header
        write_header(&mut writer)?;

        // 2. Data blocks
        let mut bloom = Bloom::new_for_fp_rate(
            expected_count.max(1),
            SST_BLOOM_FILTER_FALSE_POSITIVE_RATE,
        )
        .map_err(|e| SSTableError::Internal(e.to_string()))?;
        let (stats, index_entries) = write_data_blocks(&mut writer, entries, &mut bloom)?;

        // 3. Bloom filter block
        let bloom_handle = write_checksummed_block(&mut writer, bloom.as_slice())?;

        // 4. Properties block
        let record_count = stats.record_count;
        let properties = stats.into_properties(index_entries.len())?;
        let props_handle =
            write_checksummed_block(&mut writer, &encoding::encode_to_vec(&properties)?)?;

        // 5. Metaindex block
        let meta = MetaIndex {
            bloom: bloom_handle,
            properties: props_handle,
        };
        let meta_handle = write_checksummed_block(&mut writer, &encoding::encode_to_vec(&meta)?)?;

        // 6. Index block
        let mut index_bytes = Vec::new();
        encoding::encode_vec(&index_entries, &mut index_bytes)?;
        let index_handle = write_checksummed_block(&mut writer, &index_bytes)?;

        // 7. Footer
        let total_file_size = writer.stream_position()? + SST_FOOTER_SIZE as u64;
        let mut footer = SSTableFooter {
            metaindex: meta_handle,
            index: index_handle,
            total_file_size,
            footer_crc32: 0,
        };
        let mut hasher = Crc32::new();
        hasher.update(&encoding::encode_to_vec(&footer)?);
        footer.footer_crc32 = hasher.finalize();

        let mut footer_bytes = Vec::with_capacity(SST_FOOTER_SIZE);
        footer.encode_to(&mut footer_bytes)?;
        writer.write_all(&footer_bytes)?;

        writer.flush()?;
        drop(writer);
        file.sync_all()?;

        rename(&tmp_path, final_path)?;

        trace!(
            path = %final_path.display(),
            records = record_count,
            blocks = index_entries.len(),
            bytes = total_file_size,
            "sstable written"
        );
        Ok(total_file_size)
    }
}

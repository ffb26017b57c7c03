//! Key/location codec used between the LSM tier and the learned index.
//!
//! The learned index stores, for every migrated key, an 8-byte value that
//! points at the data block holding the key inside a detached SSTable.
//! That value is a single `u64` word:
//!
//! ```text
//!  63            46 45                          16 15            0
//! +----------------+------------------------------+---------------+
//! | file_id (18 b) |         offset (30 b)        |  size (16 b)  |
//! +----------------+------------------------------+---------------+
//! ```
//!
//! stored little-endian, like every other fixed-width field in the store.
//! `file_id` is the migration id of the ledger entry that owns the file.
//!
//! Keys are reduced to a numeric prefix with [`key_prefix`]: the first eight
//! bytes read big-endian and right-padded with zeros, so that numeric order
//! of prefixes follows lexicographic order of the keys. The same prefix
//! drives partition dispatch ([`dispatch`]).

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Field widths
// ------------------------------------------------------------------------------------------------

pub const FILE_ID_BITS: u32 = 18;
pub const OFFSET_BITS: u32 = 30;
pub const SIZE_BITS: u32 = 16;

const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;
const FILE_ID_MASK: u64 = (1 << FILE_ID_BITS) - 1;

const OFFSET_SHIFT: u32 = SIZE_BITS;
const FILE_ID_SHIFT: u32 = SIZE_BITS + OFFSET_BITS;

/// Width of an encoded location in bytes.
pub const LOCATION_SIZE: usize = 8;

/// An encoded location as stored in the learned index.
pub type EncodedLocation = [u8; LOCATION_SIZE];

// ------------------------------------------------------------------------------------------------
// Location
// ------------------------------------------------------------------------------------------------

/// Where a key's data block lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// Migration id of the owning ledger entry.
    pub file_id: u64,
    /// Byte offset of the block inside the file.
    pub offset: u64,
    /// Size of the block in bytes, framing included.
    pub size: u64,
}

impl Location {
    pub fn new(file_id: u64, offset: u64, size: u64) -> Self {
        Self {
            file_id,
            offset,
            size,
        }
    }

    /// Whether every field fits its bit width.
    ///
    /// [`encode_location`] masks silently; callers that cannot tolerate a
    /// corrupted field check this first.
    pub fn fits(&self) -> bool {
        self.file_id <= FILE_ID_MASK && self.offset <= OFFSET_MASK && self.size <= SIZE_MASK
    }
}

/// Packs a location into its 8-byte form.
///
/// Fields wider than their slot are truncated to the slot; neighbouring
/// fields are never disturbed.
pub fn encode_location(location: &Location) -> EncodedLocation {
    let word = ((location.file_id & FILE_ID_MASK) << FILE_ID_SHIFT)
        | ((location.offset & OFFSET_MASK) << OFFSET_SHIFT)
        | (location.size & SIZE_MASK);
    word.to_le_bytes()
}

/// Unpacks an 8-byte location.
pub fn decode_location(raw: EncodedLocation) -> Location {
    let word = u64::from_le_bytes(raw);
    Location {
        file_id: (word >> FILE_ID_SHIFT) & FILE_ID_MASK,
        offset: (word >> OFFSET_SHIFT) & OFFSET_MASK,
        size: word & SIZE_MASK,
    }
}

// ------------------------------------------------------------------------------------------------
// Key prefix and dispatch
// ------------------------------------------------------------------------------------------------

/// First eight bytes of `key` as a big-endian `u64`, zero-padded on the
/// right when the key is shorter.
pub fn key_prefix(key: &[u8]) -> u64 {
    let mut head = [0u8; 8];
    let n = key.len().min(8);
    head[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(head)
}

/// Partition owning `prefix` among `partitions` equal numeric ranges:
/// `floor(prefix / (2^64 / partitions))`.
///
/// Computed as the high word of `prefix * partitions`, which is always
/// below `partitions`.
pub fn dispatch(prefix: u64, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    ((u128::from(prefix) * u128::from(partitions)) >> 64) as u32
}

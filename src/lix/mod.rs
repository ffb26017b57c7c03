//! # Learned Index
//!
//! The read-optimized tier. It maps a 64-bit key prefix to an 8-byte encoded
//! [`Location`](crate::codec::Location) and nothing else; the values stay in
//! the migrated SSTables and are fetched through [`crate::coldpath`].
//!
//! The store talks to the index only through the [`LearnedIndex`] trait.
//! [`PiecewiseIndex`] is the implementation shipped with the crate: a sorted
//! array of keys approximated by piecewise-linear segments with a bounded
//! prediction error, persisted as a checksummed snapshot under `LIX/INDEX`.
//!
//! ## Key collisions
//!
//! Keys are prefixes, so two user keys sharing their first eight bytes map to
//! one index slot. Within a batch the first occurrence wins; across batches
//! the later batch overwrites.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


mod piecewise;
mod snapshot;

pub use piecewise::PiecewiseIndex;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;

use crate::codec::EncodedLocation;
use crate::encoding::EncodingError;
use thiserror::Error;

/// Snapshot file name inside the index directory.
pub const INDEX_FILENAME: &str = "INDEX";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by learned-index operations.
#[derive(Debug, Error)]
pub enum LixError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// `bulk_load` on an index that already holds keys.
    #[error("bulk load into a non-empty index ({0} keys)")]
    NotEmpty(usize),

    /// The persisted snapshot failed verification.
    #[error("corrupt index snapshot: {0}")]
    Corrupt(String),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Trait
// ------------------------------------------------------------------------------------------------

/// Point-lookup index from key prefix to encoded location.
///
/// Implementations are internally synchronized. Every successful
/// `put_batch` or `bulk_load` is durable when it returns.
pub trait LearnedIndex: Send + Sync {
    /// Location stored for `key`, if any.
    fn get(&self, key: u64) -> Result<Option<EncodedLocation>, LixError>;

    /// Upserts `pairs`.
    fn put_batch(&self, pairs: &[(u64, EncodedLocation)]) -> Result<(), LixError>;

    /// Initial load of an empty index.
    fn bulk_load(&self, pairs: &[(u64, EncodedLocation)]) -> Result<(), LixError>;

    /// Number of keys stored.
    fn len(&self) -> Result<usize, LixError>;

    fn is_empty(&self) -> Result<bool, LixError> {
        Ok(self.len()? == 0)
    }
}

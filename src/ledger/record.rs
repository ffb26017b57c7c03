//! Ledger entry types and their log wire format.
//!
//! Every field of a log record is a little-endian `u64`, the tag first:
//!
//! ```text
//! Insert  [0][migration_id][source_file_id][partition][smallest][largest][flag]   56 B
//! Modify  [1][migration_id][flag]                                                 24 B
//! Modify  [1][migration_id][source_file_id][flag]                                 32 B
//! Remove  [2][migration_id]                                                       16 B
//! ```
//!
//! Both `Modify` shapes are accepted on decode; which one was written is
//! told apart by the record length, so a buffer handed to
//! [`LedgerRecord::decode_from`] must hold exactly one record.

use std::fmt;

use crate::encoding::{Decode, Encode, EncodingError, decode_at};

const OP_INSERT: u64 = 0;
const OP_MODIFY: u64 = 1;
const OP_REMOVE: u64 = 2;

const WORD: usize = 8;
const MODIFY_SHORT_LEN: usize = 3 * WORD;
const MODIFY_LONG_LEN: usize = 4 * WORD;

// ------------------------------------------------------------------------------------------------
// Migration flag
// ------------------------------------------------------------------------------------------------

/// Lifecycle state of a migrated file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MigrationFlag {
    /// Served from its canonical file name through the learned index.
    Normal = 0,
    /// Key/location pairs are being pushed; the LSM tier still owns the file.
    Transferring = 1,
    /// Pushed; the file lives (or is about to live) under its holding name.
    Detaching = 2,
    /// Reserved for garbage collection.
    Gcing = 3,
}

impl MigrationFlag {
    pub fn from_u64(raw: u64) -> Result<Self, EncodingError> {
        match raw {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Transferring),
            2 => Ok(Self::Detaching),
            3 => Ok(Self::Gcing),
            tag => Err(EncodingError::InvalidTag {
                tag,
                type_name: "MigrationFlag",
            }),
        }
    }

    /// Whether a live update may move an entry from `self` to `next`.
    ///
    /// Replay applies whatever the log says; this only guards new writes.
    pub fn can_become(self, next: MigrationFlag) -> bool {
        use MigrationFlag::*;
        matches!(
            (self, next),
            (Transferring, Detaching) | (Detaching, Gcing) | (Detaching, Normal)
        ) || self == next
    }
}

impl fmt::Display for MigrationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Transferring => "transferring",
            Self::Detaching => "detaching",
            Self::Gcing => "gcing",
        };
        f.write_str(name)
    }
}

// ------------------------------------------------------------------------------------------------
// Migration record
// ------------------------------------------------------------------------------------------------

/// Per-file migration state, keyed by `migration_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Ledger key; also the file-id field of every location pointing into
    /// this file.
    pub migration_id: u64,
    /// LSM file id the data was written under.
    pub source_file_id: u64,
    pub partition: u32,
    /// Smallest key prefix in the file (informational).
    pub smallest_key: u64,
    /// Largest key prefix in the file (informational).
    pub largest_key: u64,
    pub flag: MigrationFlag,
}

// ------------------------------------------------------------------------------------------------
// Log record
// ------------------------------------------------------------------------------------------------

/// One ledger mutation as written to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRecord {
    Insert(MigrationRecord),
    Modify {
        migration_id: u64,
        flag: MigrationFlag,
        /// Written only when the source file id changes with the flag.
        source_file_id: Option<u64>,
    },
    Remove {
        migration_id: u64,
    },
}

impl Encode for LedgerRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            LedgerRecord::Insert(rec) => {
                OP_INSERT.encode_to(buf)?;
                rec.migration_id.encode_to(buf)?;
                rec.source_file_id.encode_to(buf)?;
                u64::from(rec.partition).encode_to(buf)?;
                rec.smallest_key.encode_to(buf)?;
                rec.largest_key.encode_to(buf)?;
                (rec.flag as u64).encode_to(buf)?;
            }
            LedgerRecord::Modify {
                migration_id,
                flag,
                source_file_id,
            } => {
                OP_MODIFY.encode_to(buf)?;
                migration_id.encode_to(buf)?;
                if let Some(src) = source_file_id {
                    src.encode_to(buf)?;
                }
                (*flag as u64).encode_to(buf)?;
            }
            LedgerRecord::Remove { migration_id } => {
                OP_REMOVE.encode_to(buf)?;
                migration_id.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for LedgerRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let op: u64 = decode_at(buf, &mut offset)?;
        let migration_id: u64 = decode_at(buf, &mut offset)?;

        let record = match op {
            OP_INSERT => {
                let source_file_id = decode_at(buf, &mut offset)?;
                let partition: u64 = decode_at(buf, &mut offset)?;
                let partition = u32::try_from(partition).map_err(|_| {
                    EncodingError::Custom(format!("partition {partition} out of range"))
                })?;
                let smallest_key = decode_at(buf, &mut offset)?;
                let largest_key = decode_at(buf, &mut offset)?;
                let flag = MigrationFlag::from_u64(decode_at(buf, &mut offset)?)?;
                LedgerRecord::Insert(MigrationRecord {
                    migration_id,
                    source_file_id,
                    partition,
                    smallest_key,
                    largest_key,
                    flag,
                })
            }
            OP_MODIFY => {
                let source_file_id = match buf.len() {
                    MODIFY_LONG_LEN => Some(decode_at::<u64>(buf, &mut offset)?),
                    MODIFY_SHORT_LEN => None,
                    other => {
                        return Err(EncodingError::Custom(format!(
                            "modify record of {other} bytes"
                        )));
                    }
                };
                let flag = MigrationFlag::from_u64(decode_at(buf, &mut offset)?)?;
                LedgerRecord::Modify {
                    migration_id,
                    flag,
                    source_file_id,
                }
            }
            OP_REMOVE => LedgerRecord::Remove { migration_id },
            tag => {
                return Err(EncodingError::InvalidTag {
                    tag,
                    type_name: "LedgerRecord",
                });
            }
        };
        Ok((record, offset))
    }
}

//! On-disk snapshot of the index.
//!
//! ```text
//! [magic "LIX0"][version u32][count u64]([key u64][location 8 B]) × count [crc32 u32]
//! ```
//!
//! All integers little-endian; the CRC32 covers every preceding byte.
//! Written to `INDEX.tmp`, synced, renamed over `INDEX`, then the directory
//! is synced.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::Path,
};

use crc32fast::Hasher as Crc32;
use tracing::{debug, info};

use super::{INDEX_FILENAME, LixError};
use crate::codec::{EncodedLocation, LOCATION_SIZE};
use crate::encoding::{Encode, decode_at};

const MAGIC: [u8; 4] = *b"LIX0";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 8;
const ENTRY_SIZE: usize = 8 + LOCATION_SIZE;
const CRC_SIZE: usize = 4;
const TMP_SUFFIX: &str = ".tmp";

pub(super) fn write(dir: &Path, keys: &[u64], values: &[EncodedLocation]) -> Result<(), LixError> {
    if keys.len() != values.len() {
        return Err(LixError::Internal("key/value length mismatch".into()));
    }

    let mut bytes = Vec::with_capacity(HEADER_SIZE + keys.len() * ENTRY_SIZE + CRC_SIZE);
    MAGIC.encode_to(&mut bytes)?;
    VERSION.encode_to(&mut bytes)?;
    (keys.len() as u64).encode_to(&mut bytes)?;
    for (key, value) in keys.iter().zip(values) {
        key.encode_to(&mut bytes)?;
        value.encode_to(&mut bytes)?;
    }
    let mut hasher = Crc32::new();
    hasher.update(&bytes);
    hasher.finalize().encode_to(&mut bytes)?;

    let tmp_path = dir.join(format!("{INDEX_FILENAME}{TMP_SUFFIX}"));
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }

    let final_path = dir.join(INDEX_FILENAME);
    fs::rename(&tmp_path, &final_path)?;
    File::open(dir)?.sync_all()?;

    debug!(path = %final_path.display(), keys = keys.len(), bytes = bytes.len(), "index snapshot written");
    Ok(())
}

pub(super) fn read(dir: &Path) -> Result<Option<(Vec<u64>, Vec<EncodedLocation>)>, LixError> {
    let path = dir.join(INDEX_FILENAME);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if bytes.len() < HEADER_SIZE + CRC_SIZE {
        return Err(LixError::Corrupt(format!("{} bytes is too short", bytes.len())));
    }

    let (body, crc_bytes) = bytes.split_at(bytes.len() - CRC_SIZE);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut hasher = Crc32::new();
    hasher.update(body);
    if hasher.finalize() != stored {
        return Err(LixError::Corrupt("checksum mismatch".into()));
    }

    let mut off = 0;
    let magic: [u8; 4] = decode_at(body, &mut off)?;
    if magic != MAGIC {
        return Err(LixError::Corrupt("bad magic".into()));
    }
    let version: u32 = decode_at(body, &mut off)?;
    if version != VERSION {
        return Err(LixError::Corrupt(format!("unsupported version {version}")));
    }
    let count: u64 = decode_at(body, &mut off)?;
    let count = usize::try_from(count)
        .ok()
        .filter(|n| n.checked_mul(ENTRY_SIZE) == Some(body.len() - HEADER_SIZE))
        .ok_or_else(|| LixError::Corrupt(format!("count {count} does not match file size")))?;

    let mut keys = Vec::with_capacity(count);
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let key: u64 = decode_at(body, &mut off)?;
        if keys.last().is_some_and(|prev| *prev >= key) {
            return Err(LixError::Corrupt("keys not strictly ascending".into()));
        }
        keys.push(key);
        values.push(decode_at::<EncodedLocation>(body, &mut off)?);
    }

    info!(path = %path.display(), keys = count, "index snapshot loaded");
    Ok(Some((keys, values)))
}

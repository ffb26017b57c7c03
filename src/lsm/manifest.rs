//! Forest manifest: which SSTables belong to which partition and level.
//!
//! The manifest is a log of [`ManifestEvent`]s in the crate's WAL format.
//! Opening a forest replays it into a [`ForestLayout`] and then replaces the
//! file with a single `Snapshot` event (written to `MANIFEST.log.tmp`,
//! synced, renamed over `MANIFEST.log`), so replay cost stays bounded.

use std::{
    collections::BTreeSet,
    fs,
    path::Path,
};

use tracing::{debug, info};

use super::{LsmError, fsync_dir};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::wal::{DropCounter, LogReader, LogWriter};

pub(crate) const MANIFEST_FILENAME: &str = "MANIFEST.log";
const TMP_EXTENSION: &str = "log.tmp";

// ------------------------------------------------------------------------------------------------
// Layout
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PartitionLayout {
    /// Flushed files, oldest first.
    pub level0: Vec<u64>,
    /// Compacted files, ascending id.
    pub bottom: Vec<u64>,
}

/// Durable shape of the forest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ForestLayout {
    pub next_file_id: u64,
    pub partitions: Vec<PartitionLayout>,
    /// Files that left the tree through detach. Their ids are never reused
    /// and their canonical names are never garbage-collected.
    pub detached: BTreeSet<u64>,
}

impl ForestLayout {
    fn partition_mut(&mut self, partition: u32) -> &mut PartitionLayout {
        let idx = partition as usize;
        if self.partitions.len() <= idx {
            self.partitions.resize_with(idx + 1, PartitionLayout::default);
        }
        &mut self.partitions[idx]
    }

    fn observe_id(&mut self, file_id: u64) {
        self.next_file_id = self.next_file_id.max(file_id + 1);
    }

    pub fn apply(&mut self, event: &ManifestEvent) {
        match event {
            ManifestEvent::Flush { partition, file_id } => {
                self.partition_mut(*partition).level0.push(*file_id);
                self.observe_id(*file_id);
            }
            ManifestEvent::Compaction {
                partition,
                added,
                removed,
            } => {
                let layout = self.partition_mut(*partition);
                layout.level0.retain(|id| !removed.contains(id));
                layout.bottom.retain(|id| !removed.contains(id));
                layout.bottom.extend(added.iter().copied());
                layout.bottom.sort_unstable();
                layout.bottom.dedup();
                for id in added {
                    self.observe_id(*id);
                }
            }
            ManifestEvent::Detach { file_id } => {
                for layout in &mut self.partitions {
                    layout.level0.retain(|id| id != file_id);
                    layout.bottom.retain(|id| id != file_id);
                }
                self.detached.insert(*file_id);
                self.observe_id(*file_id);
            }
            ManifestEvent::Snapshot(layout) => {
                *self = layout.clone();
            }
        }
    }

    /// Every file id currently in the tree, with its partition.
    pub fn live_files(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.partitions.iter().enumerate().flat_map(|(p, layout)| {
            layout
                .level0
                .iter()
                .chain(layout.bottom.iter())
                .map(move |id| (p as u32, *id))
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Events
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ManifestEvent {
    Flush {
        partition: u32,
        file_id: u64,
    },
    Compaction {
        partition: u32,
        added: Vec<u64>,
        removed: Vec<u64>,
    },
    Detach {
        file_id: u64,
    },
    Snapshot(ForestLayout),
}

impl Encode for PartitionLayout {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.level0.encode_to(buf)?;
        self.bottom.encode_to(buf)
    }
}

impl Decode for PartitionLayout {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let level0 = encoding::decode_at::<Vec<u64>>(buf, &mut offset)?;
        let bottom = encoding::decode_at::<Vec<u64>>(buf, &mut offset)?;
        Ok((Self { level0, bottom }, offset))
    }
}

impl Encode for ForestLayout {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.next_file_id.encode_to(buf)?;
        encoding::encode_vec(&self.partitions, buf)?;
        let detached: Vec<u64> = self.detached.iter().copied().collect();
        detached.encode_to(buf)
    }
}

impl Decode for ForestLayout {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let next_file_id = encoding::decode_at::<u64>(buf, &mut offset)?;
        let (partitions, n) = encoding::decode_vec::<PartitionLayout>(&buf[offset..])?;
        offset += n;
        let detached = encoding::decode_at::<Vec<u64>>(buf, &mut offset)?;
        Ok((
            Self {
                next_file_id,
                partitions,
                detached: detached.into_iter().collect(),
            },
            offset,
        ))
    }
}

impl Encode for ManifestEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestEvent::Flush { partition, file_id } => {
                0u32.encode_to(buf)?;
                partition.encode_to(buf)?;
                file_id.encode_to(buf)?;
            }
            ManifestEvent::Compaction {
                partition,
                added,
                removed,
            } => {
                1u32.encode_to(buf)?;
                partition.encode_to(buf)?;
                added.encode_to(buf)?;
                removed.encode_to(buf)?;
            }
            ManifestEvent::Detach { file_id } => {
                2u32.encode_to(buf)?;
                file_id.encode_to(buf)?;
            }
            ManifestEvent::Snapshot(layout) => {
                3u32.encode_to(buf)?;
                layout.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for ManifestEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let tag = encoding::decode_at::<u32>(buf, &mut offset)?;
        let event = match tag {
            0 => ManifestEvent::Flush {
                partition: encoding::decode_at(buf, &mut offset)?,
                file_id: encoding::decode_at(buf, &mut offset)?,
            },
            1 => ManifestEvent::Compaction {
                partition: encoding::decode_at(buf, &mut offset)?,
                added: encoding::decode_at(buf, &mut offset)?,
                removed: encoding::decode_at(buf, &mut offset)?,
            },
            2 => ManifestEvent::Detach {
                file_id: encoding::decode_at(buf, &mut offset)?,
            },
            3 => ManifestEvent::Snapshot(encoding::decode_at(buf, &mut offset)?),
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u64::from(other),
                    type_name: "ManifestEvent",
                });
            }
        };
        Ok((event, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest log
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ForestManifest {
    log: LogWriter,
}

impl ForestManifest {
    /// Rebuilds the layout from `dir/MANIFEST.log`. A missing file yields an
    /// empty layout.
    pub fn replay(dir: &Path, verify_checksums: bool) -> Result<ForestLayout, LsmError> {
        let path = dir.join(MANIFEST_FILENAME);
        let mut layout = ForestLayout::default();
        if !path.exists() {
            debug!(path = %path.display(), "no forest manifest");
            return Ok(layout);
        }

        let mut reader = LogReader::open(&path, DropCounter::default(), verify_checksums, 0)?;
        let mut events = 0usize;
        while let Some(event) = reader.read_decoded::<ManifestEvent>()? {
            layout.apply(&event);
            events += 1;
        }
        info!(
            path = %path.display(),
            events,
            dropped_bytes = reader.reporter().bytes,
            next_file_id = layout.next_file_id,
            "forest manifest replayed"
        );
        Ok(layout)
    }

    /// Replaces the manifest with a snapshot of `layout` and opens it for
    /// appending.
    pub fn checkpoint(dir: &Path, layout: &ForestLayout) -> Result<Self, LsmError> {
        let path = dir.join(MANIFEST_FILENAME);
        let tmp_path = path.with_extension(TMP_EXTENSION);

        let mut tmp = LogWriter::create(&tmp_path)?;
        tmp.add_encoded(&ManifestEvent::Snapshot(layout.clone()))?;
        tmp.sync()?;
        drop(tmp);

        fs::rename(&tmp_path, &path)?;
        fsync_dir(dir)?;

        let log = LogWriter::open_append(&path)?;
        Ok(Self { log })
    }

    /// Durably appends one event.
    pub fn record(&mut self, event: &ManifestEvent) -> Result<(), LsmError> {
        self.log.add_encoded(event)?;
        self.log.sync()?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), LsmError> {
        self.log.sync()?;
        Ok(())
    }
}

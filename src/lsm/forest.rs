//! Partitioned LSM forest.
//!
//! Each partition owns a memtable, a level-0 list and a bottom-level list
//! behind its own `RwLock`. The forest shares one manifest, one file-id
//! counter and one background compaction thread (`lixstore-compaction`)
//! across partitions.
//!
//! ## Lock order
//!
//! `compaction_lock` → partition lock → manifest lock. The compaction lock is
//! held for the whole compaction *and* the listener callback, so a migration
//! triggered by one compaction finishes before the next compaction starts.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs, io, mem,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam::channel::{Sender, unbounded};
use tracing::{debug, error, info, trace, warn};

use super::{
    CANONICAL_EXTENSION, ColdFile, ColdFileSelection, CompactionListener, LsmEngine, LsmError,
    canonical_file_name, fsync_dir, holding_file_name,
    manifest::{ForestLayout, ForestManifest, ManifestEvent},
    memtable::Memtable,
};
use crate::sstable::{CELL_HEADER_SIZE, SSTable, SstWriter};

const TMP_EXTENSION: &str = "tmp";

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tuning knobs of a [`Forest`].
#[derive(Debug, Clone)]
pub struct ForestConfig {
    /// Number of partitions. Fixed for the lifetime of the directory.
    pub partitions: u32,

    /// Memtable size (bytes) that triggers a flush to level 0.
    pub write_buffer_size: usize,

    /// Level-0 file count that schedules a background compaction.
    pub l0_compaction_trigger: usize,

    /// Compaction output files are cut once they hold this many bytes of
    /// cells.
    pub target_file_size: u64,

    /// Verify CRCs while replaying memtable logs and the manifest.
    pub verify_checksums: bool,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            write_buffer_size: 4 * 1024 * 1024,
            l0_compaction_trigger: 4,
            target_file_size: 2 * 1024 * 1024,
            verify_checksums: true,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Partition state
// ------------------------------------------------------------------------------------------------

struct Partition {
    memtable: Memtable,
    /// Oldest first.
    level0: Vec<Arc<SSTable>>,
    /// Ascending file id.
    bottom: Vec<Arc<SSTable>>,
    /// Reserved file id → migration id.
    reserved: HashMap<u64, u64>,
}

impl Partition {
    fn find(&self, file_id: u64) -> Option<&Arc<SSTable>> {
        self.level0
            .iter()
            .chain(self.bottom.iter())
            .find(|t| t.id == file_id)
    }

    fn unreserved_bottom(&self) -> impl Iterator<Item = &Arc<SSTable>> + '_ {
        self.bottom
            .iter()
            .filter(|t| !self.reserved.contains_key(&t.id))
    }
}

struct ForestInner {
    dir: PathBuf,
    config: ForestConfig,
    partitions: Vec<RwLock<Partition>>,
    manifest: Mutex<ForestManifest>,
    next_file_id: AtomicU64,
    compaction_lock: Mutex<()>,
    listener: RwLock<Option<Weak<dyn CompactionListener>>>,
}

struct CompactionWorker {
    sender: Sender<u32>,
    handle: JoinHandle<()>,
}

// ------------------------------------------------------------------------------------------------
// Forest
// ------------------------------------------------------------------------------------------------

/// The LSM engine shipped with the crate.
///
/// `Forest` is `Send + Sync`; share it behind an `Arc`.
pub struct Forest {
    inner: Arc<ForestInner>,
    worker: Mutex<Option<CompactionWorker>>,
    closed: AtomicBool,
}

impl Forest {
    /// Opens (or creates) the forest stored in `dir`.
    ///
    /// Replays the manifest and every memtable log, drops leftover temporary
    /// files and SSTables no longer referenced, checkpoints the manifest and
    /// starts the compaction thread.
    pub fn open(dir: impl AsRef<Path>, config: ForestConfig) -> Result<Self, LsmError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        if config.partitions == 0 {
            return Err(LsmError::Internal("forest needs at least one partition".into()));
        }

        let mut layout = ForestManifest::replay(&dir, config.verify_checksums)?;
        if !layout.partitions.is_empty() && layout.partitions.len() != config.partitions as usize {
            return Err(LsmError::Internal(format!(
                "manifest describes {} partitions, configured {}",
                layout.partitions.len(),
                config.partitions
            )));
        }
        layout
            .partitions
            .resize_with(config.partitions as usize, Default::default);

        let tables = load_tables(&dir, &mut layout)?;
        remove_orphans(&dir, &layout)?;

        let mut partitions = Vec::with_capacity(config.partitions as usize);
        for (p, (level0, bottom)) in tables.into_iter().enumerate() {
            let memtable = Memtable::open(
                dir.join(format!("partition-{p}.log")),
                config.verify_checksums,
            )?;
            partitions.push(RwLock::new(Partition {
                memtable,
                level0,
                bottom,
                reserved: HashMap::new(),
            }));
        }

        let manifest = ForestManifest::checkpoint(&dir, &layout)?;

        info!(
            dir = %dir.display(),
            partitions = config.partitions,
            next_file_id = layout.next_file_id,
            detached = layout.detached.len(),
            "forest opened"
        );

        let inner = Arc::new(ForestInner {
            dir,
            next_file_id: AtomicU64::new(layout.next_file_id.max(1)),
            config,
            partitions,
            manifest: Mutex::new(manifest),
            compaction_lock: Mutex::new(()),
            listener: RwLock::new(None),
        });

        let worker = spawn_worker(Arc::clone(&inner))?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn partitions(&self) -> u32 {
        self.inner.config.partitions
    }

    /// Ids of the level-0 files of `partition`, oldest first.
    pub fn level0_files(&self, partition: u32) -> Result<Vec<u64>, LsmError> {
        let part = self.inner.read_partition(partition)?;
        Ok(part.level0.iter().map(|t| t.id).collect())
    }

    /// Ids of the bottom-level files of `partition`, ascending.
    pub fn bottom_files(&self, partition: u32) -> Result<Vec<u64>, LsmError> {
        let part = self.inner.read_partition(partition)?;
        Ok(part.bottom.iter().map(|t| t.id).collect())
    }

    fn check_open(&self) -> Result<(), LsmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LsmError::Closed);
        }
        Ok(())
    }

    fn schedule_compaction(&self, partition: u32) {
        let Ok(guard) = self.worker.lock() else {
            error!("compaction worker mutex poisoned");
            return;
        };
        if let Some(worker) = guard.as_ref()
            && worker.sender.send(partition).is_err()
        {
            warn!(partition, "compaction worker gone, request dropped");
        }
    }

    /// Stops the compaction thread after it drains queued requests.
    fn shutdown_worker(&self) {
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                error!("compaction worker mutex poisoned during shutdown");
                return;
            }
        };
        let Some(CompactionWorker { sender, handle }) = worker else {
            return;
        };
        drop(sender);
        // The last handle can be dropped from inside a listener callback.
        if handle.thread().id() == thread::current().id() {
            debug!("forest closed from its compaction thread, not joining");
            return;
        }
        if handle.join().is_err() {
            error!("compaction thread panicked");
        }
    }
}

impl Drop for Forest {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "forest close on drop failed");
        }
    }
}

impl std::fmt::Debug for Forest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forest")
            .field("dir", &self.inner.dir)
            .field("partitions", &self.inner.config.partitions)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LsmEngine for Forest {
    fn put(&self, partition: u32, key: &[u8], value: &[u8]) -> Result<(), LsmError> {
        self.check_open()?;
        let level0_len = {
            let mut part = self.inner.write_partition(partition)?;
            part.memtable.put(key, value)?;
            if part.memtable.approximate_size() < self.inner.config.write_buffer_size {
                return Ok(());
            }
            self.inner.flush_locked(partition, &mut part)?;
            part.level0.len()
        };
        if level0_len >= self.inner.config.l0_compaction_trigger {
            self.schedule_compaction(partition);
        }
        Ok(())
    }

    fn get(&self, partition: u32, key: &[u8]) -> Result<Option<Vec<u8>>, LsmError> {
        self.check_open()?;
        let part = self.inner.read_partition(partition)?;

        if let Some(value) = part.memtable.get(key) {
            return Ok(Some(value.to_vec()));
        }
        for table in part.level0.iter().rev().chain(part.bottom.iter().rev()) {
            if let Some(value) = table.get(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn select_cold_file(
        &self,
        threshold: u64,
        partition: u32,
        migration_id: u64,
    ) -> Result<ColdFileSelection, LsmError> {
        self.check_open()?;
        let mut part = self.inner.write_partition(partition)?;

        let total_size: u64 = part.unreserved_bottom().map(|t| t.file_size()).sum();
        if total_size <= threshold {
            return Ok(ColdFileSelection {
                total_size,
                file: None,
            });
        }

        let Some(coldest) = part.unreserved_bottom().next().cloned() else {
            return Ok(ColdFileSelection {
                total_size,
                file: None,
            });
        };
        part.reserved.insert(coldest.id, migration_id);
        debug!(
            partition,
            file_id = coldest.id,
            migration_id,
            total_size,
            threshold,
            "cold file reserved"
        );

        Ok(ColdFileSelection {
            total_size,
            file: Some(self.inner.cold_file(partition, coldest)),
        })
    }

    fn reserve_file(
        &self,
        partition: u32,
        file_id: u64,
        migration_id: u64,
    ) -> Result<Option<ColdFile>, LsmError> {
        self.check_open()?;
        let mut part = self.inner.write_partition(partition)?;

        let Some(table) = part.find(file_id).cloned() else {
            return Ok(None);
        };
        if let Some(owner) = part.reserved.get(&file_id).copied()
            && owner != migration_id
        {
            return Err(LsmError::Internal(format!(
                "file {file_id} already reserved by migration {owner}"
            )));
        }
        part.reserved.insert(file_id, migration_id);
        Ok(Some(self.inner.cold_file(partition, table)))
    }

    fn release(&self, partition: u32, file_id: u64) -> Result<(), LsmError> {
        let mut part = self.inner.write_partition(partition)?;
        if part.reserved.remove(&file_id).is_some() {
            debug!(partition, file_id, "reservation released");
        }
        Ok(())
    }

    fn detach(&self, partition: u32, file_id: u64, migration_id: u64) -> Result<(), LsmError> {
        self.check_open()?;
        self.inner.detach(partition, file_id, migration_id)
    }

    fn canonical_path(&self, file_id: u64) -> PathBuf {
        self.inner.canonical_path(file_id)
    }

    fn holding_path(&self, migration_id: u64) -> PathBuf {
        self.inner.dir.join(holding_file_name(migration_id))
    }

    fn set_listener(&self, listener: Weak<dyn CompactionListener>) {
        match self.inner.listener.write() {
            Ok(mut slot) => *slot = Some(listener),
            Err(_) => error!("listener RwLock poisoned"),
        }
    }

    fn flush(&self) -> Result<usize, LsmError> {
        self.check_open()?;
        let mut flushed = 0;
        for p in 0..self.inner.config.partitions {
            let mut part = self.inner.write_partition(p)?;
            if self.inner.flush_locked(p, &mut part)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    fn compact(&self, partition: u32) -> Result<bool, LsmError> {
        self.check_open()?;
        self.inner.compact_partition(partition)
    }

    /// Stops the compaction thread and syncs every log. Idempotent.
    fn close(&self) -> Result<(), LsmError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown_worker();

        for p in 0..self.inner.config.partitions {
            self.inner.write_partition(p)?.memtable.sync()?;
        }
        self.inner.manifest()?.sync()?;

        info!(dir = %self.inner.dir.display(), "forest closed");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Inner operations
// ------------------------------------------------------------------------------------------------

impl ForestInner {
    fn read_partition(&self, partition: u32) -> Result<RwLockReadGuard<'_, Partition>, LsmError> {
        self.partitions
            .get(partition as usize)
            .ok_or(LsmError::UnknownPartition(partition))?
            .read()
            .map_err(|_| {
                error!(partition, "partition RwLock poisoned");
                LsmError::Internal("RwLock poisoned".into())
            })
    }

    fn write_partition(&self, partition: u32) -> Result<RwLockWriteGuard<'_, Partition>, LsmError> {
        self.partitions
            .get(partition as usize)
            .ok_or(LsmError::UnknownPartition(partition))?
            .write()
            .map_err(|_| {
                error!(partition, "partition RwLock poisoned");
                LsmError::Internal("RwLock poisoned".into())
            })
    }

    fn manifest(&self) -> Result<MutexGuard<'_, ForestManifest>, LsmError> {
        self.manifest.lock().map_err(|_| {
            error!("manifest mutex poisoned");
            LsmError::Internal("Mutex poisoned".into())
        })
    }

    fn canonical_path(&self, file_id: u64) -> PathBuf {
        self.dir.join(canonical_file_name(file_id))
    }

    fn cold_file(&self, partition: u32, table: Arc<SSTable>) -> ColdFile {
        ColdFile {
            partition,
            file_id: table.id,
            path: self.canonical_path(table.id),
            size: table.file_size(),
            table,
        }
    }

    /// Writes a sorted run to a fresh file id and opens it.
    fn write_table(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Arc<SSTable>, LsmError> {
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let path = self.canonical_path(file_id);
        let count = entries.len();
        SstWriter::new(&path).build(entries.into_iter(), count)?;

        let mut table = SSTable::open(&path)?;
        table.id = file_id;
        Ok(Arc::new(table))
    }

    /// Turns the memtable of `partition` into a level-0 file. Returns `false`
    /// when the memtable was empty.
    fn flush_locked(&self, partition: u32, part: &mut Partition) -> Result<bool, LsmError> {
        if part.memtable.is_empty() {
            return Ok(false);
        }
        let records = part.memtable.len();
        let table = self.write_table(part.memtable.sorted_entries())?;

        self.manifest()?.record(&ManifestEvent::Flush {
            partition,
            file_id: table.id,
        })?;
        debug!(
            partition,
            file_id = table.id,
            records,
            bytes = table.file_size(),
            "memtable flushed"
        );
        part.level0.push(table);
        part.memtable.reset()?;
        Ok(true)
    }

    /// Runs one compaction of `partition` and notifies the listener, both
    /// under the compaction lock.
    fn compact_partition(&self, partition: u32) -> Result<bool, LsmError> {
        let _guard = self.compaction_lock.lock().map_err(|_| {
            error!("compaction mutex poisoned");
            LsmError::Internal("Mutex poisoned".into())
        })?;

        let compacted = self.run_compaction(partition)?;
        if compacted {
            self.notify(partition, true);
        }
        Ok(compacted)
    }

    /// Merges every level-0 file with the unreserved bottom files whose key
    /// range overlaps them, writing the result into the bottom level.
    fn run_compaction(&self, partition: u32) -> Result<bool, LsmError> {
        let (level0, overlapping) = {
            let part = self.read_partition(partition)?;
            if part.level0.is_empty() {
                return Ok(false);
            }
            let level0 = part.level0.clone();
            let lo = level0.iter().map(|t| t.min_key()).min().unwrap_or_default();
            let hi = level0.iter().map(|t| t.max_key()).max().unwrap_or_default();
            let overlapping: Vec<Arc<SSTable>> = part
                .unreserved_bottom()
                .filter(|t| t.max_key() >= lo && t.min_key() <= hi)
                .cloned()
                .collect();
            (level0, overlapping)
        };

        // Bottom files first, then level 0 oldest to newest: later inserts win.
        let mut merged = BTreeMap::new();
        for table in overlapping.iter().chain(level0.iter()) {
            for entry in table.iter() {
                let (key, value) = entry?;
                merged.insert(key, value);
            }
        }

        let mut outputs = Vec::new();
        let mut run = Vec::new();
        let mut run_size = 0u64;
        for (key, value) in merged {
            run_size += (key.len() + value.len() + CELL_HEADER_SIZE) as u64;
            run.push((key, value));
            if run_size >= self.config.target_file_size {
                outputs.push(self.write_table(mem::take(&mut run))?);
                run_size = 0;
            }
        }
        if !run.is_empty() {
            outputs.push(self.write_table(run)?);
        }

        let removed: Vec<u64> = overlapping
            .iter()
            .chain(level0.iter())
            .map(|t| t.id)
            .collect();
        let added: Vec<u64> = outputs.iter().map(|t| t.id).collect();

        {
            let mut part = self.write_partition(partition)?;
            if removed.iter().any(|id| part.reserved.contains_key(id)) {
                warn!(partition, "compaction input reserved meanwhile, discarding output");
                drop(part);
                for id in &added {
                    remove_file_if_exists(&self.canonical_path(*id));
                }
                return Ok(false);
            }

            self.manifest()?.record(&ManifestEvent::Compaction {
                partition,
                added: added.clone(),
                removed: removed.clone(),
            })?;

            let gone: HashSet<u64> = removed.iter().copied().collect();
            part.level0.retain(|t| !gone.contains(&t.id));
            part.bottom.retain(|t| !gone.contains(&t.id));
            part.bottom.extend(outputs);
            part.bottom.sort_by_key(|t| t.id);
        }

        for id in &removed {
            remove_file_if_exists(&self.canonical_path(*id));
        }

        info!(
            partition,
            inputs = removed.len(),
            outputs = added.len(),
            "compaction finished"
        );
        Ok(true)
    }

    fn notify(&self, partition: u32, reached_bottom: bool) {
        let listener = match self.listener.read() {
            Ok(slot) => slot.as_ref().and_then(Weak::upgrade),
            Err(_) => {
                error!("listener RwLock poisoned");
                return;
            }
        };
        if let Some(listener) = listener {
            listener.on_compaction_completed(partition, reached_bottom);
        }
    }

    fn detach(&self, partition: u32, file_id: u64, migration_id: u64) -> Result<(), LsmError> {
        let mut part = self.write_partition(partition)?;

        let live = part.find(file_id).is_some();
        if live {
            self.manifest()?.record(&ManifestEvent::Detach { file_id })?;
            part.level0.retain(|t| t.id != file_id);
            part.bottom.retain(|t| t.id != file_id);
            part.reserved.remove(&file_id);
        }

        let canonical = self.canonical_path(file_id);
        let holding = self.dir.join(holding_file_name(migration_id));
        if canonical.exists() && !holding.exists() {
            fs::rename(&canonical, &holding)?;
            fsync_dir(&self.dir)?;
            info!(
                partition,
                file_id,
                migration_id,
                holding = %holding.display(),
                "file detached"
            );
        } else if !live {
            debug!(partition, file_id, migration_id, "file already detached");
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Open helpers
// ------------------------------------------------------------------------------------------------

type PartitionTables = (Vec<Arc<SSTable>>, Vec<Arc<SSTable>>);

/// Opens every live file of `layout`. Files that are gone from disk are
/// moved to the detached set.
fn load_tables(dir: &Path, layout: &mut ForestLayout) -> Result<Vec<PartitionTables>, LsmError> {
    let mut missing = Vec::new();
    let mut tables = Vec::with_capacity(layout.partitions.len());

    for (p, files) in layout.partitions.iter().enumerate() {
        let mut open = |ids: &[u64]| -> Result<Vec<Arc<SSTable>>, LsmError> {
            let mut out = Vec::with_capacity(ids.len());
            for &id in ids {
                let path = dir.join(canonical_file_name(id));
                if !path.exists() {
                    warn!(partition = p, file_id = id, "live file missing, treating as detached");
                    missing.push(id);
                    continue;
                }
                let mut table = SSTable::open(&path)?;
                table.id = id;
                out.push(Arc::new(table));
            }
            Ok(out)
        };
        let level0 = open(&files.level0)?;
        let bottom = open(&files.bottom)?;
        tables.push((level0, bottom));
    }

    for id in missing {
        layout.apply(&ManifestEvent::Detach { file_id: id });
    }
    Ok(tables)
}

/// Deletes temporary files and canonical SSTables the layout does not know.
fn remove_orphans(dir: &Path, layout: &ForestLayout) -> Result<(), LsmError> {
    let live: HashSet<u64> = layout.live_files().map(|(_, id)| id).collect();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        match ext {
            TMP_EXTENSION => {
                trace!(path = %path.display(), "removing temporary file");
                remove_file_if_exists(&path);
            }
            CANONICAL_EXTENSION => {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                    && !live.contains(&id)
                    && !layout.detached.contains(&id)
                {
                    info!(path = %path.display(), "removing orphan sstable");
                    remove_file_if_exists(&path);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn remove_file_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

fn spawn_worker(inner: Arc<ForestInner>) -> Result<CompactionWorker, LsmError> {
    let (sender, receiver) = unbounded::<u32>();
    let handle = thread::Builder::new()
        .name("lixstore-compaction".into())
        .spawn(move || {
            for partition in receiver {
                match inner.compact_partition(partition) {
                    Ok(true) => {}
                    Ok(false) => trace!(partition, "nothing to compact"),
                    Err(e) => error!(partition, error = %e, "background compaction failed"),
                }
            }
        })?;
    Ok(CompactionWorker { sender, handle })
}

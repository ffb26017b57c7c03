//! Piecewise-linear learned index.
//!
//! Keys live in one sorted array. A list of segments approximates the
//! key → array-position function: inside a segment the position of `key` is
//! predicted as `start + slope * (key - first_key)` and is guaranteed to be
//! within `epsilon` slots of the truth. Segments are fitted greedily with a
//! shrinking cone over the sorted keys.
//!
//! Updates rebuild the array and the model; they are rare (one per
//! migrated file) and reads dominate.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, error, info};

use super::{LearnedIndex, LixError, snapshot};
use crate::codec::EncodedLocation;

// ------------------------------------------------------------------------------------------------
// Model
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Segment {
    first_key: u64,
    /// Array position of `first_key`.
    start: usize,
    /// One past the last position covered.
    end: usize,
    slope: f64,
}

impl Segment {
    fn predict(&self, key: u64) -> usize {
        let dx = key.saturating_sub(self.first_key) as f64;
        let pos = self.start as f64 + self.slope * dx;
        (pos.max(0.0) as usize).clamp(self.start, self.end.saturating_sub(1))
    }
}

/// Fits segments so that every key's predicted position is within
/// `epsilon` of its real one.
fn fit_segments(keys: &[u64], epsilon: usize) -> Vec<Segment> {
    let eps = epsilon as f64;
    let mut segments = Vec::new();
    let mut start = 0;

    while start < keys.len() {
        let first_key = keys[start];
        let mut lo = f64::NEG_INFINITY;
        let mut hi = f64::INFINITY;
        let mut end = start + 1;

        while end < keys.len() {
            let dx = (keys[end] - first_key) as f64;
            let dy = (end - start) as f64;
            let new_lo = lo.max((dy - eps) / dx);
            let new_hi = hi.min((dy + eps) / dx);
            if new_lo > new_hi {
                break;
            }
            lo = new_lo;
            hi = new_hi;
            end += 1;
        }

        let slope = match (lo.is_finite(), hi.is_finite()) {
            (true, true) => (lo + hi) / 2.0,
            (true, false) => lo.max(0.0),
            (false, true) => hi.max(0.0),
            (false, false) => 0.0,
        };
        segments.push(Segment {
            first_key,
            start,
            end,
            slope: slope.max(0.0),
        });
        start = end;
    }

    segments
}

#[derive(Debug, Default)]
struct IndexState {
    keys: Vec<u64>,
    values: Vec<EncodedLocation>,
    segments: Vec<Segment>,
}

impl IndexState {
    fn from_sorted(keys: Vec<u64>, values: Vec<EncodedLocation>, epsilon: usize) -> Self {
        let segments = fit_segments(&keys, epsilon);
        Self {
            keys,
            values,
            segments,
        }
    }

    fn lookup(&self, key: u64, epsilon: usize) -> Option<EncodedLocation> {
        let seg_idx = self
            .segments
            .partition_point(|s| s.first_key <= key)
            .checked_sub(1)?;
        let seg = &self.segments[seg_idx];

        let predicted = seg.predict(key);
        let lo = predicted.saturating_sub(epsilon + 1).max(seg.start);
        let hi = (predicted + epsilon + 2).min(seg.end);

        let pos = match self.keys[lo..hi].binary_search(&key) {
            Ok(i) => Some(lo + i),
            // The model bound holds for stored keys only; a miss inside the
            // window is re-checked over the whole array.
            Err(_) => self.keys.binary_search(&key).ok(),
        };
        pos.map(|i| self.values[i])
    }
}

// ------------------------------------------------------------------------------------------------
// PiecewiseIndex
// ------------------------------------------------------------------------------------------------

/// Persistent piecewise-linear index over `u64` keys.
#[derive(Debug)]
pub struct PiecewiseIndex {
    /// Snapshot directory; `None` keeps the index in memory only.
    dir: Option<PathBuf>,
    epsilon: usize,
    state: RwLock<IndexState>,
}

impl PiecewiseIndex {
    /// Opens the index stored in `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, epsilon: usize) -> Result<Self, LixError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let epsilon = epsilon.max(1);

        let state = match snapshot::read(&dir)? {
            Some((keys, values)) => IndexState::from_sorted(keys, values, epsilon),
            None => IndexState::default(),
        };

        info!(
            dir = %dir.display(),
            keys = state.keys.len(),
            segments = state.segments.len(),
            epsilon,
            "learned index opened"
        );

        Ok(Self {
            dir: Some(dir),
            epsilon,
            state: RwLock::new(state),
        })
    }

    /// An index that never touches disk.
    pub fn in_memory(epsilon: usize) -> Self {
        Self {
            dir: None,
            epsilon: epsilon.max(1),
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Number of fitted segments.
    pub fn segment_count(&self) -> Result<usize, LixError> {
        Ok(self.read()?.segments.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexState>, LixError> {
        self.state.read().map_err(|_| {
            error!("learned index RwLock poisoned");
            LixError::Internal("RwLock poisoned".into())
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexState>, LixError> {
        self.state.write().map_err(|_| {
            error!("learned index RwLock poisoned");
            LixError::Internal("RwLock poisoned".into())
        })
    }

    /// Persists `next` and then publishes it.
    fn install(&self, state: &mut IndexState, next: IndexState) -> Result<(), LixError> {
        if let Some(dir) = &self.dir {
            snapshot::write(dir, &next.keys, &next.values)?;
        }
        debug!(
            keys = next.keys.len(),
            segments = next.segments.len(),
            "learned index rebuilt"
        );
        *state = next;
        Ok(())
    }
}

/// Sorts by key keeping the first occurrence of each key.
fn sorted_unique(pairs: &[(u64, EncodedLocation)]) -> (Vec<u64>, Vec<EncodedLocation>) {
    let mut map = BTreeMap::new();
    for (k, v) in pairs {
        map.entry(*k).or_insert(*v);
    }
    map.into_iter().unzip()
}

impl LearnedIndex for PiecewiseIndex {
    fn get(&self, key: u64) -> Result<Option<EncodedLocation>, LixError> {
        Ok(self.read()?.lookup(key, self.epsilon))
    }

    fn put_batch(&self, pairs: &[(u64, EncodedLocation)]) -> Result<(), LixError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut state = self.write()?;

        let (new_keys, new_values) = sorted_unique(pairs);
        let mut merged: BTreeMap<u64, EncodedLocation> =
            state.keys.iter().copied().zip(state.values.iter().copied()).collect();
        merged.extend(new_keys.into_iter().zip(new_values));

        let (keys, values): (Vec<u64>, Vec<EncodedLocation>) = merged.into_iter().unzip();
        let next = IndexState::from_sorted(keys, values, self.epsilon);
        self.install(&mut state, next)
    }

    fn bulk_load(&self, pairs: &[(u64, EncodedLocation)]) -> Result<(), LixError> {
        let mut state = self.write()?;
        if !state.keys.is_empty() {
            return Err(LixError::NotEmpty(state.keys.len()));
        }

        let (keys, values) = sorted_unique(pairs);
        let next = IndexState::from_sorted(keys, values, self.epsilon);
        self.install(&mut state, next)
    }

    fn len(&self) -> Result<usize, LixError> {
        Ok(self.read()?.keys.len())
    }
}

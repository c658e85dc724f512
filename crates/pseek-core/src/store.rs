//! Durable index store: paths, mtimes and the primary embedding matrix
//!
//! One [`IndexStore`] owns one index directory and is the sole mediator of
//! upsert and prune. The durable snapshot is the triple
//! `(paths.json, embeddings.npy)` where `paths.json` carries the path list,
//! the per-path mtimes and a monotonically increasing snapshot counter used
//! by ANN sidecars for invalidation.
//!
//! Writes are atomic: both files are written to `.tmp` siblings and renamed.
//! A reader that finds a half-published pair (one file missing, or a shape
//! mismatch) treats the store as empty and leaves the files on disk for
//! post-mortem.

use anyhow::{Context, Result};
use ndarray::{Array2, Axis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::embedder::{default_batch_size, Embedder};
use crate::error::CoreError;
use crate::matrix::{load_matrix, norm, save_matrix, tmp_sibling};
use crate::progress::{CancelFlag, JobKind, JobTracker};

/// Name of the per-root index directory.
pub const INDEX_DIR_NAME: &str = ".photo_index";

/// Environment variable overriding the storage root for all indexes.
pub const APPDATA_ENV: &str = "PSEEK_APPDATA_DIR";

const PATHS_FILE: &str = "paths.json";
const EMBEDDINGS_FILE: &str = "embeddings.npy";
const LOCK_FILE: &str = ".lock";

/// Comparison slack when deciding whether a file was modified.
const MTIME_EPSILON: f64 = 1e-6;

/// One photo to index: absolute path plus its modification time.
#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub path: PathBuf,
    pub mtime: f64,
}

/// In-memory snapshot of the primary index.
#[derive(Debug, Default, Clone)]
pub struct IndexState {
    pub paths: Vec<String>,
    pub mtimes: Vec<f64>,
    pub embeddings: Option<Array2<f32>>,
    /// Bumped on every persisted upsert; copied into ANN sidecars.
    pub snapshot: u64,
}

impl IndexState {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Row of an exact path string, if indexed.
    pub fn row_of(&self, path: &str) -> Option<usize> {
        self.paths.iter().position(|p| p == path)
    }

    /// Embedding dimension, when a matrix is loaded.
    pub fn dim(&self) -> Option<usize> {
        self.embeddings.as_ref().map(|e| e.ncols())
    }
}

#[derive(Serialize, Deserialize)]
struct PathsSidecar {
    paths: Vec<String>,
    mtimes: Vec<f64>,
    #[serde(default)]
    snapshot: u64,
}

/// Store-level progress phases (batch granularity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertPhase {
    Update,
    Insert,
}

/// One store-level progress record.
#[derive(Debug, Clone, Copy)]
pub struct UpsertProgress {
    pub phase: UpsertPhase,
    pub done: usize,
    pub total: usize,
}

/// Callback receiving [`UpsertProgress`] records.
pub type UpsertSink<'a> = &'a (dyn Fn(&UpsertProgress) + Send + Sync);

/// Options for [`IndexStore::upsert`].
pub struct UpsertOptions<'a> {
    /// Embedding batch size; 0 selects a device-appropriate default.
    pub batch_size: usize,
    pub progress: Option<UpsertSink<'a>>,
    pub cancel: CancelFlag,
}

impl Default for UpsertOptions<'_> {
    fn default() -> Self {
        Self {
            batch_size: 0,
            progress: None,
            cancel: CancelFlag::new(),
        }
    }
}

/// Sanitize an index key (or root path) into a directory component.
pub fn sanitize_key(key: &str) -> String {
    key.replace(['/', ' ', ':', '|'], "-")
}

/// Resolve the index directory for a root + key, honoring an appdata root.
pub fn resolve_index_dir(root: &Path, index_key: &str, appdata: Option<&Path>) -> PathBuf {
    let key = sanitize_key(index_key);
    match appdata {
        Some(base) => base
            .join(sanitize_key(&root.to_string_lossy()))
            .join(key),
        None => root.join(INDEX_DIR_NAME).join(key),
    }
}

/// Read a JSON sidecar, returning `None` when the file does not exist.
pub(crate) fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let value = serde_json::from_str(&text)
                .with_context(|| format!("malformed JSON in {}", path.display()))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Write a JSON sidecar atomically (`.tmp` + rename).
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = tmp_sibling(path);
    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("failed to create {}", tmp.display()))?;
    serde_json::to_writer(&mut file, value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    file.flush()?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to publish {}", path.display()))?;
    Ok(())
}

/// Exclusive writer lock for an index directory.
///
/// Only one writer per directory is permitted; the lock file records the
/// holder PID. A lock left behind by a dead process is reclaimed.
#[derive(Debug)]
struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    fn acquire(index_dir: &Path) -> Result<Self> {
        let path = index_dir.join(LOCK_FILE);
        for attempt in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && Self::is_stale(&path) {
                        tracing::warn!("reclaiming stale index lock {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    return Err(CoreError::LockHeld(path).into());
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create lock {}", path.display()))
                }
            }
        }
        Err(CoreError::LockHeld(path).into())
    }

    fn is_stale(path: &Path) -> bool {
        let pid = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        match pid {
            Some(pid) => !pid_alive(pid),
            // Unreadable or empty lock file: treat as held.
            None => false,
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    // No portable liveness probe; never reclaim.
    true
}

/// Persistent store for one `(root, index_key)` pair.
#[derive(Debug)]
pub struct IndexStore {
    root: PathBuf,
    index_dir: PathBuf,
    state: IndexState,
}

impl IndexStore {
    /// Open (creating if absent) the store for `root` under `index_key`.
    ///
    /// The storage directory is `{root}/.photo_index/{key}` or, when the
    /// `PSEEK_APPDATA_DIR` environment variable is set,
    /// `{appdata}/{sanitized root}/{key}`.
    pub fn open(root: &Path, index_key: &str) -> Result<Self> {
        let appdata = std::env::var_os(APPDATA_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::open_in(root, index_key, appdata.as_deref())
    }

    /// Like [`IndexStore::open`] with an explicit appdata override.
    pub fn open_in(root: &Path, index_key: &str, appdata: Option<&Path>) -> Result<Self> {
        let index_dir = resolve_index_dir(root, index_key, appdata);
        if !index_dir.is_dir() && !root.is_dir() && appdata.is_none() {
            return Err(CoreError::StoreNotFound(root.to_path_buf()).into());
        }
        std::fs::create_dir_all(&index_dir)
            .with_context(|| format!("failed to create {}", index_dir.display()))?;
        let mut store = Self {
            root: root.to_path_buf(),
            index_dir,
            state: IndexState::default(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Read-only view of the current snapshot.
    pub fn state(&self) -> &IndexState {
        &self.state
    }

    fn paths_file(&self) -> PathBuf {
        self.index_dir.join(PATHS_FILE)
    }

    fn embeddings_file(&self) -> PathBuf {
        self.index_dir.join(EMBEDDINGS_FILE)
    }

    /// Reload the snapshot from disk.
    ///
    /// A half-published or shape-mismatched snapshot is a recovery event:
    /// the store loads as empty and the files stay on disk.
    pub fn load(&mut self) -> Result<()> {
        self.state = IndexState::default();
        let sidecar: Option<PathsSidecar> = read_json_file(&self.paths_file())?;
        let Some(sidecar) = sidecar else {
            return Ok(());
        };
        self.state.snapshot = sidecar.snapshot;
        if sidecar.paths.is_empty() {
            return Ok(());
        }

        let embeddings = match load_matrix(&self.embeddings_file()) {
            Ok(matrix) => matrix,
            Err(e) => {
                tracing::warn!(
                    "recovery: embeddings missing or unreadable in {}, treating store as empty: {e}",
                    self.index_dir.display()
                );
                return Ok(());
            }
        };
        if embeddings.nrows() != sidecar.paths.len()
            || sidecar.mtimes.len() != sidecar.paths.len()
        {
            tracing::warn!(
                "recovery: snapshot shape mismatch in {} ({} paths vs {} rows), treating store as empty",
                self.index_dir.display(),
                sidecar.paths.len(),
                embeddings.nrows()
            );
            return Ok(());
        }

        self.state.paths = sidecar.paths;
        self.state.mtimes = sidecar.mtimes;
        self.state.embeddings = Some(embeddings);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        match &self.state.embeddings {
            Some(matrix) => save_matrix(&self.embeddings_file(), matrix)?,
            None => {
                let path = self.embeddings_file();
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            }
        }
        write_json_atomic(
            &self.paths_file(),
            &PathsSidecar {
                paths: self.state.paths.clone(),
                mtimes: self.state.mtimes.clone(),
                snapshot: self.state.snapshot,
            },
        )
    }

    /// Insert, update and prune to match `photos`, returning
    /// `(new_count, updated_count)`.
    ///
    /// Diff key is `mtime + path`: paths not yet stored are embedded and
    /// appended (in input order, which callers keep scan-sorted); stored
    /// paths with a newer mtime are re-embedded in place; stored paths
    /// absent from `photos` are pruned with stable row compaction. The new
    /// snapshot is published atomically at the end.
    ///
    /// Cancellation is observed between batches; progress persisted up to
    /// that point is saved and the partial counts are returned.
    pub fn upsert(
        &mut self,
        embedder: &mut dyn Embedder,
        photos: &[Photo],
        options: &UpsertOptions,
    ) -> Result<(usize, usize)> {
        let _lock = WriterLock::acquire(&self.index_dir)?;
        self.check_dim(embedder)?;
        let batch_size = effective_batch_size(options.batch_size, embedder);

        let mut tracker = JobTracker::with_cancel(
            &self.index_dir,
            JobKind::Indexing,
            photos.len(),
            self.state.len(),
            options.cancel.clone(),
        );

        let existing: HashMap<&str, usize> = self
            .state
            .paths
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_str(), i))
            .collect();

        let mut new_items: Vec<&Photo> = Vec::new();
        let mut modified_idx: Vec<usize> = Vec::new();
        let mut new_mtime: HashMap<String, f64> = HashMap::new();
        for photo in photos {
            let sp = photo.path.to_string_lossy().into_owned();
            new_mtime.insert(sp.clone(), photo.mtime);
            match existing.get(sp.as_str()) {
                None => new_items.push(photo),
                Some(&row) => {
                    if photo.mtime > self.state.mtimes[row] + MTIME_EPSILON {
                        modified_idx.push(row);
                    }
                }
            }
        }

        tracker.update(|s| {
            s.updated_total = modified_idx.len();
            s.insert_total = new_items.len();
        });

        let mut updated_count = 0usize;
        let mut new_count = 0usize;
        let mut cancelled = false;

        // Modifications first, insertions second, prune last; each batch
        // boundary is a suspension point.
        if !modified_idx.is_empty() && self.state.embeddings.is_some() {
            let total = modified_idx.len();
            for chunk in modified_idx.chunks(batch_size.max(1)) {
                if !tracker.checkpoint() {
                    cancelled = true;
                    break;
                }
                let chunk_paths: Vec<PathBuf> = chunk
                    .iter()
                    .map(|&i| PathBuf::from(&self.state.paths[i]))
                    .collect();
                let embedded = embedder
                    .embed_images(&chunk_paths, batch_size, None)
                    .map_err(|e| {
                        tracker.fail(e.to_string());
                        e
                    })?;
                let matrix = self.state.embeddings.as_mut().expect("checked above");
                for (j, &row) in chunk.iter().enumerate() {
                    let v = embedded.matrix.row(j);
                    if norm(v.as_slice().unwrap_or(&[])) > 0.0 {
                        matrix.row_mut(row).assign(&v);
                        let sp = &self.state.paths[row];
                        if let Some(&mt) = new_mtime.get(sp) {
                            self.state.mtimes[row] = mt;
                        }
                    }
                }
                updated_count += chunk.len();
                tracker.update(|s| s.updated_done = updated_count);
                if let Some(sink) = options.progress {
                    sink(&UpsertProgress {
                        phase: UpsertPhase::Update,
                        done: updated_count,
                        total,
                    });
                }
            }
        }

        if !cancelled && !new_items.is_empty() {
            let total = new_items.len();
            let mut done = 0usize;
            for chunk in new_items.chunks(batch_size.max(1)) {
                if !tracker.checkpoint() {
                    cancelled = true;
                    break;
                }
                let chunk_paths: Vec<PathBuf> =
                    chunk.iter().map(|p| p.path.clone()).collect();
                let embedded = embedder
                    .embed_images(&chunk_paths, batch_size, None)
                    .map_err(|e| {
                        tracker.fail(e.to_string());
                        e
                    })?;
                for &j in &embedded.valid {
                    let photo = chunk[j];
                    self.append_row(
                        photo.path.to_string_lossy().into_owned(),
                        photo.mtime,
                        embedded.matrix.row(j).to_vec(),
                    )?;
                    new_count += 1;
                }
                done += chunk.len();
                tracker.update(|s| s.insert_done = done);
                if let Some(sink) = options.progress {
                    sink(&UpsertProgress {
                        phase: UpsertPhase::Insert,
                        done,
                        total,
                    });
                }
            }
        }

        if !cancelled {
            let present: HashSet<String> = photos
                .iter()
                .map(|p| p.path.to_string_lossy().into_owned())
                .collect();
            self.prune(&present);
        }

        self.state.snapshot += 1;
        self.save()?;
        if !cancelled {
            tracker.complete();
        }
        Ok((new_count, updated_count))
    }

    /// Update or insert only the given paths; never prunes.
    pub fn upsert_paths(
        &mut self,
        embedder: &mut dyn Embedder,
        paths: &[PathBuf],
        batch_size: usize,
    ) -> Result<(usize, usize)> {
        let photos: Vec<Photo> = paths
            .iter()
            .filter_map(|p| match crate::scanner::file_mtime(p) {
                Ok(mtime) => Some(Photo {
                    path: p.clone(),
                    mtime,
                }),
                Err(e) => {
                    tracing::warn!("skipping unreadable path {}: {e}", p.display());
                    None
                }
            })
            .collect();

        let _lock = WriterLock::acquire(&self.index_dir)?;
        self.check_dim(embedder)?;
        let batch_size = effective_batch_size(batch_size, embedder);

        let mut updated = 0usize;
        let mut newc = 0usize;

        let mut to_update: Vec<(usize, f64)> = Vec::new();
        let mut to_insert: Vec<&Photo> = Vec::new();
        for photo in &photos {
            let sp = photo.path.to_string_lossy();
            match self.state.row_of(&sp) {
                Some(row) => to_update.push((row, photo.mtime)),
                None => to_insert.push(photo),
            }
        }

        if !to_update.is_empty() && self.state.embeddings.is_some() {
            for chunk in to_update.chunks(batch_size.max(1)) {
                let chunk_paths: Vec<PathBuf> = chunk
                    .iter()
                    .map(|&(i, _)| PathBuf::from(&self.state.paths[i]))
                    .collect();
                let embedded = embedder.embed_images(&chunk_paths, batch_size, None)?;
                let matrix = self.state.embeddings.as_mut().expect("checked above");
                for (j, &(row, mtime)) in chunk.iter().enumerate() {
                    let v = embedded.matrix.row(j);
                    if norm(v.as_slice().unwrap_or(&[])) > 0.0 {
                        matrix.row_mut(row).assign(&v);
                        self.state.mtimes[row] = mtime;
                    }
                }
                updated += chunk.len();
            }
        }

        for chunk in to_insert.chunks(batch_size.max(1)) {
            let chunk_paths: Vec<PathBuf> = chunk.iter().map(|p| p.path.clone()).collect();
            let embedded = embedder.embed_images(&chunk_paths, batch_size, None)?;
            for &j in &embedded.valid {
                let photo = chunk[j];
                self.append_row(
                    photo.path.to_string_lossy().into_owned(),
                    photo.mtime,
                    embedded.matrix.row(j).to_vec(),
                )?;
                newc += 1;
            }
        }

        self.state.snapshot += 1;
        self.save()?;
        Ok((newc, updated))
    }

    /// Low-level row override used by auxiliary maintainers.
    pub fn replace_row(&mut self, row: usize, vector: &[f32]) -> Result<()> {
        let matrix = self
            .state
            .embeddings
            .as_mut()
            .ok_or_else(|| CoreError::InvalidArgument("store has no embeddings".into()))?;
        if row >= matrix.nrows() {
            return Err(CoreError::InvalidArgument(format!(
                "row {row} out of range ({} rows)",
                matrix.nrows()
            ))
            .into());
        }
        if vector.len() != matrix.ncols() {
            return Err(CoreError::InvalidArgument(format!(
                "vector dim {} does not match matrix dim {}",
                vector.len(),
                matrix.ncols()
            ))
            .into());
        }
        let mut v = vector.to_vec();
        crate::matrix::l2_normalize(&mut v);
        matrix
            .row_mut(row)
            .assign(&ndarray::ArrayView1::from(&v[..]));
        self.state.snapshot += 1;
        self.save()
    }

    /// Delete the entire index directory.
    pub fn nuke(self) -> Result<()> {
        std::fs::remove_dir_all(&self.index_dir)
            .with_context(|| format!("failed to remove {}", self.index_dir.display()))
    }

    fn append_row(&mut self, path: String, mtime: f64, vector: Vec<f32>) -> Result<()> {
        match &mut self.state.embeddings {
            None => {
                let dim = vector.len();
                self.state.embeddings = Some(crate::matrix::from_flat(vector, dim)?);
            }
            Some(matrix) => {
                matrix
                    .push_row(ndarray::ArrayView1::from(&vector[..]))
                    .context("failed to append embedding row")?;
            }
        }
        self.state.paths.push(path);
        self.state.mtimes.push(mtime);
        Ok(())
    }

    /// Drop every stored path not in `present`, compacting rows stably.
    fn prune(&mut self, present: &HashSet<String>) {
        if self.state.paths.is_empty() || present.is_empty() {
            return;
        }
        let keep: Vec<usize> = self
            .state
            .paths
            .iter()
            .enumerate()
            .filter(|(_, p)| present.contains(*p))
            .map(|(i, _)| i)
            .collect();
        if keep.len() == self.state.paths.len() {
            return;
        }
        self.state.paths = keep.iter().map(|&i| self.state.paths[i].clone()).collect();
        self.state.mtimes = keep.iter().map(|&i| self.state.mtimes[i]).collect();
        if let Some(matrix) = &self.state.embeddings {
            self.state.embeddings = if keep.is_empty() {
                None
            } else {
                Some(matrix.select(Axis(0), &keep))
            };
        }
        if self.state.paths.is_empty() {
            self.state.embeddings = None;
        }
    }

    fn check_dim(&self, embedder: &dyn Embedder) -> Result<()> {
        if let Some(dim) = self.state.dim() {
            if dim != embedder.dim() {
                return Err(CoreError::EmbedderUnavailable(format!(
                    "dimension mismatch: index has {dim}, embedder {} produces {}",
                    embedder.index_id(),
                    embedder.dim()
                ))
                .into());
            }
        }
        Ok(())
    }
}

fn effective_batch_size(requested: usize, embedder: &dyn Embedder) -> usize {
    if requested > 0 {
        requested
    } else {
        default_batch_size(embedder.is_accelerated())
    }
}

//! Filesystem scanner for photo libraries
//!
//! Enumerates supported media files beneath a root, skipping hidden
//! directories and the index directory itself. Output is sorted by path so
//! that a scan of an unchanged tree always produces the same list, which
//! keeps upsert diffs and row assignment deterministic.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::store::INDEX_DIR_NAME;

/// Recognized image extensions (lowercase, without dot).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "bmp", "gif", "webp", "tiff", "tif", "heic", "heif",
];

/// Recognized video extensions (lowercase, without dot).
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "m4v"];

/// One file found by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Seconds since the epoch, fractional.
    pub mtime: f64,
    pub size: u64,
}

/// Scan configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Also pick up video files.
    pub include_videos: bool,
}

/// Check whether a path has a recognized image extension (case-insensitive).
pub fn is_image_file(path: &Path) -> bool {
    has_extension_in(path, IMAGE_EXTENSIONS)
}

/// Check whether a path has a recognized video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    has_extension_in(path, VIDEO_EXTENSIONS)
}

fn has_extension_in(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            extensions.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Directories that are never descended into.
fn should_skip_dir(name: &str) -> bool {
    name.starts_with('.') || name == INDEX_DIR_NAME
}

/// File modification time in fractional seconds since the epoch.
pub fn file_mtime(path: &Path) -> Result<f64> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let modified = meta
        .modified()
        .with_context(|| format!("no mtime for {}", path.display()))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

/// Enumerate media files under `root`, sorted ascending by path.
///
/// Symlinks are followed; the same target reached through two links is
/// reported once (canonical-path dedup). Unreadable directories are logged
/// and skipped, they never abort the scan.
pub fn scan(root: &Path, options: &ScanOptions) -> Result<Vec<ScannedFile>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }

    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut files = Vec::new();

    let walker = WalkDir::new(root).follow_links(true).into_iter();
    let mut it = walker.filter_entry(|entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        entry
            .file_name()
            .to_str()
            .map(|name| !should_skip_dir(name))
            .unwrap_or(true)
    });

    while let Some(entry) = it.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("skipping unreadable entry during scan: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let wanted = is_image_file(path) || (options.include_videos && is_video_file(path));
        if !wanted {
            continue;
        }
        // Dedup through symlinks; fall back to the literal path if the
        // target vanished between listing and canonicalization.
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if !seen.insert(canonical) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("failed to stat {}: {e}", path.display());
                continue;
            }
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        files.push(ScannedFile {
            path: path.to_path_buf(),
            mtime,
            size: meta.len(),
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

//! Shared helpers for unit tests: a deterministic embedder and photo roots.

use anyhow::Result;
use ndarray::Array2;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::embedder::{Embedder, EmbedPhase, EmbedProgress, ImageEmbeddings, ProgressSink};
use crate::scanner::{scan, ScanOptions};
use crate::store::Photo;

/// Deterministic stand-in for a CLIP model.
///
/// Vectors are keyed by file name (for images) or by the full query string
/// (for text). Unknown inputs hash to a stable unit vector, so any corpus is
/// embeddable without fixtures. Names registered via [`MockEmbedder::failing_on`]
/// behave like undecodable files and produce zero rows.
pub(crate) struct MockEmbedder {
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
    texts: HashMap<String, Vec<f32>>,
    failing: HashSet<String>,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: HashMap::new(),
            texts: HashMap::new(),
            failing: HashSet::new(),
        }
    }

    /// Register the embedding for a file name, verbatim.
    pub fn with_vector(mut self, name: &str, v: Vec<f32>) -> Self {
        self.set_vector(name, v);
        self
    }

    pub fn set_vector(&mut self, name: &str, v: Vec<f32>) {
        assert_eq!(v.len(), self.dim);
        self.vectors.insert(name.to_string(), v);
    }

    /// Register the embedding for a text query, verbatim.
    pub fn with_text(mut self, query: &str, v: Vec<f32>) -> Self {
        assert_eq!(v.len(), self.dim);
        self.texts.insert(query.to_string(), v);
        self
    }

    /// Make a file name behave like an undecodable image.
    pub fn failing_on(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    fn vector_for(&self, name: &str) -> Vec<f32> {
        self.vectors
            .get(name)
            .cloned()
            .unwrap_or_else(|| hash_vector(name, self.dim))
    }
}

impl Embedder for MockEmbedder {
    fn index_id(&self) -> String {
        "mock-clip".to_string()
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>> {
        Ok(self
            .texts
            .get(text)
            .cloned()
            .unwrap_or_else(|| hash_vector(text, self.dim)))
    }

    fn embed_images(
        &mut self,
        paths: &[PathBuf],
        _batch_size: usize,
        progress: Option<ProgressSink>,
    ) -> Result<ImageEmbeddings> {
        let mut data = Vec::with_capacity(paths.len() * self.dim);
        let mut valid = 0usize;
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if self.failing.contains(&name) {
                data.extend(std::iter::repeat(0.0).take(self.dim));
            } else {
                data.extend(self.vector_for(&name));
                valid += 1;
            }
        }
        let matrix = Array2::from_shape_vec((paths.len(), self.dim), data)?;
        if let Some(sink) = progress {
            sink(&EmbedProgress {
                phase: EmbedPhase::EncodeDone,
                done: paths.len(),
                total: paths.len(),
                valid,
            });
        }
        Ok(ImageEmbeddings::new(matrix))
    }
}

/// Stable pseudo-random unit vector derived from a string.
pub(crate) fn hash_vector(seed: &str, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim)
        .map(|i| {
            let h = xxhash_rust::xxh3::xxh3_64_with_seed(seed.as_bytes(), i as u64);
            (h as f64 / u64::MAX as f64) as f32 * 2.0 - 1.0
        })
        .collect();
    crate::matrix::l2_normalize(&mut v);
    v
}

/// A temp directory populated with (fake) photo files.
pub(crate) struct MockRoot {
    dir: tempfile::TempDir,
}

impl MockRoot {
    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Scan the root into a sorted photo list.
    pub fn photos(&self) -> Vec<Photo> {
        scan(self.dir.path(), &ScanOptions::default())
            .unwrap()
            .into_iter()
            .map(|f| Photo {
                path: f.path,
                mtime: f.mtime,
            })
            .collect()
    }
}

/// Create a temp root containing empty files with the given names.
pub(crate) fn mock_root(names: &[&str]) -> MockRoot {
    let dir = tempfile::tempdir().unwrap();
    for name in names {
        std::fs::write(dir.path().join(name), b"mock image bytes").unwrap();
    }
    MockRoot { dir }
}

/// Write a small solid-color PNG, for tests that need a real decodable image.
pub(crate) fn write_png(path: &std::path::Path, rgb: [u8; 3], size: u32) {
    let img = image::RgbImage::from_pixel(size, size, image::Rgb(rgb));
    img.save(path).unwrap();
}

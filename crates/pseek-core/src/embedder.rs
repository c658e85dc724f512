//! Embedding capability and the image-decode pipeline
//!
//! The core is written against the [`Embedder`] trait: a model that maps
//! text and images into one L2-normalized vector space of a fixed dimension.
//! `index_id()` names the embedding namespace; two embedders with different
//! ids never share an index directory.
//!
//! Decoding is the expensive CPU-bound half of image embedding, so it runs
//! in a bounded worker pool feeding the model in batches. The pool is kept
//! small when an accelerator backend is active, otherwise decode threads
//! fight the model for dispatch.

use anyhow::Result;
use ndarray::Array2;
use rayon::prelude::*;
use std::path::PathBuf;

use crate::matrix::norm;

/// Progress phases emitted while embedding a set of images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedPhase {
    /// Images for the current batch were decoded.
    Load,
    /// The model is about to encode the current batch.
    EncodeStart,
    /// The current batch finished encoding.
    EncodeDone,
}

/// One progress record, delivered per batch.
#[derive(Debug, Clone, Copy)]
pub struct EmbedProgress {
    pub phase: EmbedPhase,
    /// Inputs consumed so far, including failed ones.
    pub done: usize,
    pub total: usize,
    /// Inputs that produced a usable embedding so far.
    pub valid: usize,
}

/// Callback receiving [`EmbedProgress`] records.
pub type ProgressSink<'a> = &'a (dyn Fn(&EmbedProgress) + Send + Sync);

/// Result of embedding a list of image paths.
///
/// `matrix` always has one row per input path; rows for inputs that could
/// not be decoded are zero. `valid` lists the indices of non-zero rows, so
/// callers can pick either the padded or the compact view.
#[derive(Debug, Clone)]
pub struct ImageEmbeddings {
    pub matrix: Array2<f32>,
    pub valid: Vec<usize>,
}

impl ImageEmbeddings {
    pub fn new(matrix: Array2<f32>) -> Self {
        let valid = matrix
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(_, row)| norm(row.as_slice().unwrap_or(&[])) > 0.0)
            .map(|(i, _)| i)
            .collect();
        Self { matrix, valid }
    }
}

/// A CLIP-family embedding model.
///
/// Implementations must produce unit-norm vectors of a constant dimension
/// for a given `index_id`. A single undecodable image is not an error (it
/// yields a zero row); model-level failures are.
pub trait Embedder: Send {
    /// Stable identifier of the embedding namespace (model name).
    fn index_id(&self) -> String;

    /// Output dimension `D`.
    fn dim(&self) -> usize;

    /// Embed a text query into a unit-norm `(D,)` vector.
    fn embed_text(&mut self, text: &str) -> Result<Vec<f32>>;

    /// Embed images into a `(len(paths), D)` matrix, batch by batch.
    fn embed_images(
        &mut self,
        paths: &[PathBuf],
        batch_size: usize,
        progress: Option<ProgressSink>,
    ) -> Result<ImageEmbeddings>;

    /// Whether the model runs on an accelerator. Drives decode-pool sizing
    /// and the auto batch size.
    fn is_accelerated(&self) -> bool {
        false
    }
}

/// Auto-chosen embedding batch size: small on CPU, larger on accelerators.
pub fn default_batch_size(accelerated: bool) -> usize {
    if accelerated {
        64
    } else {
        16
    }
}

/// Size of the image-decode worker pool.
///
/// Halved-down to 2 workers for accelerator backends to avoid dispatch
/// contention with the model.
pub fn decode_workers(accelerated: bool) -> usize {
    if accelerated {
        2
    } else {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cpus / 2).clamp(1, 4)
    }
}

/// Decode a batch of images to RGB in parallel, preserving input order.
///
/// Undecodable files come back as `None` and are logged, never fatal.
pub fn decode_rgb_batch(paths: &[PathBuf], workers: usize) -> Vec<Option<image::RgbImage>> {
    let pool = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!("decode pool unavailable, falling back to serial decode: {e}");
            return paths.iter().map(|p| decode_rgb(p)).collect();
        }
    };
    pool.install(|| paths.par_iter().map(|p| decode_rgb(p)).collect())
}

fn decode_rgb(path: &PathBuf) -> Option<image::RgbImage> {
    match image::open(path) {
        Ok(img) => Some(img.to_rgb8()),
        Err(e) => {
            tracing::warn!("failed to decode {}: {e}", path.display());
            None
        }
    }
}

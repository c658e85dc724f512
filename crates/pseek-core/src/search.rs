//! Search engine: exact scoring, ANN dispatch, fusion and workspaces
//!
//! Scoring is always an inner product against the primary matrix; ANN
//! backends only generate candidates and are re-ranked exactly before
//! anything is returned. Hybrid fusion blends the image similarity with an
//! aligned OCR or caption text-embedding matrix. Structured filters run
//! after scoring and only ever drop rows.
//!
//! Results are sorted by descending score with ties broken by ascending
//! path, so identical corpora always rank identically.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ann::{ann_search, AnnKind};
use crate::embedder::Embedder;
use crate::filters::{apply_filters, FilterOptions};
use crate::matrix::matvec;
use crate::store::IndexStore;

/// Default result count when the caller does not specify `top_k`.
pub const DEFAULT_TOP_K: usize = 12;

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub path: String,
    pub score: f32,
}

/// Which auxiliary matrix to fuse with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionKind {
    Ocr,
    Captions,
}

/// Weighted fusion of image and text-derived similarity.
#[derive(Debug, Clone, Copy)]
pub struct Fusion {
    pub kind: FusionKind,
    pub weight_image: f32,
    pub weight_text: f32,
}

impl Fusion {
    pub fn new(kind: FusionKind) -> Self {
        Self {
            kind,
            weight_image: 0.5,
            weight_text: 0.5,
        }
    }

    /// Weights scaled to sum to 1.
    fn normalized(&self) -> (f32, f32) {
        let total = self.weight_image + self.weight_text;
        if total <= 0.0 {
            (0.5, 0.5)
        } else {
            (self.weight_image / total, self.weight_text / total)
        }
    }
}

/// Search options: top-K, subset restriction, ANN hint, fusion weights and
/// the structured filter set.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Results to return; 0 means [`DEFAULT_TOP_K`].
    pub top_k: usize,
    /// Restrict scoring to these primary rows.
    pub subset: Option<Vec<usize>>,
    /// Use an ANN backend as candidate generator when its snapshot is
    /// usable; ignored for subset and fusion searches.
    pub ann: Option<AnnKind>,
    /// Blend in an auxiliary text matrix.
    pub fusion: Option<Fusion>,
    pub filters: FilterOptions,
}

impl SearchOptions {
    fn effective_top_k(&self) -> usize {
        if self.top_k == 0 {
            DEFAULT_TOP_K
        } else {
            self.top_k
        }
    }
}

/// Text → images search.
///
/// An empty query scores every row 1.0 (pure filter browsing).
pub fn search(
    store: &IndexStore,
    embedder: &mut dyn Embedder,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let state = store.state();
    if state.is_empty() || state.embeddings.is_none() {
        return Ok(Vec::new());
    }

    if query.trim().is_empty() {
        let scored = rows_in_scope(state.len(), options)
            .into_iter()
            .map(|row| (row, 1.0))
            .collect();
        return Ok(finish(store, scored, query, options));
    }

    let q = embedder.embed_text(query)?;
    let scored = score_rows(store, &q, options)?;
    Ok(finish(store, scored, query, options))
}

/// Image → images search: rank by similarity to an already-indexed photo.
///
/// The photo itself comes back at rank 0 (self-similarity 1.0).
pub fn search_like(
    store: &IndexStore,
    path: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let state = store.state();
    let Some(matrix) = state.embeddings.as_ref() else {
        return Ok(Vec::new());
    };
    let Some(row) = state.row_of(path) else {
        return Ok(Vec::new());
    };
    let q: Vec<f32> = matrix.row(row).to_vec();
    let scored = score_rows(store, &q, options)?;
    Ok(finish(store, scored, "", options))
}

/// Cross-store search over a workspace of roots.
///
/// All stores must share the embedding dimension; stores with a different
/// one are skipped with a warning. Filters apply per-store, using the side
/// tables of the store that owns each path.
pub fn search_workspace(
    stores: &[&IndexStore],
    embedder: &mut dyn Embedder,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let q = if query.trim().is_empty() {
        None
    } else {
        Some(embedder.embed_text(query)?)
    };
    let dim = embedder.dim();

    let mut merged: Vec<SearchResult> = Vec::new();
    for store in stores {
        let state = store.state();
        let Some(matrix) = state.embeddings.as_ref() else {
            continue;
        };
        if matrix.ncols() != dim {
            tracing::warn!(
                "skipping {} in workspace search: dim {} != {}",
                store.index_dir().display(),
                matrix.ncols(),
                dim
            );
            continue;
        }
        let scored: Vec<(usize, f32)> = match &q {
            Some(q) => matvec(matrix, q).into_iter().enumerate().collect(),
            None => (0..state.len()).map(|row| (row, 1.0)).collect(),
        };
        let per_store = SearchOptions {
            top_k: usize::MAX,
            subset: None,
            ann: None,
            fusion: options.fusion,
            filters: options.filters.clone(),
        };
        merged.extend(finish(store, scored, query, &per_store));
    }

    rank(&mut merged);
    merged.truncate(options.effective_top_k());
    Ok(merged)
}

/// Score rows for a query vector, honoring subset, fusion and ANN hints.
fn score_rows(
    store: &IndexStore,
    q: &[f32],
    options: &SearchOptions,
) -> Result<Vec<(usize, f32)>> {
    let state = store.state();
    let matrix = state.embeddings.as_ref().expect("caller checked");

    if let Some(fusion) = &options.fusion {
        let aux = match fusion.kind {
            FusionKind::Ocr => crate::ocr::load_ocr_matrix(store)?,
            FusionKind::Captions => crate::captions::load_caption_matrix(store)?,
        };
        if let Some(aux) = aux {
            let (w_img, w_txt) = fusion.normalized();
            let image_scores = matvec(matrix, q);
            let text_scores = matvec(&aux, q);
            return Ok(rows_in_scope(state.len(), options)
                .into_iter()
                .map(|row| (row, w_img * image_scores[row] + w_txt * text_scores[row]))
                .collect());
        }
        tracing::debug!("fusion requested but aux index unavailable, scoring image-only");
    }

    // ANN is a candidate generator only; exact scores always win.
    if options.subset.is_none() && options.fusion.is_none() {
        if let Some(kind) = options.ann {
            match ann_search(store, kind, q, options.effective_top_k()) {
                Ok(candidates) => {
                    let scores = matvec(matrix, q);
                    return Ok(candidates
                        .into_iter()
                        .map(|(row, _raw)| (row, scores[row]))
                        .collect());
                }
                Err(e) => {
                    tracing::debug!("ann {} unusable, falling back to exact: {e}", kind.as_str());
                }
            }
        }
    }

    let scores = matvec(matrix, q);
    Ok(rows_in_scope(state.len(), options)
        .into_iter()
        .map(|row| (row, scores[row]))
        .collect())
}

fn rows_in_scope(len: usize, options: &SearchOptions) -> Vec<usize> {
    match &options.subset {
        Some(subset) => subset.iter().copied().filter(|&row| row < len).collect(),
        None => (0..len).collect(),
    }
}

/// Attach paths, rank, filter, truncate.
fn finish(
    store: &IndexStore,
    scored: Vec<(usize, f32)>,
    raw_query: &str,
    options: &SearchOptions,
) -> Vec<SearchResult> {
    let state = store.state();
    let mut results: Vec<SearchResult> = scored
        .into_iter()
        .map(|(row, score)| SearchResult {
            path: state.paths[row].clone(),
            score,
        })
        .collect();
    rank(&mut results);
    let mut results = apply_filters(store, results, &options.filters, raw_query);
    results.truncate(options.effective_top_k());
    results
}

/// Descending score, ties broken by ascending path.
fn rank(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
    });
}

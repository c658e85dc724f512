//! OCR auxiliary index
//!
//! Extracted text is cached per path in `ocr_texts.json` and text-embedded
//! into `ocr_embeddings.npy`, aligned row-for-row with the primary paths
//! list (empty text ⇒ zero row). The OCR capability itself is external; the
//! core only drives it and maintains the caches. `captions.rs` reuses the
//! same machinery with a different producer and file pair.

use anyhow::Result;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::embedder::Embedder;
use crate::matrix::{load_matrix, save_matrix};
use crate::progress::{CancelFlag, JobKind, JobTracker};
use crate::store::{read_json_file, write_json_atomic, IndexStore};

pub const OCR_TEXTS_FILE: &str = "ocr_texts.json";
pub const OCR_EMBEDDINGS_FILE: &str = "ocr_embeddings.npy";

/// Text recognition capability (external engine).
pub trait OcrEngine {
    /// Extract all text found in the image, concatenated.
    fn recognize(&mut self, path: &Path) -> Result<String>;
}

/// `{paths, texts}` sidecar shared by the OCR and caption indexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextSidecar {
    pub paths: Vec<String>,
    pub texts: Vec<String>,
}

impl TextSidecar {
    /// Map view of the cache.
    pub fn as_map(&self) -> HashMap<&str, &str> {
        self.paths
            .iter()
            .zip(self.texts.iter())
            .map(|(p, t)| (p.as_str(), t.as_str()))
            .collect()
    }

    /// Aligned with the store's current path list?
    pub fn aligned_with(&self, paths: &[String]) -> bool {
        self.paths == paths
    }
}

/// Run OCR over every indexed photo without cached text, then rebuild the
/// aligned text-embedding matrix. Returns how many paths were newly OCR'd.
pub fn build_ocr(
    store: &IndexStore,
    engine: &mut dyn OcrEngine,
    embedder: &mut dyn Embedder,
    cancel: CancelFlag,
) -> Result<usize> {
    build_text_index(
        store,
        OCR_TEXTS_FILE,
        OCR_EMBEDDINGS_FILE,
        JobKind::Ocr,
        cancel,
        embedder,
        &mut |path| engine.recognize(path),
    )
}

/// Whether an OCR index exists and is aligned with the store.
pub fn ocr_available(store: &IndexStore) -> bool {
    text_index_available(store, OCR_TEXTS_FILE, OCR_EMBEDDINGS_FILE)
}

pub fn load_ocr_texts(index_dir: &Path) -> Result<Option<TextSidecar>> {
    read_json_file(&index_dir.join(OCR_TEXTS_FILE))
}

/// The OCR embedding matrix, only when aligned with the store.
pub fn load_ocr_matrix(store: &IndexStore) -> Result<Option<Array2<f32>>> {
    load_text_matrix(store, OCR_TEXTS_FILE, OCR_EMBEDDINGS_FILE)
}

/// Shared builder for text-derived auxiliary indexes (OCR and captions).
///
/// The producer is consulted only for paths missing from the cache, so
/// re-running after new photos were indexed is incremental. Producer
/// failures yield empty text for that path, never abort the job.
pub(crate) fn build_text_index(
    store: &IndexStore,
    texts_file: &str,
    matrix_file: &str,
    kind: JobKind,
    cancel: CancelFlag,
    embedder: &mut dyn Embedder,
    producer: &mut dyn FnMut(&Path) -> Result<String>,
) -> Result<usize> {
    let state = store.state();
    if state.is_empty() {
        return Ok(0);
    }
    let index_dir = store.index_dir();

    let cached: HashMap<String, String> = read_json_file::<TextSidecar>(&index_dir.join(texts_file))?
        .map(|sidecar| {
            sidecar
                .paths
                .into_iter()
                .zip(sidecar.texts)
                .collect()
        })
        .unwrap_or_default();

    let mut tracker =
        JobTracker::with_cancel(index_dir, kind, state.len(), cached.len(), cancel);

    let mut texts: Vec<String> = Vec::with_capacity(state.len());
    let mut updated = 0usize;
    let mut done = 0usize;
    for path in &state.paths {
        if !tracker.checkpoint() {
            // Cancelled: caches stay as they were, partial counts returned.
            return Ok(updated);
        }
        let text = match cached.get(path) {
            Some(prev) if !prev.is_empty() => prev.clone(),
            _ => {
                let produced = producer(Path::new(path)).unwrap_or_else(|e| {
                    tracing::warn!("text extraction failed for {path}: {e}");
                    String::new()
                });
                updated += 1;
                produced.trim().to_string()
            }
        };
        texts.push(text);
        done += 1;
        tracker.update(|s| {
            s.insert_done = done;
            s.insert_total = state.len();
            s.updated_done = updated;
        });
    }

    write_json_atomic(
        &index_dir.join(texts_file),
        &TextSidecar {
            paths: state.paths.clone(),
            texts: texts.clone(),
        },
    )?;

    // Embed every text; empty text stays a zero row.
    let dim = state.dim().unwrap_or_else(|| embedder.dim());
    let mut data: Vec<f32> = Vec::with_capacity(state.len() * dim);
    for text in &texts {
        if text.is_empty() {
            data.extend(std::iter::repeat(0.0).take(dim));
        } else {
            let v = embedder.embed_text(text).map_err(|e| {
                tracker.fail(e.to_string());
                e
            })?;
            data.extend(v);
        }
    }
    let matrix = Array2::from_shape_vec((state.len(), dim), data)?;
    save_matrix(&index_dir.join(matrix_file), &matrix)?;

    tracker.complete();
    Ok(updated)
}

pub(crate) fn text_index_available(store: &IndexStore, texts_file: &str, matrix_file: &str) -> bool {
    let index_dir = store.index_dir();
    if !index_dir.join(matrix_file).exists() {
        return false;
    }
    match read_json_file::<TextSidecar>(&index_dir.join(texts_file)) {
        Ok(Some(sidecar)) => sidecar.aligned_with(&store.state().paths),
        _ => false,
    }
}

pub(crate) fn load_text_matrix(
    store: &IndexStore,
    texts_file: &str,
    matrix_file: &str,
) -> Result<Option<Array2<f32>>> {
    if !text_index_available(store, texts_file, matrix_file) {
        return Ok(None);
    }
    let matrix = load_matrix(&store.index_dir().join(matrix_file))?;
    if matrix.nrows() != store.state().len() {
        tracing::warn!(
            "aux matrix {} out of sync ({} rows vs {} paths), ignoring",
            matrix_file,
            matrix.nrows(),
            store.state().len()
        );
        return Ok(None);
    }
    Ok(Some(matrix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UpsertOptions;
    use crate::testing::{mock_root, MockEmbedder};

    struct FixedOcr(HashMap<String, String>);

    impl OcrEngine for FixedOcr {
        fn recognize(&mut self, path: &Path) -> Result<String> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            match self.0.get(&name) {
                Some(text) => Ok(text.clone()),
                None => Ok(String::new()),
            }
        }
    }

    fn ocr_engine(entries: &[(&str, &str)]) -> FixedOcr {
        FixedOcr(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_build_ocr_aligned_and_incremental() {
        let root = mock_root(&["a.jpg", "b.jpg"]);
        let mut embedder = MockEmbedder::new(3)
            .with_vector("a.jpg", vec![1.0, 0.0, 0.0])
            .with_vector("b.jpg", vec![0.0, 1.0, 0.0]);
        let mut store = crate::store::IndexStore::open(root.path(), "mock").unwrap();
        store
            .upsert(&mut embedder, &root.photos(), &UpsertOptions::default())
            .unwrap();

        let mut engine = ocr_engine(&[("a.jpg", "STOP sign")]);
        let updated = build_ocr(&store, &mut engine, &mut embedder, CancelFlag::new()).unwrap();
        assert_eq!(updated, 2);
        assert!(ocr_available(&store));

        let sidecar = load_ocr_texts(store.index_dir()).unwrap().unwrap();
        assert_eq!(sidecar.paths, store.state().paths);
        assert_eq!(sidecar.texts[sidecar.paths.iter().position(|p| p.ends_with("a.jpg")).unwrap()], "STOP sign");

        let matrix = load_ocr_matrix(&store).unwrap().unwrap();
        assert_eq!(matrix.nrows(), 2);
        // b.jpg has no text: zero row.
        let b_row = sidecar.paths.iter().position(|p| p.ends_with("b.jpg")).unwrap();
        assert!(matrix.row(b_row).iter().all(|&x| x == 0.0));

        // Second run re-processes only the still-empty path.
        let updated = build_ocr(&store, &mut engine, &mut embedder, CancelFlag::new()).unwrap();
        assert_eq!(updated, 1);
    }

    #[test]
    fn test_ocr_invalidated_by_primary_rewrite() {
        let root = mock_root(&["a.jpg", "b.jpg"]);
        let mut embedder = MockEmbedder::new(3);
        let mut store = crate::store::IndexStore::open(root.path(), "mock").unwrap();
        store
            .upsert(&mut embedder, &root.photos(), &UpsertOptions::default())
            .unwrap();

        let mut engine = ocr_engine(&[]);
        build_ocr(&store, &mut engine, &mut embedder, CancelFlag::new()).unwrap();
        assert!(ocr_available(&store));

        // Remove one photo; the aux index no longer matches the path list.
        let photos = root.photos();
        store
            .upsert(&mut embedder, &photos[..1], &UpsertOptions::default())
            .unwrap();
        assert!(!ocr_available(&store));
        assert!(load_ocr_matrix(&store).unwrap().is_none());
    }

    #[test]
    fn test_empty_store_builds_nothing() {
        let root = mock_root(&[]);
        let store = crate::store::IndexStore::open(root.path(), "mock").unwrap();
        let mut embedder = MockEmbedder::new(3);
        let mut engine = ocr_engine(&[]);
        let updated = build_ocr(&store, &mut engine, &mut embedder, CancelFlag::new()).unwrap();
        assert_eq!(updated, 0);
        assert!(!ocr_available(&store));
    }

    #[test]
    fn test_engine_failure_yields_empty_text() {
        struct BrokenOcr;
        impl OcrEngine for BrokenOcr {
            fn recognize(&mut self, _path: &Path) -> Result<String> {
                anyhow::bail!("model blew up")
            }
        }

        let root = mock_root(&["a.jpg"]);
        let mut embedder = MockEmbedder::new(3);
        let mut store = crate::store::IndexStore::open(root.path(), "mock").unwrap();
        store
            .upsert(&mut embedder, &root.photos(), &UpsertOptions::default())
            .unwrap();

        let updated = build_ocr(&store, &mut BrokenOcr, &mut embedder, CancelFlag::new()).unwrap();
        assert_eq!(updated, 1);
        let sidecar = load_ocr_texts(store.index_dir()).unwrap().unwrap();
        assert_eq!(sidecar.texts, vec![String::new()]);
    }
}

//! Caption auxiliary index
//!
//! Same shape as the OCR index: captions from a vision-language capability
//! are cached in `cap_texts.json` and text-embedded into
//! `cap_embeddings.npy` aligned with the primary paths.

use anyhow::Result;
use ndarray::Array2;
use std::path::Path;

use crate::embedder::Embedder;
use crate::ocr::{build_text_index, load_text_matrix, text_index_available, TextSidecar};
use crate::progress::{CancelFlag, JobKind};
use crate::store::{read_json_file, IndexStore};

pub const CAPTION_TEXTS_FILE: &str = "cap_texts.json";
pub const CAPTION_EMBEDDINGS_FILE: &str = "cap_embeddings.npy";

/// Vision-language captioning capability (external model).
pub trait Captioner {
    /// Produce a one-sentence description of the image.
    fn caption(&mut self, path: &Path) -> Result<String>;
}

/// Caption every indexed photo without a cached caption, then rebuild the
/// aligned caption-embedding matrix. Returns how many paths were captioned.
pub fn build_captions(
    store: &IndexStore,
    vlm: &mut dyn Captioner,
    embedder: &mut dyn Embedder,
    cancel: CancelFlag,
) -> Result<usize> {
    build_text_index(
        store,
        CAPTION_TEXTS_FILE,
        CAPTION_EMBEDDINGS_FILE,
        JobKind::Captions,
        cancel,
        embedder,
        &mut |path| vlm.caption(path),
    )
}

/// Whether a caption index exists and is aligned with the store.
pub fn captions_available(store: &IndexStore) -> bool {
    text_index_available(store, CAPTION_TEXTS_FILE, CAPTION_EMBEDDINGS_FILE)
}

pub fn load_caption_texts(index_dir: &Path) -> Result<Option<TextSidecar>> {
    read_json_file(&index_dir.join(CAPTION_TEXTS_FILE))
}

/// The caption embedding matrix, only when aligned with the store.
pub fn load_caption_matrix(store: &IndexStore) -> Result<Option<Array2<f32>>> {
    load_text_matrix(store, CAPTION_TEXTS_FILE, CAPTION_EMBEDDINGS_FILE)
}

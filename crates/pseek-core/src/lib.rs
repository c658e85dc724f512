//! pseek-core: Core library for PhotoSeek semantic photo search
//!
//! This crate provides:
//! - Persistent CLIP-embedding indexes over local photo directories
//! - Exact and approximate (flat / graph / forest) similarity search
//! - Auxiliary indexes: OCR text, captions, EXIF, perceptual hashes, faces
//! - A structured filter layer with a small boolean query language
//! - Cooperative pause/resume/cancel for long-running index jobs
//!
//! The embedding model, OCR, captioning and face-detection capabilities are
//! external: the core is written against the narrow traits in [`embedder`],
//! [`ocr`], [`captions`] and [`faces`], and ships a Candle-backed CLIP
//! implementation behind the `clip` feature.

pub mod ann;
mod ann_flat;
mod ann_graph;
mod ann_tree;
pub mod captions;
pub mod collections;
pub mod embedder;
pub mod error;
pub mod exif;
pub mod faces;
pub mod filters;
pub mod matrix;
pub mod ocr;
pub mod phash;
pub mod progress;
pub mod query;
pub mod scanner;
pub mod search;
pub mod store;

#[cfg(feature = "clip")]
pub mod embedder_clip;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use ann::{ann_search, ann_status, build_ann, drop_ann, AnnKind, AnnMeta, AnnParams, AnnStatus};
pub use captions::{build_captions, captions_available, Captioner};
pub use embedder::{
    decode_workers, default_batch_size, EmbedPhase, EmbedProgress, Embedder, ImageEmbeddings,
};
pub use error::{exit_code, CoreError};
pub use exif::{build_exif, load_exif, ExifTable};
pub use faces::{
    build_faces, load_faces, merge_clusters, photos_of_person, set_cluster_name, split_cluster,
    DetectedFace, FaceBox, FaceBuildParams, FaceBuildStats, FaceDetector, FaceIndex,
};
pub use filters::{FilterOptions, FlashFilter, WhiteBalanceFilter};
pub use ocr::{build_ocr, ocr_available, OcrEngine, TextSidecar};
pub use phash::{build_hashes, find_lookalikes, group_id, resolve_group, LookalikeGroup};
pub use progress::{read_status, request_pause, CancelFlag, JobKind, JobState, JobStatus};
pub use query::{compile, CompiledQuery, QueryContext};
pub use scanner::{scan, ScanOptions, ScannedFile};
pub use search::{
    search, search_like, search_workspace, Fusion, FusionKind, SearchOptions, SearchResult,
    DEFAULT_TOP_K,
};
pub use store::{IndexStore, IndexState, Photo, UpsertOptions, UpsertPhase, UpsertProgress};

#[cfg(feature = "clip")]
pub use embedder_clip::{make_device, ClipEmbedder, CLIP_DIM, CLIP_IMAGE_SIZE};

/// One-look summary of an index directory, for status displays.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub photos: usize,
    pub dim: Option<usize>,
    pub snapshot: u64,
    pub has_ocr: bool,
    pub has_captions: bool,
    pub has_exif: bool,
    pub hashed: usize,
    pub face_clusters: usize,
    pub ann_flat: bool,
    pub ann_graph: bool,
    pub ann_tree: bool,
}

/// Collect [`StoreStats`] for a store.
pub fn store_stats(store: &IndexStore) -> StoreStats {
    let index_dir = store.index_dir();
    StoreStats {
        photos: store.state().len(),
        dim: store.state().dim(),
        snapshot: store.state().snapshot,
        has_ocr: ocr_available(store),
        has_captions: captions_available(store),
        has_exif: index_dir.join(exif::EXIF_FILE).exists(),
        hashed: phash::load_hashes(index_dir).map(|h| h.len()).unwrap_or(0),
        face_clusters: load_faces(index_dir)
            .ok()
            .flatten()
            .map(|f| f.clusters.len())
            .unwrap_or(0),
        ann_flat: ann_status(store, AnnKind::Flat).exists,
        ann_graph: ann_status(store, AnnKind::Graph).exists,
        ann_tree: ann_status(store, AnnKind::Tree).exists,
    }
}

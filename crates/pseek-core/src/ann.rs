//! Approximate-nearest-neighbor backends over the primary matrix
//!
//! Three interchangeable backends are provided: a flat inner-product scan,
//! an HNSW-style cosine graph and an angular random-projection forest. Each
//! persists a binary payload (`flat.index`, `graph.index`, `tree.index`)
//! next to a JSON sidecar recording `dim`, `size`, the build parameters and
//! the store snapshot counter at build time.
//!
//! A backend's snapshot is trusted only while the sidecar agrees with the
//! live store: any upsert bumps the store's snapshot counter, so `status()`
//! reports `exists = false` until the backend is rebuilt. ANN output is a
//! candidate list, never a final ranking; the search layer re-ranks against
//! the exact matrix.

use anyhow::{Context, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::matrix::tmp_sibling;
use crate::store::IndexStore;

/// Available backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnKind {
    Flat,
    Graph,
    Tree,
}

impl AnnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnKind::Flat => "flat",
            AnnKind::Graph => "graph",
            AnnKind::Tree => "tree",
        }
    }

    pub const ALL: [AnnKind; 3] = [AnnKind::Flat, AnnKind::Graph, AnnKind::Tree];
}

impl std::str::FromStr for AnnKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(AnnKind::Flat),
            "graph" | "hnsw" => Ok(AnnKind::Graph),
            "tree" | "forest" => Ok(AnnKind::Tree),
            other => Err(CoreError::InvalidArgument(format!("unknown ann kind: {other}")).into()),
        }
    }
}

/// Build-time tuning knobs. Kinds read only the fields they care about.
#[derive(Debug, Clone, Copy)]
pub struct AnnParams {
    /// Graph: max neighbors per node above layer 0.
    pub m: usize,
    /// Graph: candidate list size during construction.
    pub ef_construction: usize,
    /// Graph: candidate list size during search.
    pub ef_search: usize,
    /// Tree: number of trees in the forest.
    pub trees: usize,
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            trees: 50,
        }
    }
}

/// Sidecar metadata persisted next to each backend payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnMeta {
    pub dim: usize,
    pub size: usize,
    #[serde(default)]
    pub snapshot: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub m: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ef_construction: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trees: Option<usize>,
}

/// Runtime status of one backend for one store.
#[derive(Debug, Clone)]
pub struct AnnStatus {
    pub exists: bool,
    pub meta: Option<AnnMeta>,
}

pub(crate) fn data_path(index_dir: &Path, kind: AnnKind) -> PathBuf {
    index_dir.join(format!("{}.index", kind.as_str()))
}

pub(crate) fn meta_path(index_dir: &Path, kind: AnnKind) -> PathBuf {
    index_dir.join(format!("{}.meta.json", kind.as_str()))
}

/// A persisted candidate generator.
pub(crate) trait AnnBackend {
    /// Serialize an index over the matrix into a payload.
    fn build(&self, matrix: &Array2<f32>, params: &AnnParams) -> Result<Vec<u8>>;

    /// Search a payload, returning `(row, raw_score)` with raw scores in
    /// cosine-similarity space, best first.
    fn search(&self, payload: &[u8], query: &[f32], k: usize) -> Result<Vec<(usize, f32)>>;
}

fn backend(kind: AnnKind) -> Box<dyn AnnBackend> {
    match kind {
        AnnKind::Flat => Box::new(crate::ann_flat::FlatBackend),
        AnnKind::Graph => Box::new(crate::ann_graph::GraphBackend),
        AnnKind::Tree => Box::new(crate::ann_tree::TreeBackend),
    }
}

/// Build (or rebuild) a backend over the store's current matrix.
///
/// Returns `false` without touching disk when the store is empty.
pub fn build_ann(store: &IndexStore, kind: AnnKind, params: &AnnParams) -> Result<bool> {
    let state = store.state();
    let Some(matrix) = state.embeddings.as_ref() else {
        return Ok(false);
    };
    if matrix.nrows() == 0 {
        return Ok(false);
    }

    let payload = backend(kind).build(matrix, params)?;
    let data = data_path(store.index_dir(), kind);
    let tmp = tmp_sibling(&data);
    std::fs::write(&tmp, &payload)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &data)
        .with_context(|| format!("failed to publish {}", data.display()))?;

    let meta = AnnMeta {
        dim: matrix.ncols(),
        size: matrix.nrows(),
        snapshot: state.snapshot,
        m: (kind == AnnKind::Graph).then_some(params.m),
        ef_construction: (kind == AnnKind::Graph).then_some(params.ef_construction),
        ef_search: (kind == AnnKind::Graph).then_some(params.ef_search),
        trees: (kind == AnnKind::Tree).then_some(params.trees),
    };
    crate::store::write_json_atomic(&meta_path(store.index_dir(), kind), &meta)?;
    tracing::info!(
        "built {} ann over {} rows (snapshot {})",
        kind.as_str(),
        meta.size,
        meta.snapshot
    );
    Ok(true)
}

/// Report whether a backend snapshot exists and is still trustworthy.
pub fn ann_status(store: &IndexStore, kind: AnnKind) -> AnnStatus {
    let index_dir = store.index_dir();
    if !data_path(index_dir, kind).exists() {
        return AnnStatus {
            exists: false,
            meta: None,
        };
    }
    let meta: Option<AnnMeta> =
        crate::store::read_json_file(&meta_path(index_dir, kind)).unwrap_or_default();
    let Some(meta) = meta else {
        return AnnStatus {
            exists: false,
            meta: None,
        };
    };

    let state = store.state();
    let fresh = state.dim() == Some(meta.dim)
        && state.len() == meta.size
        && state.snapshot == meta.snapshot;
    AnnStatus {
        exists: fresh,
        meta: Some(meta),
    }
}

/// Search a backend snapshot, returning `(row, raw_score)` candidates.
///
/// Fails with [`CoreError::AnnUnavailable`] when the snapshot is missing or
/// stale; the search layer treats that as "fall back to exact".
pub fn ann_search(
    store: &IndexStore,
    kind: AnnKind,
    query: &[f32],
    k: usize,
) -> Result<Vec<(usize, f32)>> {
    let status = ann_status(store, kind);
    if !status.exists {
        return Err(CoreError::AnnUnavailable(format!(
            "{} index absent or stale for {}",
            kind.as_str(),
            store.index_dir().display()
        ))
        .into());
    }
    let size = status.meta.as_ref().map(|m| m.size).unwrap_or(0);
    let payload = std::fs::read(data_path(store.index_dir(), kind))
        .with_context(|| format!("failed to read {} index", kind.as_str()))?;
    backend(kind).search(&payload, query, k.clamp(1, size.max(1)))
}

/// Remove a backend snapshot, if present.
pub fn drop_ann(store: &IndexStore, kind: AnnKind) -> Result<()> {
    for path in [
        data_path(store.index_dir(), kind),
        meta_path(store.index_dir(), kind),
    ] {
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexStore, UpsertOptions};
    use crate::testing::{mock_root, MockEmbedder};

    fn built_store() -> (crate::testing::MockRoot, IndexStore, MockEmbedder) {
        let root = mock_root(&["a.jpg", "b.jpg", "c.jpg"]);
        let mut embedder = MockEmbedder::new(4)
            .with_vector("a.jpg", vec![1.0, 0.0, 0.0, 0.0])
            .with_vector("b.jpg", vec![0.0, 1.0, 0.0, 0.0])
            .with_vector("c.jpg", vec![0.0, 0.0, 1.0, 0.0]);
        let mut store = IndexStore::open(root.path(), "mock").unwrap();
        store
            .upsert(&mut embedder, &root.photos(), &UpsertOptions::default())
            .unwrap();
        (root, store, embedder)
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("graph".parse::<AnnKind>().unwrap(), AnnKind::Graph);
        assert_eq!("FLAT".parse::<AnnKind>().unwrap(), AnnKind::Flat);
        assert!("lsh".parse::<AnnKind>().is_err());
    }

    #[test]
    fn test_build_and_status_all_kinds() {
        let (_root, store, _embedder) = built_store();
        for kind in AnnKind::ALL {
            assert!(build_ann(&store, kind, &AnnParams::default()).unwrap());
            let status = ann_status(&store, kind);
            assert!(status.exists, "{} should exist", kind.as_str());
            let meta = status.meta.unwrap();
            assert_eq!(meta.dim, 4);
            assert_eq!(meta.size, 3);
        }
    }

    #[test]
    fn test_empty_store_builds_nothing() {
        let root = mock_root(&[]);
        let store = IndexStore::open(root.path(), "mock").unwrap();
        assert!(!build_ann(&store, AnnKind::Flat, &AnnParams::default()).unwrap());
        assert!(!ann_status(&store, AnnKind::Flat).exists);
    }

    #[test]
    fn test_upsert_invalidates_snapshot() {
        let (root, mut store, mut embedder) = built_store();
        build_ann(&store, AnnKind::Graph, &AnnParams::default()).unwrap();
        assert!(ann_status(&store, AnnKind::Graph).exists);

        let mut photos = root.photos();
        photos[0].mtime += 5.0;
        store
            .upsert(&mut embedder, &photos, &UpsertOptions::default())
            .unwrap();

        // Same size, but the snapshot counter moved on.
        assert!(!ann_status(&store, AnnKind::Graph).exists);
        assert!(ann_search(&store, AnnKind::Graph, &[1.0, 0.0, 0.0, 0.0], 2).is_err());

        build_ann(&store, AnnKind::Graph, &AnnParams::default()).unwrap();
        assert!(ann_status(&store, AnnKind::Graph).exists);
    }

    #[test]
    fn test_search_returns_best_candidate_first() {
        let (_root, store, _embedder) = built_store();
        for kind in AnnKind::ALL {
            build_ann(&store, kind, &AnnParams::default()).unwrap();
            let hits = ann_search(&store, kind, &[0.9, 0.1, 0.0, 0.0], 2).unwrap();
            assert!(!hits.is_empty(), "{} returned nothing", kind.as_str());
            assert_eq!(hits[0].0, 0, "{} top candidate wrong", kind.as_str());
            assert!(hits.len() <= 2);
        }
    }

    #[test]
    fn test_rebuild_meta_is_byte_identical() {
        let (_root, store, _embedder) = built_store();
        build_ann(&store, AnnKind::Tree, &AnnParams::default()).unwrap();
        let first = std::fs::read(meta_path(store.index_dir(), AnnKind::Tree)).unwrap();
        build_ann(&store, AnnKind::Tree, &AnnParams::default()).unwrap();
        let second = std::fs::read(meta_path(store.index_dir(), AnnKind::Tree)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_drop_ann() {
        let (_root, store, _embedder) = built_store();
        build_ann(&store, AnnKind::Flat, &AnnParams::default()).unwrap();
        drop_ann(&store, AnnKind::Flat).unwrap();
        assert!(!ann_status(&store, AnnKind::Flat).exists);
        assert!(!data_path(store.index_dir(), AnnKind::Flat).exists());
    }
}

//! Face index: detection, quality gating and clustering
//!
//! Face detection and per-face embedding are an external capability behind
//! [`FaceDetector`]. The core filters detections through a blur × size
//! quality score, clusters the surviving embeddings with a density-based
//! pass over cosine distance, and persists:
//!
//! - `faces/embeddings.npy`: the `(M, D_face)` face matrix
//! - `faces/faces.json`: per-photo face lists, cluster membership and
//!   user-assigned cluster names
//!
//! Cluster ids are plain integers; merge keeps the target id and split
//! allocates `max(existing) + 1`.

use anyhow::Result;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::exif::laplacian_variance;
use crate::matrix::{l2_normalize, load_matrix, save_matrix};
use crate::progress::{CancelFlag, JobKind, JobTracker};
use crate::store::{read_json_file, write_json_atomic, IndexStore};

pub const FACES_DIR: &str = "faces";
pub const FACES_FILE: &str = "faces.json";
pub const FACE_EMBEDDINGS_FILE: &str = "embeddings.npy";

/// Laplacian variance at which a face crop counts as fully sharp.
const BLUR_REFERENCE: f64 = 500.0;

/// Face-to-image area ratio at which a face counts as fully sized.
const SIZE_REFERENCE: f64 = 0.05;

/// Quality assigned when the photo cannot be re-decoded for scoring.
const FALLBACK_QUALITY: f32 = 0.5;

/// Axis-aligned face box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// One detection returned by the external capability.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub embedding: Vec<f32>,
}

/// Face detection + embedding capability (external model).
pub trait FaceDetector {
    /// Face embedding dimension `D_face`.
    fn dim(&self) -> usize;

    /// Detect faces and embed each one.
    fn detect(&mut self, path: &Path) -> Result<Vec<DetectedFace>>;
}

/// One face as stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceRef {
    /// Row in the face embedding matrix.
    pub row: usize,
    pub bbox: FaceBox,
    /// Cluster membership; `None` for noise points.
    pub cluster: Option<u32>,
    pub quality: f32,
}

/// Persisted face index (`faces/faces.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaceIndex {
    /// Per-photo face lists.
    pub photos: BTreeMap<String, Vec<FaceRef>>,
    /// Cluster id → member faces as `(path, index into photos[path])`.
    pub clusters: BTreeMap<u32, Vec<(String, usize)>>,
    /// User-assigned cluster names.
    pub names: BTreeMap<u32, String>,
}

impl FaceIndex {
    fn next_cluster_id(&self) -> u32 {
        self.clusters.keys().max().map(|&id| id + 1).unwrap_or(0)
    }

    /// Rebuild the cluster → members map from the photo lists.
    fn reindex_clusters(&mut self) {
        self.clusters.clear();
        for (path, faces) in &self.photos {
            for (idx, face) in faces.iter().enumerate() {
                if let Some(cluster) = face.cluster {
                    self.clusters
                        .entry(cluster)
                        .or_default()
                        .push((path.clone(), idx));
                }
            }
        }
        self.names.retain(|id, _| self.clusters.contains_key(id));
    }
}

/// Tuning for [`build_faces`].
#[derive(Debug, Clone, Copy)]
pub struct FaceBuildParams {
    /// Minimum faces for a valid cluster (DBSCAN `min_pts`).
    pub min_cluster_size: usize,
    /// Cosine similarity above which two faces are neighbors.
    pub similarity_threshold: f32,
    /// Detections below this quality score are discarded.
    pub quality_threshold: f32,
}

impl Default for FaceBuildParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            similarity_threshold: 0.6,
            quality_threshold: 0.3,
        }
    }
}

/// Outcome of a face build.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaceBuildStats {
    /// Photos processed.
    pub updated: usize,
    /// Faces kept after the quality gate.
    pub faces: usize,
    /// Clusters found.
    pub clusters: usize,
}

fn faces_dir(index_dir: &Path) -> PathBuf {
    index_dir.join(FACES_DIR)
}

fn faces_file(index_dir: &Path) -> PathBuf {
    faces_dir(index_dir).join(FACES_FILE)
}

fn embeddings_file(index_dir: &Path) -> PathBuf {
    faces_dir(index_dir).join(FACE_EMBEDDINGS_FILE)
}

/// Detect, score, cluster and persist faces for every indexed photo.
///
/// Rebuilds the face index from scratch; existing cluster names are carried
/// over by id where the id survives.
pub fn build_faces(
    store: &IndexStore,
    detector: &mut dyn FaceDetector,
    params: &FaceBuildParams,
    cancel: CancelFlag,
) -> Result<FaceBuildStats> {
    let state = store.state();
    let index_dir = store.index_dir();
    let mut tracker =
        JobTracker::with_cancel(index_dir, JobKind::Faces, state.len(), 0, cancel);

    let previous_names = load_faces(index_dir)?.map(|f| f.names).unwrap_or_default();

    let mut index = FaceIndex::default();
    let mut flat: Vec<f32> = Vec::new();
    let mut face_count = 0usize;
    let mut stats = FaceBuildStats::default();

    for path in &state.paths {
        if !tracker.checkpoint() {
            return Ok(stats);
        }
        let detections = match detector.detect(Path::new(path)) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("face detection failed for {path}: {e}");
                Vec::new()
            }
        };

        let gray = image::open(path).ok().map(|img| img.to_luma8());
        let mut faces = Vec::new();
        for detection in detections {
            if detection.embedding.len() != detector.dim() {
                tracing::warn!(
                    "dropping face with dim {} (expected {}) in {path}",
                    detection.embedding.len(),
                    detector.dim()
                );
                continue;
            }
            let quality = gray
                .as_ref()
                .map(|g| face_quality(g, &detection.bbox))
                .unwrap_or(FALLBACK_QUALITY);
            if quality < params.quality_threshold {
                continue;
            }
            let mut embedding = detection.embedding;
            l2_normalize(&mut embedding);
            flat.extend(&embedding);
            faces.push(FaceRef {
                row: face_count,
                bbox: detection.bbox,
                cluster: None,
                quality,
            });
            face_count += 1;
        }
        if !faces.is_empty() {
            index.photos.insert(path.clone(), faces);
        }
        stats.updated += 1;
        tracker.update(|s| s.insert_done = stats.updated);
    }
    stats.faces = face_count;

    let matrix = Array2::from_shape_vec((face_count, detector.dim()), flat)?;

    // Density clustering over cosine distance.
    let eps = 1.0 - params.similarity_threshold;
    let labels = dbscan_cosine(&matrix, eps, params.min_cluster_size.max(1));
    for faces in index.photos.values_mut() {
        for face in faces.iter_mut() {
            face.cluster = labels[face.row];
        }
    }
    index.reindex_clusters();
    index.names = previous_names
        .into_iter()
        .filter(|(id, _)| index.clusters.contains_key(id))
        .collect();
    stats.clusters = index.clusters.len();

    std::fs::create_dir_all(faces_dir(index_dir))?;
    save_matrix(&embeddings_file(index_dir), &matrix)?;
    save_faces(index_dir, &index)?;
    tracker.complete();
    Ok(stats)
}

/// Load the persisted face index, if any.
pub fn load_faces(index_dir: &Path) -> Result<Option<FaceIndex>> {
    read_json_file(&faces_file(index_dir))
}

/// Load the face embedding matrix, if any.
pub fn load_face_embeddings(index_dir: &Path) -> Result<Option<Array2<f32>>> {
    let path = embeddings_file(index_dir);
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(load_matrix(&path)?))
}

fn save_faces(index_dir: &Path, index: &FaceIndex) -> Result<()> {
    write_json_atomic(&faces_file(index_dir), index)
}

/// Paths whose photos contain a face from a cluster named `name`.
pub fn photos_of_person(index_dir: &Path, name: &str) -> Result<HashSet<String>> {
    let Some(index) = load_faces(index_dir)? else {
        return Ok(HashSet::new());
    };
    let clusters: HashSet<u32> = index
        .names
        .iter()
        .filter(|(_, n)| n.as_str() == name)
        .map(|(&id, _)| id)
        .collect();
    Ok(index
        .clusters
        .iter()
        .filter(|(id, _)| clusters.contains(id))
        .flat_map(|(_, members)| members.iter().map(|(path, _)| path.clone()))
        .collect())
}

/// Assign a display name to a cluster.
pub fn set_cluster_name(index_dir: &Path, cluster: u32, name: &str) -> Result<()> {
    let mut index = load_faces(index_dir)?.unwrap_or_default();
    if !index.clusters.contains_key(&cluster) {
        return Err(CoreError::InvalidArgument(format!("no cluster {cluster}")).into());
    }
    index.names.insert(cluster, name.to_string());
    save_faces(index_dir, &index)
}

/// Reassign every face in cluster `a` to cluster `b` and delete `a`.
pub fn merge_clusters(index_dir: &Path, a: u32, b: u32) -> Result<()> {
    let mut index = load_faces(index_dir)?.unwrap_or_default();
    if !index.clusters.contains_key(&a) || !index.clusters.contains_key(&b) {
        return Err(
            CoreError::InvalidArgument(format!("cannot merge {a} into {b}: unknown cluster")).into(),
        );
    }
    for faces in index.photos.values_mut() {
        for face in faces.iter_mut() {
            if face.cluster == Some(a) {
                face.cluster = Some(b);
            }
        }
    }
    index.names.remove(&a);
    index.reindex_clusters();
    save_faces(index_dir, &index)
}

/// Extract the given faces of a cluster into a brand-new cluster.
///
/// Faces are addressed as `(path, index into photos[path])`; the new id is
/// `max(existing ids) + 1` and is returned.
pub fn split_cluster(index_dir: &Path, cluster: u32, faces: &[(String, usize)]) -> Result<u32> {
    let mut index = load_faces(index_dir)?.unwrap_or_default();
    if !index.clusters.contains_key(&cluster) {
        return Err(CoreError::InvalidArgument(format!("no cluster {cluster}")).into());
    }
    let new_id = index.next_cluster_id();
    let wanted: HashSet<(&str, usize)> = faces.iter().map(|(p, i)| (p.as_str(), *i)).collect();
    let mut moved = 0usize;
    for (path, photo_faces) in index.photos.iter_mut() {
        for (idx, face) in photo_faces.iter_mut().enumerate() {
            if face.cluster == Some(cluster) && wanted.contains(&(path.as_str(), idx)) {
                face.cluster = Some(new_id);
                moved += 1;
            }
        }
    }
    if moved == 0 {
        return Err(CoreError::InvalidArgument("no matching faces to split".into()).into());
    }
    index.reindex_clusters();
    save_faces(index_dir, &index)?;
    Ok(new_id)
}

/// Blur × size quality heuristic in `[0, 1]`.
fn face_quality(gray: &image::GrayImage, bbox: &FaceBox) -> f32 {
    let (img_w, img_h) = gray.dimensions();
    if img_w == 0 || img_h == 0 || bbox.w <= 0.0 || bbox.h <= 0.0 {
        return 0.0;
    }
    let x = (bbox.x.max(0.0) as u32).min(img_w.saturating_sub(1));
    let y = (bbox.y.max(0.0) as u32).min(img_h.saturating_sub(1));
    let w = (bbox.w as u32).min(img_w - x).max(1);
    let h = (bbox.h as u32).min(img_h - y).max(1);

    let crop = image::imageops::crop_imm(gray, x, y, w, h).to_image();
    let blur_score = (laplacian_variance(&crop) / BLUR_REFERENCE).clamp(0.0, 1.0);
    let area_ratio = (w as f64 * h as f64) / (img_w as f64 * img_h as f64);
    let size_score = (area_ratio / SIZE_REFERENCE).clamp(0.0, 1.0);

    (0.4 * blur_score + 0.6 * size_score) as f32
}

/// Plain DBSCAN over cosine distance (`1 - dot` on unit rows).
///
/// Returns one label per row; `None` marks noise.
fn dbscan_cosine(matrix: &Array2<f32>, eps: f32, min_pts: usize) -> Vec<Option<u32>> {
    let n = matrix.nrows();
    let mut labels: Vec<Option<u32>> = vec![None; n];
    let mut visited = vec![false; n];
    let mut next_cluster = 0u32;

    let neighbors = |i: usize| -> Vec<usize> {
        let anchor = matrix.row(i);
        (0..n)
            .filter(|&j| {
                let dot: f32 = anchor
                    .iter()
                    .zip(matrix.row(j).iter())
                    .map(|(a, b)| a * b)
                    .sum();
                1.0 - dot <= eps
            })
            .collect()
    };

    for i in 0..n {
        if visited[i] {
            continue;
        }
        visited[i] = true;
        let seed = neighbors(i);
        if seed.len() < min_pts {
            continue;
        }
        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = Some(cluster);

        let mut frontier: Vec<usize> = seed;
        while let Some(j) = frontier.pop() {
            if labels[j].is_none() {
                labels[j] = Some(cluster);
            }
            if visited[j] {
                continue;
            }
            visited[j] = true;
            let expansion = neighbors(j);
            if expansion.len() >= min_pts {
                frontier.extend(expansion);
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexStore, UpsertOptions};
    use crate::testing::{mock_root, write_png, MockEmbedder};
    use std::collections::HashMap;

    struct StubDetector {
        faces: HashMap<String, Vec<DetectedFace>>,
    }

    impl StubDetector {
        fn new(entries: Vec<(&str, Vec<Vec<f32>>)>) -> Self {
            let faces = entries
                .into_iter()
                .map(|(name, embeddings)| {
                    let detections = embeddings
                        .into_iter()
                        .map(|embedding| DetectedFace {
                            bbox: FaceBox {
                                x: 4.0,
                                y: 4.0,
                                w: 32.0,
                                h: 32.0,
                            },
                            embedding,
                        })
                        .collect();
                    (name.to_string(), detections)
                })
                .collect();
            Self { faces }
        }
    }

    impl FaceDetector for StubDetector {
        fn dim(&self) -> usize {
            4
        }

        fn detect(&mut self, path: &Path) -> Result<Vec<DetectedFace>> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            Ok(self.faces.get(&name).cloned().unwrap_or_default())
        }
    }

    fn face_store(detector_entries: Vec<(&str, Vec<Vec<f32>>)>) -> (crate::testing::MockRoot, IndexStore, StubDetector) {
        let root = mock_root(&[]);
        for (name, _) in &detector_entries {
            write_png(&root.path_of(name), [128, 128, 128], 64);
        }
        let mut embedder = MockEmbedder::new(3);
        let mut store = IndexStore::open(root.path(), "mock").unwrap();
        store
            .upsert(&mut embedder, &root.photos(), &UpsertOptions::default())
            .unwrap();
        let detector = StubDetector::new(detector_entries);
        (root, store, detector)
    }

    #[test]
    fn test_build_and_cluster_faces() {
        let alice = vec![1.0, 0.0, 0.0, 0.0];
        let alice2 = vec![0.98, 0.02, 0.0, 0.0];
        let bob = vec![0.0, 1.0, 0.0, 0.0];
        let (_root, store, mut detector) = face_store(vec![
            ("p1.png", vec![alice.clone()]),
            ("p2.png", vec![alice2, bob.clone()]),
            ("p3.png", vec![bob.clone()]),
        ]);

        let params = FaceBuildParams {
            min_cluster_size: 2,
            ..FaceBuildParams::default()
        };
        let stats = build_faces(&store, &mut detector, &params, CancelFlag::new()).unwrap();
        assert_eq!(stats.updated, 3);
        assert_eq!(stats.faces, 4);
        assert_eq!(stats.clusters, 2);

        let index = load_faces(store.index_dir()).unwrap().unwrap();
        assert_eq!(index.photos.len(), 3);
        let matrix = load_face_embeddings(store.index_dir()).unwrap().unwrap();
        assert_eq!(matrix.nrows(), 4);
        assert_eq!(matrix.ncols(), 4);

        // The two alice faces share a cluster; bob has his own.
        let p1 = index.photos.keys().find(|p| p.ends_with("p1.png")).unwrap();
        let p3 = index.photos.keys().find(|p| p.ends_with("p3.png")).unwrap();
        let alice_cluster = index.photos[p1][0].cluster.unwrap();
        let bob_cluster = index.photos[p3][0].cluster.unwrap();
        assert_ne!(alice_cluster, bob_cluster);
    }

    #[test]
    fn test_person_lookup_by_name() {
        let v = vec![0.0, 0.0, 1.0, 0.0];
        let (_root, store, mut detector) = face_store(vec![
            ("a.png", vec![v.clone()]),
            ("b.png", vec![v.clone()]),
        ]);
        let params = FaceBuildParams {
            min_cluster_size: 2,
            ..FaceBuildParams::default()
        };
        build_faces(&store, &mut detector, &params, CancelFlag::new()).unwrap();

        let index = load_faces(store.index_dir()).unwrap().unwrap();
        let cluster = *index.clusters.keys().next().unwrap();
        set_cluster_name(store.index_dir(), cluster, "Ada").unwrap();

        let photos = photos_of_person(store.index_dir(), "Ada").unwrap();
        assert_eq!(photos.len(), 2);
        assert!(photos_of_person(store.index_dir(), "Grace").unwrap().is_empty());
    }

    #[test]
    fn test_merge_and_split() {
        let a = vec![1.0, 0.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0, 0.0];
        let (_root, store, mut detector) = face_store(vec![
            ("a1.png", vec![a.clone()]),
            ("a2.png", vec![a.clone()]),
            ("b1.png", vec![b.clone()]),
            ("b2.png", vec![b.clone()]),
        ]);
        let params = FaceBuildParams {
            min_cluster_size: 2,
            ..FaceBuildParams::default()
        };
        build_faces(&store, &mut detector, &params, CancelFlag::new()).unwrap();

        let index = load_faces(store.index_dir()).unwrap().unwrap();
        let ids: Vec<u32> = index.clusters.keys().copied().collect();
        assert_eq!(ids.len(), 2);

        merge_clusters(store.index_dir(), ids[0], ids[1]).unwrap();
        let merged = load_faces(store.index_dir()).unwrap().unwrap();
        assert_eq!(merged.clusters.len(), 1);
        assert_eq!(merged.clusters[&ids[1]].len(), 4);

        // Split two faces back out; new id is max + 1.
        let members: Vec<(String, usize)> = merged.clusters[&ids[1]]
            .iter()
            .filter(|(p, _)| p.ends_with("a1.png") || p.ends_with("a2.png"))
            .cloned()
            .collect();
        let new_id = split_cluster(store.index_dir(), ids[1], &members).unwrap();
        assert_eq!(new_id, ids[1] + 1);
        let after = load_faces(store.index_dir()).unwrap().unwrap();
        assert_eq!(after.clusters.len(), 2);
        assert_eq!(after.clusters[&new_id].len(), 2);
    }

    #[test]
    fn test_quality_gate_drops_tiny_faces() {
        let (_root, store, _detector) = face_store(vec![("a.png", vec![])]);
        let mut detector = StubDetector::new(vec![(
            "a.png",
            vec![vec![1.0, 0.0, 0.0, 0.0]],
        )]);
        // Shrink the bbox to a sliver: size score collapses, flat image has
        // zero blur score, so quality falls below the gate.
        for faces in detector.faces.values_mut() {
            for face in faces.iter_mut() {
                face.bbox = FaceBox {
                    x: 0.0,
                    y: 0.0,
                    w: 2.0,
                    h: 2.0,
                };
            }
        }
        let stats = build_faces(
            &store,
            &mut detector,
            &FaceBuildParams::default(),
            CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(stats.faces, 0);
    }

    #[test]
    fn test_dbscan_marks_noise() {
        let mut flat = vec![];
        for v in [
            [1.0_f32, 0.0, 0.0, 0.0],
            [0.99, 0.01, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ] {
            let mut v = v.to_vec();
            l2_normalize(&mut v);
            flat.extend(v);
        }
        let matrix = Array2::from_shape_vec((3, 4), flat).unwrap();
        let labels = dbscan_cosine(&matrix, 0.4, 2);
        assert_eq!(labels[0], labels[1]);
        assert!(labels[0].is_some());
        assert_eq!(labels[2], None);
    }
}

//! Embedding matrices and `.npy` persistence
//!
//! The primary index and every auxiliary text-embedding index are dense
//! `(N, D)` f32 matrices with unit-norm rows. A zero row is only meaningful
//! in auxiliary matrices, where it stands for "no text". Matrices persist as
//! NumPy `.npy` files (little-endian, self-describing header), written via
//! temp-file + rename so readers never observe a torn matrix.

use anyhow::{Context, Result};
use ndarray::{Array2, ArrayView1};
use ndarray_npy::{read_npy, write_npy};
use std::path::Path;

/// Allowed deviation from unit length for a normalized row.
pub const NORM_TOLERANCE: f32 = 1e-5;

/// Euclidean norm of a vector.
pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize a vector to unit length in place. Zero vectors stay zero.
pub fn l2_normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v.iter_mut() {
            *x /= n;
        }
    }
}

/// Whether a row is unit-norm within [`NORM_TOLERANCE`].
pub fn is_unit_norm(v: &[f32]) -> bool {
    (norm(v) - 1.0).abs() <= NORM_TOLERANCE
}

/// Dense matrix-vector product `M · q`.
///
/// With unit-norm rows and a unit-norm query this is cosine similarity per
/// row, the single scoring primitive of the search engine.
pub fn matvec(matrix: &Array2<f32>, q: &[f32]) -> Vec<f32> {
    debug_assert_eq!(matrix.ncols(), q.len());
    matrix.dot(&ArrayView1::from(q)).to_vec()
}

/// Build an `(n, dim)` matrix from flat row-major data.
pub fn from_flat(data: Vec<f32>, dim: usize) -> Result<Array2<f32>> {
    anyhow::ensure!(dim > 0, "embedding dimension must be positive");
    anyhow::ensure!(
        data.len() % dim == 0,
        "flat data length {} is not a multiple of dim {dim}",
        data.len()
    );
    let rows = data.len() / dim;
    Array2::from_shape_vec((rows, dim), data).context("matrix shape mismatch")
}

/// Load an `.npy` matrix.
pub fn load_matrix(path: &Path) -> Result<Array2<f32>> {
    read_npy(path).with_context(|| format!("failed to read matrix {}", path.display()))
}

/// Persist a matrix atomically (`.tmp` + rename).
pub fn save_matrix(path: &Path, matrix: &Array2<f32>) -> Result<()> {
    let tmp = tmp_sibling(path);
    write_npy(&tmp, matrix)
        .with_context(|| format!("failed to write matrix {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to publish matrix {}", path.display()))?;
    Ok(())
}

pub(crate) fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_normalize_and_norm() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!(is_unit_norm(&v));
        assert!((v[0] - 0.6).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
        assert!(!is_unit_norm(&zero));
    }

    #[test]
    fn test_matvec_is_per_row_dot() {
        let m = array![[1.0_f32, 0.0], [0.0, 1.0], [0.6, 0.8]];
        let scores = matvec(&m, &[1.0, 0.0]);
        assert_eq!(scores.len(), 3);
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert!((scores[1]).abs() < 1e-6);
        assert!((scores[2] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_from_flat_validates_shape() {
        let m = from_flat(vec![1.0, 0.0, 0.0, 1.0], 2).unwrap();
        assert_eq!(m.nrows(), 2);
        assert!(from_flat(vec![1.0, 2.0, 3.0], 2).is_err());
        assert!(from_flat(vec![], 0).is_err());
    }

    #[test]
    fn test_npy_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.npy");
        let m = array![[0.1_f32, 0.2, 0.3], [0.4, 0.5, 0.6]];
        save_matrix(&path, &m).unwrap();
        let loaded = load_matrix(&path).unwrap();
        assert_eq!(loaded, m);
        // No leftover temp file after publication.
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn test_load_missing_matrix_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_matrix(&dir.path().join("nope.npy")).is_err());
    }
}

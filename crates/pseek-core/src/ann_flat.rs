//! Flat inner-product backend
//!
//! The simplest backend: the payload is the matrix itself and search is a
//! dense scan. On unit-norm rows inner product equals cosine similarity, so
//! this backend is exact; it exists so callers can keep one code path for
//! all three kinds and because a persisted copy can be searched without
//! loading the primary store.

use anyhow::{Context, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::ann::{AnnBackend, AnnParams};

#[derive(Serialize, Deserialize)]
struct FlatIndex {
    dim: usize,
    vectors: Vec<f32>,
}

impl FlatIndex {
    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.vectors.len() / self.dim
        }
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dim..(i + 1) * self.dim]
    }
}

pub(crate) struct FlatBackend;

impl AnnBackend for FlatBackend {
    fn build(&self, matrix: &Array2<f32>, _params: &AnnParams) -> Result<Vec<u8>> {
        let index = FlatIndex {
            dim: matrix.ncols(),
            vectors: matrix.iter().copied().collect(),
        };
        bincode::serialize(&index).context("failed to serialize flat index")
    }

    fn search(&self, payload: &[u8], query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        let index: FlatIndex =
            bincode::deserialize(payload).context("failed to deserialize flat index")?;
        anyhow::ensure!(
            query.len() == index.dim,
            "query dim {} does not match index dim {}",
            query.len(),
            index.dim
        );

        let mut scored: Vec<(usize, f32)> = (0..index.len())
            .map(|i| {
                let ip: f32 = index
                    .row(i)
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                (i, ip)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_flat_roundtrip_and_order() {
        let matrix = array![
            [1.0_f32, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.70710677, 0.70710677, 0.0],
        ];
        let payload = FlatBackend.build(&matrix, &AnnParams::default()).unwrap();
        let hits = FlatBackend.search(&payload, &[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, 0);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].0, 2);
    }

    #[test]
    fn test_flat_truncates_to_k() {
        let matrix = array![[1.0_f32, 0.0], [0.0, 1.0]];
        let payload = FlatBackend.build(&matrix, &AnnParams::default()).unwrap();
        let hits = FlatBackend.search(&payload, &[1.0, 0.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_flat_rejects_wrong_dim() {
        let matrix = array![[1.0_f32, 0.0]];
        let payload = FlatBackend.build(&matrix, &AnnParams::default()).unwrap();
        assert!(FlatBackend.search(&payload, &[1.0, 0.0, 0.0], 1).is_err());
    }
}

//! HNSW-style graph backend (cosine space)
//!
//! Layered navigable small-world graph after Malkov & Yashunin (2018):
//! upper layers hold an exponentially thinning sample of rows for long
//! hops, layer 0 holds every row. Insertion picks a random layer, walks
//! greedily down from the entry point, then links the node to its best
//! neighbors per layer with capacity pruning.
//!
//! Rows are unit-norm so the inner product is cosine similarity; the raw
//! scores returned are `1 - cosine_distance`. Layer assignment uses a
//! seeded RNG, making rebuilds over an unchanged matrix reproducible.

use anyhow::{Context, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::ann::{AnnBackend, AnnParams};

/// Seed base for layer assignment; combined with the matrix shape.
const LAYER_SEED: u64 = 0x5eed_c0de;

#[derive(Serialize, Deserialize, Clone, Default)]
struct GraphNode {
    /// Neighbor lists, one per layer the node participates in.
    neighbors: Vec<Vec<u32>>,
}

#[derive(Serialize, Deserialize)]
struct GraphIndex {
    dim: usize,
    vectors: Vec<f32>,
    nodes: Vec<GraphNode>,
    entry_point: Option<usize>,
    top_layer: usize,
    m: usize,
    m0: usize,
    ef_search: usize,
}

impl GraphIndex {
    fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dim..(i + 1) * self.dim]
    }

    fn similarity(&self, i: usize, query: &[f32]) -> f32 {
        dot(self.row(i), query)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Max-heap candidate: best score pops first.
#[derive(Clone, Copy, PartialEq)]
struct Best(f32, usize);

impl Eq for Best {}

impl PartialOrd for Best {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Best {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// Min-heap candidate: worst score pops first, for result pruning.
#[derive(Clone, Copy, PartialEq)]
struct Worst(f32, usize);

impl Eq for Worst {}

impl PartialOrd for Worst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Worst {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.partial_cmp(&self.0).unwrap_or(Ordering::Equal)
    }
}

struct GraphBuilder {
    index: GraphIndex,
    ef_construction: usize,
    level_mult: f32,
    rng: StdRng,
}

impl GraphBuilder {
    fn new(matrix: &Array2<f32>, params: &AnnParams) -> Self {
        let m = params.m.max(2);
        let seed = LAYER_SEED ^ (matrix.nrows() as u64) ^ ((matrix.ncols() as u64) << 32);
        Self {
            index: GraphIndex {
                dim: matrix.ncols(),
                vectors: matrix.iter().copied().collect(),
                nodes: vec![GraphNode::default(); matrix.nrows()],
                entry_point: None,
                top_layer: 0,
                m,
                m0: m * 2,
                ef_search: params.ef_search.max(1),
            },
            ef_construction: params.ef_construction.max(m),
            level_mult: 1.0 / (m as f32).ln(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn random_layer(&mut self) -> usize {
        let r: f32 = self.rng.random::<f32>().max(f32::MIN_POSITIVE);
        (-r.ln() * self.level_mult).floor() as usize
    }

    fn insert(&mut self, id: usize) {
        let layer = self.random_layer();
        self.index.nodes[id].neighbors = vec![Vec::new(); layer + 1];

        let Some(entry) = self.index.entry_point else {
            self.index.entry_point = Some(id);
            self.index.top_layer = layer;
            return;
        };

        let query: Vec<f32> = self.index.row(id).to_vec();
        let mut ep = entry;
        for l in ((layer + 1)..=self.index.top_layer).rev() {
            ep = greedy_descend(&self.index, &query, ep, l);
        }

        for l in (0..=layer.min(self.index.top_layer)).rev() {
            let found = search_layer(&self.index, &query, ep, self.ef_construction, l);
            let cap = if l == 0 { self.index.m0 } else { self.index.m };
            let chosen: Vec<u32> = found.iter().take(cap).map(|&(_, n)| n as u32).collect();
            self.index.nodes[id].neighbors[l] = chosen.clone();

            for &neighbor in &chosen {
                let neighbor = neighbor as usize;
                if l >= self.index.nodes[neighbor].neighbors.len() {
                    continue;
                }
                self.index.nodes[neighbor].neighbors[l].push(id as u32);
                if self.index.nodes[neighbor].neighbors[l].len() > cap {
                    self.prune_neighbors(neighbor, l, cap);
                }
            }
            if let Some(&(_, best)) = found.first() {
                ep = best;
            }
        }

        if layer > self.index.top_layer {
            self.index.top_layer = layer;
            self.index.entry_point = Some(id);
        }
    }

    /// Keep only the highest-similarity links when a node is over capacity.
    fn prune_neighbors(&mut self, node: usize, layer: usize, cap: usize) {
        let anchor: Vec<f32> = self.index.row(node).to_vec();
        let mut scored: Vec<(f32, u32)> = self.index.nodes[node].neighbors[layer]
            .iter()
            .map(|&n| (self.index.similarity(n as usize, &anchor), n))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored.truncate(cap);
        self.index.nodes[node].neighbors[layer] = scored.into_iter().map(|(_, n)| n).collect();
    }
}

/// Greedy single-best walk within one layer.
fn greedy_descend(index: &GraphIndex, query: &[f32], entry: usize, layer: usize) -> usize {
    let mut current = entry;
    let mut current_sim = index.similarity(current, query);
    loop {
        let mut moved = false;
        if layer < index.nodes[current].neighbors.len() {
            for &n in &index.nodes[current].neighbors[layer] {
                let sim = index.similarity(n as usize, query);
                if sim > current_sim {
                    current = n as usize;
                    current_sim = sim;
                    moved = true;
                }
            }
        }
        if !moved {
            return current;
        }
    }
}

/// Beam search within one layer; results sorted best-first.
fn search_layer(
    index: &GraphIndex,
    query: &[f32],
    entry: usize,
    ef: usize,
    layer: usize,
) -> Vec<(f32, usize)> {
    let mut visited: HashSet<usize> = HashSet::new();
    visited.insert(entry);

    let entry_sim = index.similarity(entry, query);
    let mut candidates = BinaryHeap::from([Best(entry_sim, entry)]);
    let mut results = BinaryHeap::from([Worst(entry_sim, entry)]);

    while let Some(Best(sim, node)) = candidates.pop() {
        let floor = results.peek().map(|w| w.0).unwrap_or(f32::NEG_INFINITY);
        if sim < floor && results.len() >= ef {
            break;
        }
        if layer >= index.nodes[node].neighbors.len() {
            continue;
        }
        for &n in &index.nodes[node].neighbors[layer] {
            let n = n as usize;
            if !visited.insert(n) {
                continue;
            }
            let n_sim = index.similarity(n, query);
            let floor = results.peek().map(|w| w.0).unwrap_or(f32::NEG_INFINITY);
            if n_sim > floor || results.len() < ef {
                candidates.push(Best(n_sim, n));
                results.push(Worst(n_sim, n));
                if results.len() > ef {
                    results.pop();
                }
            }
        }
    }

    let mut out: Vec<(f32, usize)> = results.into_iter().map(|Worst(s, n)| (s, n)).collect();
    out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    out
}

pub(crate) struct GraphBackend;

impl AnnBackend for GraphBackend {
    fn build(&self, matrix: &Array2<f32>, params: &AnnParams) -> Result<Vec<u8>> {
        let mut builder = GraphBuilder::new(matrix, params);
        for id in 0..matrix.nrows() {
            builder.insert(id);
        }
        bincode::serialize(&builder.index).context("failed to serialize graph index")
    }

    fn search(&self, payload: &[u8], query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        let index: GraphIndex =
            bincode::deserialize(payload).context("failed to deserialize graph index")?;
        anyhow::ensure!(
            query.len() == index.dim,
            "query dim {} does not match index dim {}",
            query.len(),
            index.dim
        );
        let Some(entry) = index.entry_point else {
            return Ok(Vec::new());
        };

        let mut ep = entry;
        for layer in (1..=index.top_layer).rev() {
            ep = greedy_descend(&index, query, ep, layer);
        }
        let found = search_layer(&index, query, ep, index.ef_search.max(k), 0);
        Ok(found.into_iter().take(k).map(|(s, n)| (n, s)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::l2_normalize;
    use ndarray::Array2;

    fn unit_matrix(rows: Vec<Vec<f32>>) -> Array2<f32> {
        let dim = rows[0].len();
        let mut flat = Vec::new();
        for mut row in rows {
            l2_normalize(&mut row);
            flat.extend(row);
        }
        Array2::from_shape_vec((flat.len() / dim, dim), flat).unwrap()
    }

    #[test]
    fn test_graph_finds_nearest() {
        let matrix = unit_matrix(vec![
            vec![1.0, 0.0, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ]);
        let payload = GraphBackend.build(&matrix, &AnnParams::default()).unwrap();
        let hits = GraphBackend
            .search(&payload, &[0.95, 0.05, 0.0], 2)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].0 == 0 || hits[0].0 == 1);
        assert!(hits[0].1 >= hits[1].1);
    }

    #[test]
    fn test_graph_self_query_recovers_row() {
        let rows: Vec<Vec<f32>> = (0..40)
            .map(|i| {
                let mut v = vec![0.0_f32; 8];
                v[i % 8] = 1.0;
                v[(i + 3) % 8] = (i as f32 % 5.0) / 10.0;
                v
            })
            .collect();
        let matrix = unit_matrix(rows);
        let payload = GraphBackend.build(&matrix, &AnnParams::default()).unwrap();

        for i in 0..matrix.nrows() {
            let q: Vec<f32> = matrix.row(i).to_vec();
            let hits = GraphBackend.search(&payload, &q, 5).unwrap();
            assert!(
                hits.iter().any(|&(row, _)| matrix.row(row) == matrix.row(i)),
                "row {i} not among its own nearest neighbors"
            );
        }
    }

    #[test]
    fn test_graph_empty_payload_handles_no_entry() {
        let matrix = unit_matrix(vec![vec![1.0, 0.0]]);
        let payload = GraphBackend.build(&matrix, &AnnParams::default()).unwrap();
        let hits = GraphBackend.search(&payload, &[1.0, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
    }

    #[test]
    fn test_graph_deterministic_rebuild() {
        let matrix = unit_matrix(vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.0, 1.0],
        ]);
        let a = GraphBackend.build(&matrix, &AnnParams::default()).unwrap();
        let b = GraphBackend.build(&matrix, &AnnParams::default()).unwrap();
        assert_eq!(a, b);
    }
}

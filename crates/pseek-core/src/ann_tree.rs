//! Angular random-projection forest backend
//!
//! Annoy-style forest: each tree recursively splits the rows by a
//! hyperplane through the midpoint of two sampled rows, stopping at small
//! leaves. A query descends every tree by hyperplane side, with a shared
//! priority queue ordered by margin so near-boundary branches are also
//! explored, then the unioned leaf candidates are scored exactly.
//!
//! Raw scores are angular distances converted to similarity,
//! `sim = 1 - d²/2`, which on unit vectors is exactly the cosine.

use anyhow::{Context, Result};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::ann::{AnnBackend, AnnParams};

/// Rows per leaf before splitting stops.
const LEAF_SIZE: usize = 16;

/// Recursion cap; guards against duplicate-heavy pathological inputs.
const MAX_DEPTH: usize = 48;

/// Seed base for hyperplane sampling; combined with tree id and shape.
const FOREST_SEED: u64 = 0x7ee5_a11d;

#[derive(Serialize, Deserialize)]
enum TreeNode {
    Split {
        normal: Vec<f32>,
        offset: f32,
        /// Child for `normal·x < offset`.
        below: u32,
        /// Child for `normal·x >= offset`.
        above: u32,
    },
    Leaf {
        items: Vec<u32>,
    },
}

#[derive(Serialize, Deserialize)]
struct ForestIndex {
    dim: usize,
    vectors: Vec<f32>,
    /// One shared node arena; `roots[t]` is the root of tree `t`.
    nodes: Vec<TreeNode>,
    roots: Vec<u32>,
}

fn row(vectors: &[f32], dim: usize, i: usize) -> &[f32] {
    &vectors[i * dim..(i + 1) * dim]
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Recursively split `items`, returning the arena index of the subtree.
fn split_items(
    vectors: &[f32],
    dim: usize,
    nodes: &mut Vec<TreeNode>,
    rng: &mut StdRng,
    items: Vec<u32>,
    depth: usize,
) -> u32 {
    if items.len() <= LEAF_SIZE || depth > MAX_DEPTH {
        nodes.push(TreeNode::Leaf { items });
        return (nodes.len() - 1) as u32;
    }

    let (normal, offset) = pick_hyperplane(vectors, dim, rng, &items);
    let mut below = Vec::new();
    let mut above = Vec::new();
    for &item in &items {
        if dot(row(vectors, dim, item as usize), &normal) < offset {
            below.push(item);
        } else {
            above.push(item);
        }
    }

    // A degenerate split learns nothing; stop here.
    if below.is_empty() || above.is_empty() {
        nodes.push(TreeNode::Leaf { items });
        return (nodes.len() - 1) as u32;
    }

    let below_id = split_items(vectors, dim, nodes, rng, below, depth + 1);
    let above_id = split_items(vectors, dim, nodes, rng, above, depth + 1);
    nodes.push(TreeNode::Split {
        normal,
        offset,
        below: below_id,
        above: above_id,
    });
    (nodes.len() - 1) as u32
}

/// Hyperplane through the midpoint of two sampled rows.
fn pick_hyperplane(
    vectors: &[f32],
    dim: usize,
    rng: &mut StdRng,
    items: &[u32],
) -> (Vec<f32>, f32) {
    let a = items[rng.random_range(0..items.len())] as usize;
    let mut b = items[rng.random_range(0..items.len())] as usize;
    for _ in 0..4 {
        if b != a {
            break;
        }
        b = items[rng.random_range(0..items.len())] as usize;
    }

    let va = row(vectors, dim, a);
    let vb = row(vectors, dim, b);
    let mut normal: Vec<f32> = va.iter().zip(vb.iter()).map(|(x, y)| x - y).collect();
    crate::matrix::l2_normalize(&mut normal);
    if crate::matrix::norm(&normal) == 0.0 {
        // Identical samples; fall back to a random axis.
        let axis = rng.random_range(0..dim);
        normal = vec![0.0; dim];
        normal[axis] = 1.0;
    }
    let midpoint: Vec<f32> = va.iter().zip(vb.iter()).map(|(x, y)| (x + y) / 2.0).collect();
    let offset = dot(&normal, &midpoint);
    (normal, offset)
}

/// Priority-queue entry for forest traversal, ordered by margin.
#[derive(Clone, Copy, PartialEq)]
struct Frontier(f32, u32);

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

pub(crate) struct TreeBackend;

impl AnnBackend for TreeBackend {
    fn build(&self, matrix: &Array2<f32>, params: &AnnParams) -> Result<Vec<u8>> {
        let trees = params.trees.max(1);
        let mut index = ForestIndex {
            dim: matrix.ncols(),
            vectors: matrix.iter().copied().collect(),
            nodes: Vec::new(),
            roots: Vec::with_capacity(trees),
        };

        let ForestIndex {
            dim,
            vectors,
            nodes,
            roots,
        } = &mut index;
        for tree in 0..trees {
            let seed = FOREST_SEED
                ^ (tree as u64)
                ^ ((matrix.nrows() as u64) << 16)
                ^ ((matrix.ncols() as u64) << 48);
            let mut rng = StdRng::seed_from_u64(seed);
            let items: Vec<u32> = (0..matrix.nrows() as u32).collect();
            let root = split_items(vectors, *dim, nodes, &mut rng, items, 0);
            roots.push(root);
        }

        bincode::serialize(&index).context("failed to serialize tree index")
    }

    fn search(&self, payload: &[u8], query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        let index: ForestIndex =
            bincode::deserialize(payload).context("failed to deserialize tree index")?;
        anyhow::ensure!(
            query.len() == index.dim,
            "query dim {} does not match index dim {}",
            query.len(),
            index.dim
        );

        // Explore until we have seen a healthy multiple of k candidates.
        let want = (k * index.roots.len().max(1) * 2).max(k);
        let mut frontier: BinaryHeap<Frontier> = index
            .roots
            .iter()
            .map(|&root| Frontier(f32::INFINITY, root))
            .collect();
        let mut candidates: HashSet<u32> = HashSet::new();

        while let Some(Frontier(margin, node)) = frontier.pop() {
            match &index.nodes[node as usize] {
                TreeNode::Leaf { items } => {
                    candidates.extend(items.iter().copied());
                    if candidates.len() >= want {
                        break;
                    }
                }
                TreeNode::Split {
                    normal,
                    offset,
                    below,
                    above,
                } => {
                    let side = dot(query, normal) - offset;
                    let (near, far) = if side < 0.0 {
                        (*below, *above)
                    } else {
                        (*above, *below)
                    };
                    frontier.push(Frontier(margin, near));
                    frontier.push(Frontier(margin.min(side.abs()), far));
                }
            }
        }

        let mut scored: Vec<(usize, f32)> = candidates
            .into_iter()
            .map(|item| {
                let cos = dot(row(&index.vectors, index.dim, item as usize), query);
                // Angular distance d = sqrt(2 - 2cos); report 1 - d²/2.
                let d2 = (2.0 - 2.0 * cos).max(0.0);
                (item as usize, 1.0 - d2 / 2.0)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

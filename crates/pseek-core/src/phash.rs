//! Perceptual hashes and look-alike groups
//!
//! A 64-bit gradient hash per photo, cached in `phash.json` as hex. Photos
//! whose pairwise Hamming distance stays under a threshold are grouped with
//! union-find into look-alike groups. Group ids are content-derived (xxh3
//! of the sorted member paths), so the same set of photos always forms the
//! same group; ids the user has acknowledged live in `dupes_resolved.json`.

use anyhow::Result;
use img_hash::{HashAlg, HasherConfig};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::progress::{CancelFlag, JobKind, JobTracker};
use crate::store::{read_json_file, write_json_atomic, IndexStore};

pub const PHASH_FILE: &str = "phash.json";
pub const RESOLVED_FILE: &str = "dupes_resolved.json";

/// Hash grid side; 8×8 bits = 64-bit hashes.
const HASH_SIZE: u32 = 8;

/// One group of near-duplicate photos.
#[derive(Debug, Clone)]
pub struct LookalikeGroup {
    /// Deterministic id derived from the sorted member paths.
    pub id: String,
    pub paths: Vec<String>,
    /// Whether the user already acknowledged this exact group.
    pub resolved: bool,
}

/// Compute (or refresh) perceptual hashes for every indexed photo.
///
/// Hashes are cached per path; only paths without a cached hash are
/// decoded. Entries for pruned paths are dropped. Returns the number of
/// newly hashed photos.
pub fn build_hashes(store: &IndexStore, cancel: CancelFlag) -> Result<usize> {
    let state = store.state();
    let index_dir = store.index_dir();
    let cached = load_hashes(index_dir)?;

    let mut tracker =
        JobTracker::with_cancel(index_dir, JobKind::Hashes, state.len(), cached.len(), cancel);

    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient)
        .hash_size(HASH_SIZE, HASH_SIZE)
        .to_hasher();

    let mut fresh: BTreeMap<String, u64> = BTreeMap::new();
    let mut updated = 0usize;
    let mut done = 0usize;
    for path in &state.paths {
        if !tracker.checkpoint() {
            return Ok(updated);
        }
        match cached.get(path) {
            Some(&hash) => {
                fresh.insert(path.clone(), hash);
            }
            None => {
                if let Some(hash) = hash_file(&hasher, Path::new(path)) {
                    fresh.insert(path.clone(), hash);
                    updated += 1;
                }
            }
        }
        done += 1;
        tracker.update(|s| {
            s.insert_done = done;
            s.insert_total = state.len();
            s.updated_done = updated;
        });
    }

    let encoded: BTreeMap<&String, String> =
        fresh.iter().map(|(p, h)| (p, format!("{h:016x}"))).collect();
    write_json_atomic(&index_dir.join(PHASH_FILE), &encoded)?;
    tracker.complete();
    Ok(updated)
}

/// The cached hash map, hex-decoded.
pub fn load_hashes(index_dir: &Path) -> Result<BTreeMap<String, u64>> {
    let raw: BTreeMap<String, String> =
        read_json_file(&index_dir.join(PHASH_FILE))?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(p, hex)| u64::from_str_radix(&hex, 16).ok().map(|h| (p, h)))
        .collect())
}

/// Group cached hashes into look-alike sets by Hamming distance.
///
/// Only groups of two or more photos are reported, ordered by their first
/// member path; members within a group are sorted.
pub fn find_lookalikes(index_dir: &Path, max_distance: u32) -> Result<Vec<LookalikeGroup>> {
    let hashes = load_hashes(index_dir)?;
    let resolved = load_resolved(index_dir)?;

    let paths: Vec<&String> = hashes.keys().collect();
    let values: Vec<u64> = paths.iter().map(|p| hashes[*p]).collect();

    let mut uf = UnionFind::new(paths.len());
    for i in 0..paths.len() {
        for j in (i + 1)..paths.len() {
            if (values[i] ^ values[j]).count_ones() <= max_distance {
                uf.union(i, j);
            }
        }
    }

    let mut buckets: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for (i, path) in paths.iter().enumerate() {
        buckets.entry(uf.find(i)).or_default().push((*path).clone());
    }

    let mut groups: Vec<LookalikeGroup> = buckets
        .into_values()
        .filter(|members| members.len() >= 2)
        .map(|mut members| {
            members.sort();
            let id = group_id(&members);
            let resolved = resolved.contains(&id);
            LookalikeGroup {
                id,
                paths: members,
                resolved,
            }
        })
        .collect();
    groups.sort_by(|a, b| a.paths[0].cmp(&b.paths[0]));
    Ok(groups)
}

/// Deterministic group id for a set of paths.
pub fn group_id(paths: &[String]) -> String {
    let mut sorted: Vec<&String> = paths.iter().collect();
    sorted.sort();
    let joined = sorted
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(joined.as_bytes()))
}

/// Mark a group (given by its member paths) as acknowledged.
pub fn resolve_group(index_dir: &Path, paths: &[String]) -> Result<String> {
    let id = group_id(paths);
    let mut resolved = load_resolved(index_dir)?;
    resolved.insert(id.clone());
    let mut ordered: Vec<&String> = resolved.iter().collect();
    ordered.sort();
    write_json_atomic(&index_dir.join(RESOLVED_FILE), &ordered)?;
    Ok(id)
}

fn load_resolved(index_dir: &Path) -> Result<HashSet<String>> {
    Ok(read_json_file::<Vec<String>>(&index_dir.join(RESOLVED_FILE))?
        .unwrap_or_default()
        .into_iter()
        .collect())
}

fn hash_file(hasher: &img_hash::Hasher, path: &Path) -> Option<u64> {
    // img_hash bundles its own image version; decode with that one.
    let img = match img_hash::image::open(path) {
        Ok(img) => img,
        Err(e) => {
            tracing::warn!("failed to decode {} for hashing: {e}", path.display());
            return None;
        }
    };
    let hash = hasher.hash_image(&img);
    let bytes = hash.as_bytes();
    if bytes.len() != 8 {
        tracing::warn!("unexpected hash width {} for {}", bytes.len(), path.display());
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Some(u64::from_le_bytes(buf))
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexStore, UpsertOptions};
    use crate::testing::{mock_root, write_png, MockEmbedder};

    fn hashed_store() -> (crate::testing::MockRoot, IndexStore) {
        let root = mock_root(&[]);
        write_png(&root.path_of("dup1.png"), [120, 130, 140], 32);
        write_png(&root.path_of("dup2.png"), [120, 130, 140], 32);
        // A gradient image hashes far away from the solid colors.
        let mut img = image::RgbImage::new(32, 32);
        for (x, y, p) in img.enumerate_pixels_mut() {
            *p = image::Rgb([(x * 8) as u8, (y * 8) as u8, ((x ^ y) * 8) as u8]);
        }
        img.save(root.path_of("other.png")).unwrap();

        let mut embedder = MockEmbedder::new(3);
        let mut store = IndexStore::open(root.path(), "mock").unwrap();
        store
            .upsert(&mut embedder, &root.photos(), &UpsertOptions::default())
            .unwrap();
        build_hashes(&store, CancelFlag::new()).unwrap();
        (root, store)
    }

    #[test]
    fn test_build_hashes_caches() {
        let (_root, store) = hashed_store();
        let hashes = load_hashes(store.index_dir()).unwrap();
        assert_eq!(hashes.len(), 3);

        // All cached: rerun hashes nothing new.
        let updated = build_hashes(&store, CancelFlag::new()).unwrap();
        assert_eq!(updated, 0);
    }

    #[test]
    fn test_lookalike_grouping_and_resolution() {
        let (_root, store) = hashed_store();
        let groups = find_lookalikes(store.index_dir(), 5).unwrap();
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.paths.len(), 2);
        assert!(group.paths.iter().all(|p| p.contains("dup")));
        assert!(!group.resolved);

        resolve_group(store.index_dir(), &group.paths).unwrap();
        let groups = find_lookalikes(store.index_dir(), 5).unwrap();
        assert!(groups[0].resolved);
    }

    #[test]
    fn test_group_id_is_order_independent() {
        let a = group_id(&["/x/b.jpg".into(), "/x/a.jpg".into()]);
        let b = group_id(&["/x/a.jpg".into(), "/x/b.jpg".into()]);
        assert_eq!(a, b);
        let c = group_id(&["/x/a.jpg".into(), "/x/c.jpg".into()]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_no_groups_below_threshold() {
        let (_root, store) = hashed_store();
        // Identical images have distance 0; distance threshold still pairs
        // them, but the distinct image stays out at any threshold < its gap.
        let groups = find_lookalikes(store.index_dir(), 0).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].paths.len(), 2);
    }
}

//! Favorites and tags side stores
//!
//! Small JSON maps living next to the index: `tags.json` maps a path to its
//! tag list, `collections.json` maps a collection name to member paths. The
//! `Favorites` collection backs the favorites-only filter. Both files are
//! written atomically and an absent file is an empty map.

use anyhow::Result;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::store::{read_json_file, write_json_atomic};

pub const TAGS_FILE: &str = "tags.json";
pub const COLLECTIONS_FILE: &str = "collections.json";

/// Collection name backing the favorites filter.
pub const FAVORITES_COLLECTION: &str = "Favorites";

pub type TagMap = BTreeMap<String, Vec<String>>;
pub type CollectionMap = BTreeMap<String, Vec<String>>;

pub fn load_tags(index_dir: &Path) -> Result<TagMap> {
    Ok(read_json_file(&index_dir.join(TAGS_FILE))?.unwrap_or_default())
}

pub fn save_tags(index_dir: &Path, tags: &TagMap) -> Result<()> {
    write_json_atomic(&index_dir.join(TAGS_FILE), tags)
}

/// Replace the tag list of one path.
pub fn set_tags(index_dir: &Path, path: &str, tags: Vec<String>) -> Result<()> {
    let mut map = load_tags(index_dir)?;
    if tags.is_empty() {
        map.remove(path);
    } else {
        map.insert(path.to_string(), tags);
    }
    save_tags(index_dir, &map)
}

pub fn load_collections(index_dir: &Path) -> Result<CollectionMap> {
    Ok(read_json_file(&index_dir.join(COLLECTIONS_FILE))?.unwrap_or_default())
}

pub fn save_collections(index_dir: &Path, collections: &CollectionMap) -> Result<()> {
    write_json_atomic(&index_dir.join(COLLECTIONS_FILE), collections)
}

/// Paths in the `Favorites` collection.
pub fn favorites(index_dir: &Path) -> Result<HashSet<String>> {
    Ok(load_collections(index_dir)?
        .remove(FAVORITES_COLLECTION)
        .unwrap_or_default()
        .into_iter()
        .collect())
}

/// Add or remove a path from `Favorites`.
pub fn set_favorite(index_dir: &Path, path: &str, favorite: bool) -> Result<()> {
    let mut collections = load_collections(index_dir)?;
    let members = collections
        .entry(FAVORITES_COLLECTION.to_string())
        .or_default();
    let present = members.iter().any(|p| p == path);
    if favorite && !present {
        members.push(path.to_string());
    } else if !favorite && present {
        members.retain(|p| p != path);
    }
    save_collections(index_dir, &collections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_tags(dir.path()).unwrap().is_empty());

        set_tags(dir.path(), "/p/a.jpg", vec!["beach".into(), "rating:5".into()]).unwrap();
        let tags = load_tags(dir.path()).unwrap();
        assert_eq!(tags["/p/a.jpg"], vec!["beach", "rating:5"]);

        set_tags(dir.path(), "/p/a.jpg", vec![]).unwrap();
        assert!(load_tags(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_favorites_toggle() {
        let dir = tempfile::tempdir().unwrap();
        assert!(favorites(dir.path()).unwrap().is_empty());

        set_favorite(dir.path(), "/p/a.jpg", true).unwrap();
        set_favorite(dir.path(), "/p/b.jpg", true).unwrap();
        set_favorite(dir.path(), "/p/a.jpg", true).unwrap();
        let favs = favorites(dir.path()).unwrap();
        assert_eq!(favs.len(), 2);

        set_favorite(dir.path(), "/p/a.jpg", false).unwrap();
        assert!(!favorites(dir.path()).unwrap().contains("/p/a.jpg"));
    }
}

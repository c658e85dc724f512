//! Structured filter layer
//!
//! Filters run after scoring and only ever drop rows, never reorder them.
//! Each category loads its side table on demand (favorites, tags, faces,
//! EXIF, OCR); a row missing a value fails any constraint placed on that
//! value. Filtering is infallible: an unreadable side table disables its
//! category with a warning, and no combination of filters produces an
//! error, just fewer rows.

use std::collections::HashSet;

use crate::collections::{favorites, load_tags};
use crate::exif::{load_exif, ExifTable};
use crate::faces::photos_of_person;
use crate::ocr::load_ocr_texts;
use crate::query::{compile, QueryContext};
use crate::search::SearchResult;
use crate::store::IndexStore;

/// Sharpness floor used by `sharp_only`.
const SHARPNESS_FLOOR: f64 = 60.0;

/// Brightness bounds used by `exclude_under` / `exclude_over`.
const UNDEREXPOSED_BELOW: f64 = 50.0;
const OVEREXPOSED_ABOVE: f64 = 205.0;

/// Flash filter: the fired bit of the EXIF flash word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFilter {
    Fired,
    No,
}

/// White-balance filter: EXIF 0 = auto, 1 = manual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteBalanceFilter {
    Auto,
    Manual,
}

/// The structured filter set carried in search options.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    /// Keep only paths in the Favorites collection.
    pub favorites_only: bool,
    /// Keep rows whose tag set contains all of these.
    pub tags: Vec<String>,
    /// Intersection of several people's photo sets.
    pub persons: Vec<String>,
    /// Single person shortcut.
    pub person: Option<String>,
    pub date_from: Option<f64>,
    pub date_to: Option<f64>,
    /// Use the EXIF capture date instead of the file mtime for the date
    /// range. Rows without one fail a constrained range.
    pub use_exif_date: bool,
    /// Case-insensitive substring of the camera model.
    pub camera: Option<String>,
    pub iso_min: Option<f64>,
    pub iso_max: Option<f64>,
    pub f_min: Option<f64>,
    pub f_max: Option<f64>,
    pub alt_min: Option<f64>,
    pub alt_max: Option<f64>,
    pub heading_min: Option<f64>,
    pub heading_max: Option<f64>,
    pub flash: Option<FlashFilter>,
    pub wb: Option<WhiteBalanceFilter>,
    /// Metering mode name (`average`, `center`, `spot`, `multispot`,
    /// `pattern`, `partial`, `other`; `matrix` aliases `pattern`).
    pub metering: Option<String>,
    pub sharp_only: bool,
    pub exclude_under: bool,
    pub exclude_over: bool,
    /// Keep only rows with non-empty OCR text.
    pub has_text: bool,
    /// Case-insensitive substring of the reverse-geocoded place.
    pub place: Option<String>,
    /// Boolean query expression evaluated per row; a malformed expression
    /// falls back to a bare-text substring filter.
    pub expression: Option<String>,
}

impl FilterOptions {
    fn wants_exif(&self) -> bool {
        self.camera.is_some()
            || self.place.is_some()
            || self.iso_min.is_some()
            || self.iso_max.is_some()
            || self.f_min.is_some()
            || self.f_max.is_some()
            || self.alt_min.is_some()
            || self.alt_max.is_some()
            || self.heading_min.is_some()
            || self.heading_max.is_some()
            || self.flash.is_some()
            || self.wb.is_some()
            || self.metering.is_some()
            || self.sharp_only
            || self.exclude_under
            || self.exclude_over
    }
}

/// Apply every requested filter category, in order, dropping rows only.
pub fn apply_filters(
    store: &IndexStore,
    results: Vec<SearchResult>,
    filters: &FilterOptions,
    raw_query: &str,
) -> Vec<SearchResult> {
    let mut out = results;
    let index_dir = store.index_dir();

    if filters.favorites_only {
        match favorites(index_dir) {
            Ok(favs) => out.retain(|r| favs.contains(&r.path)),
            Err(e) => tracing::warn!("favorites unavailable, skipping filter: {e}"),
        }
    }

    if !filters.tags.is_empty() {
        match load_tags(index_dir) {
            Ok(tag_map) => {
                let wanted: HashSet<&str> = filters.tags.iter().map(String::as_str).collect();
                out.retain(|r| {
                    let tags: HashSet<&str> = tag_map
                        .get(&r.path)
                        .map(|t| t.iter().map(String::as_str).collect())
                        .unwrap_or_default();
                    wanted.is_subset(&tags)
                });
            }
            Err(e) => tracing::warn!("tags unavailable, skipping filter: {e}"),
        }
    }

    let person_names: Vec<&String> = if !filters.persons.is_empty() {
        filters.persons.iter().collect()
    } else {
        filters.person.iter().collect()
    };
    if !person_names.is_empty() {
        let mut allowed: Option<HashSet<String>> = None;
        for name in person_names {
            let set = photos_of_person(index_dir, name).unwrap_or_default();
            allowed = Some(match allowed {
                None => set,
                Some(prev) => prev.intersection(&set).cloned().collect(),
            });
        }
        if let Some(allowed) = allowed {
            out.retain(|r| allowed.contains(&r.path));
        }
    }

    if filters.date_from.is_some() || filters.date_to.is_some() {
        out = date_filter(store, out, filters);
    }

    if filters.wants_exif() {
        match load_exif(index_dir) {
            Ok(Some(table)) => out = exif_filter(out, filters, &table),
            Ok(None) => {
                tracing::debug!("exif filters requested but no exif table built; keeping rows")
            }
            Err(e) => tracing::warn!("exif table unreadable, skipping filters: {e}"),
        }
    }

    out = text_filter(store, out, filters, raw_query);

    if let Some(expression) = filters.expression.as_deref() {
        if !expression.trim().is_empty() {
            out = expression_filter(store, out, expression);
        }
    }

    out
}

fn date_filter(
    store: &IndexStore,
    mut results: Vec<SearchResult>,
    filters: &FilterOptions,
) -> Vec<SearchResult> {
    let state = store.state();
    let stamp_of = |path: &str| -> Option<f64> {
        if filters.use_exif_date {
            // Looked up lazily below via the exif table.
            None
        } else {
            state.row_of(path).map(|row| state.mtimes[row])
        }
    };

    let exif_dates = if filters.use_exif_date {
        match load_exif(store.index_dir()) {
            Ok(Some(table)) => {
                let lookup = table.row_lookup();
                Some(
                    results
                        .iter()
                        .map(|r| {
                            lookup
                                .get(r.path.as_str())
                                .and_then(|&i| table.datetime[i])
                        })
                        .collect::<Vec<_>>(),
                )
            }
            _ => {
                tracing::warn!("use_exif_date set but exif table unavailable; dropping all rows");
                Some(vec![None; results.len()])
            }
        }
    } else {
        None
    };

    let mut keep = vec![false; results.len()];
    for (i, r) in results.iter().enumerate() {
        let stamp = match &exif_dates {
            Some(dates) => dates[i],
            None => stamp_of(&r.path),
        };
        let Some(stamp) = stamp else {
            continue;
        };
        if let Some(from) = filters.date_from {
            if stamp < from {
                continue;
            }
        }
        if let Some(to) = filters.date_to {
            if stamp > to {
                continue;
            }
        }
        keep[i] = true;
    }
    let mut it = keep.into_iter();
    results.retain(|_| it.next().unwrap_or(false));
    results
}

fn exif_filter(
    mut results: Vec<SearchResult>,
    filters: &FilterOptions,
    table: &ExifTable,
) -> Vec<SearchResult> {
    let lookup = table.row_lookup();

    let range_ok = |value: Option<f64>, min: Option<f64>, max: Option<f64>| -> bool {
        if min.is_none() && max.is_none() {
            return true;
        }
        let Some(v) = value else {
            return false;
        };
        min.map(|m| v >= m).unwrap_or(true) && max.map(|m| v <= m).unwrap_or(true)
    };

    results.retain(|r| {
        let Some(&row) = lookup.get(r.path.as_str()) else {
            // Not in the table: fails any constrained category.
            return false;
        };

        if let Some(camera) = &filters.camera {
            let matched = table.camera[row]
                .as_deref()
                .map(|c| c.to_lowercase().contains(&camera.trim().to_lowercase()))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if let Some(place) = &filters.place {
            let matched = table.place[row]
                .as_deref()
                .map(|p| p.to_lowercase().contains(&place.trim().to_lowercase()))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }

        if !range_ok(
            table.iso[row].map(|v| v as f64),
            filters.iso_min,
            filters.iso_max,
        ) {
            return false;
        }
        if !range_ok(table.fnumber[row], filters.f_min, filters.f_max) {
            return false;
        }
        if !range_ok(table.gps_altitude[row], filters.alt_min, filters.alt_max) {
            return false;
        }
        let heading = table.gps_heading[row].map(|h| h.rem_euclid(360.0));
        if !range_ok(heading, filters.heading_min, filters.heading_max) {
            return false;
        }

        if let Some(flash) = filters.flash {
            let Some(word) = table.flash[row] else {
                return false;
            };
            let fired = word & 1 == 1;
            match flash {
                FlashFilter::Fired if !fired => return false,
                FlashFilter::No if fired => return false,
                _ => {}
            }
        }
        if let Some(wb) = filters.wb {
            let Some(value) = table.white_balance[row] else {
                return false;
            };
            match wb {
                WhiteBalanceFilter::Auto if value != 0 => return false,
                WhiteBalanceFilter::Manual if value != 1 => return false,
                _ => {}
            }
        }
        if let Some(metering) = &filters.metering {
            let Some(mode) = table.metering[row] else {
                return false;
            };
            let wanted = metering.trim().to_lowercase();
            let label = metering_label(mode);
            let aliased = wanted == "matrix" && label == "pattern";
            if wanted != "any" && wanted != label && !aliased {
                return false;
            }
        }

        if filters.sharp_only {
            match table.sharpness[row] {
                Some(s) if s >= SHARPNESS_FLOOR => {}
                _ => return false,
            }
        }
        if filters.exclude_under {
            if let Some(b) = table.brightness[row] {
                if b < UNDEREXPOSED_BELOW {
                    return false;
                }
            }
        }
        if filters.exclude_over {
            if let Some(b) = table.brightness[row] {
                if b > OVEREXPOSED_ABOVE {
                    return false;
                }
            }
        }
        true
    });
    results
}

fn metering_label(mode: u16) -> &'static str {
    match mode {
        0 => "unknown",
        1 => "average",
        2 => "center",
        3 => "spot",
        4 => "multispot",
        5 => "pattern",
        6 => "partial",
        _ => "other",
    }
}

/// `has_text` plus quoted-literal requirements from the raw query.
fn text_filter(
    store: &IndexStore,
    mut results: Vec<SearchResult>,
    filters: &FilterOptions,
    raw_query: &str,
) -> Vec<SearchResult> {
    let literals = quoted_literals(raw_query);
    if !filters.has_text && literals.is_empty() {
        return results;
    }

    let texts = match load_ocr_texts(store.index_dir()) {
        Ok(Some(sidecar)) => sidecar,
        _ => {
            if filters.has_text || !literals.is_empty() {
                // No OCR index: nothing can satisfy a text constraint.
                return Vec::new();
            }
            return results;
        }
    };
    let text_map = texts.as_map();

    results.retain(|r| {
        let text = text_map.get(r.path.as_str()).copied().unwrap_or("");
        if filters.has_text && text.trim().is_empty() {
            return false;
        }
        let lower = text.to_lowercase();
        literals.iter().all(|lit| lower.contains(&lit.to_lowercase()))
    });
    results
}

/// Extract `"..."` and `'...'` literals from a query string.
pub fn quoted_literals(query: &str) -> Vec<String> {
    // Compiled per call; filter evaluation is already linear in rows.
    let double = regex::Regex::new(r#""([^"]+)""#).expect("static regex");
    let single = regex::Regex::new(r"'([^']+)'").expect("static regex");
    double
        .captures_iter(query)
        .chain(single.captures_iter(query))
        .map(|c| c[1].to_string())
        .collect()
}

fn expression_filter(
    store: &IndexStore,
    mut results: Vec<SearchResult>,
    expression: &str,
) -> Vec<SearchResult> {
    let ctx = match QueryContext::build(store) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!("query context unavailable, skipping expression filter: {e}");
            return results;
        }
    };
    match compile(expression) {
        Ok(compiled) => {
            results.retain(|r| compiled.matches(&r.path, &ctx));
        }
        Err(e) => {
            // Malformed expression: treat the whole query as bare text,
            // with the quote/grouping characters stripped.
            tracing::debug!("expression failed to compile ({e}), using bare-text fallback");
            let needle: String = expression
                .to_lowercase()
                .chars()
                .filter(|c| !matches!(c, '"' | '\'' | '(' | ')'))
                .collect();
            let needle = needle.trim().to_string();
            results.retain(|r| ctx.document_text(&r.path).contains(&needle));
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::{set_favorite, set_tags};
    use crate::progress::CancelFlag;
    use crate::search::SearchResult;
    use crate::store::{write_json_atomic, IndexStore, UpsertOptions};
    use crate::testing::{mock_root, MockEmbedder};

    fn results_for(store: &IndexStore) -> Vec<SearchResult> {
        store
            .state()
            .paths
            .iter()
            .map(|p| SearchResult {
                path: p.clone(),
                score: 1.0,
            })
            .collect()
    }

    fn store_with(names: &[&str]) -> (crate::testing::MockRoot, IndexStore) {
        let root = mock_root(names);
        let mut embedder = MockEmbedder::new(3);
        let mut store = IndexStore::open(root.path(), "mock").unwrap();
        store
            .upsert(&mut embedder, &root.photos(), &UpsertOptions::default())
            .unwrap();
        (root, store)
    }

    fn path_ending<'a>(store: &'a IndexStore, suffix: &str) -> &'a str {
        store
            .state()
            .paths
            .iter()
            .find(|p| p.ends_with(suffix))
            .unwrap()
    }

    #[test]
    fn test_favorites_and_tags() {
        let (_root, store) = store_with(&["a.jpg", "b.jpg"]);
        let a = path_ending(&store, "a.jpg").to_string();
        set_favorite(store.index_dir(), &a, true).unwrap();
        set_tags(store.index_dir(), &a, vec!["beach".into(), "summer".into()]).unwrap();

        let filters = FilterOptions {
            favorites_only: true,
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, a);

        let filters = FilterOptions {
            tags: vec!["beach".into()],
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert_eq!(out.len(), 1);

        // Requiring a tag nobody has drops everything, without error.
        let filters = FilterOptions {
            tags: vec!["beach".into(), "winter".into()],
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert!(out.is_empty());
    }

    #[test]
    fn test_date_range_on_mtime() {
        let (_root, store) = store_with(&["a.jpg", "b.jpg"]);
        let mtime = store.state().mtimes[0];

        let filters = FilterOptions {
            date_from: Some(mtime - 100.0),
            date_to: Some(mtime + 100.0),
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert_eq!(out.len(), 2);

        let filters = FilterOptions {
            date_from: Some(mtime + 10_000.0),
            date_to: None,
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert!(out.is_empty());
    }

    #[test]
    fn test_exif_numeric_and_categorical() {
        let (_root, store) = store_with(&["a.jpg", "b.jpg"]);
        let a = path_ending(&store, "a.jpg").to_string();
        let b = path_ending(&store, "b.jpg").to_string();

        // Hand-write an exif table: a is a sharp Canon at ISO 200 with
        // flash fired; b has no metadata at all.
        let mut table = ExifTable::default();
        for path in [&a, &b] {
            table.paths.push(path.clone());
            table.camera.push(None);
            table.iso.push(None);
            table.fnumber.push(None);
            table.exposure.push(None);
            table.focal.push(None);
            table.width.push(None);
            table.height.push(None);
            table.flash.push(None);
            table.white_balance.push(None);
            table.metering.push(None);
            table.gps_lat.push(None);
            table.gps_lon.push(None);
            table.gps_altitude.push(None);
            table.gps_heading.push(None);
            table.place.push(None);
            table.sharpness.push(None);
            table.brightness.push(None);
            table.contrast.push(None);
            table.datetime.push(None);
        }
        table.camera[0] = Some("Canon EOS R".into());
        table.iso[0] = Some(200);
        table.flash[0] = Some(1);
        table.white_balance[0] = Some(0);
        table.metering[0] = Some(5);
        table.sharpness[0] = Some(80.0);
        table.brightness[0] = Some(120.0);
        write_json_atomic(&store.index_dir().join(crate::exif::EXIF_FILE), &table).unwrap();

        let base = FilterOptions::default();

        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions {
                camera: Some("canon".into()),
                ..base.clone()
            },
            "",
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, a);

        // ISO range: missing value on b fails the constraint.
        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions {
                iso_min: Some(100.0),
                iso_max: Some(400.0),
                ..base.clone()
            },
            "",
        );
        assert_eq!(out.len(), 1);

        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions {
                flash: Some(FlashFilter::Fired),
                ..base.clone()
            },
            "",
        );
        assert_eq!(out.len(), 1);
        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions {
                flash: Some(FlashFilter::No),
                ..base.clone()
            },
            "",
        );
        assert!(out.is_empty());

        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions {
                wb: Some(WhiteBalanceFilter::Auto),
                ..base.clone()
            },
            "",
        );
        assert_eq!(out.len(), 1);

        // `matrix` aliases the pattern metering mode.
        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions {
                metering: Some("matrix".into()),
                ..base.clone()
            },
            "",
        );
        assert_eq!(out.len(), 1);

        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions {
                sharp_only: true,
                ..base.clone()
            },
            "",
        );
        assert_eq!(out.len(), 1);

        // exclude_under only drops rows with a known-low brightness.
        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions {
                exclude_under: true,
                ..base
            },
            "",
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_has_text_and_quoted_literals() {
        let (_root, store) = store_with(&["a.jpg", "b.jpg"]);
        let a = path_ending(&store, "a.jpg").to_string();
        let b = path_ending(&store, "b.jpg").to_string();
        let sidecar = crate::ocr::TextSidecar {
            paths: vec![a.clone(), b.clone()],
            texts: vec!["Happy Birthday Ada".into(), String::new()],
        };
        write_json_atomic(
            &store.index_dir().join(crate::ocr::OCR_TEXTS_FILE),
            &sidecar,
        )
        .unwrap();

        let filters = FilterOptions {
            has_text: true,
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, a);

        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions::default(),
            r#"party "happy birthday""#,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, a);

        let out = apply_filters(
            &store,
            results_for(&store),
            &FilterOptions::default(),
            r#""graduation day""#,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_expression_and_fallback() {
        let (_root, store) = store_with(&["sunset.jpg", "city.jpg"]);

        let filters = FilterOptions {
            expression: Some("sunset".into()),
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert_eq!(out.len(), 1);
        assert!(out[0].path.ends_with("sunset.jpg"));

        // Unbalanced parenthesis: compile fails, bare-text fallback runs.
        let filters = FilterOptions {
            expression: Some("( sunset".into()),
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert_eq!(out.len(), 1);
        assert!(out[0].path.ends_with("sunset.jpg"));
    }

    #[test]
    fn test_quoted_literals_extraction() {
        let literals = quoted_literals(r#"beach "golden gate" 'foggy day' plain"#);
        assert_eq!(literals, vec!["golden gate", "foggy day"]);
        assert!(quoted_literals("no quotes here").is_empty());
    }

    #[test]
    fn test_person_filter_without_faces_drops_all() {
        let (_root, store) = store_with(&["a.jpg"]);
        let filters = FilterOptions {
            person: Some("Ada".into()),
            ..Default::default()
        };
        let out = apply_filters(&store, results_for(&store), &filters, "");
        assert!(out.is_empty());
    }
}

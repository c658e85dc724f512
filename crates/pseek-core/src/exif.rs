//! EXIF metadata table
//!
//! Column-oriented table aligned with the primary paths list, persisted as
//! `exif_index.json`. Every column has exactly `N` entries and missing
//! values are explicit nulls. Fractional fields (exposure, focal, aperture)
//! are normalized to floats, GPS tuples to signed decimal degrees, and
//! text fields are decoded as UTF-8 with replacement.
//!
//! Brightness, contrast and sharpness are computed from the decoded pixels
//! (mean / stddev of luma, Laplacian variance) since cameras rarely record
//! them; `place` is filled from an optional reverse-geocode cache
//! (`places.json`) maintained outside the core.

use anyhow::Result;
use exif::{In, Tag, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufReader;
use std::path::Path;

use crate::progress::{CancelFlag, JobKind, JobTracker};
use crate::store::{read_json_file, write_json_atomic, IndexStore};

pub const EXIF_FILE: &str = "exif_index.json";

/// Optional `{path → place}` reverse-geocode cache consumed at build time.
pub const PLACES_FILE: &str = "places.json";

/// Longest image side used for the pixel-statistics pass.
const STATS_MAX_SIDE: u32 = 256;

/// Column-oriented EXIF table; all vectors have `paths.len()` entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExifTable {
    pub paths: Vec<String>,
    pub camera: Vec<Option<String>>,
    pub iso: Vec<Option<u32>>,
    pub fnumber: Vec<Option<f64>>,
    pub exposure: Vec<Option<f64>>,
    pub focal: Vec<Option<f64>>,
    pub width: Vec<Option<u32>>,
    pub height: Vec<Option<u32>>,
    pub flash: Vec<Option<u16>>,
    pub white_balance: Vec<Option<u16>>,
    pub metering: Vec<Option<u16>>,
    pub gps_lat: Vec<Option<f64>>,
    pub gps_lon: Vec<Option<f64>>,
    pub gps_altitude: Vec<Option<f64>>,
    pub gps_heading: Vec<Option<f64>>,
    pub place: Vec<Option<String>>,
    pub sharpness: Vec<Option<f64>>,
    pub brightness: Vec<Option<f64>>,
    pub contrast: Vec<Option<f64>>,
    /// Capture time (`DateTimeOriginal`) in seconds since the epoch.
    pub datetime: Vec<Option<f64>>,
}

impl ExifTable {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// `path → row` lookup for the filter layer.
    pub fn row_lookup(&self) -> HashMap<&str, usize> {
        self.paths
            .iter()
            .enumerate()
            .map(|(i, p)| (p.as_str(), i))
            .collect()
    }

    fn push(&mut self, path: &str, meta: PhotoMeta) {
        self.paths.push(path.to_string());
        self.camera.push(meta.camera);
        self.iso.push(meta.iso);
        self.fnumber.push(meta.fnumber);
        self.exposure.push(meta.exposure);
        self.focal.push(meta.focal);
        self.width.push(meta.width);
        self.height.push(meta.height);
        self.flash.push(meta.flash);
        self.white_balance.push(meta.white_balance);
        self.metering.push(meta.metering);
        self.gps_lat.push(meta.gps_lat);
        self.gps_lon.push(meta.gps_lon);
        self.gps_altitude.push(meta.gps_altitude);
        self.gps_heading.push(meta.gps_heading);
        self.place.push(meta.place);
        self.sharpness.push(meta.sharpness);
        self.brightness.push(meta.brightness);
        self.contrast.push(meta.contrast);
        self.datetime.push(meta.datetime);
    }
}

#[derive(Debug, Default)]
struct PhotoMeta {
    camera: Option<String>,
    iso: Option<u32>,
    fnumber: Option<f64>,
    exposure: Option<f64>,
    focal: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
    flash: Option<u16>,
    white_balance: Option<u16>,
    metering: Option<u16>,
    gps_lat: Option<f64>,
    gps_lon: Option<f64>,
    gps_altitude: Option<f64>,
    gps_heading: Option<f64>,
    place: Option<String>,
    sharpness: Option<f64>,
    brightness: Option<f64>,
    contrast: Option<f64>,
    datetime: Option<f64>,
}

/// Extract metadata for every indexed photo and persist the table.
pub fn build_exif(store: &IndexStore, cancel: CancelFlag) -> Result<ExifTable> {
    let state = store.state();
    let index_dir = store.index_dir();
    let places: HashMap<String, String> =
        read_json_file(&index_dir.join(PLACES_FILE))?.unwrap_or_default();

    let mut tracker =
        JobTracker::with_cancel(index_dir, JobKind::Metadata, state.len(), 0, cancel);

    let mut table = ExifTable::default();
    let mut done = 0usize;
    for path in &state.paths {
        if !tracker.checkpoint() {
            return Ok(table);
        }
        let mut meta = extract_meta(Path::new(path));
        meta.place = places.get(path).cloned();
        table.push(path, meta);
        done += 1;
        tracker.update(|s| {
            s.insert_done = done;
            s.insert_total = state.len();
        });
    }

    write_json_atomic(&index_dir.join(EXIF_FILE), &table)?;
    tracker.complete();
    Ok(table)
}

/// Load the persisted table, if any.
pub fn load_exif(index_dir: &Path) -> Result<Option<ExifTable>> {
    read_json_file(&index_dir.join(EXIF_FILE))
}

fn extract_meta(path: &Path) -> PhotoMeta {
    let mut meta = PhotoMeta::default();

    if let Ok(file) = std::fs::File::open(path) {
        let mut reader = BufReader::new(file);
        if let Ok(exif) = exif::Reader::new().read_from_container(&mut reader) {
            meta.camera = ascii_field(&exif, Tag::Model);
            meta.iso = uint_field(&exif, Tag::PhotographicSensitivity);
            meta.fnumber = rational_field(&exif, Tag::FNumber);
            meta.exposure = rational_field(&exif, Tag::ExposureTime);
            meta.focal = rational_field(&exif, Tag::FocalLength);
            meta.width = uint_field(&exif, Tag::PixelXDimension);
            meta.height = uint_field(&exif, Tag::PixelYDimension);
            meta.flash = uint_field(&exif, Tag::Flash).map(|v| v as u16);
            meta.white_balance = uint_field(&exif, Tag::WhiteBalance).map(|v| v as u16);
            meta.metering = uint_field(&exif, Tag::MeteringMode).map(|v| v as u16);
            meta.gps_heading = rational_field(&exif, Tag::GPSImgDirection);
            meta.datetime =
                ascii_field(&exif, Tag::DateTimeOriginal).and_then(|s| parse_exif_datetime(&s));

            meta.gps_lat = gps_coordinate(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S");
            meta.gps_lon = gps_coordinate(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W");
            meta.gps_altitude = rational_field(&exif, Tag::GPSAltitude).map(|alt| {
                let below_sea = uint_field(&exif, Tag::GPSAltitudeRef) == Some(1);
                if below_sea {
                    -alt
                } else {
                    alt
                }
            });
        }
    }

    // Pixel statistics double as a fallback for missing EXIF dimensions.
    if let Some(stats) = pixel_stats(path) {
        meta.width = meta.width.or(Some(stats.width));
        meta.height = meta.height.or(Some(stats.height));
        meta.brightness = Some(stats.brightness);
        meta.contrast = Some(stats.contrast);
        meta.sharpness = Some(stats.sharpness);
    }

    meta
}

fn ascii_field(exif: &exif::Exif, tag: Tag) -> Option<String> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Ascii(parts) => {
            let joined = parts
                .iter()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            let trimmed = joined.trim().trim_matches('\0').to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        }
        _ => None,
    }
}

fn uint_field(exif: &exif::Exif, tag: Tag) -> Option<u32> {
    exif.get_field(tag, In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
}

fn rational_field(exif: &exif::Exif, tag: Tag) -> Option<f64> {
    let field = exif.get_field(tag, In::PRIMARY)?;
    match &field.value {
        Value::Rational(v) => v.first().and_then(rational_to_f64),
        Value::SRational(v) => v.first().map(|r| {
            if r.denom == 0 {
                0.0
            } else {
                r.num as f64 / r.denom as f64
            }
        }),
        _ => None,
    }
}

fn rational_to_f64(r: &exif::Rational) -> Option<f64> {
    (r.denom != 0).then(|| r.num as f64 / r.denom as f64)
}

/// Degrees-minutes-seconds plus a hemisphere reference, to signed decimal.
fn gps_coordinate(
    exif: &exif::Exif,
    value_tag: Tag,
    ref_tag: Tag,
    negative_ref: &str,
) -> Option<f64> {
    let field = exif.get_field(value_tag, In::PRIMARY)?;
    let Value::Rational(dms) = &field.value else {
        return None;
    };
    let degrees = dms.first().and_then(rational_to_f64)?;
    let minutes = dms.get(1).and_then(rational_to_f64).unwrap_or(0.0);
    let seconds = dms.get(2).and_then(rational_to_f64).unwrap_or(0.0);
    let mut decimal = degrees + minutes / 60.0 + seconds / 3600.0;

    if let Some(hemisphere) = ascii_field(exif, ref_tag) {
        if hemisphere.eq_ignore_ascii_case(negative_ref) {
            decimal = -decimal;
        }
    }
    Some(decimal)
}

/// Parse `YYYY:MM:DD HH:MM:SS` into epoch seconds.
fn parse_exif_datetime(s: &str) -> Option<f64> {
    chrono::NaiveDateTime::parse_from_str(s.trim(), "%Y:%m:%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp() as f64)
}

struct PixelStats {
    width: u32,
    height: u32,
    brightness: f64,
    contrast: f64,
    sharpness: f64,
}

fn pixel_stats(path: &Path) -> Option<PixelStats> {
    let img = match image::open(path) {
        Ok(img) => img,
        Err(e) => {
            tracing::debug!("no pixel stats for {}: {e}", path.display());
            return None;
        }
    };
    let (width, height) = (img.width(), img.height());
    let small = img.resize(STATS_MAX_SIDE, STATS_MAX_SIDE, image::imageops::FilterType::Triangle);
    let gray = small.to_luma8();
    let (brightness, contrast) = luma_stats(&gray);
    let sharpness = laplacian_variance(&gray);
    Some(PixelStats {
        width,
        height,
        brightness,
        contrast,
        sharpness,
    })
}

/// Mean and standard deviation of luma, in 0–255 space.
pub(crate) fn luma_stats(gray: &image::GrayImage) -> (f64, f64) {
    let n = (gray.width() * gray.height()) as f64;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for p in gray.pixels() {
        let v = p.0[0] as f64;
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbor Laplacian; the blur/sharpness heuristic.
pub(crate) fn laplacian_variance(gray: &image::GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }
    let mut values = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = gray.get_pixel(x, y).0[0] as f64;
            let up = gray.get_pixel(x, y - 1).0[0] as f64;
            let down = gray.get_pixel(x, y + 1).0[0] as f64;
            let left = gray.get_pixel(x - 1, y).0[0] as f64;
            let right = gray.get_pixel(x + 1, y).0[0] as f64;
            values.push(up + down + left + right - 4.0 * c);
        }
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

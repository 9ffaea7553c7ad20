//! Image files of accepted records.
//!
//! Each run directory gets `images/<sha256>.<ext>` for the normalized bytes and
//! `images/thumbs/<sha256>.jpg` for a bounded preview. Files are content
//! addressed, so an image shared by several records is written once per run.

use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use rdc_core::{sha256_hex, CanonicalRecord};
use rdc_storage::write_atomic;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

pub const IMAGES_DIR: &str = "images";
pub const THUMBS_DIR: &str = "thumbs";
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 200;
pub const THUMBNAIL_QUALITY: u8 = 80;

/// Where one image of a record landed, relative to the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    pub field: String,
    pub sha256: String,
    pub path: String,
    pub thumbnail: Option<String>,
}

fn extension(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// Downscale into a `size` x `size` box, keeping the aspect ratio, as JPEG.
pub fn thumbnail(bytes: &[u8], size: u32) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes).context("decoding image for thumbnail")?;
    let small = decoded.resize(size, size, FilterType::Lanczos3);
    let rgb = DynamicImage::ImageRgb8(small.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, THUMBNAIL_QUALITY))
        .context("encoding thumbnail")?;
    Ok(out.into_inner())
}

/// Write every image of `record` under `run_dir`. A thumbnail that cannot be
/// produced is logged and left out; the full image is still kept.
pub async fn write_record_images(
    run_dir: &Path,
    record: &CanonicalRecord,
    thumbnail_size: Option<u32>,
) -> Result<Vec<StoredImage>> {
    let mut stored = Vec::with_capacity(record.images.len());
    for asset in &record.images {
        let sha256 = sha256_hex(&asset.bytes);
        let rel = format!("{IMAGES_DIR}/{sha256}.{}", extension(&asset.media_type));
        let path = run_dir.join(&rel);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            write_atomic(&path, &asset.bytes).await?;
        }

        let preview = match thumbnail_size {
            None => None,
            Some(size) => {
                let rel = format!("{IMAGES_DIR}/{THUMBS_DIR}/{sha256}.jpg");
                let path = run_dir.join(&rel);
                if fs::try_exists(&path).await.unwrap_or(false) {
                    Some(rel)
                } else {
                    match thumbnail(&asset.bytes, size) {
                        Ok(bytes) => {
                            write_atomic(&path, &bytes).await?;
                            Some(rel)
                        }
                        Err(err) => {
                            warn!(url = %record.url, field = %asset.field, "no thumbnail: {err:#}");
                            None
                        }
                    }
                }
            }
        };

        stored.push(StoredImage {
            field: asset.field.clone(),
            sha256,
            path: rel,
            thumbnail: preview,
        });
    }
    Ok(stored)
}

fn prune_dir(dir: &Path, cutoff: SystemTime) -> Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            removed += prune_dir(&path, cutoff)?;
            continue;
        }
        if meta.modified().map_or(false, |modified| modified <= cutoff) {
            std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
            debug!(path = %path.display(), "expired image removed");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove image files at least `max_age` old from every run under
/// `reports_root`. Parquet files and summaries are left alone.
pub fn prune_images_older_than(reports_root: &Path, max_age: Duration) -> Result<usize> {
    if !reports_root.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    let runs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false));
    for run in runs {
        removed += prune_dir(&run.path().join(IMAGES_DIR), cutoff)?;
    }
    Ok(removed)
}

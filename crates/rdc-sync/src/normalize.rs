//! Canonical form of validated records.
//!
//! Normalization is deterministic and idempotent: running it on its own
//! output changes nothing, including the fingerprint.

use std::collections::BTreeMap;
use std::io::Cursor;

use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use rdc_core::{sha256_hex, CanonicalRecord, FieldValue, ImageAsset};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::validate::ValidRecord;

pub const JPEG_QUALITY: u8 = 85;

/// A rename target that is itself renamed would make normalization order-dependent,
/// and two fields renamed to the same name would overwrite each other.
pub fn check_rename(rename: &BTreeMap<String, String>) -> Result<(), String> {
    let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();
    for (from, to) in rename {
        if let Some(other) = claimed.insert(to.as_str(), from.as_str()) {
            return Err(format!("`{other}` and `{from}` are both renamed to `{to}`"));
        }
        if from == to {
            continue;
        }
        if rename.contains_key(to) {
            return Err(format!("rename `{from}` -> `{to}` chains into another rename"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    rename: BTreeMap<String, String>,
    max_image_dimension: u32,
}

impl Normalizer {
    pub fn new(rename: BTreeMap<String, String>, max_image_dimension: u32) -> Result<Self, String> {
        check_rename(&rename)?;
        Ok(Self {
            rename,
            max_image_dimension: max_image_dimension.max(1),
        })
    }

    pub fn normalize(&self, record: ValidRecord) -> CanonicalRecord {
        let fields: BTreeMap<String, FieldValue> = record
            .fields
            .into_iter()
            .map(|(name, value)| (self.canonical_name(name), canonical_value(value)))
            .collect();
        let images: Vec<ImageAsset> = record
            .images
            .into_iter()
            .map(|image| {
                let image = ImageAsset {
                    field: self.canonical_name(image.field.clone()),
                    ..image
                };
                self.canonical_image(image)
            })
            .collect();
        let fingerprint = fingerprint(&fields, &images);

        CanonicalRecord {
            identity: record.identity,
            source_id: record.source_id,
            url: record.url,
            fetched_at: record.fetched_at,
            strategy_used: record.strategy_used,
            attempt_number: record.attempt_number,
            fields,
            images,
            fingerprint,
        }
    }

    fn canonical_name(&self, name: String) -> String {
        self.rename.get(&name).cloned().unwrap_or(name)
    }

    fn canonical_image(&self, asset: ImageAsset) -> ImageAsset {
        let max = self.max_image_dimension;
        let in_bounds = asset.width <= max && asset.height <= max;
        if in_bounds && image::guess_format(&asset.bytes).ok() == Some(ImageFormat::Jpeg) {
            return asset;
        }

        let decoded = match image::load_from_memory(&asset.bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!(field = %asset.field, "image left as-is, decode failed: {err}");
                return asset;
            }
        };
        let resized = if in_bounds {
            decoded
        } else {
            decoded.resize(max, max, FilterType::Lanczos3)
        };
        let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
        let mut out = Cursor::new(Vec::new());
        if let Err(err) = rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)) {
            debug!(field = %asset.field, "image left as-is, jpeg encode failed: {err}");
            return asset;
        }
        let (width, height) = rgb.dimensions();
        ImageAsset {
            media_type: "image/jpeg".to_string(),
            width,
            height,
            bytes: out.into_inner(),
            ..asset
        }
    }
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonical_value(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::Text(s) => FieldValue::Text(collapse_whitespace(&s)),
        FieldValue::Url(s) => match Url::parse(s.trim()) {
            Ok(url) => FieldValue::Url(url.to_string()),
            Err(_) => FieldValue::Url(s.trim().to_string()),
        },
        FieldValue::Timestamp(ts) => FieldValue::Timestamp(ts.with_timezone(&Utc).fixed_offset()),
        // -0.0 and 0.0 must fingerprint the same
        FieldValue::Number(n) if n == 0.0 => FieldValue::Number(0.0),
        FieldValue::Number(n) => FieldValue::Number(n),
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    fields: &'a BTreeMap<String, FieldValue>,
    images: Vec<(&'a str, String)>,
}

/// Content hash over canonical fields and image bytes; fetch metadata is excluded.
pub fn fingerprint(fields: &BTreeMap<String, FieldValue>, images: &[ImageAsset]) -> String {
    let input = FingerprintInput {
        fields,
        images: images
            .iter()
            .map(|i| (i.field.as_str(), sha256_hex(&i.bytes)))
            .collect(),
    };
    match serde_json::to_vec(&input) {
        Ok(bytes) => sha256_hex(&bytes),
        // Serializing strings, numbers and timestamps cannot fail; fall back to a debug rendering.
        Err(_) => sha256_hex(format!("{fields:?}{:?}", input.images).as_bytes()),
    }
}

impl From<CanonicalRecord> for ValidRecord {
    fn from(record: CanonicalRecord) -> Self {
        Self {
            identity: record.identity,
            source_id: record.source_id,
            url: record.url,
            fetched_at: record.fetched_at,
            strategy_used: record.strategy_used,
            attempt_number: record.attempt_number,
            fields: record.fields,
            images: record.images,
        }
    }
}

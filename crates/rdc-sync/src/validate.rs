//! Structural and semantic checks on extracted records.
//!
//! Every rule is evaluated; a record is rejected with the full list of
//! failures so quarantine entries explain everything wrong at once.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use image::GenericImageView;
use rdc_adapters::{ExtractionProfile, FieldKind, FieldRule, ImageRef, RawRecord};
use rdc_core::{FieldValue, Identity, ImageAsset, Record, Strategy};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidReason {
    #[error("no payload to validate")]
    MissingPayload,
    #[error("record has no identity")]
    MissingIdentity,
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("required field `{0}` is missing")]
    MissingField(String),
    #[error("field `{field}` is not a valid url: `{value}`")]
    BadUrl { field: String, value: String },
    #[error("field `{field}` is not a recognized date: `{value}`")]
    BadDate { field: String, value: String },
    #[error("field `{field}` is not a number: `{value}`")]
    BadNumber { field: String, value: String },
    #[error("field `{field}` is {len} characters, limit {max}")]
    TooLong { field: String, len: usize, max: usize },
    #[error("image `{field}` unavailable: {reason}")]
    ImageUnavailable { field: String, reason: String },
    #[error("image `{field}` does not decode: {reason}")]
    ImageCorrupt { field: String, reason: String },
    #[error("image `{field}` is {width}x{height}, minimum {min_width}x{min_height}")]
    ImageTooSmall {
        field: String,
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },
    #[error("image `{field}` is {bytes} bytes, limit {max}")]
    ImageTooLarge { field: String, bytes: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record rejected: {}", .reasons.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct Rejected {
    pub reasons: Vec<InvalidReason>,
}

impl Rejected {
    pub fn messages(&self) -> Vec<String> {
        self.reasons.iter().map(ToString::to_string).collect()
    }
}

/// Typed record that passed validation, ready for normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidRecord {
    pub identity: Identity,
    pub source_id: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub strategy_used: Strategy,
    pub attempt_number: u32,
    pub fields: BTreeMap<String, FieldValue>,
    pub images: Vec<ImageAsset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRules {
    pub min_width: u32,
    pub min_height: u32,
    pub max_bytes: usize,
}

impl Default for ImageRules {
    fn default() -> Self {
        Self {
            min_width: 400,
            min_height: 400,
            max_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    profile: ExtractionProfile,
    images: ImageRules,
}

pub fn parse_date(value: &str, formats: &[String]) -> Option<DateTime<FixedOffset>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts);
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(value) {
        return Some(ts);
    }
    for fmt in formats {
        if let Ok(ts) = DateTime::parse_from_str(value, fmt) {
            return Some(ts);
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc().fixed_offset());
        }
        if let Ok(date) = NaiveDate::parse_from_str(value, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc().fixed_offset());
        }
    }
    None
}

/// Accepts `1,234.50` style thousands separators.
pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned: String = value.trim().chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

impl Validator {
    pub fn new(profile: ExtractionProfile, images: ImageRules) -> Self {
        Self { profile, images }
    }

    pub fn profile(&self) -> &ExtractionProfile {
        &self.profile
    }

    pub fn validate(&self, record: &Record, raw: &RawRecord) -> Result<ValidRecord, Rejected> {
        let mut reasons = Vec::new();
        if record.raw_payload.is_none() {
            reasons.push(InvalidReason::MissingPayload);
        }
        let identity = record.identity().cloned();
        if identity.is_none() {
            reasons.push(InvalidReason::MissingIdentity);
        }
        reasons.extend(raw.extraction_errors.iter().cloned().map(InvalidReason::Extraction));

        let mut fields = BTreeMap::new();
        for rule in &self.profile.fields {
            if rule.kind == FieldKind::Image {
                if rule.required && !raw.images.iter().any(|i| i.field == rule.name) {
                    reasons.push(InvalidReason::MissingField(rule.name.clone()));
                }
                continue;
            }
            match raw.fields.get(&rule.name) {
                Some(value) => match self.typed_value(rule, value, &raw.page_url) {
                    Ok(typed) => {
                        fields.insert(rule.name.clone(), typed);
                    }
                    Err(reason) => reasons.push(reason),
                },
                None if rule.required => reasons.push(InvalidReason::MissingField(rule.name.clone())),
                None => {}
            }
        }

        let mut images = Vec::new();
        for image in &raw.images {
            match self.check_image(image) {
                Ok(asset) => images.push(asset),
                Err(reason) => reasons.push(reason),
            }
        }

        match identity {
            Some(identity) if reasons.is_empty() => Ok(ValidRecord {
                identity,
                source_id: record.target.source_id.clone(),
                url: record.target.url.clone(),
                fetched_at: record.fetched_at,
                strategy_used: record.strategy_used,
                attempt_number: record.attempt_number(),
                fields,
                images,
            }),
            _ => Err(Rejected { reasons }),
        }
    }

    fn typed_value(
        &self,
        rule: &FieldRule,
        value: &str,
        page_url: &str,
    ) -> Result<FieldValue, InvalidReason> {
        if let Some(max) = rule.max_length {
            let len = value.chars().count();
            if len > max {
                return Err(InvalidReason::TooLong {
                    field: rule.name.clone(),
                    len,
                    max,
                });
            }
        }
        match rule.kind {
            FieldKind::Text | FieldKind::Image => Ok(FieldValue::Text(value.to_string())),
            FieldKind::Url => {
                let resolved = match Url::parse(page_url) {
                    Ok(base) => base.join(value),
                    Err(_) => Url::parse(value),
                };
                resolved
                    .map(|u| FieldValue::Url(u.to_string()))
                    .map_err(|_| InvalidReason::BadUrl {
                        field: rule.name.clone(),
                        value: value.to_string(),
                    })
            }
            FieldKind::Date => parse_date(value, &rule.date_formats)
                .map(FieldValue::Timestamp)
                .ok_or_else(|| InvalidReason::BadDate {
                    field: rule.name.clone(),
                    value: value.to_string(),
                }),
            FieldKind::Number => parse_number(value)
                .map(FieldValue::Number)
                .ok_or_else(|| InvalidReason::BadNumber {
                    field: rule.name.clone(),
                    value: value.to_string(),
                }),
        }
    }

    fn check_image(&self, img: &ImageRef) -> Result<ImageAsset, InvalidReason> {
        let field = img.field.clone();
        let Some(bytes) = &img.bytes else {
            return Err(InvalidReason::ImageUnavailable {
                field,
                reason: img
                    .load_error
                    .clone()
                    .unwrap_or_else(|| "not loaded".to_string()),
            });
        };
        if bytes.len() > self.images.max_bytes {
            return Err(InvalidReason::ImageTooLarge {
                field,
                bytes: bytes.len(),
                max: self.images.max_bytes,
            });
        }
        let decoded = image::load_from_memory(bytes).map_err(|e| InvalidReason::ImageCorrupt {
            field: field.clone(),
            reason: e.to_string(),
        })?;
        let (width, height) = decoded.dimensions();
        if width < self.images.min_width || height < self.images.min_height {
            return Err(InvalidReason::ImageTooSmall {
                field,
                width,
                height,
                min_width: self.images.min_width,
                min_height: self.images.min_height,
            });
        }
        let media_type = image::guess_format(bytes)
            .map(|f| f.to_mime_type().to_string())
            .or_else(|_| img.media_type.clone().ok_or(()))
            .unwrap_or_else(|_| "application/octet-stream".to_string());
        Ok(ImageAsset {
            field,
            source: img.source.clone(),
            media_type,
            width,
            height,
            bytes: bytes.clone(),
        })
    }
}

//! Declarative field extraction from fetched payloads.
//!
//! HTML payloads are addressed with CSS selectors (optionally reading an
//! attribute), JSON payloads with JSON pointers. Extraction never fails: rule
//! problems are collected on the [`RawRecord`] and judged by validation.

use std::collections::BTreeMap;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    #[default]
    Html,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Text,
    Url,
    Date,
    Number,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    /// CSS selector (html) or JSON pointer (json).
    pub selector: String,
    #[serde(default)]
    pub attr: Option<String>,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// chrono format strings tried after RFC 3339 / RFC 2822.
    #[serde(default)]
    pub date_formats: Vec<String>,
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl FieldRule {
    pub fn new(name: impl Into<String>, selector: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            selector: selector.into(),
            attr: None,
            kind,
            required: false,
            date_formats: Vec::new(),
            max_length: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_attr(mut self, attr: impl Into<String>) -> Self {
        self.attr = Some(attr.into());
        self
    }

    pub fn with_date_formats(mut self, formats: &[&str]) -> Self {
        self.date_formats = formats.iter().map(|f| f.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractionProfile {
    #[serde(default)]
    pub format: PayloadFormat,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
}

impl ExtractionProfile {
    pub fn rule(&self, name: &str) -> Option<&FieldRule> {
        self.fields.iter().find(|r| r.name == name)
    }

    /// Every selector must parse. Used when loading configuration.
    pub fn check_selectors(&self) -> Result<(), String> {
        for rule in &self.fields {
            match self.format {
                PayloadFormat::Html => {
                    Selector::parse(&rule.selector)
                        .map_err(|e| format!("field `{}`: bad selector: {e}", rule.name))?;
                }
                PayloadFormat::Json => {
                    if !rule.selector.is_empty() && !rule.selector.starts_with('/') {
                        return Err(format!(
                            "field `{}`: JSON pointer must start with `/`",
                            rule.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Reference to an embedded image, resolved to bytes by the asset loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub field: String,
    pub source: String,
    pub media_type: Option<String>,
    pub bytes: Option<Vec<u8>>,
    pub load_error: Option<String>,
}

impl ImageRef {
    pub fn new(field: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            source: source.into(),
            media_type: None,
            bytes: None,
            load_error: None,
        }
    }
}

/// Field values as strings, before any typing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRecord {
    pub source_id: String,
    pub page_url: String,
    pub fields: BTreeMap<String, String>,
    pub images: Vec<ImageRef>,
    pub extraction_errors: Vec<String>,
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn select_html(document: &Html, rule: &FieldRule) -> Result<Option<String>, String> {
    let sel = Selector::parse(&rule.selector).map_err(|e| e.to_string())?;
    let Some(node) = document.select(&sel).next() else {
        return Ok(None);
    };
    let attr = match (&rule.attr, rule.kind) {
        (Some(attr), _) => Some(attr.as_str()),
        (None, FieldKind::Image) => Some("src"),
        (None, _) => None,
    };
    Ok(match attr {
        Some(attr) => node.value().attr(attr).and_then(text_or_none),
        None => text_or_none(&node.text().collect::<String>()),
    })
}

fn select_json(document: &JsonValue, rule: &FieldRule) -> Option<String> {
    match document.pointer(&rule.selector)? {
        JsonValue::Null => None,
        JsonValue::String(s) => text_or_none(s),
        other => Some(other.to_string()),
    }
}

pub fn extract(
    profile: &ExtractionProfile,
    source_id: &str,
    page_url: &str,
    payload: &str,
) -> RawRecord {
    let mut raw = RawRecord {
        source_id: source_id.to_string(),
        page_url: page_url.to_string(),
        ..Default::default()
    };

    let values: Vec<(&FieldRule, Option<String>)> = match profile.format {
        PayloadFormat::Html => {
            let document = Html::parse_document(payload);
            profile
                .fields
                .iter()
                .map(|rule| match select_html(&document, rule) {
                    Ok(value) => (rule, value),
                    Err(err) => {
                        raw.extraction_errors
                            .push(format!("field `{}`: bad selector: {err}", rule.name));
                        (rule, None)
                    }
                })
                .collect()
        }
        PayloadFormat::Json => match serde_json::from_str::<JsonValue>(payload) {
            Ok(document) => profile
                .fields
                .iter()
                .map(|rule| (rule, select_json(&document, rule)))
                .collect(),
            Err(err) => {
                raw.extraction_errors
                    .push(format!("payload is not valid JSON: {err}"));
                Vec::new()
            }
        },
    };

    for (rule, value) in values {
        let Some(value) = value else { continue };
        if rule.kind == FieldKind::Image {
            raw.images.push(ImageRef::new(&rule.name, value));
        } else {
            raw.fields.insert(rule.name.clone(), value);
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html_profile() -> ExtractionProfile {
        ExtractionProfile {
            format: PayloadFormat::Html,
            fields: vec![
                FieldRule::new("title", "h1", FieldKind::Text).required(),
                FieldRule::new("link", "a.buy", FieldKind::Url).with_attr("href"),
                FieldRule::new("price", ".price", FieldKind::Number),
                FieldRule::new("cover", "img.cover", FieldKind::Image),
            ],
        }
    }

    #[test]
    fn html_rules_pick_text_attrs_and_images() {
        let html = r#"<html><body>
            <h1>  The Book  </h1>
            <a class="buy" href="/buy/1">Buy</a>
            <span class="price">12.50</span>
            <img class="cover" src="data:image/png;base64,AAAA">
        </body></html>"#;
        let raw = extract(&html_profile(), "books", "https://example.com/b/1", html);
        assert_eq!(raw.fields.get("title").map(String::as_str), Some("The Book"));
        assert_eq!(raw.fields.get("link").map(String::as_str), Some("/buy/1"));
        assert_eq!(raw.fields.get("price").map(String::as_str), Some("12.50"));
        assert_eq!(raw.images.len(), 1);
        assert_eq!(raw.images[0].field, "cover");
        assert!(raw.extraction_errors.is_empty());
    }

    #[test]
    fn missing_elements_are_simply_absent() {
        let raw = extract(&html_profile(), "books", "https://example.com", "<p>nothing</p>");
        assert!(raw.fields.is_empty());
        assert!(raw.images.is_empty());
    }

    #[test]
    fn json_pointers_read_nested_values() {
        let profile = ExtractionProfile {
            format: PayloadFormat::Json,
            fields: vec![
                FieldRule::new("title", "/item/title", FieldKind::Text),
                FieldRule::new("price", "/item/price", FieldKind::Number),
                FieldRule::new("gone", "/item/none", FieldKind::Text),
            ],
        };
        let raw = extract(
            &profile,
            "api",
            "https://example.com/api/1",
            r#"{"item": {"title": "Lamp", "price": 19.5, "none": null}}"#,
        );
        assert_eq!(raw.fields.get("title").map(String::as_str), Some("Lamp"));
        assert_eq!(raw.fields.get("price").map(String::as_str), Some("19.5"));
        assert!(!raw.fields.contains_key("gone"));
    }

    #[test]
    fn broken_json_is_recorded_not_raised() {
        let profile = ExtractionProfile {
            format: PayloadFormat::Json,
            fields: vec![FieldRule::new("title", "/title", FieldKind::Text)],
        };
        let raw = extract(&profile, "api", "https://example.com", "{oops");
        assert_eq!(raw.extraction_errors.len(), 1);
    }

    #[test]
    fn selector_check_catches_bad_rules() {
        let profile = ExtractionProfile {
            format: PayloadFormat::Html,
            fields: vec![FieldRule::new("title", "h1[", FieldKind::Text)],
        };
        assert!(profile.check_selectors().is_err());
        assert!(html_profile().check_selectors().is_ok());
    }
}

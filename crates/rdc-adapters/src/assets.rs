//! Resolves image references on a [`RawRecord`] to bytes.
//!
//! `data:` URIs are decoded in place; http(s) references are resolved against
//! the page URL and fetched with a size cap. Failures are left on the
//! [`ImageRef`] for the validator to report.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rdc_storage::HttpFetcher;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

use crate::{ImageRef, RawRecord};

#[derive(Debug, Clone)]
pub struct AssetLoader {
    http: Option<Arc<HttpFetcher>>,
    max_bytes: usize,
    permits: Option<Arc<Semaphore>>,
}

/// Split a `data:` URI into its media type and decoded bytes.
pub fn decode_data_uri(uri: &str) -> Result<(Option<String>, Vec<u8>), String> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| "not a data uri".to_string())?;
    let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| "data uri has no payload".to_string())?;
    let Some(media) = meta.strip_suffix(";base64") else {
        return Err("only base64 data uris are supported".to_string());
    };
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| format!("bad base64 payload: {e}"))?;
    let media_type = (!media.is_empty()).then(|| media.to_string());
    Ok((media_type, bytes))
}

impl AssetLoader {
    /// Without an HTTP client only inline `data:` images can be resolved.
    pub fn new(http: Option<Arc<HttpFetcher>>, max_bytes: usize) -> Self {
        Self {
            http,
            max_bytes,
            permits: None,
        }
    }

    /// Remote downloads take one of these permits for their duration.
    pub fn with_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = Some(permits);
        self
    }

    pub async fn load(&self, raw: &mut RawRecord) {
        let page_url = raw.page_url.clone();
        for image in raw.images.iter_mut() {
            if image.bytes.is_some() {
                continue;
            }
            match self.resolve(&page_url, image).await {
                Ok((media_type, bytes)) => {
                    image.media_type = media_type;
                    image.bytes = Some(bytes);
                }
                Err(reason) => {
                    debug!(field = %image.field, %reason, "image not loaded");
                    image.load_error = Some(reason);
                }
            }
        }
    }

    async fn resolve(
        &self,
        page_url: &str,
        image: &ImageRef,
    ) -> Result<(Option<String>, Vec<u8>), String> {
        if image.source.starts_with("data:") {
            let (media_type, bytes) = decode_data_uri(&image.source)?;
            self.check_size(bytes.len())?;
            return Ok((media_type, bytes));
        }

        let base = Url::parse(page_url).map_err(|e| format!("bad page url: {e}"))?;
        let resolved = base
            .join(&image.source)
            .map_err(|e| format!("bad image url `{}`: {e}", image.source))?;
        if !matches!(resolved.scheme(), "http" | "https") {
            return Err(format!("unsupported image scheme `{}`", resolved.scheme()));
        }
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| "no http client for remote images".to_string())?;
        let _permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .acquire()
                    .await
                    .map_err(|_| "fetch permits closed".to_string())?,
            ),
            None => None,
        };
        let resp = http
            .get_limited(resolved.as_str(), None, self.max_bytes)
            .await
            .map_err(|e| e.to_string())?;
        Ok((resp.content_type, resp.body))
    }

    fn check_size(&self, len: usize) -> Result<(), String> {
        if len > self.max_bytes {
            Err(format!("image is {len} bytes, limit {}", self.max_bytes))
        } else {
            Ok(())
        }
    }
}

//! Fetch strategy contract, the two strategy backends, and payload extraction.

pub mod assets;
pub mod extract;
pub mod lightweight;
pub mod rendered;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdc_core::{AttemptOutcome, Strategy, Target};
use rdc_storage::{HttpError, StatusDisposition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use assets::AssetLoader;
pub use extract::{extract, ExtractionProfile, FieldKind, FieldRule, ImageRef, PayloadFormat, RawRecord};
pub use lightweight::LightweightStrategy;
pub use rendered::{RenderOptions, RenderedStrategy};

pub const CRATE_NAME: &str = "rdc-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Classified failure of one attempt. The retry controller keys its policy off the variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("blocked: {0}")]
    Blocked(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl FetchError {
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            FetchError::Timeout(_) => AttemptOutcome::Timeout,
            FetchError::Blocked(_) => AttemptOutcome::Blocked,
            FetchError::Transient(_) | FetchError::Configuration(_) => AttemptOutcome::Error,
        }
    }
}

impl From<HttpError> for FetchError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::InvalidUrl { url, reason } => {
                FetchError::Configuration(format!("invalid url {url}: {reason}"))
            }
            HttpError::Timeout { url } => FetchError::Timeout(url),
            HttpError::Request { url, source } => {
                FetchError::Transient(format!("{url}: {source}"))
            }
            HttpError::Status {
                status,
                url,
                disposition: StatusDisposition::Blocked,
            } => FetchError::Blocked(format!("http status {status} for {url}")),
            HttpError::Status {
                status,
                url,
                disposition: StatusDisposition::Transient,
            } => FetchError::Transient(format!("http status {status} for {url}")),
            HttpError::TooLarge { url, limit } => {
                FetchError::Configuration(format!("{url} exceeds {limit} bytes"))
            }
        }
    }
}

/// One retrieval method. Implementations perform exactly one attempt per call.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn strategy(&self) -> Strategy;

    async fn attempt(&self, target: &Target) -> Result<FetchedPage, FetchError>;

    /// Called once when a run is over; pooled backends release idle sessions here.
    async fn finish_run(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageVerdict {
    Ready,
    NeedsRendering(String),
    Blocked(String),
}

/// Decides whether fetched content is usable, needs a browser, or is a denial page.
pub trait PageClassifier: Send + Sync + fmt::Debug {
    fn classify(&self, page: &FetchedPage) -> PageVerdict;
}

/// Case-insensitive substring markers.
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    render_markers: Vec<String>,
    block_markers: Vec<String>,
}

pub const DEFAULT_RENDER_MARKERS: &[&str] = &[
    "please enable javascript",
    "you need to enable javascript",
    "<div id=\"root\"></div>",
    "<div id=\"__next\"></div>",
    "<div id=\"app\"></div>",
];

pub const DEFAULT_BLOCK_MARKERS: &[&str] = &[
    "captcha",
    "cf-challenge",
    "access denied",
    "unusual traffic",
];

impl Default for MarkerClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_RENDER_MARKERS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_BLOCK_MARKERS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl MarkerClassifier {
    pub fn new(render_markers: Vec<String>, block_markers: Vec<String>) -> Self {
        let lower = |v: Vec<String>| {
            v.into_iter()
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect()
        };
        Self {
            render_markers: lower(render_markers),
            block_markers: lower(block_markers),
        }
    }
}

impl PageClassifier for MarkerClassifier {
    fn classify(&self, page: &FetchedPage) -> PageVerdict {
        let body = page.body.to_ascii_lowercase();
        if let Some(marker) = self.block_markers.iter().find(|m| body.contains(m.as_str())) {
            return PageVerdict::Blocked(format!("block marker `{marker}`"));
        }
        if let Some(marker) = self.render_markers.iter().find(|m| body.contains(m.as_str())) {
            return PageVerdict::NeedsRendering(format!("render marker `{marker}`"));
        }
        PageVerdict::Ready
    }
}

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

/// Round-robin user-agent rotation.
#[derive(Debug)]
pub struct UserAgentPool {
    agents: Vec<String>,
    next: AtomicUsize,
}

impl Default for UserAgentPool {
    fn default() -> Self {
        Self::new(DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect())
    }
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>) -> Self {
        let agents = if agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            agents
        };
        Self {
            agents,
            next: AtomicUsize::new(0),
        }
    }

    pub fn next_agent(&self) -> &str {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.agents.len();
        &self.agents[idx]
    }
}

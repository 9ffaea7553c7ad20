//! `collector.yaml` loading plus environment overrides for deployment paths.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rdc_adapters::{ExtractionProfile, FieldRule, PayloadFormat};
use rdc_core::{IdentityKey, Target};
use rdc_storage::{BackoffPolicy, HttpClientConfig, TokenBucketConfig};
use scraper::Selector;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::normalize::check_rename;

pub const QUERY_PLACEHOLDER: &str = "{query}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing collection file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid settings: {0}")]
    Settings(String),
    #[error("source `{source_id}`: {reason}")]
    Source { source_id: String, reason: String },
    #[error("invalid schedule `{expr}`: {reason}")]
    Schedule { expr: String, reason: String },
}

impl ConfigError {
    fn for_source(source_id: &str, reason: impl Into<String>) -> Self {
        ConfigError::Source {
            source_id: source_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
    pub render_timeout_secs: u64,
    pub concurrency_lightweight: usize,
    pub concurrency_rendered: usize,
    pub per_host_concurrency: usize,
    /// Minimum spacing between lightweight requests; unset disables pacing.
    pub request_spacing_ms: Option<u64>,
    pub request_burst: u32,
    pub run_interval_secs: Option<u64>,
    /// Cron expression; takes precedence over `run_interval_secs`.
    pub schedule: Option<String>,
    pub min_gap_secs: u64,
    pub run_budget_secs: Option<u64>,
    pub dedup_retention_secs: Option<u64>,
    pub dedup_capacity: usize,
    pub user_agents: Vec<String>,
    pub image_min_width: u32,
    pub image_min_height: u32,
    pub image_max_bytes: usize,
    pub max_image_dimension: u32,
    /// Bounding box of stored image previews; 0 disables them.
    pub image_thumbnail_size: u32,
    /// Stored image files older than this are deleted after each run.
    pub image_retention_secs: Option<u64>,
    pub render_markers: Option<Vec<String>>,
    pub block_markers: Option<Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            attempt_timeout_secs: 20,
            render_timeout_secs: 45,
            concurrency_lightweight: 8,
            concurrency_rendered: 2,
            per_host_concurrency: 2,
            request_spacing_ms: None,
            request_burst: 1,
            run_interval_secs: None,
            schedule: None,
            min_gap_secs: 30,
            run_budget_secs: None,
            dedup_retention_secs: Some(30 * 24 * 3600),
            dedup_capacity: 100_000,
            user_agents: Vec::new(),
            image_min_width: 400,
            image_min_height: 400,
            image_max_bytes: 10 * 1024 * 1024,
            max_image_dimension: 1200,
            image_thumbnail_size: crate::images::DEFAULT_THUMBNAIL_SIZE,
            image_retention_secs: Some(7 * 24 * 3600),
            render_markers: None,
            block_markers: None,
        }
    }
}

pub const DEFAULT_RUN_INTERVAL: Duration = Duration::from_secs(3600);

impl Settings {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn run_interval(&self) -> Duration {
        self.run_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RUN_INTERVAL)
    }

    pub fn http_client(&self, user_agent: Option<String>) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.attempt_timeout(),
            user_agent,
            per_host_concurrency: self.per_host_concurrency,
            token_bucket: self.request_spacing_ms.map(|ms| TokenBucketConfig {
                capacity: self.request_burst,
                refill_every: Duration::from_millis(ms),
            }),
        }
    }

    pub fn min_gap(&self) -> Duration {
        Duration::from_secs(self.min_gap_secs)
    }

    pub fn run_budget(&self) -> Option<Duration> {
        self.run_budget_secs.map(Duration::from_secs)
    }

    pub fn dedup_retention(&self) -> Option<Duration> {
        self.dedup_retention_secs.map(Duration::from_secs)
    }

    pub fn thumbnail_size(&self) -> Option<u32> {
        (self.image_thumbnail_size > 0).then_some(self.image_thumbnail_size)
    }

    pub fn image_retention(&self) -> Option<Duration> {
        self.image_retention_secs.map(Duration::from_secs)
    }

    fn check(&self) -> Result<(), ConfigError> {
        let bad = |reason: &str| Err(ConfigError::Settings(reason.to_string()));
        if self.max_attempts == 0 {
            return bad("max_attempts must be at least 1");
        }
        if self.base_delay_ms > self.max_delay_ms {
            return bad("base_delay_ms must not exceed max_delay_ms");
        }
        if self.attempt_timeout_secs == 0 || self.render_timeout_secs == 0 {
            return bad("attempt and render timeouts must be positive");
        }
        if self.concurrency_lightweight == 0
            || self.concurrency_rendered == 0
            || self.per_host_concurrency == 0
        {
            return bad("concurrency limits must be at least 1");
        }
        if self.run_interval_secs == Some(0) {
            return bad("run_interval_secs must be positive");
        }
        if self.dedup_capacity == 0 {
            return bad("dedup_capacity must be at least 1");
        }
        if self.max_image_dimension == 0 {
            return bad("max_image_dimension must be positive");
        }
        if self.image_retention_secs == Some(0) {
            return bad("image_retention_secs must be positive; omit it to keep images");
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

/// A group of targets sharing extraction rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub format: PayloadFormat,
    #[serde(default)]
    pub identity: IdentityKey,
    #[serde(default)]
    pub urls: Vec<String>,
    /// URL containing `{query}`, expanded once per entry of `queries`.
    #[serde(default)]
    pub url_template: Option<String>,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub ready_selector: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
}

impl SourceConfig {
    pub fn profile(&self) -> ExtractionProfile {
        ExtractionProfile {
            format: self.format,
            fields: self.fields.clone(),
        }
    }

    pub fn target_urls(&self) -> Vec<String> {
        let mut urls = self.urls.clone();
        if let Some(template) = &self.url_template {
            urls.extend(self.queries.iter().map(|q| {
                let encoded: String = url::form_urlencoded::byte_serialize(q.as_bytes()).collect();
                template.replace(QUERY_PLACEHOLDER, &encoded)
            }));
        }
        urls
    }

    pub fn targets(&self) -> Vec<Target> {
        self.target_urls()
            .into_iter()
            .map(|url| {
                let target =
                    Target::new(&self.source_id, url).with_identity_key(self.identity);
                match &self.ready_selector {
                    Some(selector) => target.with_ready_selector(selector),
                    None => target,
                }
            })
            .collect()
    }

    fn check(&self) -> Result<(), ConfigError> {
        let id = self.source_id.as_str();
        if id.trim().is_empty() {
            return Err(ConfigError::for_source(id, "source_id must not be empty"));
        }
        if let Some(template) = &self.url_template {
            if !template.contains(QUERY_PLACEHOLDER) {
                return Err(ConfigError::for_source(
                    id,
                    format!("url_template lacks {QUERY_PLACEHOLDER}"),
                ));
            }
            if self.queries.is_empty() {
                return Err(ConfigError::for_source(id, "url_template given without queries"));
            }
        }
        let urls = self.target_urls();
        if urls.is_empty() {
            return Err(ConfigError::for_source(id, "no urls or queries"));
        }
        for url in &urls {
            Url::parse(url).map_err(|e| ConfigError::for_source(id, format!("bad url `{url}`: {e}")))?;
        }
        if self.fields.is_empty() {
            return Err(ConfigError::for_source(id, "no field rules"));
        }
        let mut names = HashSet::new();
        for rule in &self.fields {
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::for_source(
                    id,
                    format!("field `{}` declared twice", rule.name),
                ));
            }
        }
        self.profile()
            .check_selectors()
            .map_err(|reason| ConfigError::for_source(id, reason))?;
        if let Some(selector) = &self.ready_selector {
            Selector::parse(selector).map_err(|e| {
                ConfigError::for_source(id, format!("bad ready_selector `{selector}`: {e}"))
            })?;
        }
        check_rename(&self.rename).map_err(|reason| ConfigError::for_source(id, reason))?;
        for (from, to) in &self.rename {
            if from != to && names.contains(to.as_str()) {
                return Err(ConfigError::for_source(
                    id,
                    format!("rename `{from}` -> `{to}` collides with declared field `{to}`"),
                ));
            }
        }
        Ok(())
    }
}

/// A source left out of the run because its definition is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSource {
    pub source_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Sources dropped at load time; the rest still run.
    #[serde(skip)]
    pub skipped: Vec<SkippedSource>,
}

impl CollectorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Settings errors and duplicate source ids are fatal. A source with a bad
    /// definition is moved to `skipped` so the remaining sources still load.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(text)?;
        config.settings.check()?;
        let mut ids = HashSet::new();
        for source in &config.sources {
            if !ids.insert(source.source_id.as_str()) {
                return Err(ConfigError::for_source(&source.source_id, "duplicate source_id"));
            }
        }

        let (usable, broken): (Vec<_>, Vec<_>) = std::mem::take(&mut config.sources)
            .into_iter()
            .map(|source| {
                let checked = source.check();
                (source, checked)
            })
            .partition(|(_, checked)| checked.is_ok());
        config.sources = usable.into_iter().map(|(source, _)| source).collect();
        for (source, checked) in broken {
            if let Err(err) = checked {
                warn!(source_id = %source.source_id, "skipping source: {err}");
                config.skipped.push(SkippedSource {
                    source_id: source.source_id,
                    reason: err.to_string(),
                });
            }
        }
        Ok(config)
    }

    /// Strict validation: every problem, including per-source ones, is an error.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.settings.check()?;
        let mut ids = HashSet::new();
        for source in &self.sources {
            if !ids.insert(source.source_id.as_str()) {
                return Err(ConfigError::for_source(&source.source_id, "duplicate source_id"));
            }
            source.check()?;
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn targets(&self) -> Vec<Target> {
        self.enabled_sources().flat_map(SourceConfig::targets).collect()
    }
}

/// Deployment paths and switches, read once at start-up.
#[derive(Debug, Clone)]
pub struct CollectorEnv {
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
}

impl CollectorEnv {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("RDC_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./collector.yaml")),
            state_dir: std::env::var("RDC_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            reports_dir: std::env::var("RDC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            user_agent: std::env::var("RDC_USER_AGENT").ok().filter(|v| !v.is_empty()),
            chrome_path: std::env::var("RDC_CHROME_PATH").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("RDC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn dedup_path(&self) -> PathBuf {
        self.state_dir.join("dedup.json")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.state_dir.join("quarantine")
    }
}

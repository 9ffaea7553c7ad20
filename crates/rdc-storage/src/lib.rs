//! HTTP fetch utilities, backoff policy and on-disk state for RDC.

pub mod dedup;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use rdc_core::sha256_hex;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub use dedup::{DedupStore, DedupVerdict};

pub const CRATE_NAME: &str = "rdc-storage";

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct QuarantinedArtifact {
    pub content_hash: String,
    pub payload_path: PathBuf,
    pub reasons_path: PathBuf,
    pub deduplicated: bool,
}

#[derive(Debug, Serialize)]
struct QuarantineSidecar<'a> {
    source_id: &'a str,
    identity: &'a str,
    url: &'a str,
    fetched_at: DateTime<Utc>,
    reasons: &'a [String],
}

/// Hash-addressed archive of payloads that failed validation.
#[derive(Debug, Clone)]
pub struct QuarantineStore {
    root: PathBuf,
}

impl QuarantineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_dir(&self, fetched_at: DateTime<Utc>, source_id: &str) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d").to_string()).join(source_id)
    }

    /// Archive one rejected payload with its reasons. Identical payloads share a file.
    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        identity: &str,
        url: &str,
        payload: &[u8],
        reasons: &[String],
    ) -> anyhow::Result<QuarantinedArtifact> {
        let content_hash = sha256_hex(payload);
        let dir = self.root.join(self.relative_dir(fetched_at, source_id));
        let payload_path = dir.join(format!("{content_hash}.payload"));
        let reasons_path = dir.join(format!("{content_hash}.reasons.json"));

        let deduplicated = fs::try_exists(&payload_path)
            .await
            .with_context(|| format!("checking quarantine path {}", payload_path.display()))?;
        if !deduplicated {
            write_atomic(&payload_path, payload).await?;
        }

        let sidecar = serde_json::to_vec_pretty(&QuarantineSidecar {
            source_id,
            identity,
            url,
            fetched_at,
            reasons,
        })
        .context("serializing quarantine reasons")?;
        write_atomic(&reasons_path, &sidecar).await?;

        Ok(QuarantinedArtifact {
            content_hash,
            payload_path,
            reasons_path,
            deduplicated,
        })
    }
}

/// How a non-success HTTP status should be treated by the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDisposition {
    Transient,
    Blocked,
}

pub fn classify_status(status: StatusCode) -> StatusDisposition {
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        StatusDisposition::Transient
    } else {
        StatusDisposition::Blocked
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Capped exponential delay before retry number `retry_index` (0-based).
    pub fn delay_for_attempt(&self, retry_index: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Equal-jitter variant: uniform in `[delay / 2, delay]`, never above `max_delay`.
    pub fn jittered_delay<R: Rng>(&self, retry_index: u32, rng: &mut R) -> Duration {
        let ceiling = self.delay_for_attempt(retry_index).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(ceiling / 2..=ceiling))
    }

    /// Upper bound on the time spent waiting between attempts of one resolution.
    pub fn worst_case_wait(&self) -> Duration {
        self.max_delay
            .saturating_mul(self.max_attempts.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacing shared by every target on the client.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity.max(1), Instant::now())),
        }
    }

    pub async fn take(&self) {
        let every = self.refill_every.as_millis();
        if every == 0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (tokens, last_refill) = &mut *state;
                let refills = (last_refill.elapsed().as_millis() / every) as u32;
                if refills > 0 {
                    *tokens = tokens.saturating_add(refills).min(self.capacity);
                    *last_refill += self.refill_every * refills;
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                self.refill_every
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub per_host_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            per_host_concurrency: 2,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status {
        status: u16,
        url: String,
        disposition: StatusDisposition,
    },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

/// Single-shot GET client. Retrying is the caller's job; this only enforces
/// per-host concurrency and optional pacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<TokenBucket>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket: config.token_bucket.map(TokenBucket::new),
        })
    }

    async fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GET `url`. Non-success statuses come back as [`HttpError::Status`].
    pub async fn get(&self, url: &str, user_agent: Option<&str>) -> Result<HttpResponse, HttpError> {
        self.fetch(url, user_agent, None).await
    }

    /// GET `url`, refusing bodies over `max_bytes`. The declared length is
    /// checked first and the body is streamed so at most `max_bytes` is held.
    pub async fn get_limited(
        &self,
        url: &str,
        user_agent: Option<&str>,
        max_bytes: usize,
    ) -> Result<HttpResponse, HttpError> {
        self.fetch(url, user_agent, Some(max_bytes)).await
    }

    async fn fetch(
        &self,
        url: &str,
        user_agent: Option<&str>,
        max_bytes: Option<usize>,
    ) -> Result<HttpResponse, HttpError> {
        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

        let semaphore = self.host_semaphore(&host).await;
        // Semaphores here are never closed.
        let _permit = semaphore.acquire_owned().await.ok();
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let mut request = self.client.get(parsed);
        if let Some(ua) = user_agent {
            request = request.header(reqwest::header::USER_AGENT, ua);
        }
        let map_err = |err: reqwest::Error| {
            if err.is_timeout() {
                HttpError::Timeout {
                    url: url.to_string(),
                }
            } else {
                HttpError::Request {
                    url: url.to_string(),
                    source: err,
                }
            }
        };

        let mut resp = request.send().await.map_err(map_err)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        debug!(url, status = status.as_u16(), "http response");

        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                url: final_url,
                disposition: classify_status(status),
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = match max_bytes {
            None => resp.bytes().await.map_err(map_err)?.to_vec(),
            Some(limit) => {
                let too_large = || HttpError::TooLarge {
                    url: final_url.clone(),
                    limit,
                };
                if resp.content_length().is_some_and(|len| len > limit as u64) {
                    return Err(too_large());
                }
                let mut body = Vec::new();
                while let Some(chunk) = resp.chunk().await.map_err(map_err)? {
                    if body.len() + chunk.len() > limit {
                        return Err(too_large());
                    }
                    body.extend_from_slice(&chunk);
                }
                body
            }
        };
        Ok(HttpResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}

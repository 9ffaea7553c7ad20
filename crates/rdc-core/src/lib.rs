//! Core domain model for RDC: targets, fetch attempts, records and batches.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rdc-core";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fetch method variant. Escalation only ever moves lightweight -> rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Lightweight,
    Rendered,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Lightweight => "lightweight",
            Strategy::Rendered => "rendered",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    Blocked,
    Error,
}

/// Stable key of a collected entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Normalized URL identity: scheme/host lower-cased, default port and fragment dropped.
    pub fn from_url(raw: &str) -> Result<Self, url::ParseError> {
        let mut url = Url::parse(raw.trim())?;
        url.set_fragment(None);
        Ok(Self(url.to_string()))
    }

    pub fn from_content(bytes: &[u8]) -> Self {
        Self(format!("sha256:{}", sha256_hex(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a source derives record identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKey {
    #[default]
    Url,
    Content,
}

/// One external source unit to be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub source_id: String,
    pub url: String,
    #[serde(default)]
    pub identity_key: IdentityKey,
    /// CSS selector whose presence signals rendered content is ready.
    #[serde(default)]
    pub ready_selector: Option<String>,
}

impl Target {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            identity_key: IdentityKey::Url,
            ready_selector: None,
        }
    }

    pub fn with_identity_key(mut self, key: IdentityKey) -> Self {
        self.identity_key = key;
        self
    }

    pub fn with_ready_selector(mut self, selector: impl Into<String>) -> Self {
        self.ready_selector = Some(selector.into());
        self
    }
}

/// One try against a target. Only the final attempt survives on the [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchAttempt {
    pub target: String,
    pub strategy: Strategy,
    pub outcome: AttemptOutcome,
    pub attempt_number: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Valid,
    Invalid,
    Failed,
}

impl RecordStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("illegal status transition {from:?} -> {to:?}")]
    IllegalTransition { from: RecordStatus, to: RecordStatus },
    #[error("identity already assigned: {existing}")]
    IdentityAlreadyAssigned { existing: Identity },
}

/// A unique external entity being collected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    identity: Option<Identity>,
    pub target: Target,
    pub raw_payload: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub strategy_used: Strategy,
    status: RecordStatus,
    pub final_attempt: Option<FetchAttempt>,
    pub failure: Option<String>,
}

impl Record {
    /// Starts resolving `target`. URL-keyed targets get their identity immediately;
    /// content-keyed ones get it once the payload is known.
    pub fn pending(target: Target, fetched_at: DateTime<Utc>) -> Self {
        let identity = match target.identity_key {
            IdentityKey::Url => Identity::from_url(&target.url).ok(),
            IdentityKey::Content => None,
        };
        Self {
            identity,
            target,
            raw_payload: None,
            fetched_at,
            strategy_used: Strategy::Lightweight,
            status: RecordStatus::Pending,
            final_attempt: None,
            failure: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn assign_identity(&mut self, identity: Identity) -> Result<(), RecordError> {
        if let Some(existing) = &self.identity {
            return Err(RecordError::IdentityAlreadyAssigned {
                existing: existing.clone(),
            });
        }
        self.identity = Some(identity);
        Ok(())
    }

    pub fn status(&self) -> RecordStatus {
        self.status
    }

    /// Moves pending -> terminal. Terminal states never change again.
    pub fn transition(&mut self, next: RecordStatus) -> Result<(), RecordError> {
        if self.status.is_terminal() || !next.is_terminal() {
            return Err(RecordError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Terminal failure: drops any payload and keeps the reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), RecordError> {
        self.transition(RecordStatus::Failed)?;
        self.raw_payload = None;
        self.failure = Some(reason.into());
        Ok(())
    }

    pub fn attempt_number(&self) -> u32 {
        self.final_attempt
            .as_ref()
            .map(|a| a.attempt_number)
            .unwrap_or(0)
    }
}

/// Typed value of a validated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Url(String),
    Timestamp(DateTime<FixedOffset>),
    Number(f64),
}

impl FieldValue {
    /// Flat cell rendering for tabular export.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Text(s) | FieldValue::Url(s) => s.clone(),
            FieldValue::Timestamp(ts) => ts.to_rfc3339(),
            FieldValue::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub field: String,
    pub source: String,
    pub media_type: String,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// Canonical, normalized shape handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub identity: Identity,
    pub source_id: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub strategy_used: Strategy,
    pub attempt_number: u32,
    pub fields: BTreeMap<String, FieldValue>,
    pub images: Vec<ImageAsset>,
    pub fingerprint: String,
}

/// Per-run outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub valid: usize,
    pub duplicate: usize,
    pub invalid: usize,
    pub failed: usize,
    #[serde(default)]
    pub cancelled: usize,
}

impl OutcomeSummary {
    pub fn total(&self) -> usize {
        self.valid + self.duplicate + self.invalid + self.failed + self.cancelled
    }

    /// True when targets were attempted but none produced usable content.
    pub fn nothing_collected(&self) -> bool {
        self.total() > 0 && self.valid == 0 && self.duplicate == 0
    }
}

/// Immutable output of one run. Built through [`BatchBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    records: Vec<CanonicalRecord>,
}

impl Batch {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Accumulator preserving completion order.
#[derive(Debug)]
pub struct BatchBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    records: Vec<CanonicalRecord>,
}

impl BatchBuilder {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: CanonicalRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn finish(self, finished_at: DateTime<Utc>) -> Batch {
        Batch {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            records: self.records,
        }
    }
}

/// Last sighting of an identity across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    pub identity: Identity,
    pub fingerprint: String,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn url_identity_is_normalized() {
        let a = Identity::from_url("HTTPS://Example.COM:443/items/1#reviews").unwrap();
        let b = Identity::from_url("https://example.com/items/1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://example.com/items/1");
    }

    #[test]
    fn content_identity_is_hash_prefixed() {
        let id = Identity::from_content(b"hello world");
        assert_eq!(
            id.as_str(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn status_only_moves_forward() {
        let mut record = Record::pending(Target::new("books", "https://example.com/a"), ts());
        assert_eq!(record.status(), RecordStatus::Pending);
        record.transition(RecordStatus::Valid).unwrap();
        assert_eq!(
            record.transition(RecordStatus::Failed),
            Err(RecordError::IllegalTransition {
                from: RecordStatus::Valid,
                to: RecordStatus::Failed,
            })
        );
        assert_eq!(record.status(), RecordStatus::Valid);
    }

    #[test]
    fn pending_is_not_a_valid_target_state() {
        let mut record = Record::pending(Target::new("books", "https://example.com/a"), ts());
        assert!(record.transition(RecordStatus::Pending).is_err());
    }

    #[test]
    fn fail_clears_payload() {
        let mut record = Record::pending(Target::new("books", "https://example.com/a"), ts());
        record.raw_payload = Some("<html></html>".into());
        record.fail("timed out twice").unwrap();
        assert_eq!(record.status(), RecordStatus::Failed);
        assert!(record.raw_payload.is_none());
        assert_eq!(record.failure.as_deref(), Some("timed out twice"));
    }

    #[test]
    fn identity_is_assigned_once() {
        let target = Target::new("feed", "https://example.com/feed")
            .with_identity_key(IdentityKey::Content);
        let mut record = Record::pending(target, ts());
        assert!(record.identity().is_none());
        record
            .assign_identity(Identity::from_content(b"first"))
            .unwrap();
        assert!(record
            .assign_identity(Identity::from_content(b"second"))
            .is_err());
        assert_eq!(record.identity(), Some(&Identity::from_content(b"first")));
    }

    #[test]
    fn batch_keeps_push_order() {
        let mut builder = BatchBuilder::new(Uuid::new_v4(), ts());
        for n in ["b", "a", "c"] {
            builder.push(CanonicalRecord {
                identity: Identity::from_url(&format!("https://example.com/{n}")).unwrap(),
                source_id: "books".into(),
                url: format!("https://example.com/{n}"),
                fetched_at: ts(),
                strategy_used: Strategy::Lightweight,
                attempt_number: 1,
                fields: BTreeMap::new(),
                images: Vec::new(),
                fingerprint: n.into(),
            });
        }
        let batch = builder.finish(ts());
        let order: Vec<_> = batch.records().iter().map(|r| r.fingerprint.as_str()).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn field_values_serialize_tagged() {
        let v = serde_json::to_value(FieldValue::Number(12.5)).unwrap();
        assert_eq!(v, serde_json::json!({"kind": "number", "value": 12.5}));
    }

    #[test]
    fn summary_flags_runs_without_content() {
        let summary = OutcomeSummary {
            failed: 2,
            invalid: 1,
            ..Default::default()
        };
        assert!(summary.nothing_collected());
        assert!(!OutcomeSummary::default().nothing_collected());
    }
}

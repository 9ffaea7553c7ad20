//! Cross-run deduplication ledger: identity -> last fingerprint + last sighting.
//!
//! The store is a plain value. Callers hold it exclusively (`&mut`) while a run
//! is in progress, which is what keeps writes single-threaded.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rdc_core::{DedupEntry, Identity};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::write_atomic;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    /// Identity never seen (or evicted).
    New,
    /// Identity seen before with different content.
    Updated { previous_fingerprint: String },
    /// Identity seen before with byte-identical content.
    Duplicate,
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DedupVerdict::Duplicate)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    capacity: usize,
    entries: Vec<DedupEntry>,
}

#[derive(Debug, Clone)]
pub struct DedupStore {
    entries: HashMap<Identity, DedupEntry>,
    by_age: BTreeSet<(DateTime<Utc>, Identity)>,
    capacity: usize,
}

impl DedupStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_age: BTreeSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn seen(&self, identity: &Identity) -> Option<&DedupEntry> {
        self.entries.get(identity)
    }

    pub fn classify(&self, identity: &Identity, fingerprint: &str) -> DedupVerdict {
        match self.entries.get(identity) {
            None => DedupVerdict::New,
            Some(entry) if entry.fingerprint == fingerprint => DedupVerdict::Duplicate,
            Some(entry) => DedupVerdict::Updated {
                previous_fingerprint: entry.fingerprint.clone(),
            },
        }
    }

    /// Upsert the entry and return how it compared to what was stored before.
    /// Duplicates refresh `last_seen` so retention counts from the latest sighting.
    pub fn record(
        &mut self,
        identity: &Identity,
        fingerprint: &str,
        timestamp: DateTime<Utc>,
    ) -> DedupVerdict {
        let verdict = self.classify(identity, fingerprint);
        if let Some(old) = self.entries.get(identity) {
            self.by_age.remove(&(old.last_seen, identity.clone()));
        }
        self.entries.insert(
            identity.clone(),
            DedupEntry {
                identity: identity.clone(),
                fingerprint: fingerprint.to_string(),
                last_seen: timestamp,
            },
        );
        self.by_age.insert((timestamp, identity.clone()));
        self.evict_over_capacity(identity);
        verdict
    }

    /// Oldest first, never the entry that was just written.
    fn evict_over_capacity(&mut self, keep: &Identity) {
        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .by_age
                .iter()
                .find(|(_, identity)| identity != keep)
                .cloned()
            else {
                break;
            };
            self.by_age.remove(&oldest);
            self.entries.remove(&oldest.1);
            debug!(identity = %oldest.1, "dedup entry evicted (capacity)");
        }
    }

    /// Drop every entry last seen before `cutoff`. Returns how many were dropped.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some((last_seen, _)) = self.by_age.first() {
            if *last_seen >= cutoff {
                break;
            }
            if let Some((_, identity)) = self.by_age.pop_first() {
                self.entries.remove(&identity);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.by_age.clear();
    }

    /// Entries oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &DedupEntry> {
        self.by_age
            .iter()
            .filter_map(|(_, identity)| self.entries.get(identity))
    }

    /// Load a snapshot; a missing file yields an empty store.
    pub async fn load(path: &Path, capacity: usize) -> anyhow::Result<Self> {
        let mut store = Self::new(capacity);
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(store);
        }
        let bytes = fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        anyhow::ensure!(
            snapshot.version == SNAPSHOT_VERSION,
            "unsupported dedup snapshot version {} in {}",
            snapshot.version,
            path.display()
        );
        for entry in snapshot.entries {
            store.record(&entry.identity, &entry.fingerprint, entry.last_seen);
        }
        Ok(store)
    }

    pub async fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            capacity: self.capacity,
            entries: self.entries().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).context("serializing dedup snapshot")?;
        write_atomic(path, &bytes).await
    }
}

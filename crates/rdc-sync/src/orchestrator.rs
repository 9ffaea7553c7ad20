//! One collection run: resolve every target concurrently, then validate,
//! normalize and deduplicate in completion order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rdc_adapters::{extract, AssetLoader};
use rdc_core::{Batch, BatchBuilder, CanonicalRecord, Identity, OutcomeSummary, RecordStatus, Strategy, Target};
use rdc_storage::{DedupStore, QuarantineStore};
use serde::{Deserialize, Serialize};
use tokio::task::{self, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::normalize::Normalizer;
use crate::retry::RetryController;
use crate::validate::Validator;

/// Extraction, validation and normalization rules of one source.
#[derive(Debug, Clone)]
pub struct SourcePipeline {
    pub validator: Validator,
    pub normalizer: Normalizer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub identity: Option<Identity>,
    pub source_id: String,
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub reasons: Vec<String>,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTarget {
    pub source_id: String,
    pub url: String,
    pub strategy: Option<Strategy>,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub batch: Batch,
    pub summary: OutcomeSummary,
    pub quarantine: Vec<QuarantinedRecord>,
    pub failures: Vec<FailedTarget>,
}

impl RunReport {
    pub fn run_id(&self) -> Uuid {
        self.batch.run_id()
    }
}

#[derive(Debug)]
enum TargetOutcome {
    Valid(CanonicalRecord),
    Invalid(QuarantinedRecord),
    Failed(FailedTarget),
}

struct Shared {
    controller: RetryController,
    assets: AssetLoader,
    pipelines: HashMap<String, SourcePipeline>,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    quarantine: Option<QuarantineStore>,
    dedup_retention: Option<Duration>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("sources", &self.shared.pipelines.keys().collect::<Vec<_>>())
            .field("quarantine", &self.quarantine)
            .field("dedup_retention", &self.dedup_retention)
            .finish()
    }
}

/// Key used to collapse repeated targets within a run.
fn dispatch_key(target: &Target) -> String {
    match Identity::from_url(&target.url) {
        Ok(identity) => format!("{}|{identity}", target.source_id),
        Err(_) => format!("{}|{}", target.source_id, target.url),
    }
}

impl Orchestrator {
    pub fn new(
        controller: RetryController,
        assets: AssetLoader,
        pipelines: HashMap<String, SourcePipeline>,
    ) -> Self {
        let assets = assets.with_permits(controller.lightweight_permits());
        Self {
            shared: Arc::new(Shared {
                controller,
                assets,
                pipelines,
            }),
            quarantine: None,
            dedup_retention: None,
        }
    }

    pub fn with_quarantine(mut self, store: QuarantineStore) -> Self {
        self.quarantine = Some(store);
        self
    }

    pub fn with_dedup_retention(mut self, retention: Option<Duration>) -> Self {
        self.dedup_retention = retention;
        self
    }

    pub async fn run(
        &self,
        targets: Vec<Target>,
        dedup: &mut DedupStore,
        deadline: Option<Instant>,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("collect_run", %run_id, targets = targets.len());
        self.run_inner(run_id, targets, dedup, deadline)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        targets: Vec<Target>,
        dedup: &mut DedupStore,
        deadline: Option<Instant>,
    ) -> RunReport {
        let started_at = Utc::now();
        if let Some(retention) = self.dedup_retention {
            if let Ok(age) = chrono::Duration::from_std(retention) {
                let evicted = dedup.evict_older_than(started_at - age);
                if evicted > 0 {
                    info!(evicted, "dedup entries expired");
                }
            }
        }

        let mut seen = HashSet::new();
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<task::Id, Target> = HashMap::new();
        for target in targets {
            if !seen.insert(dispatch_key(&target)) {
                debug!(url = %target.url, "repeated target collapsed");
                continue;
            }
            let shared = self.shared.clone();
            let task = target.clone();
            let handle =
                tasks.spawn(async move { process_target(shared, task).await }.in_current_span());
            in_flight.insert(handle.id(), target);
        }

        let mut batch = BatchBuilder::new(run_id, started_at);
        let mut summary = OutcomeSummary::default();
        let mut quarantine = Vec::new();
        let mut failures = Vec::new();

        loop {
            let joined = match deadline {
                Some(deadline) => tokio::select! {
                    joined = tasks.join_next_with_id() => joined,
                    _ = sleep_until(deadline) => {
                        summary.cancelled = tasks.len();
                        warn!(cancelled = summary.cancelled, "run deadline reached; flushing partial batch");
                        tasks.shutdown().await;
                        break;
                    }
                },
                None => tasks.join_next_with_id().await,
            };
            let Some(joined) = joined else { break };
            let joined = match joined {
                Ok((id, outcome)) => {
                    in_flight.remove(&id);
                    Ok(outcome)
                }
                Err(err) => Err((in_flight.remove(&err.id()), err)),
            };

            match joined {
                Ok(TargetOutcome::Valid(record)) => {
                    let verdict = dedup.record(&record.identity, &record.fingerprint, record.fetched_at);
                    if verdict.is_duplicate() {
                        debug!(identity = %record.identity, "unchanged record suppressed");
                        summary.duplicate += 1;
                    } else {
                        summary.valid += 1;
                        batch.push(record);
                    }
                }
                Ok(TargetOutcome::Invalid(record)) => {
                    summary.invalid += 1;
                    self.archive(&record).await;
                    quarantine.push(record);
                }
                Ok(TargetOutcome::Failed(failure)) => {
                    summary.failed += 1;
                    failures.push(failure);
                }
                Err((target, err)) => {
                    let (source_id, url) = target
                        .map(|t| (t.source_id, t.url))
                        .unwrap_or_default();
                    warn!(%url, "collection task aborted: {err}");
                    summary.failed += 1;
                    failures.push(FailedTarget {
                        source_id,
                        url,
                        strategy: None,
                        attempts: 0,
                        reason: format!("collection task aborted: {err}"),
                    });
                }
            }
        }

        self.shared.controller.finish_run().await;
        let batch = batch.finish(Utc::now());

        if summary.nothing_collected() {
            warn!(
                failed = summary.failed,
                invalid = summary.invalid,
                cancelled = summary.cancelled,
                "run collected no records"
            );
        }
        info!(
            valid = summary.valid,
            duplicate = summary.duplicate,
            invalid = summary.invalid,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "collection run complete"
        );

        RunReport {
            batch,
            summary,
            quarantine,
            failures,
        }
    }

    async fn archive(&self, record: &QuarantinedRecord) {
        let Some(store) = &self.quarantine else {
            return;
        };
        let identity = record.identity.as_ref().map(Identity::as_str).unwrap_or_default();
        if let Err(err) = store
            .archive(
                record.fetched_at,
                &record.source_id,
                identity,
                &record.url,
                record.payload.as_bytes(),
                &record.reasons,
            )
            .await
        {
            warn!(url = %record.url, "quarantine archive failed: {err:#}");
        }
    }
}

async fn process_target(shared: Arc<Shared>, target: Target) -> TargetOutcome {
    let failed = |record: &rdc_core::Record, reason: String| {
        TargetOutcome::Failed(FailedTarget {
            source_id: record.target.source_id.clone(),
            url: record.target.url.clone(),
            strategy: record.final_attempt.as_ref().map(|a| a.strategy),
            attempts: record.attempt_number(),
            reason,
        })
    };

    let mut record = shared.controller.resolve(target).await;
    if record.status() == RecordStatus::Failed {
        let reason = record.failure.clone().unwrap_or_else(|| "fetch failed".to_string());
        return failed(&record, reason);
    }

    let Some(pipeline) = shared.pipelines.get(&record.target.source_id) else {
        let reason = format!("no extraction rules for source `{}`", record.target.source_id);
        if let Err(err) = record.fail(reason.clone()) {
            warn!("recording failure: {err}");
        }
        return failed(&record, reason);
    };

    let payload = record.raw_payload.clone().unwrap_or_default();
    let mut raw = extract(
        pipeline.validator.profile(),
        &record.target.source_id,
        &record.target.url,
        &payload,
    );
    shared.assets.load(&mut raw).await;

    match pipeline.validator.validate(&record, &raw) {
        Ok(valid) => {
            if let Err(err) = record.transition(RecordStatus::Valid) {
                warn!("recording validity: {err}");
            }
            TargetOutcome::Valid(pipeline.normalizer.normalize(valid))
        }
        Err(rejected) => {
            if let Err(err) = record.transition(RecordStatus::Invalid) {
                warn!("recording invalidity: {err}");
            }
            debug!(url = %record.target.url, "{rejected}");
            TargetOutcome::Invalid(QuarantinedRecord {
                identity: record.identity().cloned(),
                source_id: record.target.source_id.clone(),
                url: record.target.url.clone(),
                fetched_at: record.fetched_at,
                reasons: rejected.messages(),
                payload,
            })
        }
    }
}

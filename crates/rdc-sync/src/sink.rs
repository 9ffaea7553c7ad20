//! Batch persistence: parquet run reports plus an in-memory sink for tests.

use std::fs::File;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use rdc_core::{Batch, CanonicalRecord, OutcomeSummary};
use rdc_storage::write_atomic;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

use crate::images::{prune_images_older_than, write_record_images, StoredImage, DEFAULT_THUMBNAIL_SIZE};
use crate::orchestrator::{FailedTarget, QuarantinedRecord, RunReport};

/// Receives each completed run. The batch is read-only from here on.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn accept(&self, report: &RunReport) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Contents of `summary.json`, also what `rdc-cli summary` prints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummaryFile {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: OutcomeSummary,
    pub records: usize,
    pub failures: Vec<FailedTarget>,
}

impl RunSummaryFile {
    pub fn from_report(report: &RunReport) -> Self {
        Self {
            run_id: report.batch.run_id(),
            started_at: report.batch.started_at(),
            finished_at: report.batch.finished_at(),
            summary: report.summary,
            records: report.batch.len(),
            failures: report.failures.clone(),
        }
    }
}

/// Writes `<reports_root>/<run_id>/{records,quarantine}.parquet`, `summary.json`,
/// the record images under `images/` and a `manifest.json` with checksums.
#[derive(Debug, Clone)]
pub struct ParquetSink {
    reports_root: PathBuf,
    thumbnail_size: Option<u32>,
    image_retention: Option<Duration>,
}

impl ParquetSink {
    pub fn new(reports_root: impl Into<PathBuf>) -> Self {
        Self {
            reports_root: reports_root.into(),
            thumbnail_size: Some(DEFAULT_THUMBNAIL_SIZE),
            image_retention: None,
        }
    }

    /// Bounding box of image previews; `None` skips them.
    pub fn with_thumbnails(mut self, size: Option<u32>) -> Self {
        self.thumbnail_size = size;
        self
    }

    /// After each accepted run, delete image files of runs at least this old.
    pub fn with_image_retention(mut self, retention: Option<Duration>) -> Self {
        self.image_retention = retention;
        self
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.reports_root.join(run_id.to_string())
    }
}

#[async_trait]
impl BatchSink for ParquetSink {
    async fn accept(&self, report: &RunReport) -> Result<()> {
        let run_dir = self.run_dir(report.run_id());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let mut images = Vec::with_capacity(report.batch.len());
        for record in report.batch.records() {
            images.push(write_record_images(&run_dir, record, self.thumbnail_size).await?);
        }

        let records_path = run_dir.join("records.parquet");
        let quarantine_path = run_dir.join("quarantine.parquet");
        write_records_parquet(&records_path, &report.batch, &images)?;
        write_quarantine_parquet(&quarantine_path, &report.quarantine)?;

        let summary_path = run_dir.join("summary.json");
        let summary = serde_json::to_vec_pretty(&RunSummaryFile::from_report(report))
            .context("serializing run summary")?;
        write_atomic(&summary_path, &summary).await?;

        let mut files = vec![
            manifest_entry("records", &run_dir, &records_path)?,
            manifest_entry("quarantine", &run_dir, &quarantine_path)?,
            manifest_entry("summary", &run_dir, &summary_path)?,
        ];
        let image_files: BTreeSet<&str> = images
            .iter()
            .flatten()
            .flat_map(|stored| std::iter::once(stored.path.as_str()).chain(stored.thumbnail.as_deref()))
            .collect();
        for rel in &image_files {
            files.push(manifest_entry("image", &run_dir, &run_dir.join(rel))?);
        }
        let manifest = ReportManifest {
            schema_version: 2,
            files,
        };
        let manifest_path = run_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
        write_atomic(&manifest_path, &bytes).await?;

        info!(
            dir = %run_dir.display(),
            records = report.batch.len(),
            image_files = image_files.len(),
            "run report written"
        );

        if let Some(retention) = self.image_retention {
            match prune_images_older_than(&self.reports_root, retention) {
                Ok(0) => {}
                Ok(removed) => info!(removed, "expired images removed"),
                Err(err) => warn!("image cleanup failed: {err:#}"),
            }
        }
        Ok(())
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn fields_json(record: &CanonicalRecord) -> Result<String> {
    serde_json::to_string(&record.fields)
        .with_context(|| format!("serializing fields of {}", record.identity))
}

fn image_column(stored: &[StoredImage], pick: impl Fn(&StoredImage) -> &str) -> Result<String> {
    serde_json::to_string(&stored.iter().map(pick).collect::<Vec<_>>())
        .context("serializing image column")
}

fn write_records_parquet(path: &Path, batch: &Batch, images: &[Vec<StoredImage>]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("identity", DataType::Utf8, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("fetched_at", DataType::Utf8, false),
        ArrowField::new("strategy", DataType::Utf8, false),
        ArrowField::new("attempt_number", DataType::UInt32, false),
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("fields_json", DataType::Utf8, false),
        ArrowField::new("image_count", DataType::UInt32, false),
        ArrowField::new("image_paths", DataType::Utf8, false),
        ArrowField::new("image_sha256", DataType::Utf8, false),
    ]));

    let records = batch.records();
    let identities = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.identity.as_str()))
            .collect::<Vec<_>>(),
    );
    let source_ids = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let urls = StringArray::from(records.iter().map(|r| Some(r.url.as_str())).collect::<Vec<_>>());
    let fetched_at = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.fetched_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let strategies = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.strategy_used.as_str()))
            .collect::<Vec<_>>(),
    );
    let attempts = UInt32Array::from(records.iter().map(|r| r.attempt_number).collect::<Vec<_>>());
    let fingerprints = StringArray::from(
        records
            .iter()
            .map(|r| Some(r.fingerprint.as_str()))
            .collect::<Vec<_>>(),
    );
    let fields = StringArray::from(
        records
            .iter()
            .map(|r| fields_json(r).map(Some))
            .collect::<Result<Vec<_>>>()?,
    );
    let image_counts = UInt32Array::from(
        records
            .iter()
            .map(|r| r.images.len() as u32)
            .collect::<Vec<_>>(),
    );
    let image_paths = StringArray::from(
        images
            .iter()
            .map(|stored| image_column(stored, |s| s.path.as_str()).map(Some))
            .collect::<Result<Vec<_>>>()?,
    );
    let image_sha256 = StringArray::from(
        images
            .iter()
            .map(|stored| image_column(stored, |s| s.sha256.as_str()).map(Some))
            .collect::<Result<Vec<_>>>()?,
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(identities),
            Arc::new(source_ids),
            Arc::new(urls),
            Arc::new(fetched_at),
            Arc::new(strategies),
            Arc::new(attempts),
            Arc::new(fingerprints),
            Arc::new(fields),
            Arc::new(image_counts),
            Arc::new(image_paths),
            Arc::new(image_sha256),
        ],
    )
    .context("building records record batch")?;
    write_parquet(path, batch)
}

fn write_quarantine_parquet(path: &Path, quarantined: &[QuarantinedRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("identity", DataType::Utf8, true),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("fetched_at", DataType::Utf8, false),
        ArrowField::new("reasons", DataType::Utf8, false),
    ]));

    let identities = StringArray::from(
        quarantined
            .iter()
            .map(|q| q.identity.as_ref().map(|i| i.as_str()))
            .collect::<Vec<_>>(),
    );
    let source_ids = StringArray::from(
        quarantined
            .iter()
            .map(|q| Some(q.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let urls = StringArray::from(
        quarantined
            .iter()
            .map(|q| Some(q.url.as_str()))
            .collect::<Vec<_>>(),
    );
    let fetched_at = StringArray::from(
        quarantined
            .iter()
            .map(|q| Some(q.fetched_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let reasons = StringArray::from(
        quarantined
            .iter()
            .map(|q| Some(q.reasons.join("; ")))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(identities),
            Arc::new(source_ids),
            Arc::new(urls),
            Arc::new(fetched_at),
            Arc::new(reasons),
        ],
    )
    .context("building quarantine record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Most recent run summary under `reports_root`, by `finished_at`.
pub fn latest_run_summary(reports_root: &Path) -> Result<Option<RunSummaryFile>> {
    if !reports_root.exists() {
        return Ok(None);
    }
    let mut latest: Option<RunSummaryFile> = None;
    let dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false));
    for dir in dirs {
        let path = dir.path().join("summary.json");
        if !path.exists() {
            continue;
        }
        let summary: RunSummaryFile = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;
        if latest
            .as_ref()
            .map_or(true, |current| summary.finished_at > current.finished_at)
        {
            latest = Some(summary);
        }
    }
    Ok(latest)
}

/// Keeps every accepted batch in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    accepted: Arc<Mutex<Vec<(Batch, OutcomeSummary)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> Vec<(Batch, OutcomeSummary)> {
        self.accepted
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn accept(&self, report: &RunReport) -> Result<()> {
        self.accepted
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink lock poisoned"))?
            .push((report.batch.clone(), report.summary));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rdc_core::{BatchBuilder, FieldValue, Identity, Strategy};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn report(finished_hour: u32) -> RunReport {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        let mut builder = BatchBuilder::new(Uuid::new_v4(), started);
        builder.push(CanonicalRecord {
            identity: Identity::from_url("https://example.com/a").unwrap(),
            source_id: "s".into(),
            url: "https://example.com/a".into(),
            fetched_at: started,
            strategy_used: Strategy::Rendered,
            attempt_number: 2,
            fields: BTreeMap::from([("title".to_string(), FieldValue::Text("A".into()))]),
            images: Vec::new(),
            fingerprint: "f".repeat(64),
        });
        let finished = Utc
            .with_ymd_and_hms(2026, 3, 1, finished_hour, 0, 0)
            .single()
            .unwrap();
        RunReport {
            batch: builder.finish(finished),
            summary: OutcomeSummary {
                valid: 1,
                failed: 1,
                ..OutcomeSummary::default()
            },
            quarantine: vec![QuarantinedRecord {
                identity: None,
                source_id: "s".into(),
                url: "https://example.com/b".into(),
                fetched_at: started,
                reasons: vec!["required field `title` is missing".into()],
                payload: "<p></p>".into(),
            }],
            failures: vec![FailedTarget {
                source_id: "s".into(),
                url: "https://example.com/c".into(),
                strategy: Some(Strategy::Lightweight),
                attempts: 2,
                reason: "timed out twice".into(),
            }],
        }
    }

    #[tokio::test]
    async fn parquet_sink_writes_report_with_manifest() {
        let dir = tempdir().unwrap();
        let sink = ParquetSink::new(dir.path());
        let report = report(7);
        sink.accept(&report).await.unwrap();

        let run_dir = sink.run_dir(report.run_id());
        for name in ["records.parquet", "quarantine.parquet", "summary.json", "manifest.json"] {
            assert!(run_dir.join(name).exists(), "{name} missing");
        }
        let manifest: ReportManifest =
            serde_json::from_slice(&std::fs::read(run_dir.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 3);
        assert!(manifest.files.iter().all(|f| f.sha256.len() == 64 && f.bytes > 0));
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, _| image::Rgb([(x % 250) as u8, 80, 120]));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn record_images_are_written_and_referenced() {
        use arrow_array::Array;
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let dir = tempdir().unwrap();
        let sink = ParquetSink::new(dir.path()).with_thumbnails(Some(120));
        let bytes = jpeg(480, 480);
        let mut with_image = report(7);
        let mut builder = BatchBuilder::new(with_image.run_id(), with_image.batch.started_at());
        for record in with_image.batch.records() {
            let mut record = record.clone();
            record.images.push(rdc_core::ImageAsset {
                field: "cover".into(),
                source: "cover.jpg".into(),
                media_type: "image/jpeg".into(),
                width: 480,
                height: 480,
                bytes: bytes.clone(),
            });
            builder.push(record);
        }
        with_image.batch = builder.finish(with_image.batch.finished_at());
        sink.accept(&with_image).await.unwrap();

        let run_dir = sink.run_dir(with_image.run_id());
        let sha = rdc_core::sha256_hex(&bytes);
        assert_eq!(std::fs::read(run_dir.join(format!("images/{sha}.jpg"))).unwrap(), bytes);
        let thumb = image::open(run_dir.join(format!("images/thumbs/{sha}.jpg"))).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (120, 120));

        let file = File::open(run_dir.join("records.parquet")).unwrap();
        let mut reader = ParquetRecordBatchReaderBuilder::try_new(file).unwrap().build().unwrap();
        let batch = reader.next().unwrap().unwrap();
        let column = |name: &str| {
            batch
                .column_by_name(name)
                .unwrap()
                .as_any()
                .downcast_ref::<StringArray>()
                .unwrap()
                .value(0)
                .to_string()
        };
        assert_eq!(column("image_paths"), format!("[\"images/{sha}.jpg\"]"));
        assert_eq!(column("image_sha256"), format!("[\"{sha}\"]"));
        assert_eq!(batch.column_by_name("image_count").unwrap().len(), 1);

        let manifest: ReportManifest =
            serde_json::from_slice(&std::fs::read(run_dir.join("manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.files.iter().filter(|f| f.name == "image").count(), 2);
    }

    #[tokio::test]
    async fn image_retention_prunes_after_each_run() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("old-run").join("images");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("gone.jpg"), b"x").unwrap();

        let sink = ParquetSink::new(dir.path()).with_image_retention(Some(Duration::ZERO));
        sink.accept(&report(7)).await.unwrap();
        assert!(!stale.join("gone.jpg").exists());
        assert!(dir.path().join("old-run").exists());
    }

    #[tokio::test]
    async fn latest_summary_picks_most_recent_run() {
        let dir = tempdir().unwrap();
        assert!(latest_run_summary(&dir.path().join("missing")).unwrap().is_none());

        let sink = ParquetSink::new(dir.path());
        let older = report(7);
        let newer = report(9);
        sink.accept(&newer).await.unwrap();
        sink.accept(&older).await.unwrap();

        let latest = latest_run_summary(dir.path()).unwrap().unwrap();
        assert_eq!(latest.run_id, newer.run_id());
        assert_eq!(latest.summary.failed, 1);
        assert_eq!(latest.failures[0].attempts, 2);
    }
}

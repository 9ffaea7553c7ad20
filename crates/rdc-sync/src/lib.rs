//! Collection pipeline: configuration, retry control, validation,
//! normalization, orchestration, scheduling and run reports.

pub mod config;
pub mod images;
pub mod normalize;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rdc_adapters::{
    AssetLoader, LightweightStrategy, MarkerClassifier, PageClassifier, RenderOptions,
    RenderedStrategy, UserAgentPool, DEFAULT_BLOCK_MARKERS, DEFAULT_RENDER_MARKERS,
};
use rdc_core::OutcomeSummary;
use rdc_storage::{DedupStore, HttpFetcher, QuarantineStore};
use tokio::time::Instant;
use tracing::info;

pub use config::{CollectorConfig, CollectorEnv, ConfigError, Settings, SkippedSource, SourceConfig};
pub use images::{prune_images_older_than, StoredImage};
pub use normalize::Normalizer;
pub use orchestrator::{FailedTarget, Orchestrator, QuarantinedRecord, RunReport, SourcePipeline};
pub use retry::{RetryController, RetryLimits};
pub use scheduler::{
    CollectionJob, ScheduledJob, Scheduler, SchedulerHandle, SchedulerOptions, SchedulerState,
    SchedulerStatus, TickSource,
};
pub use sink::{latest_run_summary, BatchSink, MemorySink, ParquetSink, RunSummaryFile};
pub use validate::{ImageRules, InvalidReason, Rejected, ValidRecord, Validator};

pub const CRATE_NAME: &str = "rdc-sync";

fn markers(configured: &Option<Vec<String>>, defaults: &[&str]) -> Vec<String> {
    configured
        .clone()
        .unwrap_or_else(|| defaults.iter().map(|m| m.to_string()).collect())
}

pub fn marker_classifier(settings: &Settings) -> MarkerClassifier {
    MarkerClassifier::new(
        markers(&settings.render_markers, DEFAULT_RENDER_MARKERS),
        markers(&settings.block_markers, DEFAULT_BLOCK_MARKERS),
    )
}

pub fn build_pipelines(config: &CollectorConfig) -> Result<HashMap<String, SourcePipeline>, ConfigError> {
    let settings = &config.settings;
    let image_rules = ImageRules {
        min_width: settings.image_min_width,
        min_height: settings.image_min_height,
        max_bytes: settings.image_max_bytes,
    };
    config
        .enabled_sources()
        .map(|source| {
            let normalizer = Normalizer::new(source.rename.clone(), settings.max_image_dimension)
                .map_err(|reason| ConfigError::Source {
                    source_id: source.source_id.clone(),
                    reason,
                })?;
            let pipeline = SourcePipeline {
                validator: Validator::new(source.profile(), image_rules),
                normalizer,
            };
            Ok((source.source_id.clone(), pipeline))
        })
        .collect()
}

/// Wire the live strategies, quarantine, dedup snapshot and parquet sink.
pub async fn build_collection_job(env: &CollectorEnv, config: &CollectorConfig) -> Result<CollectionJob> {
    let settings = &config.settings;
    let http = Arc::new(HttpFetcher::new(settings.http_client(env.user_agent.clone()))?);
    let classifier: Arc<dyn PageClassifier> = Arc::new(marker_classifier(settings));

    let lightweight = Arc::new(LightweightStrategy::new(http.clone(), classifier.clone()));
    let rendered = Arc::new(RenderedStrategy::new(
        RenderOptions {
            chrome_path: env.chrome_path.clone(),
            ready_timeout: settings
                .render_timeout()
                .min(RenderOptions::default().ready_timeout),
            ..Default::default()
        },
        UserAgentPool::new(settings.user_agents.clone()),
        classifier,
    ));
    let controller = RetryController::new(
        lightweight,
        rendered,
        RetryLimits {
            policy: settings.backoff(),
            attempt_timeout: settings.attempt_timeout(),
            render_timeout: settings.render_timeout(),
            concurrency_lightweight: settings.concurrency_lightweight,
            concurrency_rendered: settings.concurrency_rendered,
        },
    );

    let orchestrator = Orchestrator::new(
        controller,
        AssetLoader::new(Some(http), settings.image_max_bytes),
        build_pipelines(config)?,
    )
    .with_quarantine(QuarantineStore::new(env.quarantine_dir()))
    .with_dedup_retention(settings.dedup_retention());

    let dedup_path = env.dedup_path();
    let dedup = DedupStore::load(&dedup_path, settings.dedup_capacity)
        .await
        .with_context(|| format!("loading dedup state {}", dedup_path.display()))?;
    info!(entries = dedup.len(), "dedup state loaded");

    Ok(CollectionJob::new(
        orchestrator,
        config.targets(),
        dedup,
        Arc::new(
            ParquetSink::new(&env.reports_dir)
                .with_thumbnails(settings.thumbnail_size())
                .with_image_retention(settings.image_retention()),
        ),
    )
    .with_dedup_path(dedup_path))
}

/// Load config from the environment and perform a single run.
pub async fn run_once_from_env() -> Result<OutcomeSummary> {
    let env = CollectorEnv::from_env();
    let config = CollectorConfig::load(&env.config_path)?;
    let job = build_collection_job(&env, &config).await?;
    let deadline = config.settings.run_budget().map(|budget| Instant::now() + budget);
    job.run(deadline).await
}

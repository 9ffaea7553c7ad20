#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rdc_adapters::{
    AssetLoader, ExtractionProfile, FetchError, FetchStrategy, FetchedPage, FieldKind, FieldRule,
    PayloadFormat,
};
use rdc_core::{Strategy, Target};
use rdc_storage::BackoffPolicy;
use rdc_sync::{
    ImageRules, Normalizer, Orchestrator, RetryController, RetryLimits, SourcePipeline, Validator,
};

pub const SOURCE: &str = "shop";

#[derive(Debug, Clone)]
pub enum Step {
    Page(String),
    Fail(FetchError),
    /// Respond with a page after the delay.
    Slow(Duration, String),
    /// The backend itself crashes.
    Panic(String),
}

/// Scripted in-memory site: per-URL queue of responses, the last one repeating.
pub struct FakeSite {
    strategy: Strategy,
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl FakeSite {
    pub fn new(strategy: Strategy) -> Arc<Self> {
        Arc::new(Self {
            strategy,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn script(&self, url: &str, steps: Vec<Step>) {
        self.script
            .lock()
            .unwrap()
            .insert(url.to_string(), steps.into_iter().collect());
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    fn next_step(&self, url: &str) -> Option<Step> {
        let mut script = self.script.lock().unwrap();
        let queue = script.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl FetchStrategy for FakeSite {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    async fn attempt(&self, target: &Target) -> Result<FetchedPage, FetchError> {
        *self.calls.lock().unwrap().entry(target.url.clone()).or_default() += 1;
        let page = |body: String| FetchedPage {
            url: target.url.clone(),
            final_url: target.url.clone(),
            content_type: Some("text/html".into()),
            body,
            fetched_at: Utc::now(),
        };
        match self.next_step(&target.url) {
            Some(Step::Page(body)) => Ok(page(body)),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Slow(delay, body)) => {
                tokio::time::sleep(delay).await;
                Ok(page(body))
            }
            Some(Step::Panic(message)) => panic!("{message}"),
            None => Err(FetchError::Configuration(format!("unscripted url {}", target.url))),
        }
    }
}

pub fn product(title: &str, price: &str) -> String {
    format!(
        "<html><body><main><h1>{title}</h1><span class=\"price\">{price}</span></main></body></html>"
    )
}

pub fn url(path: &str) -> String {
    format!("https://shop.example.com/{path}")
}

pub fn target(path: &str) -> Target {
    Target::new(SOURCE, url(path))
}

pub fn profile() -> ExtractionProfile {
    ExtractionProfile {
        format: PayloadFormat::Html,
        fields: vec![
            FieldRule::new("title", "main h1", FieldKind::Text).required(),
            FieldRule::new("price", ".price", FieldKind::Number).required(),
        ],
    }
}

pub fn limits() -> RetryLimits {
    RetryLimits {
        policy: BackoffPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        attempt_timeout: Duration::from_secs(20),
        render_timeout: Duration::from_secs(30),
        concurrency_lightweight: 4,
        concurrency_rendered: 1,
    }
}

pub fn pipeline(profile: ExtractionProfile) -> SourcePipeline {
    SourcePipeline {
        validator: Validator::new(profile, ImageRules::default()),
        normalizer: Normalizer::new(Default::default(), 1200).unwrap(),
    }
}

pub fn orchestrator_for(
    light: Arc<FakeSite>,
    rendered: Arc<FakeSite>,
    pipelines: HashMap<String, SourcePipeline>,
) -> Orchestrator {
    Orchestrator::new(
        RetryController::new(light, rendered, limits()),
        AssetLoader::new(None, 1024 * 1024),
        pipelines,
    )
}

pub fn orchestrator(light: Arc<FakeSite>, rendered: Arc<FakeSite>) -> Orchestrator {
    orchestrator_for(light, rendered, HashMap::from([(SOURCE.to_string(), pipeline(profile()))]))
}

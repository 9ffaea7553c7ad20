use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rdc_core::{Strategy, Target};
use rdc_storage::HttpFetcher;
use tracing::debug;

use crate::{FetchError, FetchStrategy, FetchedPage, PageClassifier, PageVerdict};

/// Plain HTTP GET. Fails fast as `Blocked` on denials and on pages that need a browser.
#[derive(Debug, Clone)]
pub struct LightweightStrategy {
    http: Arc<HttpFetcher>,
    classifier: Arc<dyn PageClassifier>,
}

impl LightweightStrategy {
    pub fn new(http: Arc<HttpFetcher>, classifier: Arc<dyn PageClassifier>) -> Self {
        Self { http, classifier }
    }
}

#[async_trait]
impl FetchStrategy for LightweightStrategy {
    fn strategy(&self) -> Strategy {
        Strategy::Lightweight
    }

    async fn attempt(&self, target: &Target) -> Result<FetchedPage, FetchError> {
        let resp = self.http.get(&target.url, None).await?;
        let page = FetchedPage {
            url: target.url.clone(),
            final_url: resp.final_url.clone(),
            content_type: resp.content_type.clone(),
            body: resp.text(),
            fetched_at: Utc::now(),
        };

        match self.classifier.classify(&page) {
            PageVerdict::Ready => Ok(page),
            PageVerdict::NeedsRendering(why) => {
                debug!(url = %target.url, %why, "page requires script execution");
                Err(FetchError::Blocked(format!("requires rendering: {why}")))
            }
            PageVerdict::Blocked(why) => Err(FetchError::Blocked(why)),
        }
    }
}

//! Browser-rendered fetches through a pooled Chromium instance.
//!
//! The browser is launched on the first rendered attempt, so runs that never
//! escalate never pay for a browser process. Sessions (tabs) are checked out
//! per attempt and returned to the pool on success; each new session gets the
//! next user agent from the rotation. An attempt that is cancelled mid-render
//! still closes its tab.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::page::Page;
use chrono::Utc;
use futures::StreamExt;
use rdc_core::{Strategy, Target};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{FetchError, FetchStrategy, FetchedPage, PageClassifier, PageVerdict, UserAgentPool};

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub chrome_path: Option<PathBuf>,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            chrome_path: None,
            ready_timeout: Duration::from_secs(15),
            ready_poll: Duration::from_millis(200),
        }
    }
}

/// Locate a Chromium binary: explicit path first, then the usual names on PATH.
pub fn find_chromium(explicit: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.clone());
        }
    }
    ["google-chrome", "chromium", "chromium-browser"]
        .iter()
        .find_map(|name| which::which(name).ok())
}

struct Session {
    page: Page,
    user_agent: String,
}

/// Spawns `cleanup` on the current runtime if dropped before [`disarm`](Self::disarm).
struct CleanupOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    cleanup: Option<F>,
}

impl<F> CleanupOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F> Drop for CleanupOnDrop<F>
where
    F: Future<Output = ()> + Send + 'static,
{
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(cleanup);
            }
            Err(_) => warn!("no runtime left to close an abandoned browser tab"),
        }
    }
}

struct RunningBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
}

pub struct RenderedStrategy {
    options: RenderOptions,
    user_agents: UserAgentPool,
    classifier: Arc<dyn PageClassifier>,
    browser: Mutex<Option<RunningBrowser>>,
    idle: Mutex<Vec<Session>>,
}

impl std::fmt::Debug for RenderedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderedStrategy")
            .field("options", &self.options)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl RenderedStrategy {
    pub fn new(
        options: RenderOptions,
        user_agents: UserAgentPool,
        classifier: Arc<dyn PageClassifier>,
    ) -> Self {
        Self {
            options,
            user_agents,
            classifier,
            browser: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn launch(&self) -> anyhow::Result<RunningBrowser> {
        let mut builder = BrowserConfig::builder()
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking");
        if let Some(path) = find_chromium(self.options.chrome_path.as_ref()) {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("building browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("launching Chromium")?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    debug!("browser handler event error");
                }
            }
        });
        info!("browser launched for rendered fetches");
        Ok(RunningBrowser { browser, handler })
    }

    async fn checkout(&self) -> Result<Session, FetchError> {
        if let Some(session) = self.idle.lock().await.pop() {
            return Ok(session);
        }

        let mut guard = self.browser.lock().await;
        if guard.is_none() {
            let running = self
                .launch()
                .await
                .map_err(|e| FetchError::Configuration(format!("browser unavailable: {e:#}")))?;
            *guard = Some(running);
        }
        let Some(running) = guard.as_ref() else {
            return Err(FetchError::Configuration("browser unavailable".into()));
        };

        let page = running
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| FetchError::Transient(format!("opening browser tab: {e}")))?;
        let user_agent = self.user_agents.next_agent().to_string();
        page.execute(SetUserAgentOverrideParams::new(user_agent.clone()))
            .await
            .map_err(|e| FetchError::Transient(format!("setting user agent: {e}")))?;
        debug!(%user_agent, "new browser session");
        Ok(Session { page, user_agent })
    }

    async fn checkin(&self, session: Session) {
        self.idle.lock().await.push(session);
    }

    async fn discard(&self, session: Session) {
        debug!(user_agent = %session.user_agent, "discarding browser session");
        if let Err(err) = session.page.close().await {
            debug!("closing browser tab: {err}");
        }
    }

    async fn wait_until_ready(&self, page: &Page, target: &Target) -> Result<(), FetchError> {
        let Some(selector) = target.ready_selector.as_deref() else {
            return page
                .wait_for_navigation()
                .await
                .map(|_| ())
                .map_err(|e| FetchError::Transient(format!("waiting for navigation: {e}")));
        };

        let deadline = Instant::now() + self.options.ready_timeout;
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FetchError::Timeout(format!(
                    "`{selector}` not present on {} after {:?}",
                    target.url, self.options.ready_timeout
                )));
            }
            tokio::time::sleep(self.options.ready_poll).await;
        }
    }

    async fn render(&self, page: &Page, target: &Target) -> Result<FetchedPage, FetchError> {
        page.goto(target.url.as_str())
            .await
            .map_err(|e| FetchError::Transient(format!("navigating to {}: {e}", target.url)))?;
        self.wait_until_ready(page, target).await?;

        let body = page
            .content()
            .await
            .map_err(|e| FetchError::Transient(format!("reading rendered content: {e}")))?;
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .map(|u| u.to_string())
            .unwrap_or_else(|| target.url.clone());

        let fetched = FetchedPage {
            url: target.url.clone(),
            final_url,
            content_type: Some("text/html".to_string()),
            body,
            fetched_at: Utc::now(),
        };
        // Render markers stay in the DOM (noscript) after rendering; only denials count here.
        match self.classifier.classify(&fetched) {
            PageVerdict::Blocked(why) => Err(FetchError::Blocked(why)),
            PageVerdict::Ready | PageVerdict::NeedsRendering(_) => Ok(fetched),
        }
    }

    /// Close the browser process. Subsequent attempts relaunch it.
    pub async fn shutdown(&self) {
        self.finish_run().await;
        if let Some(mut running) = self.browser.lock().await.take() {
            if let Err(err) = running.browser.close().await {
                warn!("closing browser: {err}");
            }
            running.handler.abort();
        }
    }
}

#[async_trait]
impl FetchStrategy for RenderedStrategy {
    fn strategy(&self) -> Strategy {
        Strategy::Rendered
    }

    async fn attempt(&self, target: &Target) -> Result<FetchedPage, FetchError> {
        let session = self.checkout().await?;
        // Timeouts and run deadlines drop this future; the tab must not outlive it.
        let page = session.page.clone();
        let abandoned = CleanupOnDrop::new(async move {
            debug!("closing tab of a cancelled render");
            if let Err(err) = page.close().await {
                debug!("closing browser tab: {err}");
            }
        });
        let result = match self.render(&session.page, target).await {
            Ok(page) => {
                self.checkin(session).await;
                Ok(page)
            }
            Err(err) => {
                // A session that was denied or errored is not reused; the next one gets a fresh identity.
                self.discard(session).await;
                Err(err)
            }
        };
        abandoned.disarm();
        result
    }

    async fn finish_run(&self) {
        let sessions: Vec<Session> = std::mem::take(&mut *self.idle.lock().await);
        for session in sessions {
            self.discard(session).await;
        }
    }
}

//! Per-target resolution: strategy selection, escalation and backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rdc_adapters::{FetchError, FetchStrategy, FetchedPage};
use rdc_core::{AttemptOutcome, FetchAttempt, Identity, IdentityKey, Record, Strategy, Target};
use rdc_storage::BackoffPolicy;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info_span, warn, Instrument};

/// Timeouts tolerated per resolution before giving up.
pub const MAX_TIMEOUTS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Retry,
    GiveUp(String),
}

/// Mutable state of one target's resolution.
#[derive(Debug, Clone)]
struct Resolution {
    strategy: Strategy,
    attempts_made: u32,
    timeouts_seen: u32,
    next_eligible_at: Instant,
}

impl Resolution {
    fn new(now: Instant) -> Self {
        Self {
            strategy: Strategy::Lightweight,
            attempts_made: 0,
            timeouts_seen: 0,
            next_eligible_at: now,
        }
    }

    fn after_failure(&mut self, err: &FetchError, max_attempts: u32) -> Decision {
        match err {
            FetchError::Configuration(reason) => return Decision::GiveUp(reason.clone()),
            FetchError::Blocked(reason) => {
                if self.strategy == Strategy::Rendered {
                    return Decision::GiveUp(format!("blocked while rendering: {reason}"));
                }
                // Sticky: every later attempt on this target renders.
                self.strategy = Strategy::Rendered;
            }
            FetchError::Timeout(reason) => {
                self.timeouts_seen += 1;
                if self.timeouts_seen >= MAX_TIMEOUTS {
                    return Decision::GiveUp(format!("timed out twice: {reason}"));
                }
            }
            FetchError::Transient(_) => {}
        }
        if self.attempts_made >= max_attempts {
            Decision::GiveUp(format!("gave up after {} attempts: {err}", self.attempts_made))
        } else {
            Decision::Retry
        }
    }
}

/// Drives one target to a terminal fetch result, never raising.
#[derive(Clone)]
pub struct RetryController {
    lightweight: Arc<dyn FetchStrategy>,
    rendered: Arc<dyn FetchStrategy>,
    lightweight_permits: Arc<Semaphore>,
    rendered_permits: Arc<Semaphore>,
    policy: BackoffPolicy,
    attempt_timeout: Duration,
    render_timeout: Duration,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("render_timeout", &self.render_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryLimits {
    pub policy: BackoffPolicy,
    pub attempt_timeout: Duration,
    pub render_timeout: Duration,
    pub concurrency_lightweight: usize,
    pub concurrency_rendered: usize,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::default(),
            attempt_timeout: Duration::from_secs(20),
            render_timeout: Duration::from_secs(45),
            concurrency_lightweight: 8,
            concurrency_rendered: 2,
        }
    }
}

impl RetryController {
    pub fn new(
        lightweight: Arc<dyn FetchStrategy>,
        rendered: Arc<dyn FetchStrategy>,
        limits: RetryLimits,
    ) -> Self {
        Self {
            lightweight,
            rendered,
            lightweight_permits: Arc::new(Semaphore::new(limits.concurrency_lightweight.max(1))),
            rendered_permits: Arc::new(Semaphore::new(limits.concurrency_rendered.max(1))),
            policy: limits.policy,
            attempt_timeout: limits.attempt_timeout,
            render_timeout: limits.render_timeout,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Permits bounding in-flight lightweight fetches. Asset downloads share them.
    pub fn lightweight_permits(&self) -> Arc<Semaphore> {
        self.lightweight_permits.clone()
    }

    /// Upper bound on how long `resolve` can take.
    pub fn worst_case_duration(&self) -> Duration {
        let per_attempt = self.attempt_timeout.max(self.render_timeout);
        self.policy.worst_case_wait() + per_attempt.saturating_mul(self.policy.max_attempts)
    }

    pub async fn resolve(&self, target: Target) -> Record {
        let span = info_span!("resolve", target = %target.url, source = %target.source_id);
        self.resolve_inner(target).instrument(span).await
    }

    async fn resolve_inner(&self, target: Target) -> Record {
        let mut record = Record::pending(target.clone(), Utc::now());
        let mut state = Resolution::new(Instant::now());

        loop {
            sleep_until(state.next_eligible_at).await;
            state.attempts_made += 1;
            let strategy = state.strategy;
            let started = Instant::now();
            let result = self.attempt_once(strategy, &target).await;

            record.strategy_used = strategy;
            record.final_attempt = Some(FetchAttempt {
                target: target.url.clone(),
                strategy,
                outcome: result.as_ref().map_or_else(FetchError::outcome, |_| AttemptOutcome::Success),
                attempt_number: state.attempts_made,
                elapsed: started.elapsed(),
            });

            let err = match result {
                Ok(page) => {
                    accept_page(&mut record, page);
                    debug!(attempts = state.attempts_made, %strategy, "target resolved");
                    return record;
                }
                Err(err) => err,
            };

            match state.after_failure(&err, self.policy.max_attempts) {
                Decision::Retry => {
                    if strategy != state.strategy {
                        warn!(%err, "lightweight fetch blocked; escalating to rendered");
                    } else {
                        debug!(%err, attempt = state.attempts_made, "attempt failed; retrying");
                    }
                    let delay = self
                        .policy
                        .jittered_delay(state.attempts_made - 1, &mut rand::thread_rng());
                    state.next_eligible_at = Instant::now() + delay;
                }
                Decision::GiveUp(reason) => {
                    warn!(%reason, attempts = state.attempts_made, "target failed");
                    if let Err(err) = record.fail(reason) {
                        warn!("recording failure: {err}");
                    }
                    return record;
                }
            }
        }
    }

    /// One bounded attempt. The permit is held only while the attempt runs.
    async fn attempt_once(&self, strategy: Strategy, target: &Target) -> Result<FetchedPage, FetchError> {
        let (backend, permits, limit) = match strategy {
            Strategy::Lightweight => (&self.lightweight, &self.lightweight_permits, self.attempt_timeout),
            Strategy::Rendered => (&self.rendered, &self.rendered_permits, self.render_timeout),
        };
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| FetchError::Configuration("fetch permits closed".to_string()))?;
        match tokio::time::timeout(limit, backend.attempt(target)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(format!(
                "{} attempt exceeded {limit:?}",
                strategy
            ))),
        }
    }

    /// Release pooled resources once a run is over.
    pub async fn finish_run(&self) {
        self.lightweight.finish_run().await;
        self.rendered.finish_run().await;
    }
}

fn accept_page(record: &mut Record, page: FetchedPage) {
    record.fetched_at = page.fetched_at;
    if record.target.identity_key == IdentityKey::Content && record.identity().is_none() {
        if let Err(err) = record.assign_identity(Identity::from_content(page.body.as_bytes())) {
            warn!("assigning content identity: {err}");
        }
    }
    record.raw_payload = Some(page.body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn page(target: &Target) -> FetchedPage {
        FetchedPage {
            url: target.url.clone(),
            final_url: target.url.clone(),
            content_type: Some("text/html".into()),
            body: "<h1>ok</h1>".into(),
            fetched_at: Utc::now(),
        }
    }

    /// Replays a fixed list of results, then repeats the last one.
    struct Scripted {
        strategy: Strategy,
        script: Mutex<Vec<Result<(), FetchError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(strategy: Strategy, script: Vec<Result<(), FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                strategy,
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl FetchStrategy for Scripted {
        fn strategy(&self) -> Strategy {
            self.strategy
        }

        async fn attempt(&self, target: &Target) -> Result<FetchedPage, FetchError> {
            *self.calls.lock().unwrap() += 1;
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    script[0].clone()
                }
            };
            next.map(|_| page(target))
        }
    }

    fn limits(max_attempts: u32) -> RetryLimits {
        RetryLimits {
            policy: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            },
            ..RetryLimits::default()
        }
    }

    fn target() -> Target {
        Target::new("s", "https://example.com/a")
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let light = Scripted::new(
            Strategy::Lightweight,
            vec![Err(FetchError::Transient("reset".into())), Ok(())],
        );
        let rendered = Scripted::new(Strategy::Rendered, vec![Ok(())]);
        let controller = RetryController::new(light.clone(), rendered.clone(), limits(4));

        let record = controller.resolve(target()).await;
        assert_eq!(record.attempt_number(), 2);
        assert_eq!(record.strategy_used, Strategy::Lightweight);
        assert!(record.raw_payload.is_some());
        assert_eq!(rendered.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_is_sticky() {
        let light = Scripted::new(Strategy::Lightweight, vec![Err(FetchError::Blocked("403".into()))]);
        let rendered = Scripted::new(
            Strategy::Rendered,
            vec![
                Err(FetchError::Transient("tab crashed".into())),
                Err(FetchError::Transient("tab crashed".into())),
                Ok(()),
            ],
        );
        let controller = RetryController::new(light.clone(), rendered.clone(), limits(5));

        let record = controller.resolve(target()).await;
        assert_eq!(light.calls(), 1);
        assert_eq!(rendered.calls(), 3);
        assert_eq!(record.strategy_used, Strategy::Rendered);
        assert_eq!(record.attempt_number(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_while_rendering_is_terminal() {
        let light = Scripted::new(Strategy::Lightweight, vec![Err(FetchError::Blocked("429".into()))]);
        let rendered = Scripted::new(Strategy::Rendered, vec![Err(FetchError::Blocked("captcha".into()))]);
        let controller = RetryController::new(light, rendered.clone(), limits(5));

        let record = controller.resolve(target()).await;
        assert_eq!(record.status(), rdc_core::RecordStatus::Failed);
        assert!(record.raw_payload.is_none());
        assert_eq!(rendered.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_timeout_is_terminal() {
        let light = Scripted::new(Strategy::Lightweight, vec![Err(FetchError::Timeout("slow".into()))]);
        let rendered = Scripted::new(Strategy::Rendered, vec![Ok(())]);
        let controller = RetryController::new(light.clone(), rendered, limits(4));

        let record = controller.resolve(target()).await;
        assert_eq!(record.status(), rdc_core::RecordStatus::Failed);
        assert_eq!(light.calls(), MAX_TIMEOUTS);
        assert_eq!(
            record.final_attempt.as_ref().map(|a| a.outcome),
            Some(AttemptOutcome::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_capped_and_bounded_in_time() {
        let light = Scripted::new(Strategy::Lightweight, vec![Err(FetchError::Transient("dns".into()))]);
        let rendered = Scripted::new(Strategy::Rendered, vec![Ok(())]);
        let controller = RetryController::new(light.clone(), rendered, limits(3));

        let started = Instant::now();
        let record = controller.resolve(target()).await;
        assert_eq!(light.calls(), 3);
        assert_eq!(record.status(), rdc_core::RecordStatus::Failed);
        assert!(started.elapsed() <= controller.policy().worst_case_wait());
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_errors_are_not_retried() {
        let light = Scripted::new(
            Strategy::Lightweight,
            vec![Err(FetchError::Configuration("bad url".into()))],
        );
        let rendered = Scripted::new(Strategy::Rendered, vec![Ok(())]);
        let controller = RetryController::new(light.clone(), rendered, limits(4));

        let record = controller.resolve(target()).await;
        assert_eq!(light.calls(), 1);
        assert_eq!(record.failure.as_deref(), Some("bad url"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_time_out() {
        struct Hangs;

        #[async_trait]
        impl FetchStrategy for Hangs {
            fn strategy(&self) -> Strategy {
                Strategy::Lightweight
            }

            async fn attempt(&self, _target: &Target) -> Result<FetchedPage, FetchError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(FetchError::Transient("unreachable".into()))
            }
        }

        let rendered = Scripted::new(Strategy::Rendered, vec![Ok(())]);
        let controller = RetryController::new(Arc::new(Hangs), rendered, limits(4));
        let record = controller.resolve(target()).await;
        assert_eq!(record.status(), rdc_core::RecordStatus::Failed);
        assert_eq!(record.attempt_number(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn content_identity_is_assigned_after_fetch() {
        let light = Scripted::new(Strategy::Lightweight, vec![Ok(())]);
        let rendered = Scripted::new(Strategy::Rendered, vec![Ok(())]);
        let controller = RetryController::new(light, rendered, limits(2));

        let record = controller
            .resolve(target().with_identity_key(IdentityKey::Content))
            .await;
        assert_eq!(
            record.identity(),
            Some(&Identity::from_content(b"<h1>ok</h1>"))
        );
    }
}

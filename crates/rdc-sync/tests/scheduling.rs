mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use common::{orchestrator, product, target, url, FakeSite, Step};
use rdc_core::{OutcomeSummary, Strategy};
use rdc_storage::DedupStore;
use rdc_sync::{
    BatchSink, CollectionJob, ConfigError, MemorySink, RunReport, ScheduledJob, Scheduler,
    SchedulerOptions, SchedulerState, TickSource,
};
use tempfile::tempdir;
use tokio::time::{sleep, Instant};

/// Job that takes a fixed time and records overlap.
struct SlowJob {
    duration: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
    deadlines: Mutex<Vec<Option<Instant>>>,
}

impl SlowJob {
    fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            duration,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            deadlines: Mutex::new(Vec::new()),
        })
    }

    fn starts(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScheduledJob for SlowJob {
    async fn run(&self, deadline: Option<Instant>) -> Result<OutcomeSummary> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.starts.lock().unwrap().push(Instant::now());
        self.deadlines.lock().unwrap().push(deadline);
        sleep(self.duration).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(OutcomeSummary {
            valid: 1,
            ..Default::default()
        })
    }
}

fn every(period: Duration, min_gap: Duration) -> SchedulerOptions {
    SchedulerOptions {
        tick: TickSource::Interval(period),
        min_gap,
        run_budget: None,
    }
}

#[tokio::test(start_paused = true)]
async fn slow_runs_never_overlap_and_count_missed_ticks() {
    let job = SlowJob::new(Duration::from_millis(2500));
    let handle = Scheduler::spawn(every(Duration::from_secs(1), Duration::ZERO), job.clone())
        .await
        .unwrap();

    sleep(Duration::from_millis(6500)).await;
    let status = handle.stop().await.unwrap();

    assert_eq!(job.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(status.completed_runs >= 2, "{status:?}");
    assert!(status.missed_ticks >= 2, "{status:?}");
    assert_eq!(status.state, SchedulerState::Idle);
    assert_eq!(status.last_summary.map(|s| s.valid), Some(1));
}

#[tokio::test(start_paused = true)]
async fn min_gap_separates_consecutive_runs() {
    let job = SlowJob::new(Duration::from_secs(1));
    let handle = Scheduler::spawn(
        every(Duration::from_secs(1), Duration::from_secs(5)),
        job.clone(),
    )
    .await
    .unwrap();

    sleep(Duration::from_secs(20)).await;
    handle.stop().await.unwrap();

    let starts = job.starts();
    assert!(starts.len() >= 2);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(6), "{:?}", pair[1] - pair[0]);
    }
}

#[tokio::test(start_paused = true)]
async fn run_now_while_running_is_dropped() {
    let job = SlowJob::new(Duration::from_secs(10));
    let handle = Scheduler::spawn(every(Duration::from_secs(3600), Duration::ZERO), job.clone())
        .await
        .unwrap();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.status().state, SchedulerState::Running);
    assert!(handle.run_now().await);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(handle.status().missed_ticks, 1);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(handle.status().state, SchedulerState::Idle);
    assert!(handle.run_now().await);
    sleep(Duration::from_secs(15)).await;

    let status = handle.stop().await.unwrap();
    assert_eq!(status.completed_runs, 2);
    assert_eq!(job.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn run_budget_becomes_the_job_deadline() {
    let job = SlowJob::new(Duration::from_millis(10));
    let options = SchedulerOptions {
        run_budget: Some(Duration::from_secs(30)),
        ..every(Duration::from_secs(3600), Duration::ZERO)
    };
    let handle = Scheduler::spawn(options, job.clone()).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    handle.stop().await.unwrap();

    let starts = job.starts();
    let deadlines = job.deadlines.lock().unwrap().clone();
    assert_eq!(deadlines.len(), 1);
    let deadline = deadlines[0].expect("deadline set");
    let budget = deadline - starts[0];
    assert!(budget <= Duration::from_secs(30) && budget > Duration::from_secs(29));
}

#[tokio::test]
async fn malformed_cron_is_rejected_at_startup() {
    let options = SchedulerOptions {
        tick: TickSource::Cron("every tuesday-ish".into()),
        min_gap: Duration::ZERO,
        run_budget: None,
    };
    let result = Scheduler::spawn(options, SlowJob::new(Duration::ZERO)).await;
    match result {
        Err(ConfigError::Schedule { expr, .. }) => assert_eq!(expr, "every tuesday-ish"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("malformed cron accepted"),
    }
}

#[tokio::test(start_paused = true)]
async fn scheduled_collection_persists_dedup_after_each_run() {
    let dir = tempdir().unwrap();
    let dedup_path = dir.path().join("dedup.json");
    let light = FakeSite::new(Strategy::Lightweight);
    light.script(&url("a"), vec![Step::Page(product("Lamp", "19.90"))]);
    light.script(&url("b"), vec![Step::Page(product("Desk", "149"))]);

    let sink = MemorySink::new();
    let job = Arc::new(
        CollectionJob::new(
            orchestrator(light, FakeSite::new(Strategy::Rendered)),
            vec![target("a"), target("b")],
            DedupStore::new(100),
            Arc::new(sink.clone()),
        )
        .with_dedup_path(&dedup_path),
    );
    let handle = Scheduler::spawn(every(Duration::from_secs(3600), Duration::ZERO), job.clone())
        .await
        .unwrap();

    let mut status = handle.subscribe();
    status
        .wait_for(|s| s.completed_runs == 1 && s.state == SchedulerState::Idle)
        .await
        .unwrap();
    drop(status);
    assert!(handle.run_now().await);
    let mut status = handle.subscribe();
    status.wait_for(|s| s.completed_runs == 2).await.unwrap();
    drop(status);
    let final_status = handle.stop().await.unwrap();

    let accepted = sink.accepted();
    assert_eq!(accepted.len(), 2);
    assert_eq!(accepted[0].0.len(), 2);
    assert!(accepted[1].0.is_empty());
    assert_eq!(final_status.last_summary.map(|s| s.duplicate), Some(2));
    assert_eq!(job.dedup_len().await, 2);

    let reloaded = DedupStore::load(&dedup_path, 100).await.unwrap();
    assert_eq!(reloaded.len(), 2);
}

/// Panics on its first invocation, succeeds afterwards.
struct PanicsOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl ScheduledJob for PanicsOnce {
    async fn run(&self, _deadline: Option<Instant>) -> Result<OutcomeSummary> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("collector crashed");
        }
        Ok(OutcomeSummary {
            valid: 1,
            ..Default::default()
        })
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_run_counts_as_failed_and_scheduling_continues() {
    let job = Arc::new(PanicsOnce {
        calls: AtomicUsize::new(0),
    });
    let handle = Scheduler::spawn(every(Duration::from_secs(1), Duration::ZERO), job.clone())
        .await
        .unwrap();

    sleep(Duration::from_millis(3500)).await;
    let status = handle.stop().await.unwrap();

    assert!(job.calls.load(Ordering::SeqCst) >= 2);
    assert!(status.completed_runs >= 2, "{status:?}");
    assert_eq!(status.state, SchedulerState::Idle);
    assert_eq!(status.last_summary.map(|s| s.valid), Some(1));
}

/// Refuses the first batch, then forwards to an in-memory sink.
struct RefusesFirstBatch {
    refused: AtomicBool,
    inner: MemorySink,
}

#[async_trait]
impl BatchSink for RefusesFirstBatch {
    async fn accept(&self, report: &RunReport) -> Result<()> {
        if !self.refused.swap(true, Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        self.inner.accept(report).await
    }
}

#[tokio::test(start_paused = true)]
async fn records_refused_by_the_sink_are_delivered_on_the_next_run() {
    let dir = tempdir().unwrap();
    let dedup_path = dir.path().join("dedup.json");
    let light = FakeSite::new(Strategy::Lightweight);
    light.script(&url("a"), vec![Step::Page(product("Lamp", "19.90"))]);

    let delivered = MemorySink::new();
    let sink = Arc::new(RefusesFirstBatch {
        refused: AtomicBool::new(false),
        inner: delivered.clone(),
    });
    let job = CollectionJob::new(
        orchestrator(light, FakeSite::new(Strategy::Rendered)),
        vec![target("a")],
        DedupStore::new(100),
        sink,
    )
    .with_dedup_path(&dedup_path);

    let first = job.run(None).await;
    assert!(first.is_err());
    assert_eq!(job.dedup_len().await, 0);
    assert!(!dedup_path.exists());

    let second = job.run(None).await.unwrap();
    assert_eq!(second.valid, 1);
    assert_eq!(second.duplicate, 0);
    let accepted = delivered.accepted();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].0.len(), 1);
    assert_eq!(job.dedup_len().await, 1);

    let third = job.run(None).await.unwrap();
    assert_eq!(third.duplicate, 1);
}

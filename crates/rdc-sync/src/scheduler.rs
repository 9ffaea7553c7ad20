//! Periodic invocation of a collection job.
//!
//! The loop is an explicit idle -> running -> cooling-down state machine fed by
//! a tick source (fixed interval or cron). Ticks that arrive while a run is in
//! flight or cooling down are counted as missed and dropped, so runs never
//! overlap and never pile up.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rdc_core::{OutcomeSummary, Target};
use rdc_storage::DedupStore;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{ConfigError, Settings};
use crate::orchestrator::Orchestrator;
use crate::sink::BatchSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    CoolingDown,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::CoolingDown => "cooling-down",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub completed_runs: u64,
    pub missed_ticks: u64,
    pub last_summary: Option<OutcomeSummary>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            completed_runs: 0,
            missed_ticks: 0,
            last_summary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickSource {
    Interval(Duration),
    Cron(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub tick: TickSource,
    pub min_gap: Duration,
    pub run_budget: Option<Duration>,
}

impl SchedulerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let tick = match &settings.schedule {
            Some(expr) => TickSource::Cron(expr.clone()),
            None => TickSource::Interval(settings.run_interval()),
        };
        Self {
            tick,
            min_gap: settings.min_gap(),
            run_budget: settings.run_budget(),
        }
    }
}

/// Work invoked on every accepted tick. `deadline` is the run budget, if any.
#[async_trait]
pub trait ScheduledJob: Send + Sync + 'static {
    async fn run(&self, deadline: Option<Instant>) -> Result<OutcomeSummary>;
}

/// Orchestrator run + sink hand-off + dedup snapshot.
pub struct CollectionJob {
    orchestrator: Orchestrator,
    targets: Vec<Target>,
    dedup: Mutex<DedupStore>,
    dedup_path: Option<PathBuf>,
    sink: Arc<dyn BatchSink>,
}

impl CollectionJob {
    pub fn new(
        orchestrator: Orchestrator,
        targets: Vec<Target>,
        dedup: DedupStore,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        Self {
            orchestrator,
            targets,
            dedup: Mutex::new(dedup),
            dedup_path: None,
            sink,
        }
    }

    /// Persist the dedup store here after every run the sink accepted.
    pub fn with_dedup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dedup_path = Some(path.into());
        self
    }

    pub async fn dedup_len(&self) -> usize {
        self.dedup.lock().await.len()
    }
}

#[async_trait]
impl ScheduledJob for CollectionJob {
    async fn run(&self, deadline: Option<Instant>) -> Result<OutcomeSummary> {
        let mut dedup = self.dedup.lock().await;
        // Fingerprints only become durable once the sink has the batch.
        let mut pending = dedup.clone();
        let report = self
            .orchestrator
            .run(self.targets.clone(), &mut pending, deadline)
            .await;
        self.sink.accept(&report).await?;
        *dedup = pending;
        if let Some(path) = &self.dedup_path {
            dedup.persist(path).await?;
        }
        Ok(report.summary)
    }
}

#[derive(Debug)]
enum Command {
    RunNow,
    Stop,
}

pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SchedulerStatus>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request an immediate run. Obeys the same no-overlap rule as ticks.
    pub async fn run_now(&self) -> bool {
        self.commands.send(Command::RunNow).await.is_ok()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    /// Stop ticking, let an in-flight run finish, and return the final status.
    pub async fn stop(self) -> Result<SchedulerStatus> {
        let _ = self.commands.send(Command::Stop).await;
        self.task.await?;
        Ok(self.status.borrow().clone())
    }
}

pub struct Scheduler;

impl Scheduler {
    pub async fn spawn(
        options: SchedulerOptions,
        job: Arc<dyn ScheduledJob>,
    ) -> Result<SchedulerHandle, ConfigError> {
        let (tick_tx, tick_rx) = mpsc::channel::<()>(16);
        let ticker = start_tick_source(&options.tick, tick_tx).await?;

        let (command_tx, command_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(SchedulerStatus::default());
        let task = tokio::spawn(scheduler_loop(options, job, ticker, tick_rx, command_rx, status_tx));
        Ok(SchedulerHandle {
            commands: command_tx,
            status: status_rx,
            task,
        })
    }
}

enum Ticker {
    Interval(JoinHandle<()>),
    Cron(JobScheduler),
}

impl Ticker {
    async fn shutdown(self) {
        match self {
            Ticker::Interval(pump) => pump.abort(),
            Ticker::Cron(mut sched) => {
                if let Err(err) = sched.shutdown().await {
                    warn!("stopping cron scheduler: {err}");
                }
            }
        }
    }
}

async fn start_tick_source(source: &TickSource, ticks: mpsc::Sender<()>) -> Result<Ticker, ConfigError> {
    match source {
        TickSource::Interval(period) => {
            if period.is_zero() {
                return Err(ConfigError::Settings("run interval must be positive".into()));
            }
            let period = *period;
            let pump = tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    if ticks.send(()).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Ticker::Interval(pump))
        }
        TickSource::Cron(expr) => {
            let schedule_err = |reason: String| ConfigError::Schedule {
                expr: expr.clone(),
                reason,
            };
            let job = Job::new_async(expr.as_str(), move |_uuid, _l| {
                let ticks = ticks.clone();
                Box::pin(async move {
                    // A full channel means the loop is far behind; the tick is dropped either way.
                    let _ = ticks.try_send(());
                })
            })
            .map_err(|e| schedule_err(e.to_string()))?;
            let sched = JobScheduler::new()
                .await
                .map_err(|e| schedule_err(format!("creating scheduler: {e}")))?;
            sched
                .add(job)
                .await
                .map_err(|e| schedule_err(format!("adding job: {e}")))?;
            sched
                .start()
                .await
                .map_err(|e| schedule_err(format!("starting scheduler: {e}")))?;
            Ok(Ticker::Cron(sched))
        }
    }
}

async fn scheduler_loop(
    options: SchedulerOptions,
    job: Arc<dyn ScheduledJob>,
    ticker: Ticker,
    mut ticks: mpsc::Receiver<()>,
    mut commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<SchedulerStatus>,
) {
    let (done_tx, mut done_rx) = mpsc::channel::<Result<OutcomeSummary>>(1);
    let mut status = SchedulerStatus::default();
    let mut cooldown_until = Instant::now();
    let mut stopping = false;

    loop {
        let trigger = tokio::select! {
            Some(()) = ticks.recv() => Some("tick"),
            command = commands.recv(), if !stopping => match command {
                Some(Command::RunNow) => Some("run-now"),
                Some(Command::Stop) | None => {
                    stopping = true;
                    None
                }
            },
            Some(result) = done_rx.recv() => {
                status.completed_runs += 1;
                match result {
                    Ok(summary) => status.last_summary = Some(summary),
                    Err(err) => error!("collection run failed: {err:#}"),
                }
                status.state = SchedulerState::CoolingDown;
                cooldown_until = Instant::now() + options.min_gap;
                None
            },
            _ = sleep_until(cooldown_until), if status.state == SchedulerState::CoolingDown => {
                status.state = SchedulerState::Idle;
                None
            },
        };

        if let Some(trigger) = trigger {
            if status.state == SchedulerState::Idle && !stopping {
                status.state = SchedulerState::Running;
                let job = job.clone();
                let done = done_tx.clone();
                let deadline = options.run_budget.map(|budget| Instant::now() + budget);
                info!(%trigger, "starting collection run");
                let run = tokio::spawn(async move { job.run(deadline).await });
                tokio::spawn(async move {
                    let result = match run.await {
                        Ok(result) => result,
                        Err(err) => Err(anyhow!("collection run aborted: {err}")),
                    };
                    let _ = done.send(result).await;
                });
            } else {
                status.missed_ticks += 1;
                warn!(%trigger, state = %status.state, missed = status.missed_ticks, "tick missed");
            }
        }

        status_tx.send_replace(status.clone());
        if stopping && status.state != SchedulerState::Running {
            break;
        }
    }

    ticker.shutdown().await;
    status.state = SchedulerState::Idle;
    status_tx.send_replace(status);
    info!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        runs: std::sync::Mutex<u32>,
    }

    #[async_trait]
    impl ScheduledJob for Counting {
        async fn run(&self, _deadline: Option<Instant>) -> Result<OutcomeSummary> {
            *self.runs.lock().unwrap() += 1;
            Ok(OutcomeSummary::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_rejected() {
        let job = Arc::new(Counting {
            runs: std::sync::Mutex::new(0),
        });
        let options = SchedulerOptions {
            tick: TickSource::Interval(Duration::ZERO),
            min_gap: Duration::ZERO,
            run_budget: None,
        };
        assert!(matches!(
            Scheduler::spawn(options, job).await,
            Err(ConfigError::Settings(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn first_interval_tick_runs_immediately() {
        let job = Arc::new(Counting {
            runs: std::sync::Mutex::new(0),
        });
        let options = SchedulerOptions {
            tick: TickSource::Interval(Duration::from_secs(3600)),
            min_gap: Duration::ZERO,
            run_budget: None,
        };
        let handle = Scheduler::spawn(options, job.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = handle.stop().await.unwrap();
        assert_eq!(status.completed_runs, 1);
        assert_eq!(*job.runs.lock().unwrap(), 1);
        assert_eq!(status.state, SchedulerState::Idle);
    }

    #[test]
    fn settings_pick_cron_over_interval() {
        let mut settings = Settings::default();
        assert_eq!(
            SchedulerOptions::from_settings(&settings).tick,
            TickSource::Interval(crate::config::DEFAULT_RUN_INTERVAL)
        );
        settings.schedule = Some("0 */6 * * *".into());
        assert!(matches!(
            SchedulerOptions::from_settings(&settings).tick,
            TickSource::Cron(_)
        ));
    }
}

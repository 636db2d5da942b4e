//! Warm-up Coordinator
//!
//! Runs a static catalog of named warm-up jobs, highest priority first,
//! under a concurrency cap and a per-job timeout. Job bodies are opaque:
//! they typically call `LayeredCache::set` for whatever they pre-load.
//!
//! # Cycle
//!
//! 1. Order the catalog (stable, descending priority) when enabled
//! 2. Start jobs in that order as semaphore permits free up
//! 3. Each job gets a child token of the cycle token; on timeout the job is
//!    dropped and its token cancelled
//! 4. Collect outcomes; any failure fails the cycle, never the loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::WarmupConfig;
use crate::error::{Error, Result};

/// Lowest job priority
pub const MIN_PRIORITY: u8 = 1;

/// Highest job priority
pub const MAX_PRIORITY: u8 = 10;

/// Warm-up job body. Receives a token cancelled on timeout or shutdown.
pub type WarmupJob = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Named entry in the warm-up catalog
#[derive(Clone)]
pub struct WarmupTask {
    pub name: String,
    /// 1-10, 10 runs first
    pub priority: u8,
    pub timeout: Duration,
    pub job: WarmupJob,
}

impl WarmupTask {
    /// Create a task; priority is clamped into `MIN_PRIORITY..=MAX_PRIORITY`
    pub fn new(name: impl Into<String>, priority: u8, timeout: Duration, job: WarmupJob) -> Self {
        Self {
            name: name.into(),
            priority: priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            timeout,
            job,
        }
    }
}

impl std::fmt::Debug for WarmupTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmupTask")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Result of one job within a cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub name: String,
    pub priority: u8,
    /// Wall time until the job finished or was abandoned
    pub duration: Duration,
    /// Failure reason; `None` on success
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one warm-up cycle
#[derive(Debug, Clone, Serialize)]
pub struct WarmupReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub succeeded: usize,
    pub failed: usize,
    /// One per job, in start order
    pub outcomes: Vec<JobOutcome>,
}

/// Priority-ordered, concurrency-bounded warm-up runner
pub struct WarmupCoordinator {
    config: WarmupConfig,
    catalog: RwLock<Vec<WarmupTask>>,
    last_report: RwLock<Option<WarmupReport>>,
}

impl WarmupCoordinator {
    /// Create a coordinator with an empty catalog
    pub fn new(config: WarmupConfig) -> Self {
        Self {
            config,
            catalog: RwLock::new(Vec::new()),
            last_report: RwLock::new(None),
        }
    }

    /// Append a task to the catalog
    pub fn register(&self, task: WarmupTask) {
        debug!(name = %task.name, priority = task.priority, "Registered warm-up job");
        self.catalog.write().push(task);
    }

    /// Append a task built from an async closure
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, priority: u8, timeout: Duration, f: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job: WarmupJob = Arc::new(move |ctx: CancellationToken| f(ctx).boxed());
        self.register(WarmupTask::new(name, priority, timeout, job));
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.catalog.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.read().is_empty()
    }

    /// Job names in the order a cycle would start them
    pub fn schedule(&self) -> Vec<String> {
        self.ordered_tasks().into_iter().map(|t| t.name).collect()
    }

    /// Report of the most recent completed cycle
    pub fn last_report(&self) -> Option<WarmupReport> {
        self.last_report.read().clone()
    }

    fn ordered_tasks(&self) -> Vec<WarmupTask> {
        let mut tasks = self.catalog.read().clone();
        if self.config.priority_ordering {
            // Stable: equal priorities keep catalog order
            tasks.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        tasks
    }

    /// Run every job once
    pub async fn warmup(&self, ctx: &CancellationToken) -> Result<WarmupReport> {
        self.run_cycle(ctx).await
    }

    /// Run one warm-up cycle and wait for every job to finish or be abandoned
    #[instrument(skip_all)]
    pub async fn run_cycle(&self, ctx: &CancellationToken) -> Result<WarmupReport> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let tasks = self.ordered_tasks();
        let total = tasks.len();

        info!(%cycle_id, jobs = total, "Starting warm-up cycle");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut running = JoinSet::new();
        let mut slots: Vec<Option<JobOutcome>> = vec![None; total];

        for (index, task) in tasks.iter().enumerate() {
            // Permits are taken here, in schedule order, so a freed slot always
            // goes to the highest-priority waiting job
            let permit = tokio::select! {
                biased;
                _ = ctx.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                slots[index] = Some(JobOutcome {
                    name: task.name.clone(),
                    priority: task.priority,
                    duration: Duration::ZERO,
                    error: Some("not started: cycle cancelled".to_string()),
                });
                continue;
            };

            let task = task.clone();
            let token = ctx.child_token();
            running.spawn(async move {
                let outcome = run_job(task, token).await;
                drop(permit);
                (index, outcome)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => error!(%cycle_id, error = %e, "Warm-up job task panicked"),
            }
        }

        let outcomes: Vec<JobOutcome> = slots
            .into_iter()
            .zip(&tasks)
            .map(|(slot, task)| {
                slot.unwrap_or_else(|| JobOutcome {
                    name: task.name.clone(),
                    priority: task.priority,
                    duration: Duration::ZERO,
                    error: Some("job panicked".to_string()),
                })
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let failed = total - succeeded;
        let report = WarmupReport {
            cycle_id,
            started_at,
            duration: start.elapsed(),
            succeeded,
            failed,
            outcomes,
        };

        info!(
            %cycle_id,
            succeeded,
            failed,
            duration = ?report.duration,
            "Warm-up cycle finished"
        );

        let failures: Vec<String> = report
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.name, e)))
            .collect();
        *self.last_report.write() = Some(report.clone());

        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if failed > 0 {
            return Err(Error::WarmupFailed {
                failed,
                total,
                failures,
            });
        }
        Ok(report)
    }

    /// Run a cycle now, then one per interval, until `shutdown` fires
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Warm-up disabled");
            return;
        }

        info!(
            interval = ?self.config.interval,
            max_concurrency = self.config.max_concurrency,
            jobs = self.len(),
            "Starting warm-up coordinator"
        );

        let period = self.config.interval.max(Duration::from_millis(1));
        let mut tick = interval_at(Instant::now(), period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Warm-up coordinator shutting down");
                    break;
                }
                _ = tick.tick() => {
                    match self.run_cycle(&shutdown).await {
                        Ok(_) => {}
                        Err(Error::Cancelled) => {
                            info!("Warm-up cycle interrupted by shutdown");
                            break;
                        }
                        Err(e) => warn!(error = %e, "Warm-up cycle completed with failures"),
                    }
                }
            }
        }
    }
}

/// Run one job under its timeout. A timed-out job is dropped and its token
/// cancelled so any work it handed off can stop too.
async fn run_job(task: WarmupTask, token: CancellationToken) -> JobOutcome {
    let start = Instant::now();
    let job = (task.job)(token.clone());

    let error = tokio::select! {
        biased;
        _ = token.cancelled() => Some("cancelled".to_string()),
        result = tokio::time::timeout(task.timeout, job) => match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => {
                token.cancel();
                Some(format!("timed out after {:?}", task.timeout))
            }
        },
    };

    match &error {
        None => debug!(name = %task.name, elapsed = ?start.elapsed(), "Warm-up job finished"),
        Some(reason) => warn!(name = %task.name, reason = %reason, "Warm-up job failed"),
    }

    JobOutcome {
        name: task.name,
        priority: task.priority,
        duration: start.elapsed(),
        error,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_concurrency: usize, priority_ordering: bool) -> WarmupConfig {
        WarmupConfig {
            enabled: true,
            interval: Duration::from_secs(60),
            max_concurrency,
            priority_ordering,
        }
    }

    fn recording(coordinator: &WarmupCoordinator, log: &Arc<parking_lot::Mutex<Vec<String>>>, name: &str, priority: u8) {
        let log = log.clone();
        let owned = name.to_string();
        coordinator.register_fn(name, priority, Duration::from_secs(5), move |_ctx| {
            let log = log.clone();
            let name = owned.clone();
            async move {
                log.lock().push(name);
                Ok(())
            }
        });
    }

    #[test]
    fn test_priority_is_clamped() {
        let job: WarmupJob = Arc::new(|_: CancellationToken| async { Ok::<(), Error>(()) }.boxed());
        assert_eq!(WarmupTask::new("low", 0, Duration::from_secs(1), job.clone()).priority, 1);
        assert_eq!(WarmupTask::new("high", 42, Duration::from_secs(1), job).priority, 10);
    }

    #[test]
    fn test_schedule_is_stable_descending() {
        let coordinator = WarmupCoordinator::new(config(1, true));
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        recording(&coordinator, &log, "config", 5);
        recording(&coordinator, &log, "market", 10);
        recording(&coordinator, &log, "popular", 7);
        recording(&coordinator, &log, "ticker", 10);

        assert_eq!(coordinator.schedule(), vec!["market", "ticker", "popular", "config"]);
    }

    #[tokio::test]
    async fn test_cycle_runs_in_priority_order() {
        let coordinator = WarmupCoordinator::new(config(1, true));
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        recording(&coordinator, &log, "a", 1);
        recording(&coordinator, &log, "b", 10);
        recording(&coordinator, &log, "c", 5);

        let report = coordinator.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(*log.lock(), vec!["b", "c", "a"]);
        assert_eq!(coordinator.last_report().unwrap().cycle_id, report.cycle_id);
    }

    #[tokio::test]
    async fn test_catalog_order_without_priority_ordering() {
        let coordinator = WarmupCoordinator::new(config(1, false));
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        recording(&coordinator, &log, "a", 1);
        recording(&coordinator, &log, "b", 10);

        coordinator.warmup(&CancellationToken::new()).await.unwrap();
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let coordinator = WarmupCoordinator::new(config(3, true));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..12 {
            let current = current.clone();
            let peak = peak.clone();
            coordinator.register_fn(format!("job-{}", i), 5, Duration::from_secs(5), move |_ctx| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        let report = coordinator.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.succeeded, 12);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_job_is_abandoned_and_cancelled() {
        let coordinator = WarmupCoordinator::new(config(2, true));
        let seen = Arc::new(parking_lot::Mutex::new(None::<CancellationToken>));

        let slot = seen.clone();
        coordinator.register_fn("slow", 8, Duration::from_millis(100), move |ctx| {
            *slot.lock() = Some(ctx);
            async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        });
        coordinator.register_fn("fast", 5, Duration::from_secs(1), |_ctx| async { Ok(()) });

        let err = coordinator.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, Error::WarmupFailed { failed: 1, total: 2, ref failures }
            if failures[0].starts_with("slow: timed out"));

        let token = seen.lock().clone().unwrap();
        assert!(token.is_cancelled());

        let report = coordinator.last_report().unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(report.outcomes.iter().any(|o| o.name == "fast" && o.succeeded()));
    }

    #[tokio::test]
    async fn test_job_errors_are_aggregated() {
        let coordinator = WarmupCoordinator::new(config(4, true));
        coordinator.register_fn("ok", 5, Duration::from_secs(1), |_| async { Ok(()) });
        coordinator.register_fn("bad", 5, Duration::from_secs(1), |_| async {
            Err(Error::backend("l2", "connection refused"))
        });
        coordinator.register_fn("worse", 5, Duration::from_secs(1), |_| async {
            Err(Error::Internal("exchange down".into()))
        });

        let err = coordinator.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, Error::WarmupFailed { failed: 2, total: 3, ref failures } if failures.len() == 2);
    }

    #[tokio::test]
    async fn test_empty_catalog() {
        let coordinator = WarmupCoordinator::new(config(4, true));
        assert!(coordinator.is_empty());

        let report = coordinator.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.succeeded + report.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_cycle_cancels_jobs() {
        let coordinator = Arc::new(WarmupCoordinator::new(config(1, true)));
        coordinator.register_fn("blocked", 10, Duration::from_secs(3600), |ctx| async move {
            ctx.cancelled().await;
            Ok(())
        });
        coordinator.register_fn("queued", 1, Duration::from_secs(3600), |_| async { Ok(()) });

        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        assert_matches!(coordinator.run_cycle(&ctx).await, Err(Error::Cancelled));
        let report = coordinator.last_report().unwrap();
        assert_eq!(report.failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_repeats_and_survives_failures() {
        let coordinator = Arc::new(WarmupCoordinator::new(config(2, true)));
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        coordinator.register_fn("flaky", 5, Duration::from_secs(1), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Internal("always fails".into()))
            }
        });

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(coordinator.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1, "first cycle runs on start");

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_run_returns() {
        let mut cfg = config(1, true);
        cfg.enabled = false;
        let coordinator = Arc::new(WarmupCoordinator::new(cfg));
        coordinator.run(CancellationToken::new()).await;
    }
}

//! Scheduler/orchestrator — the tick loop and management surface.
//!
//! One `Scheduler` owns the shared context (registry, identity pool,
//! health monitor, collaborators, event bus) behind an `Arc`. `tick`
//! evaluates due jobs and dispatches worker tasks under a global
//! semaphore; `run` drives ticks on a fixed interval until shutdown.
//! Tests call `tick` directly with an injected clock.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};

use pricewatch::{
    Advice, HealthMonitor, IdentityPool, JobDefinition, JobRegistry, JobRun, JobStatus, RunOutcome,
    TargetHealth, ThrottleLevel,
};

use crate::collaborators::{Extractor, RunStore};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::events::{self, EventReceiver, EventSender, TrackerEvent};
use crate::fetch::{DelayPolicy, PageFetcher};
use crate::session::SharedPool;

/// Non-scrape work dispatched by id: `Export` jobs run the callback
/// registered as `"export"`, `Custom` jobs the callback they name.
#[async_trait]
pub trait JobCallback: Send + Sync {
    /// Returns the number of items processed.
    async fn invoke(&self, job: &JobDefinition) -> RuntimeResult<usize>;
}

/// Coarse roll-up of scheduler health for status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    Healthy,
    /// At least one target is throttled.
    Degraded,
    /// Overall run success rate has collapsed.
    Unhealthy,
}

/// Point-in-time status report.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub overall: SystemHealth,
    pub shutting_down: bool,
    pub in_flight: u32,
    pub jobs: Vec<JobStatus>,
    pub targets: Vec<TargetHealth>,
}

/// Counter snapshot for metrics queries.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub runs_total: u64,
    pub successes_total: u64,
    pub failures_total: u64,
    pub in_flight: u32,
    pub identities_retired: u64,
}

pub(crate) struct SchedulerCtx {
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: Mutex<JobRegistry>,
    pub(crate) pool: SharedPool,
    pub(crate) health: Mutex<HealthMonitor>,
    pub(crate) fetcher: Arc<dyn PageFetcher>,
    pub(crate) extractor: Arc<dyn Extractor>,
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) delay: DelayPolicy,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) events: EventSender,
    callbacks: Mutex<HashMap<String, Arc<dyn JobCallback>>>,
    shutting_down: AtomicBool,
    wake: Notify,
    started_at: DateTime<Utc>,
}

impl SchedulerCtx {
    pub(crate) fn registry(&self) -> std::sync::MutexGuard<'_, JobRegistry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn health(&self) -> std::sync::MutexGuard<'_, HealthMonitor> {
        match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn callback(&self, name: &str) -> Option<Arc<dyn JobCallback>> {
        let guard = match self.callbacks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(name).cloned()
    }
}

/// The orchestrator. Cheap to clone; all clones share one context.
#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<SchedulerCtx>,
}

impl Scheduler {
    pub fn new(
        config: RuntimeConfig,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn RunStore>,
    ) -> RuntimeResult<Self> {
        config.validate()?;
        let (events, _) = events::channel();
        let ctx = SchedulerCtx {
            registry: Mutex::new(JobRegistry::new(config.history_keep)),
            pool: Arc::new(Mutex::new(IdentityPool::new(config.pool.clone()))),
            health: Mutex::new(HealthMonitor::new(config.health.clone())),
            fetcher,
            extractor,
            store,
            delay: DelayPolicy::from_config(&config.fetch),
            permits: Arc::new(Semaphore::new(config.global_concurrency)),
            events,
            callbacks: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            wake: Notify::new(),
            started_at: Utc::now(),
            config,
        };
        let scheduler = Self { ctx: Arc::new(ctx) };
        scheduler.seed_jobs()?;
        Ok(scheduler)
    }

    fn seed_jobs(&self) -> RuntimeResult<()> {
        let now = Utc::now();
        let seeds = self.ctx.config.jobs.clone();
        let mut registry = self.ctx.registry();
        for def in seeds {
            registry.register(def, now)?;
        }
        Ok(())
    }

    /// Subscribe to the tracker event stream.
    pub fn subscribe(&self) -> EventReceiver {
        self.ctx.events.subscribe()
    }

    /// Register a callback that `Export` and `Custom` jobs dispatch to.
    pub fn register_callback(&self, name: &str, callback: Arc<dyn JobCallback>) {
        let mut guard = match self.ctx.callbacks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.insert(name.to_string(), callback);
    }

    // ── Management operations ──

    pub fn add_job(&self, def: JobDefinition) -> RuntimeResult<()> {
        let now = Utc::now();
        self.ctx.registry().register(def, now)?;
        self.ctx.wake.notify_waiters();
        Ok(())
    }

    /// Soft-remove: the job never becomes due again but its history stays
    /// queryable.
    pub fn remove_job(&self, id: &str) -> RuntimeResult<()> {
        self.ctx.registry().deactivate(id)?;
        Ok(())
    }

    pub fn pause_job(&self, id: &str) -> RuntimeResult<()> {
        self.ctx.registry().pause(id)?;
        Ok(())
    }

    pub fn resume_job(&self, id: &str) -> RuntimeResult<()> {
        self.ctx.registry().resume(id)?;
        self.ctx.wake.notify_waiters();
        Ok(())
    }

    pub fn job_status(&self, id: &str) -> Option<JobStatus> {
        self.ctx.registry().job_status(id)
    }

    pub fn job_history(&self, id: &str) -> Vec<JobRun> {
        self.ctx.registry().history(id)
    }

    /// Run a job immediately, bypassing its due time but not throttle
    /// advice or the concurrency ceiling. Awaits completion and returns
    /// the finalized outcome.
    pub async fn execute_now(&self, id: &str) -> RuntimeResult<RunOutcome> {
        if self.ctx.shutting_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }
        let now = Utc::now();
        let def = self
            .ctx
            .registry()
            .get(id)
            .cloned()
            .ok_or_else(|| pricewatch::CoreError::UnknownJob(id.to_string()))?;

        let advice = self.ctx.health().advise(&def.target, def.priority, now);
        match advice {
            Advice::Skip { until } => {
                let run = self.ctx.registry().begin_run(&def.id, now)?;
                self.finalize_skip(&def, run, until, now)?;
                Ok(RunOutcome::Skipped)
            }
            Advice::Proceed {
                delay_factor,
                halve_concurrency,
            } => {
                let permit = self
                    .ctx
                    .permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| RuntimeError::ShuttingDown)?;
                // Checked and begun under one registry lock so two
                // concurrent calls cannot both slip under the cap.
                let run = {
                    let mut registry = self.ctx.registry();
                    let cap = if halve_concurrency {
                        (def.max_concurrency / 2).max(1)
                    } else {
                        def.max_concurrency
                    };
                    let in_flight = registry
                        .job_status(&def.id)
                        .map(|s| s.in_flight)
                        .unwrap_or(0);
                    if in_flight >= cap {
                        return Err(RuntimeError::AtCapacity(def.id.clone()));
                    }
                    registry.begin_run(&def.id, now)?
                };
                let run_id = run.run_id;
                events::emit(
                    &self.ctx.events,
                    TrackerEvent::JobStarted {
                        job_id: def.id.clone(),
                        run_id,
                        target: def.target.clone(),
                    },
                );
                worker::run_job(Arc::clone(&self.ctx), def, run, delay_factor, permit).await;
                let outcome = self
                    .ctx
                    .registry()
                    .history(id)
                    .into_iter()
                    .find(|r| r.run_id == run_id)
                    .map(|r| r.outcome)
                    .unwrap_or(RunOutcome::Failed);
                Ok(outcome)
            }
        }
    }

    // ── Dispatch ──

    /// Evaluate due jobs at `now` and dispatch workers. Returns the number
    /// of runs dispatched.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        if self.ctx.shutting_down.load(Ordering::SeqCst) {
            return 0;
        }

        let due = self.ctx.registry().due_jobs(now);
        let mut dispatched = 0;

        for def in due {
            let advice = self.ctx.health().advise(&def.target, def.priority, now);
            match advice {
                Advice::Skip { until } => {
                    let run = match self.ctx.registry().begin_run(&def.id, now) {
                        Ok(run) => run,
                        Err(e) => {
                            tracing::error!(job = %def.id, "begin_run failed: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = self.finalize_skip(&def, run, until, now) {
                        tracing::error!(job = %def.id, "skip finalization failed: {e}");
                    }
                }
                Advice::Proceed {
                    delay_factor,
                    halve_concurrency,
                } => {
                    if halve_concurrency {
                        let cap = (def.max_concurrency / 2).max(1);
                        let in_flight = self
                            .ctx
                            .registry()
                            .job_status(&def.id)
                            .map(|s| s.in_flight)
                            .unwrap_or(0);
                        if in_flight >= cap {
                            continue;
                        }
                    }
                    // The global ceiling is a hard stop for this tick;
                    // remaining due jobs wait for the next one.
                    let Ok(permit) = self.ctx.permits.clone().try_acquire_owned() else {
                        tracing::debug!("global concurrency ceiling reached");
                        break;
                    };
                    let run = match self.ctx.registry().begin_run(&def.id, now) {
                        Ok(run) => run,
                        Err(e) => {
                            tracing::error!(job = %def.id, "begin_run failed: {e}");
                            continue;
                        }
                    };
                    events::emit(
                        &self.ctx.events,
                        TrackerEvent::JobStarted {
                            job_id: def.id.clone(),
                            run_id: run.run_id,
                            target: def.target.clone(),
                        },
                    );
                    tracing::info!(job = %def.id, run = run.run_id, "dispatching run");
                    tokio::spawn(worker::run_job(
                        Arc::clone(&self.ctx),
                        def,
                        run,
                        delay_factor,
                        permit,
                    ));
                    dispatched += 1;
                }
            }
        }
        dispatched
    }

    /// Drive ticks on the configured interval until shutdown.
    pub async fn run(&self) {
        tracing::info!(
            tick_secs = self.ctx.config.tick_secs,
            concurrency = self.ctx.config.global_concurrency,
            "scheduler started"
        );
        loop {
            if self.ctx.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.tick(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.tick_interval()) => {}
                _ = self.ctx.wake.notified() => {}
            }
        }
        tracing::info!("scheduler loop stopped");
    }

    /// Begin cooperative shutdown: no new dispatches, in-flight runs get
    /// up to the configured grace period to finish.
    pub async fn shutdown(&self) {
        self.ctx.shutting_down.store(true, Ordering::SeqCst);
        self.ctx.wake.notify_waiters();
        let in_flight = self.ctx.registry().total_in_flight();
        events::emit(&self.ctx.events, TrackerEvent::ShutdownStarted { in_flight });
        tracing::info!(in_flight, "shutdown started");

        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_grace();
        while self.ctx.registry().total_in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    in_flight = self.ctx.registry().total_in_flight(),
                    "grace period elapsed with runs still in flight"
                );
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        tracing::info!("shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.ctx.shutting_down.load(Ordering::SeqCst)
    }

    // ── Status ──

    pub fn status(&self) -> SchedulerStatus {
        let now = Utc::now();
        let jobs = self.ctx.registry().summary();
        let in_flight = self.ctx.registry().total_in_flight();
        let targets: Vec<TargetHealth> = self
            .ctx
            .health()
            .snapshot()
            .into_iter()
            .cloned()
            .collect();

        let runs_total: u64 = jobs.iter().map(|j| j.run_count).sum();
        let successes: u64 = jobs.iter().map(|j| j.success_count).sum();
        let success_rate = if runs_total > 0 {
            successes as f64 / runs_total as f64
        } else {
            1.0
        };
        let throttled = targets.iter().any(|t| t.level != ThrottleLevel::Normal);

        let overall = if success_rate < 0.5 && runs_total > 0 {
            SystemHealth::Unhealthy
        } else if throttled {
            SystemHealth::Degraded
        } else {
            SystemHealth::Healthy
        };

        SchedulerStatus {
            started_at: self.ctx.started_at,
            uptime_secs: (now - self.ctx.started_at).num_seconds(),
            overall,
            shutting_down: self.is_shutting_down(),
            in_flight,
            jobs,
            targets,
        }
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let jobs = self.ctx.registry().summary();
        let retired = match self.ctx.pool.lock() {
            Ok(pool) => pool.retired_total(),
            Err(poisoned) => poisoned.into_inner().retired_total(),
        };
        SchedulerMetrics {
            runs_total: jobs.iter().map(|j| j.run_count).sum(),
            successes_total: jobs.iter().map(|j| j.success_count).sum(),
            failures_total: jobs.iter().map(|j| j.failure_count).sum(),
            in_flight: self.ctx.registry().total_in_flight(),
            identities_retired: retired,
        }
    }

    /// Record a throttle skip: one finalized Skipped run, then defer the
    /// job until the throttle lifts so it is not re-evaluated every tick.
    fn finalize_skip(
        &self,
        def: &JobDefinition,
        mut run: JobRun,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RuntimeResult<()> {
        run.outcome = RunOutcome::Skipped;
        run.finished_at = Some(now);
        run.failure_reason = Some(format!("target {} throttled until {until}", def.target));
        events::emit(
            &self.ctx.events,
            TrackerEvent::JobSkipped {
                job_id: def.id.clone(),
                run_id: run.run_id,
                reason: format!("target throttled until {until}"),
            },
        );
        tracing::info!(job = %def.id, %until, "run skipped, target throttled");
        self.ctx.store.write_run(&run)?;
        let mut registry = self.ctx.registry();
        registry.record_run(run, now)?;
        // Deferral must not resurrect priority starvation: Urgent jobs are
        // advised Proceed under Hard throttle, so only non-urgent reach here.
        registry.defer(&def.id, until)?;
        Ok(())
    }
}

/// Cadence-aware cleanup used by `Cleanup` jobs: prune old run history
/// and sweep retired identities.
pub(crate) fn run_cleanup(ctx: &SchedulerCtx, now: DateTime<Utc>) -> usize {
    let cutoff = now - Duration::days(ctx.config.history_retention_days);
    let dropped = ctx.registry().prune_history(cutoff);
    match ctx.pool.lock() {
        Ok(mut pool) => pool.sweep(),
        Err(poisoned) => poisoned.into_inner().sweep(),
    }
    tracing::info!(dropped, "cleanup pass complete");
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{JsonExtractor, MemoryStore};
    use crate::config::FetchConfig;
    use pricewatch::{Cadence, FetchResult, FetchStatus, Identity, JobKind, Priority, RetryPolicy};

    struct AlwaysOk;

    #[async_trait]
    impl PageFetcher for AlwaysOk {
        async fn fetch(&self, _url: &str, _identity: &Identity, _prior: bool) -> FetchResult {
            FetchResult {
                status: FetchStatus::Success,
                raw_content: Some(r#"{"id":"sku-1","title":"Widget","price":9.99}"#.to_string()),
                latency_ms: 10,
                rate_limited: false,
            }
        }
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            fetch: FetchConfig {
                disable_delay: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn test_scheduler() -> Scheduler {
        Scheduler::new(
            test_config(),
            Arc::new(AlwaysOk),
            Arc::new(JsonExtractor),
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    fn scrape_job(id: &str) -> JobDefinition {
        JobDefinition {
            id: id.to_string(),
            name: id.to_string(),
            target: "shop.example".to_string(),
            kind: JobKind::Scrape {
                urls: vec!["https://shop.example/p/1".to_string()],
            },
            cadence: Cadence::Interval { secs: 900 },
            priority: Priority::Normal,
            enabled: true,
            paused: false,
            max_concurrency: 1,
            retry: RetryPolicy {
                base_delay_secs: 0,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_execute_now_returns_outcome() {
        let scheduler = test_scheduler();
        scheduler.add_job(scrape_job("adhoc")).unwrap();
        let outcome = scheduler.execute_now("adhoc").await.unwrap();
        assert_eq!(outcome, RunOutcome::Success);

        let status = scheduler.job_status("adhoc").unwrap();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.success_count, 1);
    }

    #[tokio::test]
    async fn test_execute_now_unknown_job() {
        let scheduler = test_scheduler();
        assert!(scheduler.execute_now("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_blocks_new_dispatch() {
        let scheduler = test_scheduler();
        scheduler.add_job(scrape_job("late")).unwrap();
        scheduler.shutdown().await;
        assert_eq!(scheduler.tick(Utc::now()), 0);
        assert!(scheduler.execute_now("late").await.is_err());
    }

    #[tokio::test]
    async fn test_status_aggregates_health() {
        let scheduler = test_scheduler();
        scheduler.add_job(scrape_job("main")).unwrap();
        let status = scheduler.status();
        assert_eq!(status.overall, SystemHealth::Healthy);
        assert_eq!(status.jobs.len(), 1);
        assert_eq!(status.in_flight, 0);
        assert!(status.uptime_secs >= 0);
    }
}

//! Per-run worker task.
//!
//! Each dispatched run gets one worker that drives the retry state
//! machine across the job's URLs, reports every fetch outcome to the
//! health monitor and identity pool, and finalizes exactly one run
//! record no matter how it exits.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedSemaphorePermit;

use pricewatch::{
    CoreError, FetchStatus, JobDefinition, JobKind, JobRun, RetryDriver, RunOutcome, Step,
};

use crate::events::{self, TrackerEvent};
use crate::session::SessionGuard;

use super::{run_cleanup, SchedulerCtx};

struct UrlTally {
    extracted_ok: usize,
    fetched_only: usize,
    failed: usize,
    /// URLs never attempted because shutdown began mid-run.
    cancelled: usize,
    items: usize,
    last_failure: Option<String>,
}

/// Execute one run to completion. The permit is held for the whole run;
/// dropping it releases the global concurrency slot.
pub(crate) async fn run_job(
    ctx: Arc<SchedulerCtx>,
    def: JobDefinition,
    mut run: JobRun,
    delay_factor: f64,
    _permit: OwnedSemaphorePermit,
) {
    let started = std::time::Instant::now();

    let (outcome, items, reason) = match &def.kind {
        JobKind::Scrape { urls } => {
            let tally = scrape_urls(&ctx, &def, urls, delay_factor).await;
            let total = urls.len();
            let outcome = if tally.cancelled == total {
                RunOutcome::Skipped
            } else if tally.extracted_ok == total {
                RunOutcome::Success
            } else if tally.extracted_ok > 0 || tally.fetched_only > 0 {
                RunOutcome::PartialSuccess
            } else {
                RunOutcome::Failed
            };
            (outcome, tally.items, tally.last_failure)
        }
        JobKind::Cleanup => {
            let dropped = run_cleanup(&ctx, Utc::now());
            (RunOutcome::Success, dropped, None)
        }
        JobKind::Export => invoke_callback(&ctx, &def, "export").await,
        JobKind::Custom { callback } => invoke_callback(&ctx, &def, callback).await,
    };

    let now = Utc::now();
    run.outcome = outcome;
    run.finished_at = Some(now);
    run.items_processed = items;
    run.failure_reason = if outcome == RunOutcome::Success {
        None
    } else {
        reason
    };

    match outcome {
        RunOutcome::Failed => {
            events::emit(
                &ctx.events,
                TrackerEvent::JobFailed {
                    job_id: run.job_id.clone(),
                    run_id: run.run_id,
                    reason: run
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "unknown failure".to_string()),
                },
            );
            tracing::warn!(job = %run.job_id, run = run.run_id, reason = ?run.failure_reason, "run failed");
        }
        _ => {
            events::emit(
                &ctx.events,
                TrackerEvent::JobFinished {
                    job_id: run.job_id.clone(),
                    run_id: run.run_id,
                    outcome,
                    items_processed: items,
                    duration_ms: started.elapsed().as_millis() as u64,
                },
            );
            tracing::info!(job = %run.job_id, run = run.run_id, %outcome, items, "run finished");
        }
    }

    if let Err(e) = ctx.store.write_run(&run) {
        tracing::error!(job = %run.job_id, "failed to persist run record: {e}");
    }
    if let Err(e) = ctx.registry().record_run(run, now) {
        tracing::error!("failed to record run: {e}");
    }
}

async fn invoke_callback(
    ctx: &SchedulerCtx,
    def: &JobDefinition,
    name: &str,
) -> (RunOutcome, usize, Option<String>) {
    let Some(callback) = ctx.callback(name) else {
        let err = CoreError::UnknownCallback(name.to_string());
        return (RunOutcome::Failed, 0, Some(err.to_string()));
    };
    match callback.invoke(def).await {
        Ok(items) => (RunOutcome::Success, items, None),
        Err(e) => (RunOutcome::Failed, 0, Some(e.to_string())),
    }
}

async fn scrape_urls(
    ctx: &SchedulerCtx,
    def: &JobDefinition,
    urls: &[String],
    delay_factor: f64,
) -> UrlTally {
    let mut tally = UrlTally {
        extracted_ok: 0,
        fetched_only: 0,
        failed: 0,
        cancelled: 0,
        items: 0,
        last_failure: None,
    };
    // 429 history is scoped to this run: a repeat anywhere in the run
    // escalates, unrelated runs and targets start clean.
    let mut rate_limited = false;

    for url in urls {
        // Cancellation checkpoint between URLs.
        if ctx.is_shutting_down() {
            tally.cancelled += 1;
            tally.last_failure = Some("shutdown before fetch".to_string());
            continue;
        }
        let mut driver = RetryDriver::new(def.retry);
        loop {
            driver.begin_attempt();
            ctx.delay.pause(delay_factor).await;

            let status = attempt_fetch(ctx, def, url, &mut rate_limited, &mut tally).await;
            match driver.on_outcome(status) {
                Step::Done => break,
                Step::RetryAfter(delay) => {
                    // Cancellation checkpoint at the retry boundary.
                    if ctx.is_shutting_down() {
                        tally.failed += 1;
                        tally.last_failure = Some(format!("{url}: cancelled during shutdown"));
                        break;
                    }
                    tracing::debug!(
                        url,
                        attempt = driver.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Step::GiveUp { reason } => {
                    tally.failed += 1;
                    tally.last_failure = Some(format!("{url}: {reason}"));
                    break;
                }
            }
        }
    }
    tally
}

/// One fetch attempt for one URL: session checkout, fetch, outcome
/// reporting. Returns the status the retry driver should see.
async fn attempt_fetch(
    ctx: &SchedulerCtx,
    def: &JobDefinition,
    url: &str,
    rate_limited: &mut bool,
    tally: &mut UrlTally,
) -> FetchStatus {
    let now = Utc::now();
    let guard = match SessionGuard::acquire(&ctx.pool, &def.target, now) {
        Ok(guard) => guard,
        Err(CoreError::IdentityExhausted(_)) => {
            // Every identity is cooling; let the retry backoff wait it out.
            tracing::debug!(target = %def.target, "no identity available, treating as transient");
            return FetchStatus::NetworkError;
        }
        Err(e) => {
            tracing::error!(target = %def.target, "identity acquisition failed: {e}");
            return FetchStatus::NetworkError;
        }
    };

    let identity_id = guard.identity().id.clone();
    let result = ctx.fetcher.fetch(url, guard.identity(), *rate_limited).await;
    let now = Utc::now();
    if result.rate_limited {
        *rate_limited = true;
    }

    if let Err(e) = guard.finish(result.status, now) {
        tracing::warn!(identity = %identity_id, "identity release failed: {e}");
    }
    if result.status == FetchStatus::HardBlock {
        events::emit(
            &ctx.events,
            TrackerEvent::IdentityRetired {
                target: def.target.clone(),
                identity: identity_id,
            },
        );
    }

    report_health(ctx, def, result.status, result.latency_ms);

    if result.status == FetchStatus::Success {
        if let Some(raw) = result.raw_content.as_deref() {
            match ctx.extractor.extract(url, raw, now) {
                Ok(snapshots) => {
                    let mut stored = 0;
                    for snapshot in &snapshots {
                        match ctx.store.write_snapshot(snapshot) {
                            Ok(()) => stored += 1,
                            Err(e) => {
                                tracing::error!(
                                    product = %snapshot.product_id,
                                    "failed to persist snapshot: {e}"
                                );
                            }
                        }
                    }
                    tally.items += stored;
                    tally.extracted_ok += 1;
                }
                Err(e) => {
                    // Fetched fine but unusable content; the run becomes a
                    // partial success, not a retry.
                    tracing::warn!(url, "extraction failed: {e}");
                    tally.fetched_only += 1;
                    tally.last_failure = Some(e.to_string());
                }
            }
        } else {
            tally.fetched_only += 1;
        }
    }
    result.status
}

/// Record an outcome against the target, emitting a throttle transition
/// event when the level changes.
fn report_health(ctx: &SchedulerCtx, def: &JobDefinition, status: FetchStatus, latency_ms: u64) {
    let now = Utc::now();
    let mut health = ctx.health();
    let before = health.level(&def.target, now);
    let after = health.record(&def.target, status, latency_ms, now);
    if before != after {
        let until = health
            .snapshot()
            .into_iter()
            .find(|t| t.target == def.target)
            .and_then(|t| t.throttle_until);
        drop(health);
        events::emit(
            &ctx.events,
            TrackerEvent::ThrottleChanged {
                target: def.target.clone(),
                from: before,
                to: after,
                until,
            },
        );
    }
}
